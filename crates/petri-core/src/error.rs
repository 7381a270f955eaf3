//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the control core.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file missing, unreadable, or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// A required calibration is absent or inconsistent with the setup.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// A hardware pin/channel is already claimed by another owner.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Low-level hardware access failed (GPIO, I²C, PWM).
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Bus connectivity or protocol failure after retries were exhausted.
    #[error("bus error: {0}")]
    Bus(String),

    /// Another process on this node is already running the same job.
    #[error("{0} is already running on this node")]
    DuplicateJob(String),

    /// Key-value cache I/O or serialization failure.
    #[error("store error: {0}")]
    Store(String),

    /// Caller handed an argument the operation cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
