//! Streaming math primitives shared by the control jobs.

pub mod ekf;
pub mod ema;
pub mod pid;
pub mod regression;

pub use ekf::Ekf;
pub use ema::{Dema, Ema};
pub use pid::PidController;
pub use regression::{SineFit, simple_linear_regression, sine_regression};

/// Clamp into `[lower, upper]`.
pub fn clamp(lower: f64, value: f64, upper: f64) -> f64 {
    value.clamp(lower, upper)
}
