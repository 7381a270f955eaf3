//! # petri-core
//!
//! **The control core of a single-node bioreactor.**
//!
//! `petri-core` continuously measures the optical density of a culture with
//! a pulsed-LED photodiode array, estimates the exponential growth rate with
//! an extended Kalman filter, and autonomously exchanges media, alt-media,
//! and waste through calibrated peristaltic pumps under a selectable control
//! policy (silent / chemostat / turbidostat / morbidostat / PID variants).
//! Nodes coordinate over an MQTT bus hosted by the cluster leader.
//!
//! ## Architecture
//!
//! Every long-running subsystem is a background *job* ([`job::JobHost`]):
//! a lifecycle state machine (`init → ready ⇄ sleeping → disconnected`,
//! `lost` via last-will), a published-settings surface with bus-based remote
//! control, a duplicate-process guard, and a guaranteed exit protocol.
//!
//! Data flows through bus topics, never direct references:
//!
//! ```text
//! od_reading ──od_raw_batched──▶ growth_rate_calculating ──growth_rate──▶ dosing_automation
//!      ▲                               ▲                                        │
//!      └── pause/settings              └────────── dosing_events ◀──────────────┘ (pumps)
//! ```
//!
//! Hardware (ADC, DAC, GPIO, PWM) is reached through capability traits in
//! [`hardware`], with Linux and simulated implementations; every pin and
//! channel is claimed in a process-wide registry before use.

pub mod automations;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod error;
pub mod growth_rate;
pub mod hardware;
pub mod job;
pub mod logging;
pub mod math;
pub mod monitor;
pub mod naming;
pub mod od_reader;
pub mod pump;
pub mod stirring;
pub mod stores;
pub mod timing;

pub use config::Config;
pub use error::{Error, Result};
pub use job::{JobHost, JobState, NodeCtx};
pub use stores::Stores;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
