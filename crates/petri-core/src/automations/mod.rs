//! Periodic control policies (dosing, LED, temperature).
//!
//! Policies are looked up by string key in a process-global registry that is
//! populated explicitly at program init; plugins register through the same
//! calls the built-ins use.

pub mod dosing;
pub mod led;
pub mod temperature;

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};

/// Outcome of one automation tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_name")]
pub enum AutomationEvent {
    NoEvent {
        message: Option<String>,
        data: Option<BTreeMap<String, f64>>,
    },
    DilutionEvent {
        message: Option<String>,
        data: Option<BTreeMap<String, f64>>,
    },
    AddAltMediaEvent {
        message: Option<String>,
        data: Option<BTreeMap<String, f64>>,
    },
    AddMediaEvent {
        message: Option<String>,
        data: Option<BTreeMap<String, f64>>,
    },
    ErrorOccurred {
        message: Option<String>,
    },
}

impl AutomationEvent {
    pub fn no_event(message: impl Into<String>) -> Self {
        Self::NoEvent {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn dilution(message: impl Into<String>) -> Self {
        Self::DilutionEvent {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn add_alt_media(message: impl Into<String>) -> Self {
        Self::AddAltMediaEvent {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn add_media(message: impl Into<String>) -> Self {
        Self::AddMediaEvent {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::ErrorOccurred {
            message: Some(message.into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoEvent { .. } => "NoEvent",
            Self::DilutionEvent { .. } => "DilutionEvent",
            Self::AddAltMediaEvent { .. } => "AddAltMediaEvent",
            Self::AddMediaEvent { .. } => "AddMediaEvent",
            Self::ErrorOccurred { .. } => "ErrorOccurred",
        }
    }
}

impl std::fmt::Display for AutomationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::NoEvent { message, .. }
            | Self::DilutionEvent { message, .. }
            | Self::AddAltMediaEvent { message, .. }
            | Self::AddMediaEvent { message, .. }
            | Self::ErrorOccurred { message } => message,
        };
        match message {
            Some(m) => write!(f, "{}: {m}", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// String key/value arguments, the shape a remote `run` payload arrives in.
#[derive(Debug, Clone, Default)]
pub struct AutomationArgs(pub BTreeMap<String, String>);

impl AutomationArgs {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| Error::InvalidArgument(format!("missing numeric argument {key:?}")))
    }
}

type DosingFactory = fn(&AutomationArgs, &Config) -> Result<Box<dyn dosing::DosingAutomation>>;
type LedFactory = fn(&AutomationArgs, &Config) -> Result<Box<dyn led::LedAutomation>>;
type TemperatureFactory =
    fn(&AutomationArgs, &Config) -> Result<Box<dyn temperature::TemperatureAutomation>>;

#[derive(Default)]
struct Registry {
    dosing: BTreeMap<&'static str, DosingFactory>,
    led: BTreeMap<&'static str, LedFactory>,
    temperature: BTreeMap<&'static str, TemperatureFactory>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

pub fn register_dosing(key: &'static str, factory: DosingFactory) {
    registry().lock().unwrap().dosing.insert(key, factory);
}

pub fn register_led(key: &'static str, factory: LedFactory) {
    registry().lock().unwrap().led.insert(key, factory);
}

pub fn register_temperature(key: &'static str, factory: TemperatureFactory) {
    registry().lock().unwrap().temperature.insert(key, factory);
}

pub fn create_dosing(
    key: &str,
    args: &AutomationArgs,
    config: &Config,
) -> Result<Box<dyn dosing::DosingAutomation>> {
    let factory = registry()
        .lock()
        .unwrap()
        .dosing
        .get(key)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("unknown dosing automation {key:?}")))?;
    factory(args, config)
}

pub fn create_led(
    key: &str,
    args: &AutomationArgs,
    config: &Config,
) -> Result<Box<dyn led::LedAutomation>> {
    let factory = registry()
        .lock()
        .unwrap()
        .led
        .get(key)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("unknown LED automation {key:?}")))?;
    factory(args, config)
}

pub fn create_temperature(
    key: &str,
    args: &AutomationArgs,
    config: &Config,
) -> Result<Box<dyn temperature::TemperatureAutomation>> {
    let factory = registry()
        .lock()
        .unwrap()
        .temperature
        .get(key)
        .copied()
        .ok_or_else(|| {
            Error::InvalidArgument(format!("unknown temperature automation {key:?}"))
        })?;
    factory(args, config)
}

pub fn dosing_keys() -> Vec<&'static str> {
    registry().lock().unwrap().dosing.keys().copied().collect()
}

/// Register every built-in policy. Idempotent; call once at program init.
pub fn register_builtins() {
    dosing::policies::register_builtins();
    led::register_builtins();
    temperature::register_builtins();
}
