//! Typed TOML configuration.
//!
//! Every field has a default so a node boots with no config file at all;
//! a partial file overrides only what it names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub od: OdConfig,
    pub stirring: StirringConfig,
    pub dosing: DosingConfig,
    pub temperature: TemperatureConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Topic namespace shared by the whole cluster.
    pub namespace: String,
    /// Hostname of the leader node (runs the bus broker).
    pub leader: String,
    /// This node's unit name; empty means "use the hostname".
    pub unit: String,
    /// Experiment override; empty means "ask the leader's retained topic".
    pub experiment: String,
    /// True when this node hosts the broker.
    pub is_leader: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "petri".into(),
            leader: "localhost".into(),
            unit: String::new(),
            experiment: String::new(),
            is_leader: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Reboot-surviving caches (calibrations, throughput counters).
    pub persistent_dir: PathBuf,
    /// Boot-lifetime caches (running-job flags, transient coordination).
    pub intermittent_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistent_dir: PathBuf::from("/var/lib/petri"),
            intermittent_dir: PathBuf::from("/tmp/petri"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OdConfig {
    /// Records per second; the tick interval is its reciprocal.
    pub samples_per_second: f64,
    /// ADC samples collected per channel inside one record.
    pub samples_per_record: usize,
    /// IR LED drive intensity, percent.
    pub ir_led_intensity: f64,
    /// DAC channel (A–D) wired to the IR LED.
    pub ir_led_channel: String,
    /// Photodiode wiring: angle label → ADC channel, e.g. `"135" = 0`.
    pub angle_to_adc_channel: BTreeMap<String, u8>,
    /// Records between dynamic-gain reviews.
    pub gain_review_every: usize,
    /// Apply the OD calibration transform when one is stored.
    pub use_calibration: bool,
}

impl Default for OdConfig {
    fn default() -> Self {
        let mut angle_to_adc_channel = BTreeMap::new();
        angle_to_adc_channel.insert("135".to_string(), 0u8);
        angle_to_adc_channel.insert("90".to_string(), 1u8);
        Self {
            samples_per_second: 0.2,
            samples_per_record: 25,
            ir_led_intensity: 50.0,
            ir_led_channel: "A".into(),
            angle_to_adc_channel,
            gain_review_every: 20,
            use_calibration: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StirringConfig {
    pub target_rpm: f64,
    /// Used only when no stirring calibration is stored.
    pub initial_duty_cycle: f64,
    pub pwm_hz: f64,
    /// Seconds between RPM polls. Coprime with the OD tick to avoid beating.
    pub poll_every_secs: f64,
    /// Edge-collection window per poll.
    pub poll_for_secs: f64,
    pub pid: PidGains,
}

impl Default for StirringConfig {
    fn default() -> Self {
        Self {
            target_rpm: 500.0,
            initial_duty_cycle: 60.0,
            pwm_hz: 67.0,
            poll_every_secs: 23.0,
            poll_for_secs: 4.0,
            pid: PidGains {
                kp: 0.0126,
                ki: 0.05,
                kd: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DosingConfig {
    /// Working liquid volume of the vial, ml.
    pub vial_volume_ml: f64,
    /// Largest single pump pulse; bigger requests are chunked.
    pub max_volume_ml: f64,
    pub pid_morbidostat: PidGains,
    pub pid_turbidostat: PidGains,
}

impl Default for DosingConfig {
    fn default() -> Self {
        Self {
            vial_volume_ml: 14.0,
            max_volume_ml: 0.6,
            pid_morbidostat: PidGains {
                kp: 5.0,
                ki: 0.0,
                kd: 0.0,
            },
            pid_turbidostat: PidGains {
                kp: -3.0,
                ki: -0.2,
                kd: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    pub pid_stable: PidGains,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            pid_stable: PidGains {
                kp: 3.0,
                ki: 0.2,
                kd: 1.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// GPIO character device the node's lines hang off.
    pub gpio_chip: String,
    /// BCM pin per pump and the stirrer fan.
    pub pwm_pins: PwmPins,
    pub hall_sensor_pin: u32,
    pub led_pin: u32,
    pub button_pin: u32,
    /// I²C bus device for the ADC/DAC pair.
    pub i2c_bus: String,
    pub adc_address: u16,
    pub dac_address: u16,
    /// `true` selects the 8-bit-over-I²C DAC; `false` the 10-bit register DAC.
    pub dac_eight_bit: bool,
    /// Run against simulated hardware (development benches, CI).
    pub simulated: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            gpio_chip: "/dev/gpiochip0".into(),
            pwm_pins: PwmPins::default(),
            hall_sensor_pin: 25,
            led_pin: 23,
            button_pin: 24,
            i2c_bus: "/dev/i2c-1".into(),
            adc_address: 0x48,
            dac_address: 0x49,
            dac_eight_bit: false,
            simulated: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmPins {
    pub media: u32,
    pub alt_media: u32,
    pub waste: u32,
    pub stirring: u32,
    pub heater: u32,
}

impl Default for PwmPins {
    fn default() -> Self {
        Self {
            media: 17,
            alt_media: 13,
            waste: 16,
            stirring: 12,
            heater: 18,
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the conventional location, overridable via `PETRI_CONFIG`.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("PETRI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/petri/config.toml"));
        Self::load(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.cluster.namespace, "petri");
        assert_eq!(config.dosing.vial_volume_ml, 14.0);
        assert_eq!(config.dosing.max_volume_ml, 0.6);
        assert_eq!(config.od.samples_per_record, 25);
        assert_eq!(config.stirring.poll_every_secs, 23.0);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let doc = r#"
            [cluster]
            leader = "leader.local"

            [dosing]
            vial_volume_ml = 20.0
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert_eq!(config.cluster.leader, "leader.local");
        assert_eq!(config.cluster.namespace, "petri");
        assert_eq!(config.dosing.vial_volume_ml, 20.0);
        assert_eq!(config.dosing.max_volume_ml, 0.6);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/petri.toml")).unwrap();
        assert_eq!(config.cluster.namespace, "petri");
    }

    #[test]
    fn angle_map_round_trips() {
        let config = Config::default();
        let doc = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&doc).unwrap();
        assert_eq!(back.od.angle_to_adc_channel, config.od.angle_to_adc_channel);
    }
}
