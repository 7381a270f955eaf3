//! The built-in dosing policies.

use crate::automations::{AutomationArgs, AutomationEvent, register_dosing};
use crate::calibration::PumpKind;
use crate::config::Config;
use crate::error::Result;
use crate::job::parse_setting;
use crate::math::pid::PidController;

use super::{DosingAutomation, DosingBase};

pub fn register_builtins() {
    register_dosing("silent", |_, _| Ok(Box::new(Silent)));
    register_dosing("turbidostat", |args, _| {
        Ok(Box::new(Turbidostat {
            target_normalized_od: args.require_f64("target_normalized_od")?,
            volume: args.require_f64("volume")?,
        }))
    });
    register_dosing("morbidostat", |args, _| {
        Ok(Box::new(Morbidostat {
            target_normalized_od: args.require_f64("target_normalized_od")?,
            volume: args.require_f64("volume")?,
        }))
    });
    register_dosing("pid_morbidostat", PidMorbidostat::from_args);
    register_dosing("pid_turbidostat", PidTurbidostat::from_args);
    register_dosing("chemostat", |args, _| {
        Ok(Box::new(Chemostat {
            volume: args.require_f64("volume")?,
        }))
    });
    register_dosing("continuous_cycle", |args, _| {
        Ok(Box::new(ContinuousCycle {
            duty_cycle: args.get_f64("duty_cycle").unwrap_or(100.0),
        }))
    });
    register_dosing("fed_batch", |args, _| {
        Ok(Box::new(FedBatch {
            volume: args.require_f64("volume")?,
        }))
    });
}

// ---------------------------------------------------------------------------
// Silent
// ---------------------------------------------------------------------------

/// Observes, never doses.
pub struct Silent;

impl DosingAutomation for Silent {
    fn key(&self) -> &'static str {
        "silent"
    }

    fn execute(&mut self, _base: &mut DosingBase) -> AutomationEvent {
        AutomationEvent::no_event("no dosing occurred")
    }
}

// ---------------------------------------------------------------------------
// Turbidostat
// ---------------------------------------------------------------------------

/// Dilute by a fixed volume whenever the OD reaches the target.
pub struct Turbidostat {
    pub target_normalized_od: f64,
    pub volume: f64,
}

impl DosingAutomation for Turbidostat {
    fn key(&self) -> &'static str {
        "turbidostat"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["target_normalized_od", "volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        let parsed = parse_setting::<f64>(value)?;
        match attr {
            "target_normalized_od" => self.target_normalized_od = parsed,
            "volume" => self.volume = parsed,
            _ => return None,
        }
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        let Some(od) = base.latest_normalized_od else {
            return AutomationEvent::error("no OD data has arrived yet");
        };
        if od < self.target_normalized_od {
            return AutomationEvent::no_event(format!(
                "OD {od:.2} below target {:.2}",
                self.target_normalized_od
            ));
        }
        match base.execute_io_action(self.volume, 0.0, self.volume) {
            Ok(_) => AutomationEvent::dilution(format!(
                "OD {od:.2} ≥ target {:.2}; diluted {:.2} ml",
                self.target_normalized_od, self.volume
            )),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Morbidostat
// ---------------------------------------------------------------------------

/// Hold the culture at the target OD by alternating media and drugged
/// alt-media: alt-media when the culture is above target and still climbing,
/// a plain dilution otherwise. The very first observation only establishes
/// the baseline.
pub struct Morbidostat {
    pub target_normalized_od: f64,
    pub volume: f64,
}

impl DosingAutomation for Morbidostat {
    fn key(&self) -> &'static str {
        "morbidostat"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["target_normalized_od", "volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        let parsed = parse_setting::<f64>(value)?;
        match attr {
            "target_normalized_od" => self.target_normalized_od = parsed,
            "volume" => self.volume = parsed,
            _ => return None,
        }
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        let Some(latest) = base.latest_normalized_od else {
            return AutomationEvent::error("no OD data has arrived yet");
        };
        let Some(previous) = base.previous_normalized_od else {
            return AutomationEvent::no_event("skipping the first observation");
        };

        if latest >= self.target_normalized_od && latest >= previous {
            match base.execute_io_action(0.0, self.volume, self.volume) {
                Ok(_) => AutomationEvent::add_alt_media(format!(
                    "OD {latest:.2} above target and rising; added {:.2} ml alt-media",
                    self.volume
                )),
                Err(e) => AutomationEvent::error(e.to_string()),
            }
        } else {
            match base.execute_io_action(self.volume, 0.0, self.volume) {
                Ok(_) => AutomationEvent::dilution(format!(
                    "diluted {:.2} ml (OD {latest:.2})",
                    self.volume
                )),
                Err(e) => AutomationEvent::error(e.to_string()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PID morbidostat
// ---------------------------------------------------------------------------

/// PID on the growth-rate error decides what fraction of each dose is
/// alt-media. Below 75 % of the target OD the culture is left alone to grow
/// into the controllable range; above 125 % the dose is enlarged.
pub struct PidMorbidostat {
    pub target_growth_rate: f64,
    pub target_od: f64,
    pub volume: f64,
    pid: PidController,
}

impl PidMorbidostat {
    pub fn from_args(args: &AutomationArgs, config: &Config) -> Result<Box<dyn DosingAutomation>> {
        let target_growth_rate = args.require_f64("target_growth_rate")?;
        let gains = config.dosing.pid_morbidostat;
        Ok(Box::new(Self {
            target_growth_rate,
            target_od: args.require_f64("target_od")?,
            volume: args.get_f64("volume").unwrap_or(0.5),
            pid: PidController::new(gains.kp, gains.ki, gains.kd, target_growth_rate)
                .with_output_limits(Some(0.0), Some(1.0)),
        }))
    }

    fn min_od(&self) -> f64 {
        0.75 * self.target_od
    }

    fn max_od(&self) -> f64 {
        1.25 * self.target_od
    }
}

impl DosingAutomation for PidMorbidostat {
    fn key(&self) -> &'static str {
        "pid_morbidostat"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["target_growth_rate", "target_od", "volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        let parsed = parse_setting::<f64>(value)?;
        match attr {
            "target_growth_rate" => {
                self.target_growth_rate = parsed;
                self.pid.set_setpoint(parsed);
            }
            "target_od" => self.target_od = parsed,
            "volume" => self.volume = parsed,
            _ => return None,
        }
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        let (Some(od), Some(growth_rate)) = (base.latest_normalized_od, base.latest_growth_rate)
        else {
            return AutomationEvent::error("no OD/growth-rate data has arrived yet");
        };
        if od <= self.min_od() {
            return AutomationEvent::no_event(format!(
                "current OD {od:.2} is below {:.2}, letting the culture grow",
                self.min_od()
            ));
        }

        let alt_fraction = self.pid.update(growth_rate);
        let volume = if od > self.max_od() {
            // keep the signal in the sensor's linear range
            2.5 * self.volume
        } else {
            self.volume
        };
        let alt_media_ml = alt_fraction * volume;
        let media_ml = (1.0 - alt_fraction) * volume;

        match base.execute_io_action(media_ml, alt_media_ml, volume) {
            Ok(_) => AutomationEvent::add_alt_media(format!(
                "exchanged {volume:.2} ml, {:.0}% alt-media (growth rate {growth_rate:.3})",
                alt_fraction * 100.0
            )),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// PID turbidostat
// ---------------------------------------------------------------------------

/// PID on the OD error sizes the dilution; `volume` caps a single exchange.
pub struct PidTurbidostat {
    pub target_od: f64,
    pub volume: f64,
    pid: PidController,
}

impl PidTurbidostat {
    pub fn from_args(args: &AutomationArgs, config: &Config) -> Result<Box<dyn DosingAutomation>> {
        let target_od = args.require_f64("target_od")?;
        let volume = args.get_f64("volume").unwrap_or(1.0);
        let gains = config.dosing.pid_turbidostat;
        Ok(Box::new(Self {
            target_od,
            volume,
            pid: PidController::new(gains.kp, gains.ki, gains.kd, target_od)
                .with_output_limits(Some(0.0), Some(volume)),
        }))
    }
}

impl DosingAutomation for PidTurbidostat {
    fn key(&self) -> &'static str {
        "pid_turbidostat"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["target_od", "volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        let parsed = parse_setting::<f64>(value)?;
        match attr {
            "target_od" => {
                self.target_od = parsed;
                self.pid.set_setpoint(parsed);
            }
            "volume" => self.volume = parsed,
            _ => return None,
        }
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        let Some(od) = base.latest_normalized_od else {
            return AutomationEvent::error("no OD data has arrived yet");
        };
        let volume_to_cycle = self.pid.update(od).min(self.volume);
        if volume_to_cycle <= 1e-3 {
            return AutomationEvent::no_event(format!("OD {od:.2} needs no dilution"));
        }
        match base.execute_io_action(volume_to_cycle, 0.0, volume_to_cycle) {
            Ok(_) => AutomationEvent::dilution(format!(
                "diluted {volume_to_cycle:.2} ml toward OD {:.2}",
                self.target_od
            )),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Chemostat
// ---------------------------------------------------------------------------

/// Constant dilution rate: a fixed exchange every period, blind to OD.
pub struct Chemostat {
    pub volume: f64,
}

impl DosingAutomation for Chemostat {
    fn key(&self) -> &'static str {
        "chemostat"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        if attr != "volume" {
            return None;
        }
        let parsed = parse_setting::<f64>(value)?;
        self.volume = parsed;
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        match base.execute_io_action(self.volume, 0.0, self.volume) {
            Ok(_) => AutomationEvent::dilution(format!("exchanged {:.2} ml", self.volume)),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Continuous cycle
// ---------------------------------------------------------------------------

/// Run the media pump continuously at a settable duty cycle (cleaning,
/// priming, external-loop circulation).
pub struct ContinuousCycle {
    pub duty_cycle: f64,
}

impl DosingAutomation for ContinuousCycle {
    fn key(&self) -> &'static str {
        "continuous_cycle"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["duty_cycle"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        if attr != "duty_cycle" {
            return None;
        }
        let parsed = parse_setting::<f64>(value)?.clamp(0.0, 100.0);
        self.duty_cycle = parsed;
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        match base.run_continuously(PumpKind::Media, self.duty_cycle) {
            Ok(_) => AutomationEvent::add_media("cycled media continuously"),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fed batch
// ---------------------------------------------------------------------------

/// Add media on a schedule; nothing is ever removed.
pub struct FedBatch {
    pub volume: f64,
}

impl DosingAutomation for FedBatch {
    fn key(&self) -> &'static str {
        "fed_batch"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["volume"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        if attr != "volume" {
            return None;
        }
        let parsed = parse_setting::<f64>(value)?;
        self.volume = parsed;
        Some(parsed.to_string())
    }

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent {
        match base.execute_io_action(self.volume, 0.0, 0.0) {
            Ok(_) => AutomationEvent::add_media(format!("added {:.2} ml", self.volume)),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::dosing::test_support::test_base;

    // -----------------------------------------------------------------------
    // Silent
    // -----------------------------------------------------------------------

    #[test]
    fn silent_never_doses() {
        let (_dir, mut base, doser) = test_base("silent");
        let mut algo = Silent;

        base.record_growth_rate(0.01);
        base.record_normalized_od(1.0);
        assert!(matches!(
            algo.execute(&mut base),
            AutomationEvent::NoEvent { .. }
        ));

        base.record_growth_rate(0.02);
        base.record_normalized_od(1.1);
        assert!(matches!(
            algo.execute(&mut base),
            AutomationEvent::NoEvent { .. }
        ));

        assert_eq!(base.latest_growth_rate, Some(0.02));
        assert_eq!(base.previous_growth_rate, Some(0.01));
        assert_eq!(base.latest_normalized_od, Some(1.1));
        assert_eq!(base.previous_normalized_od, Some(1.0));
        assert!(doser.calls.lock().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Turbidostat
    // -----------------------------------------------------------------------

    #[test]
    fn turbidostat_dilutes_at_and_above_target() {
        let (_dir, mut base, _) = test_base("turbidostat");
        let mut algo = Turbidostat {
            target_normalized_od: 1.0,
            volume: 0.25,
        };

        let expectations = [
            (0.98, "NoEvent"),
            (1.0, "DilutionEvent"),
            (1.01, "DilutionEvent"),
            (0.99, "NoEvent"),
        ];
        for (od, expected) in expectations {
            base.record_normalized_od(od);
            let event = algo.execute(&mut base);
            assert_eq!(event.name(), expected, "at OD {od}");
        }
    }

    #[test]
    fn turbidostat_without_data_reports_error() {
        let (_dir, mut base, _) = test_base("turbidostat_nodata");
        let mut algo = Turbidostat {
            target_normalized_od: 0.1,
            volume: 0.25,
        };
        assert!(matches!(
            algo.execute(&mut base),
            AutomationEvent::ErrorOccurred { .. }
        ));
    }

    #[test]
    fn turbidostat_settings_update_over_the_wire() {
        let mut algo = Turbidostat {
            target_normalized_od: 1.0,
            volume: 0.5,
        };
        assert_eq!(algo.set("volume", "1.0"), Some("1".to_string()));
        assert_eq!(algo.volume, 1.0);
        assert_eq!(algo.set("target_normalized_od", "1.5"), Some("1.5".into()));
        assert_eq!(algo.target_normalized_od, 1.5);
        assert_eq!(algo.set("garbage", "1"), None);
    }

    // -----------------------------------------------------------------------
    // Morbidostat
    // -----------------------------------------------------------------------

    #[test]
    fn morbidostat_alternates_media_and_alt_media() {
        let (_dir, mut base, _) = test_base("morbidostat");
        let mut algo = Morbidostat {
            target_normalized_od: 1.0,
            volume: 0.25,
        };

        let expectations = [
            (0.95, "NoEvent"),
            (0.99, "DilutionEvent"),
            (1.05, "AddAltMediaEvent"),
            (1.03, "DilutionEvent"),
            (1.04, "AddAltMediaEvent"),
            (0.99, "DilutionEvent"),
        ];
        for (od, expected) in expectations {
            base.record_normalized_od(od);
            let event = algo.execute(&mut base);
            assert_eq!(event.name(), expected, "at OD {od}");
        }
    }

    // -----------------------------------------------------------------------
    // PID morbidostat
    // -----------------------------------------------------------------------

    #[test]
    fn pid_morbidostat_waits_for_od_then_feeds_alt_media() {
        let (_dir, mut base, _) = test_base("pid_morbidostat");
        let config = Config::default();
        let args = AutomationArgs::from_pairs(&[
            ("target_growth_rate", "0.09"),
            ("target_od", "1.0"),
        ]);
        let mut algo = PidMorbidostat::from_args(&args, &config).unwrap();

        let expectations = [
            (0.08, 0.5, "NoEvent"),
            (0.08, 0.95, "AddAltMediaEvent"),
            (0.07, 0.95, "AddAltMediaEvent"),
            (0.065, 0.95, "AddAltMediaEvent"),
        ];
        for (rate, od, expected) in expectations {
            base.record_growth_rate(rate);
            base.record_normalized_od(od);
            let event = algo.execute(&mut base);
            assert_eq!(event.name(), expected, "at rate {rate}, OD {od}");
        }
    }

    #[test]
    fn pid_morbidostat_doses_both_streams() {
        let (_dir, mut base, _) = test_base("pid_morbidostat_both");
        let config = Config::default();
        let args = AutomationArgs::from_pairs(&[
            ("target_growth_rate", "0.05"),
            ("target_od", "1.0"),
        ]);
        let mut algo = PidMorbidostat::from_args(&args, &config).unwrap();

        base.record_growth_rate(0.04);
        base.record_normalized_od(0.95);
        algo.execute(&mut base);
        assert!(base.media_throughput > 0.0);
        assert!(base.alt_media_throughput > 0.0);
    }

    #[test]
    fn pid_morbidostat_setpoint_follows_setting() {
        let config = Config::default();
        let args = AutomationArgs::from_pairs(&[
            ("target_growth_rate", "0.05"),
            ("target_od", "1.0"),
        ]);
        let mut algo = PidMorbidostat::from_args(&args, &config).unwrap();
        assert_eq!(algo.set("target_growth_rate", "0.07"), Some("0.07".into()));
    }

    // -----------------------------------------------------------------------
    // PID turbidostat
    // -----------------------------------------------------------------------

    #[test]
    fn pid_turbidostat_dilutes_above_target_only() {
        let (_dir, mut base, _) = test_base("pid_turbidostat");
        let config = Config::default();
        let args =
            AutomationArgs::from_pairs(&[("target_od", "1.0"), ("volume", "1.0")]);
        let mut algo = PidTurbidostat::from_args(&args, &config).unwrap();

        base.record_normalized_od(0.5);
        assert_eq!(algo.execute(&mut base).name(), "NoEvent");

        base.record_normalized_od(1.3);
        assert_eq!(algo.execute(&mut base).name(), "DilutionEvent");
        assert!(base.media_throughput > 0.0);
        assert!(base.media_throughput <= 1.0 + 1e-9);
    }

    // -----------------------------------------------------------------------
    // Chemostat / fed batch
    // -----------------------------------------------------------------------

    #[test]
    fn chemostat_exchanges_fixed_volume_every_run() {
        let (_dir, mut base, doser) = test_base("chemostat");
        let mut algo = Chemostat { volume: 0.7 };
        assert_eq!(algo.execute(&mut base).name(), "DilutionEvent");
        assert!((base.media_throughput - 0.7).abs() < 1e-9);
        assert_eq!(algo.execute(&mut base).name(), "DilutionEvent");
        assert!((base.media_throughput - 1.4).abs() < 1e-9);
        // waste is exchanged one-for-one
        let waste: f64 = doser
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == PumpKind::Waste)
            .map(|(_, ml)| ml)
            .sum();
        assert!((waste - 1.4).abs() < 1e-9);
    }

    #[test]
    fn fed_batch_only_ever_adds() {
        let (_dir, mut base, doser) = test_base("fed_batch");
        let mut algo = FedBatch { volume: 0.3 };
        assert_eq!(algo.execute(&mut base).name(), "AddMediaEvent");
        assert_eq!(algo.execute(&mut base).name(), "AddMediaEvent");
        assert!((base.media_throughput - 0.6).abs() < 1e-9);
        assert!(
            doser
                .calls
                .lock()
                .unwrap()
                .iter()
                .all(|(k, _)| *k != PumpKind::Waste)
        );
    }

    // -----------------------------------------------------------------------
    // Continuous cycle
    // -----------------------------------------------------------------------

    #[test]
    fn continuous_cycle_duty_cycle_is_settable_and_clamped() {
        let mut algo = ContinuousCycle { duty_cycle: 100.0 };
        assert_eq!(algo.set("duty_cycle", "50"), Some("50".into()));
        assert_eq!(algo.duty_cycle, 50.0);
        assert_eq!(algo.set("duty_cycle", "150"), Some("100".into()));
        assert_eq!(algo.duty_cycle, 100.0);
    }
}
