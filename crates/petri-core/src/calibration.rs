//! Calibration data: pumps (ml ↔ seconds) and OD curves (voltage ↔ OD600).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stores::{Stores, names};

/// Which peristaltic pump a calibration or dosing action refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpKind {
    Media,
    AltMedia,
    Waste,
}

impl PumpKind {
    pub fn cache_key(self) -> &'static str {
        match self {
            PumpKind::Media => "media",
            PumpKind::AltMedia => "alt_media",
            PumpKind::Waste => "waste",
        }
    }
}

impl std::fmt::Display for PumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cache_key())
    }
}

/// Linear pump model fitted during calibration: `ml = duration_·secs + bias_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpCalibration {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub pump: PumpKind,
    /// Slope, ml per second.
    pub duration_: f64,
    /// Intercept, ml.
    pub bias_: f64,
    pub hz: f64,
    pub dc: f64,
    pub voltage: f64,
    pub durations: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl PumpCalibration {
    /// Seconds of pumping needed for `ml`.
    pub fn ml_to_duration(&self, ml: f64) -> f64 {
        (ml - self.bias_) / self.duration_
    }

    /// Milliliters delivered by `secs` of pumping.
    pub fn duration_to_ml(&self, secs: f64) -> f64 {
        self.duration_ * secs + self.bias_
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration_ <= 0.0 {
            return Err(Error::Calibration(format!(
                "{} calibration {:?} has non-positive slope",
                self.pump, self.name
            )));
        }
        if self.durations.len() != self.volumes.len() {
            return Err(Error::Calibration(format!(
                "{} calibration {:?} has mismatched sample arrays",
                self.pump, self.name
            )));
        }
        Ok(())
    }
}

/// Look up the active calibration for `pump`.
pub fn current_pump_calibration(stores: &Stores, pump: PumpKind) -> Result<PumpCalibration> {
    let cache = stores.persistent(names::CURRENT_PUMP_CALIBRATION);
    let guard = cache.open()?;
    let raw = guard.get(pump.cache_key()).ok_or_else(|| {
        Error::Calibration(format!("no {pump} calibration defined; run a calibration first"))
    })?;
    let calibration: PumpCalibration = serde_json::from_str(raw)?;
    calibration.validate()?;
    Ok(calibration)
}

/// Persist `calibration` into the archive and mark it active for its pump.
pub fn store_pump_calibration(stores: &Stores, calibration: &PumpCalibration) -> Result<()> {
    calibration.validate()?;
    let raw = serde_json::to_string(calibration)?;
    stores
        .persistent(names::PUMP_CALIBRATIONS)
        .open()?
        .set(&format!("{}:{}", calibration.pump, calibration.name), raw.clone());
    stores
        .persistent(names::CURRENT_PUMP_CALIBRATION)
        .open()?
        .set(calibration.pump.cache_key(), raw);
    Ok(())
}

// ---------------------------------------------------------------------------
// OD calibration
// ---------------------------------------------------------------------------

/// Polynomial OD curve: `voltage = poly(od600)`, coefficients high → low.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdCalibration {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Photodiode angle: one of 45, 90, 135, 180.
    pub angle: String,
    pub curve_type: String,
    pub curve_data_: Vec<f64>,
    pub maximum_od600: f64,
    pub minimum_od600: f64,
    pub minimum_voltage: f64,
    pub maximum_voltage: f64,
    pub ir_led_intensity: f64,
    pub pd_channel: String,
    pub voltages: Vec<f64>,
    pub inferred_od600s: Vec<f64>,
}

/// Look up the active OD calibration for `angle`, if any.
pub fn current_od_calibration(stores: &Stores, angle: &str) -> Result<Option<OdCalibration>> {
    let cache = stores.persistent(names::CURRENT_OD_CALIBRATION);
    let guard = cache.open()?;
    match guard.get(angle) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

pub fn store_od_calibration(stores: &Stores, calibration: &OdCalibration) -> Result<()> {
    let raw = serde_json::to_string(calibration)?;
    stores
        .persistent(names::CURRENT_OD_CALIBRATION)
        .open()?
        .set(&calibration.angle, raw);
    Ok(())
}

/// Evaluate a high→low coefficient polynomial at `x`.
pub fn poly_eval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, &c| acc * x + c)
}

/// Invert the calibration curve at `voltage`.
///
/// Finds the roots of `poly(od) = voltage` over the calibrated OD span and
/// returns the one on the monotone branch nearest `previous_od`. When the
/// voltage lies beyond every value the curve reaches (past an extremum), the
/// OD at the nearest extremum is returned instead with `clipped = true`; the
/// caller logs the advisory.
pub fn od_from_voltage(calibration: &OdCalibration, voltage: f64, previous_od: f64) -> (f64, bool) {
    const GRID: usize = 2000;
    let poly = &calibration.curve_data_;
    let lo = calibration.minimum_od600;
    let hi = calibration.maximum_od600;
    let step = (hi - lo) / GRID as f64;

    let mut roots: Vec<f64> = Vec::new();
    let at_lo = poly_eval(poly, lo);
    let mut best_low = (at_lo, lo);
    let mut best_high = (at_lo, lo);

    let mut prev_x = lo;
    let mut prev_f = at_lo - voltage;
    if prev_f == 0.0 {
        roots.push(lo);
    }
    for i in 1..=GRID {
        let x = lo + step * i as f64;
        let f = poly_eval(poly, x) - voltage;
        let value = f + voltage;
        if value < best_low.0 {
            best_low = (value, x);
        }
        if value > best_high.0 {
            best_high = (value, x);
        }
        if f == 0.0 {
            roots.push(x);
        } else if prev_f.signum() != f.signum() && prev_f != 0.0 {
            roots.push(bisect(poly, voltage, prev_x, x));
        }
        prev_x = x;
        prev_f = f;
    }

    if let Some(&root) = roots.iter().min_by(|a, b| {
        (*a - previous_od)
            .abs()
            .partial_cmp(&(*b - previous_od).abs())
            .unwrap()
    }) {
        return (root, false);
    }

    // no crossing: the observed voltage is outside the calibrated curve
    if voltage > best_high.0 {
        (best_high.1, true)
    } else {
        (best_low.1, true)
    }
}

fn bisect(poly: &[f64], target: f64, mut lo: f64, mut hi: f64) -> f64 {
    let f_lo = poly_eval(poly, lo) - target;
    for _ in 0..60 {
        let mid = (lo + hi) / 2.0;
        let f_mid = poly_eval(poly, mid) - target;
        if f_mid == 0.0 {
            return mid;
        }
        if f_lo.signum() == f_mid.signum() {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_calibration(duration_: f64, bias_: f64) -> PumpCalibration {
        PumpCalibration {
            name: "bench".into(),
            timestamp: Utc::now(),
            pump: PumpKind::Media,
            duration_,
            bias_,
            hz: 100.0,
            dc: 60.0,
            voltage: -1.0,
            durations: vec![0.0, 1.0],
            volumes: vec![0.0, 1.5],
        }
    }

    fn od_cal(poly: Vec<f64>, max_od: f64, max_v: f64) -> OdCalibration {
        OdCalibration {
            name: "linear".into(),
            timestamp: Utc::now(),
            angle: "90".into(),
            curve_type: "poly".into(),
            curve_data_: poly,
            maximum_od600: max_od,
            minimum_od600: 0.0,
            minimum_voltage: 0.0,
            maximum_voltage: max_v,
            ir_led_intensity: 90.0,
            pd_channel: "2".into(),
            voltages: vec![],
            inferred_od600s: vec![],
        }
    }

    // -----------------------------------------------------------------------
    // Pump model
    // -----------------------------------------------------------------------

    #[test]
    fn ml_duration_round_trip_is_identity() {
        let cal = media_calibration(0.75, 0.1);
        for ml in [0.2, 0.6, 1.0, 3.7] {
            let there_and_back = cal.duration_to_ml(cal.ml_to_duration(ml));
            assert!((there_and_back - ml).abs() < 1e-12);
        }
    }

    #[test]
    fn duration_formula_matches_linear_model() {
        let cal = media_calibration(1.0, 0.0);
        assert_eq!(cal.ml_to_duration(1.5), 1.5);
        let offset = media_calibration(2.0, 0.5);
        assert!((offset.ml_to_duration(2.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn non_positive_slope_is_rejected() {
        let cal = media_calibration(0.0, 0.0);
        assert!(cal.validate().is_err());
    }

    #[test]
    fn mismatched_sample_arrays_are_rejected() {
        let mut cal = media_calibration(1.0, 0.0);
        cal.volumes.push(9.9);
        assert!(cal.validate().is_err());
    }

    #[test]
    fn store_and_fetch_current_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        let cal = media_calibration(1.0, 0.0);
        store_pump_calibration(&stores, &cal).unwrap();
        let fetched = current_pump_calibration(&stores, PumpKind::Media).unwrap();
        assert_eq!(fetched.name, "bench");
        assert!(current_pump_calibration(&stores, PumpKind::Waste).is_err());
    }

    // -----------------------------------------------------------------------
    // OD curve inversion
    // -----------------------------------------------------------------------

    #[test]
    fn linear_curve_inverts_exactly() {
        // voltage = 2·od
        let cal = od_cal(vec![2.0, 0.0], 2.0, 1.0);
        let (od, clipped) = od_from_voltage(&cal, 0.5, 0.0);
        assert!((od - 0.25).abs() < 1e-6);
        assert!(!clipped);
    }

    #[test]
    fn voltage_beyond_curve_clips_to_extremum() {
        let cal = od_cal(vec![2.0, 0.0], 2.0, 1.0);
        let (od, clipped) = od_from_voltage(&cal, 10.0, 0.5);
        assert!((od - 2.0).abs() < 1e-6);
        assert!(clipped);
    }

    #[test]
    fn negative_slope_curve_inverts_and_clips() {
        // voltage = 2 − 0.1·od over od ∈ [0, 20]
        let cal = od_cal(vec![-0.1, 2.0], 20.0, 2.0);
        let (od, clipped) = od_from_voltage(&cal, 1.5, 0.0);
        assert!((od - 5.0).abs() < 1e-4);
        assert!(!clipped);

        let (od, clipped) = od_from_voltage(&cal, 12.0, 0.0);
        assert!(clipped);
        // the largest curve value sits at od = 0
        assert!(od.abs() < 0.02);
    }

    #[test]
    fn quadratic_curve_picks_branch_in_domain() {
        // voltage = od² − 0.1
        let cal = od_cal(vec![1.0, 0.0, -0.1], 2.0, 1.0);
        let (od, clipped) = od_from_voltage(&cal, 0.5, 0.0);
        assert!((od - (0.6f64).sqrt()).abs() < 1e-3);
        assert!(!clipped);
    }

    #[test]
    fn multimodal_curve_prefers_branch_near_previous_estimate() {
        // rises to a local peak near 0.74 then falls: two ods share a voltage
        let cal = od_cal(vec![0.2983, -0.585, 0.146, 0.261, 0.0], 2.0, 1.0);
        let target_voltage = poly_eval(&cal.curve_data_, 0.3);
        let (od_low, _) = od_from_voltage(&cal, target_voltage, 0.25);
        assert!((od_low - 0.3).abs() < 0.02, "saw {od_low}");
    }

    #[test]
    fn poly_eval_is_high_to_low() {
        // 3x² + 2x + 1 at x=2 → 17
        assert_eq!(poly_eval(&[3.0, 2.0, 1.0], 2.0), 17.0);
    }
}
