//! Synchronous AC-modulated optical density reader.
//!
//! One record: power the IR LED, sweep every configured photodiode channel
//! for ~25 ADC samples with µs timestamps, power the LED off, then separate
//! the true optical signal from mains interference by sine regression at the
//! line frequency. The DC term is the reading; a soft prior seeded by the
//! previous record keeps transients from whipping the estimate around.
//!
//! The mains frequency itself is chosen at startup by fitting a calibration
//! burst at both 50 and 60 Hz and keeping the lower AIC.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bus::Qos;
use crate::calibration::{self, OdCalibration};
use crate::config::OdConfig;
use crate::error::{Error, Result};
use crate::hardware::adc::{Adc, Gain};
use crate::hardware::dac::{Dac, LedChannel};
use crate::job::{JobHost, NodeCtx};
use crate::math::ema::Ema;
use crate::math::regression::{SineFit, sine_regression};
use crate::stores::{Stores, names};
use crate::timing::RepeatedTimer;

pub const JOB_NAME: &str = "od_reading";

/// Soft pull toward the previous record's DC level.
const PRIOR_PENALTY: f64 = 2.0;

/// Records between re-checks of the mains frequency (about hourly at the
/// default tick rate); grid frequency drifts and installations move.
const MAINS_RECHECK_EVERY: usize = 720;

/// One wired photodiode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdChannelSpec {
    /// Scattering angle, e.g. `"135"`.
    pub angle: String,
    /// Topic label, `"<angle>/<letter>"`.
    pub label: String,
    pub adc_channel: u8,
}

/// Expand the config map into labeled channels. Keys are either a bare angle
/// (`"135"`, labeled `135/A`) or an explicit label (`"135/B"`).
pub fn channel_specs(angle_to_adc_channel: &BTreeMap<String, u8>) -> Result<Vec<OdChannelSpec>> {
    let mut specs = Vec::new();
    for (key, &adc_channel) in angle_to_adc_channel {
        let (angle, label) = match key.split_once('/') {
            Some((angle, _)) => (angle.to_string(), key.clone()),
            None => (key.clone(), format!("{key}/A")),
        };
        if !matches!(angle.as_str(), "45" | "90" | "135" | "180") {
            return Err(Error::Config(format!(
                "unsupported photodiode angle {angle:?}; expected 45, 90, 135 or 180"
            )));
        }
        specs.push(OdChannelSpec {
            angle,
            label,
            adc_channel,
        });
    }
    Ok(specs)
}

/// Raw burst from one channel: seconds-since-LED-on and volts.
#[derive(Debug, Clone, Default)]
pub struct AdcBurst {
    pub timestamps: Vec<f64>,
    pub readings: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Calibration transform
// ---------------------------------------------------------------------------

/// Optional voltage → OD600 conversion applied per channel.
pub enum CalibrationTransformer {
    /// Pass voltages through untouched.
    Null,
    Cached {
        models: BTreeMap<String, OdCalibration>,
        previous_od: BTreeMap<String, f64>,
    },
}

impl CalibrationTransformer {
    /// Load active calibrations for the wired channels. Verifies the stored
    /// curve was taken at the configured LED intensity and on the same ADC
    /// channel; a mismatch is a setup error.
    pub fn from_stores(
        stores: &Stores,
        specs: &[OdChannelSpec],
        ir_led_intensity: f64,
        use_calibration: bool,
    ) -> Result<Self> {
        if !use_calibration {
            return Ok(Self::Null);
        }
        let mut models = BTreeMap::new();
        for spec in specs {
            let Some(cal) = calibration::current_od_calibration(stores, &spec.angle)? else {
                continue;
            };
            if (cal.ir_led_intensity - ir_led_intensity).abs() > f64::EPSILON {
                return Err(Error::Calibration(format!(
                    "calibration {:?} was taken at LED intensity {}%, but {}% is configured",
                    cal.name, cal.ir_led_intensity, ir_led_intensity
                )));
            }
            if cal.pd_channel != spec.adc_channel.to_string() {
                return Err(Error::Calibration(format!(
                    "calibration {:?} was taken on ADC channel {}, but {} is wired for angle {}",
                    cal.name, cal.pd_channel, spec.adc_channel, spec.angle
                )));
            }
            models.insert(spec.label.clone(), cal);
        }
        Ok(Self::Cached {
            models,
            previous_od: BTreeMap::new(),
        })
    }

    pub fn model_count(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Cached { models, .. } => models.len(),
        }
    }

    /// Convert one channel's voltage. Advisory-logs when the voltage lies
    /// outside the calibrated curve and the OD is clipped to the extremum.
    pub fn transform(&mut self, label: &str, voltage: f64) -> f64 {
        match self {
            Self::Null => voltage,
            Self::Cached {
                models,
                previous_od,
            } => {
                let Some(cal) = models.get(label) else {
                    return voltage;
                };
                let previous = previous_od.get(label).copied().unwrap_or(cal.minimum_od600);
                let (od, clipped) = calibration::od_from_voltage(cal, voltage, previous);
                if clipped {
                    log::debug!(
                        "voltage {voltage:.3} V on {label} is outside calibration {:?}; \
                         a recalibration is suggested (clipped OD to {od:.3})",
                        cal.name
                    );
                }
                previous_od.insert(label.to_string(), od);
                od
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Bus-free acquisition core: LED pulsing, ADC bursts, sine regression,
/// dynamic gain. The job wrapper owns publishing and scheduling.
pub struct OdSampler {
    adc: Box<dyn Adc>,
    led: Box<dyn Dac>,
    led_channel: LedChannel,
    pub ir_led_intensity: f64,
    channels: Vec<OdChannelSpec>,
    samples_per_record: usize,
    /// Pause between ADC conversions; spaces the burst across mains cycles.
    sample_spacing: Duration,
    pub ac_hz: f64,
    prior_dc: BTreeMap<String, f64>,
    max_signal_ema: Ema,
    records_taken: usize,
    gain_review_every: usize,
}

impl OdSampler {
    pub fn new(
        adc: Box<dyn Adc>,
        led: Box<dyn Dac>,
        led_channel: LedChannel,
        channels: Vec<OdChannelSpec>,
        config: &OdConfig,
    ) -> Self {
        Self {
            adc,
            led,
            led_channel,
            ir_led_intensity: config.ir_led_intensity,
            channels,
            samples_per_record: config.samples_per_record.max(4),
            sample_spacing: Duration::from_micros(1250),
            ac_hz: 60.0,
            prior_dc: BTreeMap::new(),
            max_signal_ema: Ema::new(0.5),
            records_taken: 0,
            gain_review_every: config.gain_review_every.max(1),
        }
    }

    pub fn with_sample_spacing(mut self, spacing: Duration) -> Self {
        self.sample_spacing = spacing;
        self
    }

    pub fn channels(&self) -> &[OdChannelSpec] {
        &self.channels
    }

    pub fn led_on(&mut self) -> Result<()> {
        self.led
            .set_intensity(self.led_channel, self.ir_led_intensity)
    }

    pub fn led_off(&mut self) -> Result<()> {
        self.led.set_intensity(self.led_channel, 0.0)
    }

    fn collect_bursts(&mut self) -> Result<BTreeMap<String, AdcBurst>> {
        self.led_on()?;
        let result = self.collect_bursts_led_lit();
        // the LED goes dark even when the sweep failed mid-way
        let off = self.led_off();
        let bursts = result?;
        off?;
        Ok(bursts)
    }

    fn collect_bursts_led_lit(&mut self) -> Result<BTreeMap<String, AdcBurst>> {
        let mut bursts = BTreeMap::new();
        let started = Instant::now();
        for spec in self.channels.clone() {
            let mut burst = AdcBurst::default();
            for _ in 0..self.samples_per_record {
                burst
                    .timestamps
                    .push(started.elapsed().as_micros() as f64 / 1e6);
                burst.readings.push(self.adc.read_voltage(spec.adc_channel)?);
                std::thread::sleep(self.sample_spacing);
            }
            bursts.insert(spec.label.clone(), burst);
        }
        Ok(bursts)
    }

    fn fit_dc(&self, label: &str, burst: &AdcBurst, freq: f64) -> SineFit {
        let prior = self.prior_dc.get(label).copied();
        let penalty = if prior.is_some() { PRIOR_PENALTY } else { 0.0 };
        sine_regression(&burst.timestamps, &burst.readings, freq, prior, penalty)
    }

    /// Take one record: per-channel DC voltage, mains interference removed.
    pub fn record(&mut self) -> Result<BTreeMap<String, f64>> {
        let bursts = self.collect_bursts()?;
        let mut levels = BTreeMap::new();
        for (label, burst) in &bursts {
            let fit = self.fit_dc(label, burst, self.ac_hz);
            let dc = fit.c.max(0.0);
            self.prior_dc.insert(label.clone(), dc);
            levels.insert(label.clone(), dc);
        }

        if let Some(&max_signal) = levels
            .values()
            .max_by(|a, b| a.partial_cmp(b).unwrap())
        {
            self.max_signal_ema.update(max_signal);
        }
        self.records_taken += 1;
        if self.records_taken % self.gain_review_every == 0 {
            self.review_gain();
        }
        if self.records_taken % MAINS_RECHECK_EVERY == 0 {
            if let Err(e) = self.determine_best_ac_hz() {
                log::debug!("mains-frequency recheck failed: {e}");
            }
        }
        Ok(levels)
    }

    /// Pick the gain whose band the running signal mean sits in.
    fn review_gain(&mut self) {
        let Some(mean) = self.max_signal_ema.value() else {
            return;
        };
        for gain in Gain::ALL {
            let (lower, upper) = gain.band();
            if 0.85 * lower <= mean && mean < 0.85 * upper && self.adc.gain() != gain {
                self.adc.set_gain(gain);
                log::info!("ADC gain updated to {gain:?} (signal mean {mean:.3} V)");
                break;
            }
        }
    }

    /// Fit a fresh burst at the candidate mains frequencies and keep the one
    /// minimizing the summed AIC.
    pub fn determine_best_ac_hz(&mut self) -> Result<f64> {
        let bursts = self.collect_bursts()?;
        let best = best_ac_hz(&bursts, |label, burst, freq| self.fit_dc(label, burst, freq));
        self.ac_hz = best;
        log::debug!("selected {best} Hz mains frequency");
        Ok(best)
    }
}

/// AIC-minimizing frequency over the 50/60 Hz candidates.
pub fn best_ac_hz<F>(bursts: &BTreeMap<String, AdcBurst>, mut fit: F) -> f64
where
    F: FnMut(&str, &AdcBurst, f64) -> SineFit,
{
    let mut best = (60.0, f64::INFINITY);
    for candidate in [50.0, 60.0] {
        let total: f64 = bursts
            .iter()
            .map(|(label, burst)| fit(label, burst, candidate))
            .map(|f| f.aic)
            .sum();
        if total < best.1 {
            best = (candidate, total);
        }
    }
    best.0
}

// ---------------------------------------------------------------------------
// Job wrapper
// ---------------------------------------------------------------------------

pub struct OdReader {
    pub host: Arc<JobHost>,
    timer: Arc<std::sync::Mutex<Option<RepeatedTimer>>>,
}

/// Start the OD reading job: wires the sampler to the bus and samples every
/// `1/samples_per_second` seconds until disconnected.
pub fn start_od_reading(
    ctx: NodeCtx,
    config: &OdConfig,
    adc: Box<dyn Adc>,
    led: Box<dyn Dac>,
) -> Result<OdReader> {
    let specs = channel_specs(&config.angle_to_adc_channel)?;
    let led_channel = LedChannel::parse(&config.ir_led_channel).ok_or_else(|| {
        Error::Config(format!("bad LED channel {:?}", config.ir_led_channel))
    })?;
    let transformer = CalibrationTransformer::from_stores(
        &ctx.stores,
        &specs,
        config.ir_led_intensity,
        config.use_calibration,
    )?;

    let mut sampler = OdSampler::new(adc, led, led_channel, specs, config);
    sampler.determine_best_ac_hz()?;

    let host = JobHost::init(JOB_NAME, ctx)?;
    let pause = Arc::new(AtomicBool::new(false));

    {
        let pause = Arc::clone(&pause);
        host.subscribe(
            &[host.job_topic("pause").as_str()],
            Qos::AtLeastOnce,
            true,
            move |message| {
                let on = message.payload_str().trim() == "1";
                pause.store(on, Ordering::SeqCst);
                log::info!("od_reading: pause={}", u8::from(on));
            },
        )?;
    }

    let sampler = Arc::new(std::sync::Mutex::new(sampler));
    let transformer = Arc::new(std::sync::Mutex::new(transformer));

    let setting_sampler = Arc::clone(&sampler);
    host.declare_setting(
        "ir_led_intensity",
        crate::job::SettingMeta::float(true, Some("%")),
        move |_, payload| {
            let intensity = crate::job::parse_setting::<f64>(payload)
                .filter(|v| (0.0..=100.0).contains(v))?;
            setting_sampler.lock().unwrap().ir_led_intensity = intensity;
            Some(intensity.to_string())
        },
    );
    host.activate()?;

    let timer_slot: Arc<std::sync::Mutex<Option<RepeatedTimer>>> =
        Arc::new(std::sync::Mutex::new(None));
    let disconnect_slot = Arc::clone(&timer_slot);
    host.on_disconnect(move |_| {
        if let Some(mut timer) = disconnect_slot.lock().unwrap().take() {
            timer.cancel();
        }
    });

    let tick_host = Arc::clone(&host);
    let tick_sampler = Arc::clone(&sampler);
    let tick_transformer = Arc::clone(&transformer);
    let tick_pause = Arc::clone(&pause);

    let interval = Duration::from_secs_f64(1.0 / config.samples_per_second.max(1e-6));
    let timer = RepeatedTimer::new(interval, true, move || {
        if tick_pause.load(Ordering::SeqCst) {
            return;
        }
        if tick_host.state() != crate::job::JobState::Ready {
            return;
        }
        let outcome = {
            let mut sampler = tick_sampler.lock().unwrap();
            sampler.record()
        };
        match outcome {
            Ok(levels) => {
                let mut transformer = tick_transformer.lock().unwrap();
                let mut batch = BTreeMap::new();
                for (label, volts) in levels {
                    let od = transformer.transform(&label, volts);
                    batch.insert(label.clone(), od);
                    let _ = tick_host.publish_job(
                        &format!("od_raw/{label}"),
                        od.to_string().as_bytes(),
                        Qos::AtMostOnce,
                        false,
                    );
                }
                if let Ok(payload) = serde_json::to_vec(&batch) {
                    let _ = tick_host.publish_exp(
                        "od_raw_batched",
                        &payload,
                        Qos::ExactlyOnce,
                        false,
                    );
                }
            }
            Err(Error::Hardware(e)) => {
                // transient bus hiccups happen when pumps kick in; wait it out
                let _ = tick_host.publish_exp(
                    "error_log",
                    format!("[od_reading] failed with {e}; attempting to continue").as_bytes(),
                    Qos::AtMostOnce,
                    false,
                );
                std::thread::sleep(Duration::from_secs(5));
            }
            Err(e) => {
                let _ = tick_host.publish_exp(
                    "error_log",
                    format!("[od_reading] failed with {e}").as_bytes(),
                    Qos::AtMostOnce,
                    false,
                );
                log::error!("od_reading: {e}");
                tick_host.transition(crate::job::JobState::Disconnected);
            }
        }
    });

    *timer_slot.lock().unwrap() = Some(timer);
    host.ready();
    Ok(OdReader {
        host,
        timer: timer_slot,
    })
}

impl OdReader {
    pub fn shutdown(&mut self) {
        self.host.transition(crate::job::JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Sample `n_records` and persist the per-channel median and variance used
/// to normalize OD readings downstream.
pub fn od_normalization(
    sampler: &mut OdSampler,
    stores: &Stores,
    n_records: usize,
) -> Result<(BTreeMap<String, f64>, BTreeMap<String, f64>)> {
    let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for _ in 0..n_records {
        for (label, value) in sampler.record()? {
            series.entry(label).or_default().push(value);
        }
    }

    let mut medians = BTreeMap::new();
    let mut variances = BTreeMap::new();
    for (label, mut values) in series {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = if values.len() > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
        } else {
            0.0
        };
        medians.insert(label.clone(), median);
        variances.insert(label, variance);
    }

    let binding = stores.persistent(names::OD_NORMALIZATION);
    let mut guard = binding.open()?;
    guard.set("median", serde_json::to_string(&medians)?);
    guard.set("variance", serde_json::to_string(&variances)?);
    Ok((medians, variances))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::adc::SimAdc;
    use crate::hardware::dac::SimDac;

    fn test_config(channels: &[(&str, u8)]) -> OdConfig {
        let mut config = OdConfig::default();
        config.angle_to_adc_channel =
            channels.iter().map(|(a, c)| (a.to_string(), *c)).collect();
        config
    }

    fn sine_sampler(freq: f64, c: f64, a: f64) -> OdSampler {
        let config = test_config(&[("135", 0), ("90", 1)]);
        let specs = channel_specs(&config.angle_to_adc_channel).unwrap();
        let adc = SimAdc::new(Gain::One, move |_, t| {
            c + a * (2.0 * std::f64::consts::PI * freq * t).sin()
        });
        OdSampler::new(
            Box::new(adc),
            Box::new(SimDac::new()),
            LedChannel::A,
            specs,
            &config,
        )
        .with_sample_spacing(Duration::from_millis(2))
    }

    // -----------------------------------------------------------------------
    // Channel labeling
    // -----------------------------------------------------------------------

    #[test]
    fn bare_angles_get_letter_labels() {
        let config = test_config(&[("135", 0), ("90", 1)]);
        let specs = channel_specs(&config.angle_to_adc_channel).unwrap();
        let labels: Vec<&str> = specs.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["135/A", "90/A"]);
    }

    #[test]
    fn explicit_labels_pass_through() {
        let config = test_config(&[("135/A", 0), ("135/B", 1)]);
        let specs = channel_specs(&config.angle_to_adc_channel).unwrap();
        assert_eq!(specs[0].angle, "135");
        assert_eq!(specs[1].label, "135/B");
    }

    #[test]
    fn bad_angle_is_a_config_error() {
        let config = test_config(&[("100", 0)]);
        assert!(channel_specs(&config.angle_to_adc_channel).is_err());
    }

    // -----------------------------------------------------------------------
    // Sampling
    // -----------------------------------------------------------------------

    #[test]
    fn record_recovers_dc_level_under_mains_interference() {
        let mut sampler = sine_sampler(60.0, 2.0, 0.4);
        let levels = sampler.record().unwrap();
        for (label, level) in levels {
            assert!(
                (level - 2.0).abs() < 0.1,
                "{label} DC off: {level} (expected ≈ 2.0)"
            );
        }
    }

    #[test]
    fn led_is_pulsed_per_record() {
        let config = test_config(&[("90", 0)]);
        let specs = channel_specs(&config.angle_to_adc_channel).unwrap();
        let dac = SimDac::new();
        let probe = dac.clone();
        let mut sampler = OdSampler::new(
            Box::new(SimAdc::constant(Gain::One, 1.0)),
            Box::new(dac),
            LedChannel::A,
            specs,
            &config,
        )
        .with_sample_spacing(Duration::from_micros(200));
        sampler.record().unwrap();
        // off after the sweep, and it was driven at the configured intensity
        assert_eq!(probe.level(LedChannel::A), 0.0);
        sampler.led_on().unwrap();
        assert_eq!(probe.level(LedChannel::A), OdConfig::default().ir_led_intensity);
    }

    #[test]
    fn best_ac_hz_picks_the_true_frequency() {
        for (true_hz, other) in [(50.0, 60.0), (60.0, 50.0)] {
            let mut sampler = sine_sampler(true_hz, 1.0, 0.3);
            let picked = sampler.determine_best_ac_hz().unwrap();
            assert_eq!(picked, true_hz, "should beat {other}");
        }
    }

    #[test]
    fn gain_ladder_steps_down_for_small_signals() {
        let config = test_config(&[("90", 0)]);
        let specs = channel_specs(&config.angle_to_adc_channel).unwrap();
        let mut sampler = OdSampler::new(
            Box::new(SimAdc::constant(Gain::One, 0.1)),
            Box::new(SimDac::new()),
            LedChannel::A,
            specs,
            &config,
        )
        .with_sample_spacing(Duration::from_micros(100));
        for _ in 0..OdConfig::default().gain_review_every {
            sampler.record().unwrap();
        }
        // 0.1 V sits inside the ±0.256 V band
        assert_eq!(sampler.adc.gain(), Gain::Sixteen);
    }

    // -----------------------------------------------------------------------
    // Calibration transformer
    // -----------------------------------------------------------------------

    fn linear_od_calibration(angle: &str, channel: u8, intensity: f64) -> OdCalibration {
        OdCalibration {
            name: "linear".into(),
            timestamp: chrono::Utc::now(),
            angle: angle.into(),
            curve_type: "poly".into(),
            curve_data_: vec![2.0, 0.0],
            maximum_od600: 2.0,
            minimum_od600: 0.0,
            minimum_voltage: 0.0,
            maximum_voltage: 1.0,
            ir_led_intensity: intensity,
            pd_channel: channel.to_string(),
            voltages: vec![],
            inferred_od600s: vec![],
        }
    }

    fn scratch() -> (tempfile::TempDir, Stores) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        (dir, stores)
    }

    #[test]
    fn transformer_off_passes_voltages_through() {
        let (_dir, stores) = scratch();
        let specs = channel_specs(&test_config(&[("90", 2)]).angle_to_adc_channel).unwrap();
        let mut t = CalibrationTransformer::from_stores(&stores, &specs, 50.0, false).unwrap();
        assert!(matches!(t, CalibrationTransformer::Null));
        assert_eq!(t.transform("90/A", 0.5), 0.5);
    }

    #[test]
    fn transformer_without_stored_curve_is_empty() {
        let (_dir, stores) = scratch();
        let specs = channel_specs(&test_config(&[("90", 2)]).angle_to_adc_channel).unwrap();
        let t = CalibrationTransformer::from_stores(&stores, &specs, 50.0, true).unwrap();
        assert_eq!(t.model_count(), 0);
    }

    #[test]
    fn transformer_inverts_linear_curve() {
        let (_dir, stores) = scratch();
        calibration::store_od_calibration(&stores, &linear_od_calibration("90", 2, 50.0)).unwrap();
        let specs = channel_specs(&test_config(&[("90", 2)]).angle_to_adc_channel).unwrap();
        let mut t = CalibrationTransformer::from_stores(&stores, &specs, 50.0, true).unwrap();
        assert_eq!(t.model_count(), 1);
        assert!((t.transform("90/A", 0.5) - 0.25).abs() < 1e-4);
        // past the calibrated maximum: clipped to the curve's extremum
        assert!((t.transform("90/A", 10.0) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn led_intensity_mismatch_fails_at_setup() {
        let (_dir, stores) = scratch();
        calibration::store_od_calibration(&stores, &linear_od_calibration("90", 2, 50.0)).unwrap();
        let specs = channel_specs(&test_config(&[("90", 2)]).angle_to_adc_channel).unwrap();
        let result = CalibrationTransformer::from_stores(&stores, &specs, 90.0, true);
        assert!(matches!(result, Err(Error::Calibration(_))));
    }

    #[test]
    fn adc_channel_mismatch_fails_at_setup() {
        let (_dir, stores) = scratch();
        calibration::store_od_calibration(&stores, &linear_od_calibration("90", 2, 50.0)).unwrap();
        let specs = channel_specs(&test_config(&[("90", 1)]).angle_to_adc_channel).unwrap();
        let result = CalibrationTransformer::from_stores(&stores, &specs, 50.0, true);
        assert!(matches!(result, Err(Error::Calibration(_))));
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn normalization_persists_median_and_variance() {
        let (_dir, stores) = scratch();
        let mut sampler = sine_sampler(60.0, 1.0, 0.05);
        let (medians, variances) = od_normalization(&mut sampler, &stores, 5).unwrap();
        assert!((medians["135/A"] - 1.0).abs() < 0.05);
        assert!(variances["135/A"] >= 0.0);

        let binding = stores.persistent(names::OD_NORMALIZATION);
        let guard = binding.open().unwrap();
        let stored: BTreeMap<String, f64> =
            serde_json::from_str(guard.get("median").unwrap()).unwrap();
        assert_eq!(stored.len(), 2);
    }
}
