//! Growth-rate estimation over batched OD readings.
//!
//! An EKF jointly tracks one filtered OD per photodiode and the exponential
//! growth rate. Readings are scaled by the per-angle normalization medians
//! before they reach the filter; 180° channels measure transmission rather
//! than backscatter and are excluded from inference. Dosing events inflate
//! the OD observation variance for a two-minute window so a dilution's sharp
//! OD step is not read as a growth-rate change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nalgebra::{DMatrix, DVector};

use crate::bus::Qos;
use crate::config::OdConfig;
use crate::error::{Error, Result};
use crate::job::{JobHost, JobState, NodeCtx};
use crate::math::ekf::Ekf;
use crate::stores::{Stores, names};

pub const JOB_NAME: &str = "growth_rate_calculating";

/// Observation-variance inflation applied on a dosing event.
pub const DOSING_VARIANCE_FACTOR: f64 = 2e4;
/// How long the inflation lasts (≈ two minutes of samples).
pub const DOSING_VARIANCE_WINDOW: Duration = Duration::from_secs(120);

/// Drop transmission channels and order angles the way the wire batch does
/// (descending), scaling each by its normalization median.
fn scale_and_order(
    batch: &BTreeMap<String, f64>,
    medians: &BTreeMap<String, f64>,
) -> Vec<(String, f64)> {
    let mut rows: Vec<(String, f64)> = batch
        .iter()
        .filter(|(label, _)| !label.starts_with("180"))
        .map(|(label, &value)| {
            let median = medians.get(label).copied().unwrap_or(1.0);
            (label.clone(), value / median)
        })
        .collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    rows
}

/// Bus-free estimation core.
pub struct GrowthRateCore {
    ekf: Ekf,
    labels: Vec<String>,
    medians: BTreeMap<String, f64>,
}

impl GrowthRateCore {
    /// Seed from the first scaled observation batch.
    ///
    /// `dt` is the tick interval in hours. Per-angle observation variances
    /// come from the normalization pass; missing entries fall back to a
    /// shared default so the relative weighting is flat.
    pub fn new(
        first_batch: &BTreeMap<String, f64>,
        initial_rate: f64,
        medians: BTreeMap<String, f64>,
        variances: &BTreeMap<String, f64>,
        dt: f64,
    ) -> Result<Self> {
        let scaled = scale_and_order(first_batch, &medians);
        if scaled.is_empty() {
            return Err(Error::InvalidArgument(
                "no usable OD channels in the first batch".into(),
            ));
        }
        let labels: Vec<String> = scaled.iter().map(|(l, _)| l.clone()).collect();
        let k = labels.len();

        let mut initial_state = DVector::zeros(k + 1);
        for (i, (_, value)) in scaled.iter().enumerate() {
            initial_state[i] = *value;
        }
        initial_state[k] = initial_rate;

        let mut initial_covariance = DMatrix::zeros(k + 1, k + 1);
        for i in 0..k {
            initial_covariance[(i, i)] = 0.001 * initial_state[i];
        }
        initial_covariance[(k, k)] = 0.001 * 1e-4;

        let mut process_noise = DMatrix::zeros(k + 1, k + 1);
        for i in 0..k {
            process_noise[(i, i)] = (1e-2 * dt).powi(2);
        }
        process_noise[(k, k)] = (0.005 * dt).powi(2);

        // relative channel weights from the normalization variances
        let raw: Vec<f64> = labels
            .iter()
            .map(|label| variances.get(label).copied().unwrap_or(1e-5))
            .collect();
        let smallest = raw.iter().cloned().fold(f64::INFINITY, f64::min).max(1e-30);
        let observation_noise = DVector::from_iterator(
            k,
            raw.iter().map(|v| 100.0 * (0.05 * dt).powi(2) * (v / smallest)),
        );

        Ok(Self {
            ekf: Ekf::new(
                initial_state,
                initial_covariance,
                process_noise,
                observation_noise,
                dt,
            )?,
            labels,
            medians,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn growth_rate(&self) -> f64 {
        self.ekf.growth_rate()
    }

    /// Fold one batch in; returns the rate and the filtered OD per label.
    pub fn step(&mut self, batch: &BTreeMap<String, f64>) -> Result<(f64, Vec<(String, f64)>)> {
        let scaled = scale_and_order(batch, &self.medians);
        let observation: Vec<f64> = scaled.iter().map(|(_, v)| *v).collect();
        self.ekf.update(&observation)?;
        let filtered = self
            .labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), self.ekf.od(i)))
            .collect();
        Ok((self.ekf.growth_rate(), filtered))
    }

    pub fn inflate_observation_variance(&mut self) {
        self.ekf.scale_od_variance(DOSING_VARIANCE_FACTOR);
    }

    pub fn restore_observation_variance(&mut self) {
        self.ekf.restore_od_variance();
    }
}

/// Read the persisted normalization tables.
pub fn normalization_tables(
    stores: &Stores,
) -> Result<(BTreeMap<String, f64>, BTreeMap<String, f64>)> {
    let cache = stores.persistent(names::OD_NORMALIZATION);
    let guard = cache.open()?;
    let medians = match guard.get("median") {
        Some(raw) => serde_json::from_str(raw)?,
        None => BTreeMap::new(),
    };
    let variances = match guard.get("variance") {
        Some(raw) => serde_json::from_str(raw)?,
        None => BTreeMap::new(),
    };
    Ok((medians, variances))
}

// ---------------------------------------------------------------------------
// Job wrapper
// ---------------------------------------------------------------------------

pub struct GrowthRateCalculator {
    pub host: Arc<JobHost>,
}

/// Start the job: seed the filter, then track every `od_raw_batched` batch
/// until disconnected.
pub fn start_growth_rate_calculating(
    ctx: NodeCtx,
    od_config: &OdConfig,
    ignore_cache: bool,
) -> Result<GrowthRateCalculator> {
    let host = JobHost::init(JOB_NAME, ctx)?;
    host.activate()?;

    let initial_rate = if ignore_cache {
        1.0
    } else {
        host.subscribe_once(
            &host.job_topic("growth_rate"),
            Qos::ExactlyOnce,
            Duration::from_secs(2),
        )?
        .and_then(|m| m.payload_f64())
        .unwrap_or(0.0)
    };

    let (medians, variances) = normalization_tables(&host.ctx.stores)?;
    let dt = 1.0 / od_config.samples_per_second.max(1e-6) / 3600.0;

    // the filter seeds from the first live batch
    let first = host
        .subscribe_once(
            &host.exp_topic("od_raw_batched"),
            Qos::ExactlyOnce,
            Duration::from_secs(300),
        )?
        .ok_or_else(|| Error::Config("no OD readings arriving; is od_reading running?".into()))?;
    let first_batch: BTreeMap<String, f64> = serde_json::from_slice(&first.payload)?;

    let core = Arc::new(Mutex::new(GrowthRateCore::new(
        &first_batch,
        initial_rate,
        medians,
        &variances,
        dt,
    )?));

    // -- od_raw_batched → EKF step → publish -------------------------------
    let step_core = Arc::clone(&core);
    let step_host = Arc::clone(&host);
    host.subscribe(
        &[host.exp_topic("od_raw_batched").as_str()],
        Qos::ExactlyOnce,
        false,
        move |message| {
            if step_host.state() != JobState::Ready {
                return;
            }
            let batch: BTreeMap<String, f64> = match serde_json::from_slice(&message.payload) {
                Ok(batch) => batch,
                Err(e) => {
                    log::error!("growth_rate_calculating: bad batch: {e}");
                    return;
                }
            };
            let outcome = step_core.lock().unwrap().step(&batch);
            match outcome {
                Ok((rate, filtered)) => {
                    let _ = step_host.publish_job(
                        "growth_rate",
                        rate.to_string().as_bytes(),
                        Qos::ExactlyOnce,
                        true,
                    );
                    for (label, od) in filtered {
                        let _ = step_host.publish_job(
                            &format!("od_filtered/{label}"),
                            od.to_string().as_bytes(),
                            Qos::AtMostOnce,
                            false,
                        );
                    }
                }
                Err(e) => log::error!("growth_rate_calculating: update failed: {e}; skipping"),
            }
        },
    )?;

    // -- dosing events → variance window -----------------------------------
    let window_generation = Arc::new(AtomicU64::new(0));
    let dosing_core = Arc::clone(&core);
    let dosing_generation = Arc::clone(&window_generation);
    host.subscribe(
        &[host.exp_topic("dosing_events").as_str()],
        Qos::ExactlyOnce,
        false,
        move |_message| {
            let generation = dosing_generation.fetch_add(1, Ordering::SeqCst) + 1;
            dosing_core.lock().unwrap().inflate_observation_variance();

            let restore_core = Arc::clone(&dosing_core);
            let restore_generation = Arc::clone(&dosing_generation);
            std::thread::spawn(move || {
                std::thread::sleep(DOSING_VARIANCE_WINDOW);
                // a newer event supersedes this window's restore
                if restore_generation.load(Ordering::SeqCst) == generation {
                    restore_core.lock().unwrap().restore_observation_variance();
                }
            });
        },
    )?;

    host.ready();
    Ok(GrowthRateCalculator { host })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn default_core(first: &BTreeMap<String, f64>) -> GrowthRateCore {
        // 5 s ticks, in hours
        GrowthRateCore::new(first, 0.0, BTreeMap::new(), &BTreeMap::new(), 5.0 / 3600.0).unwrap()
    }

    // -----------------------------------------------------------------------
    // Batch conditioning
    // -----------------------------------------------------------------------

    #[test]
    fn transmission_channels_are_dropped() {
        let first = batch(&[("135/A", 0.4), ("180/A", 0.9)]);
        let core = default_core(&first);
        assert_eq!(core.labels(), ["135/A"]);
    }

    #[test]
    fn angles_are_ordered_descending() {
        let first = batch(&[("45/A", 0.2), ("135/A", 0.4), ("90/A", 0.3)]);
        let core = default_core(&first);
        assert_eq!(core.labels(), ["90/A", "45/A", "135/A"]);
    }

    #[test]
    fn normalization_median_scales_observations() {
        let first = batch(&[("135/A", 0.5)]);
        let medians = batch(&[("135/A", 0.5)]);
        let core = GrowthRateCore::new(
            &first,
            0.0,
            medians,
            &BTreeMap::new(),
            5.0 / 3600.0,
        )
        .unwrap();
        // 0.5 / 0.5 = 1.0 seeds the filter
        assert!((core.ekf.od(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let first = batch(&[("180/A", 0.9)]);
        assert!(
            GrowthRateCore::new(&first, 0.0, BTreeMap::new(), &BTreeMap::new(), 0.001).is_err()
        );
    }

    // -----------------------------------------------------------------------
    // Filtering
    // -----------------------------------------------------------------------

    #[test]
    fn constant_od_keeps_rate_near_zero() {
        let first = batch(&[("135/A", 1.0)]);
        let mut core = default_core(&first);
        for _ in 0..200 {
            let (rate, filtered) = core.step(&first).unwrap();
            assert!(rate.abs() < 0.1);
            assert!((filtered[0].1 - 1.0).abs() < 0.05);
        }
    }

    #[test]
    fn step_reports_every_label() {
        let first = batch(&[("135/A", 0.4), ("90/A", 0.3)]);
        let mut core = default_core(&first);
        let (_, filtered) = core.step(&first).unwrap();
        let labels: Vec<&str> = filtered.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, ["90/A", "135/A"]);
    }

    #[test]
    fn variance_inflation_round_trips() {
        let first = batch(&[("135/A", 1.0)]);
        let mut core = default_core(&first);
        core.step(&first).unwrap();
        core.inflate_observation_variance();
        assert!(core.ekf.is_scaling_od_variance());
        core.inflate_observation_variance(); // a second event re-applies
        core.restore_observation_variance();
        assert!(!core.ekf.is_scaling_od_variance());
    }

    // -----------------------------------------------------------------------
    // Normalization tables
    // -----------------------------------------------------------------------

    #[test]
    fn missing_tables_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        let (medians, variances) = normalization_tables(&stores).unwrap();
        assert!(medians.is_empty());
        assert!(variances.is_empty());
    }

    #[test]
    fn stored_tables_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        {
            let cache = stores.persistent(names::OD_NORMALIZATION);
            let mut guard = cache.open().unwrap();
            guard.set("median", r#"{"135/A":0.5}"#);
            guard.set("variance", r#"{"135/A":1e-6}"#);
        }
        let (medians, variances) = normalization_tables(&stores).unwrap();
        assert_eq!(medians["135/A"], 0.5);
        assert_eq!(variances["135/A"], 1e-6);
    }
}
