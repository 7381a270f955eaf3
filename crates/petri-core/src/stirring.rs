//! Stirring: hall-sensor RPM feedback onto a PWM fan driver.
//!
//! Every 23 seconds (coprime with the OD tick, so the two never beat) the
//! controller watches the hall sensor for ~4 s, converts the pulse train to
//! RPM, smooths it with an EMA, and nudges the duty cycle by the PID output.
//! The first duty cycle comes from the stored stirring calibration, blended
//! conservatively with the current value so the PID has room to finish the
//! move.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::bus::Qos;
use crate::config::StirringConfig;
use crate::error::Result;
use crate::hardware::gpio::EdgeSource;
use crate::hardware::pwm::Pwm;
use crate::job::{JobHost, JobState, NodeCtx, SettingMeta, parse_setting};
use crate::math::clamp;
use crate::math::ema::Ema;
use crate::math::pid::PidController;
use crate::stores::{Stores, names};
use crate::timing::RepeatedTimer;

pub const JOB_NAME: &str = "stirring";

/// Ignore hall edges closer than this; at 1000 RPM pulses are ~60 ms apart.
const DEBOUNCE: Duration = Duration::from_millis(15);

/// How to turn a pulse train into RPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpmMethod {
    /// Pulses per window: robust, coarse.
    FromCount,
    /// Inverse mean inter-pulse interval: finer, needs ≥ 2 edges.
    FromFrequency,
}

/// Convert edge timestamps (seconds) observed over `window_secs` to RPM.
pub fn rpm_from_edges(method: RpmMethod, edges: &[f64], window_secs: f64) -> f64 {
    match method {
        RpmMethod::FromCount => edges.len() as f64 * 60.0 / window_secs,
        RpmMethod::FromFrequency => {
            if edges.len() < 2 {
                return 0.0;
            }
            let total: f64 = edges.windows(2).map(|w| w[1] - w[0]).sum();
            if total == 0.0 {
                return 0.0;
            }
            (edges.len() - 1) as f64 * 60.0 / total
        }
    }
}

#[derive(Debug, Deserialize)]
struct StirringCalibrationLine {
    rpm_coef: f64,
    intercept: f64,
}

/// Duty-cycle seed for `target_rpm`: calibrated prediction blended
/// `0.1·current + 0.9·predicted`; without a calibration, the current DC.
pub fn rpm_to_dc_seed(stores: &Stores, current_dc: f64, target_rpm: f64) -> f64 {
    let binding = stores.persistent(names::STIRRING_CALIBRATION);
    let Ok(guard) = binding.open() else {
        return current_dc;
    };
    let Some(raw) = guard.get("linear_v1") else {
        return current_dc;
    };
    match serde_json::from_str::<StirringCalibrationLine>(raw) {
        Ok(line) => {
            let predicted = line.rpm_coef * target_rpm + line.intercept;
            current_dc - 0.9 * (current_dc - predicted)
        }
        Err(e) => {
            log::debug!("unreadable stirring calibration: {e}");
            current_dc
        }
    }
}

/// Bus-free control core.
pub struct Stirrer {
    pwm: Pwm,
    edge_source: Option<Box<dyn EdgeSource>>,
    method: RpmMethod,
    stores: Stores,
    pub target_rpm: f64,
    pub duty_cycle: f64,
    previous_duty_cycle: f64,
    measured: Ema,
    pid: PidController,
    poll_for: Duration,
}

impl Stirrer {
    pub fn new(
        mut pwm: Pwm,
        edge_source: Option<Box<dyn EdgeSource>>,
        config: &StirringConfig,
        stores: Stores,
        pid: PidController,
    ) -> Result<Self> {
        pwm.lock()?;
        let duty_cycle = rpm_to_dc_seed(&stores, config.initial_duty_cycle, config.target_rpm);
        Ok(Self {
            pwm,
            edge_source,
            method: RpmMethod::FromFrequency,
            stores,
            target_rpm: config.target_rpm,
            duty_cycle,
            previous_duty_cycle: 0.0,
            measured: Ema::new(0.05),
            pid,
            poll_for: Duration::from_secs_f64(config.poll_for_secs),
        })
    }

    pub fn measured_rpm(&self) -> Option<f64> {
        self.measured.value()
    }

    /// Spin up: full power for momentum, then settle at the seeded DC.
    pub fn start_stirring(&mut self) -> Result<()> {
        self.pwm.start(100.0)?;
        std::thread::sleep(Duration::from_millis(250));
        self.set_duty_cycle(self.duty_cycle);
        Ok(())
    }

    pub fn stop_stirring(&mut self) {
        self.set_duty_cycle(0.0);
    }

    /// One RPM observation, EMA-smoothed. `None` without a hall sensor.
    pub fn poll(&mut self) -> Result<Option<f64>> {
        let Some(source) = self.edge_source.as_mut() else {
            return Ok(None);
        };
        let edges = source.collect_edges(self.poll_for, DEBOUNCE)?;
        let recent = rpm_from_edges(self.method, &edges, self.poll_for.as_secs_f64());
        if recent == 0.0 {
            log::warn!("stirring RPM is 0; has stirring failed?");
        }
        Ok(Some(self.measured.update(recent)))
    }

    /// Poll, then nudge the duty cycle by the PID delta.
    pub fn poll_and_update_dc(&mut self) -> Result<()> {
        let Some(rpm) = self.poll()? else {
            return Ok(());
        };
        let delta = self.pid.update(rpm);
        self.set_duty_cycle(self.duty_cycle + delta);
        Ok(())
    }

    pub fn set_duty_cycle(&mut self, value: f64) {
        self.duty_cycle = clamp(0.0, value, 100.0);
        self.pwm.change_duty_cycle(self.duty_cycle);
    }

    pub fn set_target_rpm(&mut self, rpm: f64) {
        self.target_rpm = rpm;
        let seeded = rpm_to_dc_seed(&self.stores, self.duty_cycle, rpm);
        self.set_duty_cycle(seeded);
        self.pid.set_setpoint(rpm);
    }

    /// ready → sleeping: remember the DC and cut power.
    pub fn pause_stirring(&mut self) {
        self.previous_duty_cycle = self.duty_cycle;
        self.stop_stirring();
    }

    /// sleeping → ready: pick up where we left off.
    pub fn resume_stirring(&mut self) -> Result<()> {
        self.duty_cycle = self.previous_duty_cycle;
        self.start_stirring()
    }

    pub fn shutdown(&mut self) {
        self.stop_stirring();
        self.pwm.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Job wrapper
// ---------------------------------------------------------------------------

pub struct StirringJob {
    pub host: Arc<JobHost>,
    timer: Arc<Mutex<Option<RepeatedTimer>>>,
}

pub fn start_stirring(
    ctx: NodeCtx,
    config: &StirringConfig,
    pwm: Pwm,
    edge_source: Option<Box<dyn EdgeSource>>,
) -> Result<StirringJob> {
    let host = JobHost::init(JOB_NAME, ctx)?;

    let pid = PidController::new(config.pid.kp, config.pid.ki, config.pid.kd, config.target_rpm)
        .with_stats_publisher(host.publisher(), host.exp_topic("pid_log"));
    let stirrer = Arc::new(Mutex::new(Stirrer::new(
        pwm,
        edge_source,
        config,
        host.ctx.stores.clone(),
        pid,
    )?));

    let rpm_stirrer = Arc::clone(&stirrer);
    host.declare_setting(
        "target_rpm",
        SettingMeta::float(true, Some("RPM")),
        move |_, payload| {
            let rpm = parse_setting::<f64>(payload)?;
            rpm_stirrer.lock().unwrap().set_target_rpm(rpm);
            Some(rpm.to_string())
        },
    );
    let dc_stirrer = Arc::clone(&stirrer);
    host.declare_setting(
        "duty_cycle",
        SettingMeta::float(true, Some("%")),
        move |_, payload| {
            let dc = parse_setting::<f64>(payload)?;
            let mut stirrer = dc_stirrer.lock().unwrap();
            stirrer.set_duty_cycle(dc);
            Some(stirrer.duty_cycle.to_string())
        },
    );
    host.declare_setting(
        "measured_rpm",
        SettingMeta::float(false, Some("RPM")),
        |_, _| None,
    );
    host.activate()?;

    let timer_slot: Arc<Mutex<Option<RepeatedTimer>>> = Arc::new(Mutex::new(None));

    let sleep_stirrer = Arc::clone(&stirrer);
    let sleep_timer = Arc::clone(&timer_slot);
    host.on_sleeping(move |_| {
        if let Some(timer) = sleep_timer.lock().unwrap().as_ref() {
            timer.pause();
        }
        sleep_stirrer.lock().unwrap().pause_stirring();
    });

    let wake_stirrer = Arc::clone(&stirrer);
    let wake_timer = Arc::clone(&timer_slot);
    host.on_ready(move |_| {
        let mut stirrer = wake_stirrer.lock().unwrap();
        if stirrer.previous_duty_cycle > 0.0 {
            let _ = stirrer.resume_stirring();
        }
        if let Some(timer) = wake_timer.lock().unwrap().as_ref() {
            timer.unpause();
        }
    });

    let stop_stirrer = Arc::clone(&stirrer);
    let stop_timer = Arc::clone(&timer_slot);
    host.on_disconnect(move |_| {
        if let Some(mut timer) = stop_timer.lock().unwrap().take() {
            timer.cancel();
        }
        stop_stirrer.lock().unwrap().shutdown();
    });

    log::debug!("starting stirring at {} RPM", config.target_rpm);
    stirrer.lock().unwrap().start_stirring()?;

    let tick_host = Arc::clone(&host);
    let tick_stirrer = Arc::clone(&stirrer);
    let timer = RepeatedTimer::new(
        Duration::from_secs_f64(config.poll_every_secs),
        true,
        move || {
            if tick_host.state() != JobState::Ready {
                return;
            }
            let mut stirrer = tick_stirrer.lock().unwrap();
            if let Err(e) = stirrer.poll_and_update_dc() {
                log::error!("stirring: rpm poll failed: {e}");
                return;
            }
            if let Some(rpm) = stirrer.measured_rpm() {
                let payload = serde_json::json!({
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "rpm": rpm,
                });
                let _ = tick_host.publish_setting("measured_rpm", payload.to_string().as_bytes());
            }
            let _ = tick_host.publish_job(
                "duty_cycle",
                stirrer.duty_cycle.to_string().as_bytes(),
                Qos::ExactlyOnce,
                true,
            );
        },
    );
    *timer_slot.lock().unwrap() = Some(timer);

    host.ready();
    Ok(StirringJob {
        host,
        timer: timer_slot,
    })
}

impl StirringJob {
    pub fn shutdown(&mut self) {
        self.host.transition(JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

/// Store a stirring calibration line (used by the calibration action).
pub fn store_stirring_calibration(stores: &Stores, rpm_coef: f64, intercept: f64) -> Result<()> {
    let mut map = BTreeMap::new();
    map.insert("rpm_coef", rpm_coef);
    map.insert("intercept", intercept);
    stores
        .persistent(names::STIRRING_CALIBRATION)
        .open()?
        .set("linear_v1", serde_json::to_string(&map)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gpio::{SimEdgeSource, SimOutput};

    fn scratch() -> (tempfile::TempDir, Stores) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        (dir, stores)
    }

    fn test_stirrer(stores: &Stores, pin: u32, interval_secs: f64) -> Stirrer {
        let config = StirringConfig::default();
        let pwm = Pwm::new(pin, config.pwm_hz, Box::new(SimOutput::new()));
        let pid = PidController::new(config.pid.kp, config.pid.ki, config.pid.kd, config.target_rpm);
        Stirrer::new(
            pwm,
            Some(Box::new(SimEdgeSource::steady(interval_secs))),
            &config,
            stores.clone(),
            pid,
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // RPM conversion
    // -----------------------------------------------------------------------

    #[test]
    fn rpm_from_count_scales_to_minutes() {
        let edges: Vec<f64> = (1..=40).map(|i| i as f64 * 0.1).collect();
        assert_eq!(rpm_from_edges(RpmMethod::FromCount, &edges, 4.0), 600.0);
    }

    #[test]
    fn rpm_from_frequency_uses_mean_interval() {
        let edges = vec![0.1, 0.2, 0.3, 0.4];
        let rpm = rpm_from_edges(RpmMethod::FromFrequency, &edges, 4.0);
        assert!((rpm - 600.0).abs() < 1e-9);
    }

    #[test]
    fn too_few_edges_reads_as_stalled() {
        assert_eq!(rpm_from_edges(RpmMethod::FromFrequency, &[], 4.0), 0.0);
        assert_eq!(rpm_from_edges(RpmMethod::FromFrequency, &[1.0], 4.0), 0.0);
    }

    // -----------------------------------------------------------------------
    // Duty-cycle seeding
    // -----------------------------------------------------------------------

    #[test]
    fn seed_without_calibration_keeps_current_dc() {
        let (_dir, stores) = scratch();
        assert_eq!(rpm_to_dc_seed(&stores, 60.0, 500.0), 60.0);
    }

    #[test]
    fn seed_blends_toward_calibrated_prediction() {
        let (_dir, stores) = scratch();
        store_stirring_calibration(&stores, 0.1, 10.0).unwrap();
        // prediction for 500 RPM: 60; blend from 80: 80 − 0.9·(80−60) = 62
        let seeded = rpm_to_dc_seed(&stores, 80.0, 500.0);
        assert!((seeded - 62.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Control loop
    // -----------------------------------------------------------------------

    #[test]
    fn duty_cycle_stays_clamped() {
        let (_dir, stores) = scratch();
        let mut stirrer = test_stirrer(&stores, 940, 0.1);
        stirrer.set_duty_cycle(150.0);
        assert_eq!(stirrer.duty_cycle, 100.0);
        stirrer.set_duty_cycle(-4.0);
        assert_eq!(stirrer.duty_cycle, 0.0);
        stirrer.shutdown();
    }

    #[test]
    fn poll_smooths_with_ema() {
        let (_dir, stores) = scratch();
        let mut stirrer = test_stirrer(&stores, 941, 0.1);
        // steady 600 RPM pulse train
        let first = stirrer.poll().unwrap().unwrap();
        assert!((first - 600.0).abs() < 30.0, "saw {first}");
        let second = stirrer.poll().unwrap().unwrap();
        assert!((second - 600.0).abs() < 30.0);
        stirrer.shutdown();
    }

    #[test]
    fn slow_rpm_pushes_duty_cycle_up() {
        let (_dir, stores) = scratch();
        // ~300 RPM against a 500 RPM setpoint
        let mut stirrer = test_stirrer(&stores, 942, 0.2);
        let before = stirrer.duty_cycle;
        stirrer.poll_and_update_dc().unwrap();
        assert!(
            stirrer.duty_cycle > before,
            "dc should rise: {before} → {}",
            stirrer.duty_cycle
        );
        stirrer.shutdown();
    }

    #[test]
    fn stalled_sensor_reports_zero_and_warns() {
        let (_dir, stores) = scratch();
        let mut stirrer = test_stirrer(&stores, 943, 0.0);
        let rpm = stirrer.poll().unwrap().unwrap();
        assert_eq!(rpm, 0.0);
        stirrer.shutdown();
    }

    #[test]
    fn pause_and_resume_restore_duty_cycle() {
        let (_dir, stores) = scratch();
        let mut stirrer = test_stirrer(&stores, 944, 0.1);
        stirrer.set_duty_cycle(42.0);
        stirrer.pause_stirring();
        assert_eq!(stirrer.duty_cycle, 0.0);
        stirrer.resume_stirring().unwrap();
        assert_eq!(stirrer.duty_cycle, 42.0);
        stirrer.shutdown();
    }

    #[test]
    fn target_rpm_change_reseeds_dc_and_setpoint() {
        let (_dir, stores) = scratch();
        store_stirring_calibration(&stores, 0.1, 10.0).unwrap();
        let mut stirrer = test_stirrer(&stores, 945, 0.1);
        stirrer.set_duty_cycle(80.0);
        stirrer.set_target_rpm(500.0);
        assert!((stirrer.duty_cycle - 62.0).abs() < 1e-9);
        assert_eq!(stirrer.pid.setpoint(), 500.0);
        stirrer.shutdown();
    }
}
