//! Node monitor: self-checks, button/LED interaction, remote job launch,
//! and bus-vs-process state reconciliation.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::bus::Qos;
use crate::error::{Error, Result};
use crate::hardware::gpio::{EdgeSource, GpioInput, GpioOutput};
use crate::job::{self, JobHost, JobState, NodeCtx};
use crate::naming::{UNIVERSAL_EXPERIMENT, UNIVERSAL_UNIT};
use crate::stores::{Stores, names};
use crate::timing::RepeatedTimer;

pub const JOB_NAME: &str = "monitor";

/// LED blink codes for faults the user must see without a screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BusNotConnectedToLeader = 2,
    DiskIsAlmostFull = 3,
}

/// Self-check interval.
pub const SELF_CHECK_EVERY: Duration = Duration::from_secs(12 * 60 * 60);

// ---------------------------------------------------------------------------
// Vitals
// ---------------------------------------------------------------------------

/// Snapshot of the node's health metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeVitals {
    pub disk_usage_percent: f64,
    pub cpu_usage_percent: f64,
    pub available_memory_percent: f64,
    pub cpu_temperature_celsius: f64,
}

/// Threshold review; each warning is logged and the worst ones blink.
pub fn vitals_warnings(vitals: &NodeVitals) -> Vec<String> {
    let mut warnings = Vec::new();
    if vitals.disk_usage_percent > 80.0 {
        warnings.push(format!("disk space at {:.0}%", vitals.disk_usage_percent));
    }
    if vitals.cpu_usage_percent > 75.0 {
        warnings.push(format!("CPU usage at {:.0}%", vitals.cpu_usage_percent));
    }
    if vitals.available_memory_percent < 20.0 {
        warnings.push(format!(
            "available memory at {:.0}%",
            vitals.available_memory_percent
        ));
    }
    if vitals.cpu_temperature_celsius > 70.0 {
        warnings.push(format!(
            "CPU temperature at {:.0} ℃",
            vitals.cpu_temperature_celsius
        ));
    }
    warnings
}

fn disk_usage_percent(path: &str) -> Result<f64> {
    let c_path = CString::new(path).map_err(|_| Error::InvalidArgument("bad path".into()))?;
    // SAFETY: zeroed statvfs is a valid out-param; c_path outlives the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if stat.f_blocks == 0 {
        return Ok(0.0);
    }
    Ok(100.0 * (1.0 - stat.f_bavail as f64 / stat.f_blocks as f64))
}

fn cpu_usage_percent() -> f64 {
    let Some(loadavg) = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse::<f64>().ok())
    else {
        return 0.0;
    };
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    (100.0 * loadavg / cores).min(100.0)
}

fn available_memory_percent() -> f64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 100.0;
    };
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    match (field("MemAvailable:"), field("MemTotal:")) {
        (Some(available), Some(total)) if total > 0.0 => 100.0 * available / total,
        _ => 100.0,
    }
}

fn cpu_temperature_celsius() -> f64 {
    std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(|millis| millis / 1000.0)
        .unwrap_or(0.0)
}

/// Read the firmware power-throttle register, if this platform exposes one.
pub fn power_throttle_status() -> Option<u32> {
    let raw = std::fs::read_to_string("/sys/devices/platform/soc/soc:firmware/get_throttled")
        .ok()?;
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

/// Active throttle bits: undervoltage, frequency cap, throttling.
pub fn is_actively_throttled(status: u32) -> bool {
    status & 0x7 != 0
}

pub fn read_vitals() -> NodeVitals {
    NodeVitals {
        disk_usage_percent: disk_usage_percent("/").unwrap_or(0.0),
        cpu_usage_percent: cpu_usage_percent(),
        available_memory_percent: available_memory_percent(),
        cpu_temperature_celsius: cpu_temperature_celsius(),
    }
}

/// Leader-only: days since the last database backup, from the backup cache.
pub fn days_since_last_backup(stores: &Stores) -> Option<i64> {
    let binding = stores.persistent(names::DATABASE_BACKUPS);
    let guard = binding.open().ok()?;
    let raw = guard.get("latest_backup_timestamp")?;
    let at = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    Some((chrono::Utc::now() - at.with_timezone(&chrono::Utc)).num_days())
}

// ---------------------------------------------------------------------------
// Remote job launch
// ---------------------------------------------------------------------------

/// Turn a `run/<job>` payload into `petrid run <job> --flag value …`.
pub fn build_run_args(job_name: &str, payload: &BTreeMap<String, serde_json::Value>) -> Vec<String> {
    let mut args = vec!["run".to_string(), job_name.to_string()];
    for (key, value) in payload {
        args.push(format!("--{}", key.replace('_', "-")));
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        args.push(rendered);
    }
    args
}

fn spawn_job_process(job_name: &str, payload: &BTreeMap<String, serde_json::Value>) {
    let args = build_run_args(job_name, payload);
    log::debug!("launching `petrid {}` from monitor", args.join(" "));
    let spawned = std::process::Command::new("petrid")
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        log::error!("failed to launch {job_name}: {e}");
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Decide whether a bus-reported job state contradicts the process listing.
pub fn state_is_phantom(reported: &str, job_name: &str, running: &[String]) -> bool {
    matches!(
        JobState::parse(reported),
        Some(JobState::Init | JobState::Ready | JobState::Sleeping)
    ) && !running.iter().any(|j| j == job_name)
}

/// After a restart the broker may still claim jobs are alive. Listen to the
/// retained `$state` topics of the active experiment briefly and overwrite
/// phantoms with `lost`.
fn reconcile_job_states(host: &Arc<JobHost>, stores: &Stores) -> Result<()> {
    let running = job::jobs_running(stores);
    let experiment = host
        .subscribe_once(
            &format!("{}/latest_experiment", host.ctx.namespace),
            Qos::AtLeastOnce,
            Duration::from_secs(2),
        )?
        .map(|m| m.payload_str().trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| crate::naming::FALLBACK_EXPERIMENT.to_string());
    let filter = format!(
        "{}/{}/{experiment}/+/$state",
        host.ctx.namespace, host.ctx.unit
    );

    let reconcile_host = Arc::clone(host);
    host.subscribe(&[filter.as_str()], Qos::AtLeastOnce, true, move |message| {
        let segments: Vec<&str> = message.topic.split('/').collect();
        if segments.len() != 5 {
            return;
        }
        let job_name = segments[3];
        if job_name == JOB_NAME {
            return;
        }
        if state_is_phantom(&message.payload_str(), job_name, &running) {
            log::debug!("marking phantom job {job_name} as lost");
            let _ = reconcile_host.publisher().publish(
                &message.topic,
                JobState::Lost.as_str().as_bytes(),
                Qos::ExactlyOnce,
                true,
            );
        }
    })?;

    // give the retained replay a moment, then stop listening
    std::thread::sleep(Duration::from_millis(2500));
    host.unsubscribe(&filter);
    Ok(())
}

// ---------------------------------------------------------------------------
// Monitor job
// ---------------------------------------------------------------------------

pub struct MonitorHardware {
    pub led: Box<dyn GpioOutput>,
    pub button_level: Box<dyn GpioInput>,
    pub button_edges: Box<dyn EdgeSource>,
}

pub struct Monitor {
    pub host: Arc<JobHost>,
    timer: Arc<std::sync::Mutex<Option<RepeatedTimer>>>,
    stop_button: Arc<AtomicBool>,
}

pub fn start_monitor(mut ctx: NodeCtx, hardware: MonitorHardware) -> Result<Monitor> {
    // the monitor outlives experiments
    ctx.experiment = UNIVERSAL_EXPERIMENT.to_string();
    let host = JobHost::init(JOB_NAME, ctx)?;
    host.activate()?;

    let led = Arc::new(std::sync::Mutex::new(hardware.led));
    let stores = host.ctx.stores.clone();

    // 1. remote job launch
    let run_filters = [
        format!(
            "{}/{}/{}/run/+",
            host.ctx.namespace, host.ctx.unit, UNIVERSAL_EXPERIMENT
        ),
        format!(
            "{}/{UNIVERSAL_UNIT}/{UNIVERSAL_EXPERIMENT}/run/+",
            host.ctx.namespace
        ),
    ];
    host.subscribe(
        &[run_filters[0].as_str(), run_filters[1].as_str()],
        Qos::AtLeastOnce,
        false,
        move |message| {
            let Some(job_name) = message.topic.rsplit('/').next() else {
                return;
            };
            let payload: BTreeMap<String, serde_json::Value> = if message.payload.is_empty() {
                BTreeMap::new()
            } else {
                match serde_json::from_slice(&message.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("bad run payload for {job_name}: {e}");
                        return;
                    }
                }
            };
            spawn_job_process(job_name, &payload);
        },
    )?;

    // 2. periodic self-checks
    let check_host = Arc::clone(&host);
    let check_led = Arc::clone(&led);
    let check_stores = stores.clone();
    let is_leader = host.ctx.is_leader;
    let timer = RepeatedTimer::new(SELF_CHECK_EVERY, true, move || {
        let vitals = read_vitals();
        for warning in vitals_warnings(&vitals) {
            log::warn!("{warning}");
        }
        if vitals.disk_usage_percent > 80.0 {
            blink_error_code(&check_led, ErrorCode::DiskIsAlmostFull);
        }
        if is_leader {
            if let Some(days) = days_since_last_backup(&check_stores) {
                if days > 30 {
                    log::warn!("database has not been backed up in over 30 days");
                }
            }
        } else if !check_host.publisher().is_connected() {
            log::warn!("bus client is not connected to the leader");
            blink_error_code(&check_led, ErrorCode::BusNotConnectedToLeader);
        }
        if let Some(status) = power_throttle_status() {
            if is_actively_throttled(status) {
                log::warn!("power supply is throttling the board (status {status:#x})");
            } else {
                log::debug!("power status okay");
            }
        }
        if let Ok(payload) = serde_json::to_vec(&vitals) {
            let _ = check_host.publish_job("computer_statistics", &payload, Qos::AtMostOnce, false);
        }
    });
    let timer_slot = Arc::new(std::sync::Mutex::new(Some(timer)));

    // 3. button watcher
    let stop_button = Arc::new(AtomicBool::new(false));
    {
        let button_host = Arc::clone(&host);
        let button_led = Arc::clone(&led);
        let stop = Arc::clone(&stop_button);
        let mut edges = hardware.button_edges;
        let level = hardware.button_level;
        std::thread::Builder::new()
            .name("monitor-button".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let Ok(seen) =
                        edges.collect_edges(Duration::from_secs(1), Duration::from_millis(50))
                    else {
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    };
                    if seen.is_empty() {
                        continue;
                    }
                    let _ = button_host.publish_job("button_down", b"1", Qos::AtLeastOnce, false);
                    let _ = button_led.lock().unwrap().set(true);
                    log::debug!("tactile button pressed");
                    while level.read().unwrap_or(false) && !stop.load(Ordering::SeqCst) {
                        let _ =
                            button_host.publish_job("button_down", b"1", Qos::AtMostOnce, false);
                        std::thread::sleep(Duration::from_millis(250));
                    }
                    let _ = button_host.publish_job("button_down", b"0", Qos::AtLeastOnce, false);
                    let _ = button_led.lock().unwrap().set(false);
                }
            })
            .ok();
    }

    let disconnect_slot = Arc::clone(&timer_slot);
    let disconnect_stop = Arc::clone(&stop_button);
    host.on_disconnect(move |_| {
        disconnect_stop.store(true, Ordering::SeqCst);
        if let Some(mut timer) = disconnect_slot.lock().unwrap().take() {
            timer.cancel();
        }
    });

    host.ready();
    log::info!("{} online and ready", host.ctx.unit);

    // 4. reconcile after the broker replayed retained state
    reconcile_job_states(&host, &stores)?;

    Ok(Monitor {
        host,
        timer: timer_slot,
        stop_button,
    })
}

impl Monitor {
    pub fn shutdown(&mut self) {
        self.stop_button.store(true, Ordering::SeqCst);
        self.host.transition(JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

/// Blink `code` pulses, three bursts, 5 s apart.
fn blink_error_code(led: &std::sync::Mutex<Box<dyn GpioOutput>>, code: ErrorCode) {
    for burst in 0..3 {
        for _ in 0..(code as u32) {
            let _ = led.lock().unwrap().set(true);
            std::thread::sleep(Duration::from_millis(500));
            let _ = led.lock().unwrap().set(false);
            std::thread::sleep(Duration::from_millis(500));
        }
        if burst < 2 {
            std::thread::sleep(Duration::from_secs(5));
        }
    }
}
