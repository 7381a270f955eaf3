//! Dosing automations: base contract, IO sequencing, and the job wrapper.

pub mod policies;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::automations::{AutomationArgs, AutomationEvent};
use crate::bus::Qos;
use crate::calibration::PumpKind;
use crate::config::Config;
use crate::error::Result;
use crate::job::{JobHost, JobState, NodeCtx, SettingMeta, parse_setting};
use crate::pump::Doser;
use crate::stores::{Stores, names};
use crate::timing::RepeatedTimer;

pub const JOB_NAME: &str = "dosing_automation";

/// One dosing policy. Implementations read culture state from the
/// [`DosingBase`] and act through [`DosingBase::execute_io_action`].
pub trait DosingAutomation: Send {
    fn key(&self) -> &'static str;

    fn execute(&mut self, base: &mut DosingBase) -> AutomationEvent;

    /// Attributes adjustable over the bus.
    fn settable_attrs(&self) -> &'static [&'static str] {
        &[]
    }

    /// Apply a remote setting; returns the accepted value for republish.
    fn set(&mut self, _attr: &str, _value: &str) -> Option<String> {
        None
    }
}

/// Shared culture state and vial bookkeeping for every dosing policy.
pub struct DosingBase {
    pub experiment: String,
    pub vial_volume_ml: f64,
    pub max_volume_ml: f64,

    pub latest_od: Option<f64>,
    pub latest_normalized_od: Option<f64>,
    pub previous_normalized_od: Option<f64>,
    pub latest_growth_rate: Option<f64>,
    pub previous_growth_rate: Option<f64>,
    pub latest_od_at: Option<Instant>,
    pub latest_growth_rate_at: Option<Instant>,

    pub media_throughput: f64,
    pub alt_media_throughput: f64,
    pub alt_media_fraction: f64,

    stores: Stores,
    doser: Box<dyn Doser>,
    source_label: String,
}

impl DosingBase {
    /// Restore persisted throughput counters for this experiment.
    pub fn new(
        stores: Stores,
        doser: Box<dyn Doser>,
        experiment: &str,
        vial_volume_ml: f64,
        max_volume_ml: f64,
        source_label: &str,
    ) -> Result<Self> {
        let read = |cache_name: &str| -> Result<f64> {
            let cache = stores.persistent(cache_name);
            let guard = cache.open()?;
            Ok(guard.get_f64(experiment).unwrap_or(0.0))
        };
        Ok(Self {
            experiment: experiment.to_string(),
            vial_volume_ml,
            max_volume_ml,
            latest_od: None,
            latest_normalized_od: None,
            previous_normalized_od: None,
            latest_growth_rate: None,
            previous_growth_rate: None,
            latest_od_at: None,
            latest_growth_rate_at: None,
            media_throughput: read(names::MEDIA_THROUGHPUT)?,
            alt_media_throughput: read(names::ALT_MEDIA_THROUGHPUT)?,
            alt_media_fraction: read(names::ALT_MEDIA_FRACTION)?,
            stores,
            doser,
            source_label: source_label.to_string(),
        })
    }

    pub fn record_normalized_od(&mut self, od: f64) {
        self.previous_normalized_od = self.latest_normalized_od;
        self.latest_normalized_od = Some(od);
        self.latest_od_at = Some(Instant::now());
    }

    pub fn record_od(&mut self, od: f64) {
        self.latest_od = Some(od);
        self.latest_od_at = Some(Instant::now());
    }

    pub fn record_growth_rate(&mut self, rate: f64) {
        self.previous_growth_rate = self.latest_growth_rate;
        self.latest_growth_rate = Some(rate);
        self.latest_growth_rate_at = Some(Instant::now());
    }

    /// Age of the stalest of the two input streams.
    pub fn most_stale_time(&self) -> Option<Duration> {
        match (self.latest_od_at, self.latest_growth_rate_at) {
            (Some(od), Some(rate)) => Some(od.min(rate).elapsed()),
            _ => None,
        }
    }

    /// Override a throughput counter (remote correction), persisting it.
    pub fn set_media_throughput(&mut self, value: f64) -> Result<()> {
        self.media_throughput = value;
        self.persist(names::MEDIA_THROUGHPUT, value)
    }

    pub fn set_alt_media_throughput(&mut self, value: f64) -> Result<()> {
        self.alt_media_throughput = value;
        self.persist(names::ALT_MEDIA_THROUGHPUT, value)
    }

    fn persist(&self, cache_name: &str, value: f64) -> Result<()> {
        self.stores
            .persistent(cache_name)
            .open()?
            .set_f64(&self.experiment, value);
        Ok(())
    }

    /// Sequence one dosing action.
    ///
    /// Volumes above `max_volume_ml` are halved recursively and pumped as
    /// interleaved chunks, waste drawn first in every chunk so the vial
    /// can never overflow, then media, then alt-media. Afterwards the
    /// persisted throughput counters grow by exactly the dispensed amounts
    /// and the alt-media fraction follows the mixing law
    /// `alt' = alt·(1 − Δ/V) + alt_ml/V` applied once with the totals.
    pub fn execute_io_action(
        &mut self,
        media_ml: f64,
        alt_media_ml: f64,
        waste_ml: f64,
    ) -> Result<(f64, f64, f64)> {
        let (media, alt_media, waste) = self.pump_chunked(media_ml, alt_media_ml, waste_ml)?;

        if media > 0.0 {
            self.media_throughput += media;
            self.persist(names::MEDIA_THROUGHPUT, self.media_throughput)?;
        }
        if alt_media > 0.0 {
            self.alt_media_throughput += alt_media;
            self.persist(names::ALT_MEDIA_THROUGHPUT, self.alt_media_throughput)?;
        }

        let added = media + alt_media;
        if added > 0.0 {
            let v = self.vial_volume_ml;
            self.alt_media_fraction =
                (self.alt_media_fraction * (1.0 - added / v) + alt_media / v).clamp(0.0, 1.0);
            self.persist(names::ALT_MEDIA_FRACTION, self.alt_media_fraction)?;
        }

        Ok((media, alt_media, waste))
    }

    /// Run one pump until externally stopped, at `duty_cycle` percent.
    pub fn run_continuously(&mut self, kind: PumpKind, duty_cycle: f64) -> Result<f64> {
        self.doser
            .run_continuously(kind, Some(duty_cycle), &self.source_label)
    }

    fn pump_chunked(
        &mut self,
        media_ml: f64,
        alt_media_ml: f64,
        waste_ml: f64,
    ) -> Result<(f64, f64, f64)> {
        let max = self.max_volume_ml;
        if media_ml > max || alt_media_ml > max || waste_ml > max {
            let first = self.pump_chunked(media_ml / 2.0, alt_media_ml / 2.0, waste_ml / 2.0)?;
            let second = self.pump_chunked(media_ml / 2.0, alt_media_ml / 2.0, waste_ml / 2.0)?;
            return Ok((first.0 + second.0, first.1 + second.1, first.2 + second.2));
        }

        let mut dispensed = (0.0, 0.0, 0.0);
        // waste first: room must exist before anything is added
        if waste_ml > 0.0 {
            dispensed.2 = self
                .doser
                .dose(PumpKind::Waste, waste_ml, &self.source_label)?;
        }
        if media_ml > 0.0 {
            dispensed.0 = self
                .doser
                .dose(PumpKind::Media, media_ml, &self.source_label)?;
        }
        if alt_media_ml > 0.0 {
            dispensed.1 = self
                .doser
                .dose(PumpKind::AltMedia, alt_media_ml, &self.source_label)?;
        }
        Ok(dispensed)
    }
}

// ---------------------------------------------------------------------------
// Job wrapper
// ---------------------------------------------------------------------------

pub struct DosingJob {
    pub host: Arc<JobHost>,
    pub base: Arc<Mutex<DosingBase>>,
    pub automation: Arc<Mutex<Box<dyn DosingAutomation>>>,
    timer: Arc<Mutex<Option<RepeatedTimer>>>,
    latest_event: Arc<Mutex<Option<AutomationEvent>>>,
}

/// Gate, execute, record. Split out of the timer closure so the
/// decision path is callable directly from tests and one-shot runs.
pub fn run_once(
    host: &JobHost,
    base: &Mutex<DosingBase>,
    automation: &Mutex<Box<dyn DosingAutomation>>,
    duration: Option<Duration>,
) -> AutomationEvent {
    // not READY: poll up to a quarter of the period, then give up this run
    if host.state() != JobState::Ready {
        let budget = duration.map(|d| d / 4).unwrap_or(Duration::from_secs(25));
        let waited_from = Instant::now();
        while host.state() != JobState::Ready {
            if host.state() == JobState::Disconnected || host.is_shutting_down() {
                return AutomationEvent::no_event("job disconnected before the run");
            }
            if waited_from.elapsed() >= budget {
                return AutomationEvent::no_event(
                    "waited too long not being in state ready; skipping this run",
                );
            }
            std::thread::sleep(Duration::from_secs(5).min(budget));
        }
    }

    let mut base = base.lock().unwrap();
    let event = automation.lock().unwrap().execute(&mut base);
    log::info!("triggered {event}");
    event
}

/// Start the dosing job running `automation_key` every `duration` minutes.
pub fn start_dosing_automation(
    ctx: NodeCtx,
    config: &Config,
    automation_key: &str,
    args: &AutomationArgs,
    doser: Box<dyn Doser>,
) -> Result<DosingJob> {
    let automation = crate::automations::create_dosing(automation_key, args, config)?;
    let duration_minutes = args.get_f64("duration");
    let skip_first_run = args.get("skip_first_run").is_some_and(|v| v != "0");

    let host = JobHost::init(JOB_NAME, ctx)?;
    let base = Arc::new(Mutex::new(DosingBase::new(
        host.ctx.stores.clone(),
        doser,
        &host.ctx.experiment,
        config.dosing.vial_volume_ml,
        config.dosing.max_volume_ml,
        &format!("{JOB_NAME}:{automation_key}"),
    )?));
    let automation = Arc::new(Mutex::new(automation));
    let latest_event: Arc<Mutex<Option<AutomationEvent>>> = Arc::new(Mutex::new(None));

    // remote-settable automation attributes
    let settable_attrs = automation.lock().unwrap().settable_attrs();
    for &attr in settable_attrs {
        let setting_automation = Arc::clone(&automation);
        host.declare_setting(attr, SettingMeta::float(true, None), move |_, payload| {
            setting_automation.lock().unwrap().set(attr, payload)
        });
    }
    // throughput counters are settable for manual corrections
    let media_base = Arc::clone(&base);
    host.declare_setting(
        "media_throughput",
        SettingMeta::float(true, Some("mL")),
        move |_, payload| {
            let value = parse_setting::<f64>(payload)?;
            media_base.lock().unwrap().set_media_throughput(value).ok()?;
            Some(value.to_string())
        },
    );
    let alt_base = Arc::clone(&base);
    host.declare_setting(
        "alt_media_throughput",
        SettingMeta::float(true, Some("mL")),
        move |_, payload| {
            let value = parse_setting::<f64>(payload)?;
            alt_base.lock().unwrap().set_alt_media_throughput(value).ok()?;
            Some(value.to_string())
        },
    );
    host.declare_setting(
        "alt_media_fraction",
        SettingMeta::float(false, None),
        |_, _| None,
    );
    host.declare_setting("latest_event", SettingMeta::float(false, None), |_, _| None);
    host.activate()?;

    // culture state feeds
    let rate_base = Arc::clone(&base);
    host.subscribe(
        &[host
            .exp_topic("growth_rate_calculating/growth_rate")
            .as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            if let Some(rate) = message.payload_f64() {
                rate_base.lock().unwrap().record_growth_rate(rate);
            }
        },
    )?;
    let od_base = Arc::clone(&base);
    host.subscribe(
        &[host
            .exp_topic("growth_rate_calculating/od_filtered/#")
            .as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            if let Some(od) = message.payload_f64() {
                od_base.lock().unwrap().record_normalized_od(od);
            }
        },
    )?;
    let raw_base = Arc::clone(&base);
    host.subscribe(
        &[host.exp_topic("od_raw_batched").as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            let Ok(batch) = serde_json::from_slice::<BTreeMap<String, f64>>(&message.payload)
            else {
                return;
            };
            if let Some(value) = batch.values().next() {
                raw_base.lock().unwrap().record_od(*value);
            }
        },
    )?;

    let timer_slot: Arc<Mutex<Option<RepeatedTimer>>> = Arc::new(Mutex::new(None));
    let disconnect_slot = Arc::clone(&timer_slot);
    host.on_disconnect(move |_| {
        if let Some(mut timer) = disconnect_slot.lock().unwrap().take() {
            timer.cancel();
        }
    });

    host.ready();

    let tick = {
        let host = Arc::clone(&host);
        let base = Arc::clone(&base);
        let automation = Arc::clone(&automation);
        let latest_event = Arc::clone(&latest_event);
        let duration = duration_minutes.map(|m| Duration::from_secs_f64(m * 60.0));
        move || {
            let event = run_once(&host, &base, &automation, duration);
            if let Ok(payload) = serde_json::to_vec(&event) {
                let _ = host.publish_setting("latest_event", &payload);
            }
            {
                let base = base.lock().unwrap();
                let _ = host.publish_setting(
                    "media_throughput",
                    base.media_throughput.to_string().as_bytes(),
                );
                let _ = host.publish_setting(
                    "alt_media_throughput",
                    base.alt_media_throughput.to_string().as_bytes(),
                );
                let _ = host.publish_setting(
                    "alt_media_fraction",
                    base.alt_media_fraction.to_string().as_bytes(),
                );
            }
            *latest_event.lock().unwrap() = Some(event);
        }
    };

    match duration_minutes {
        Some(minutes) => {
            let timer = RepeatedTimer::new(
                Duration::from_secs_f64(minutes * 60.0),
                !skip_first_run,
                tick,
            );
            *timer_slot.lock().unwrap() = Some(timer);
        }
        None => {
            // one-shot policies run once in the background
            std::thread::Builder::new()
                .name(format!("{JOB_NAME}-oneshot"))
                .spawn(tick)
                .ok();
        }
    }

    Ok(DosingJob {
        host,
        base,
        automation,
        timer: timer_slot,
        latest_event,
    })
}

impl DosingJob {
    pub fn latest_event(&self) -> Option<AutomationEvent> {
        self.latest_event.lock().unwrap().clone()
    }

    pub fn shutdown(&mut self) {
        self.host.transition(JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    // -----------------------------------------------------------------------
    // execute_io_action accounting
    // -----------------------------------------------------------------------

    #[test]
    fn throughput_counters_accumulate_exactly() {
        let (_dir, mut base, _) = test_base("accumulate");
        base.execute_io_action(0.65, 0.35, 1.0).unwrap();
        assert!((base.media_throughput - 0.65).abs() < 1e-9);
        assert!((base.alt_media_throughput - 0.35).abs() < 1e-9);

        base.execute_io_action(0.15, 0.15, 0.3).unwrap();
        assert!((base.media_throughput - 0.80).abs() < 1e-9);
        assert!((base.alt_media_throughput - 0.50).abs() < 1e-9);

        base.execute_io_action(1.0, 0.0, 1.0).unwrap();
        assert!((base.media_throughput - 1.80).abs() < 1e-9);
        assert!((base.alt_media_throughput - 0.50).abs() < 1e-9);

        base.execute_io_action(0.0, 1.0, 1.0).unwrap();
        assert!((base.media_throughput - 1.80).abs() < 1e-9);
        assert!((base.alt_media_throughput - 1.50).abs() < 1e-9);
    }

    #[test]
    fn alt_media_fraction_follows_mixing_law() {
        let (_dir, mut base, _) = test_base("mixing");
        let (media, alt, waste) = base.execute_io_action(1.25, 0.01, 1.26).unwrap();
        assert_eq!((media, alt, waste), (1.25, 0.01, 1.26));
        assert!((base.media_throughput - 1.25).abs() < 1e-9);
        assert!((base.alt_media_throughput - 0.01).abs() < 1e-9);
        assert!(
            (base.alt_media_fraction - 0.0007142).abs() < 1e-5,
            "fraction {}",
            base.alt_media_fraction
        );
    }

    #[test]
    fn fraction_stays_in_unit_interval() {
        let (_dir, mut base, _) = test_base("bounds");
        for _ in 0..50 {
            base.execute_io_action(0.0, 1.0, 1.0).unwrap();
            assert!((0.0..=1.0).contains(&base.alt_media_fraction));
        }
        // pure alt-media feed converges toward 1 without crossing it
        assert!(base.alt_media_fraction > 0.9);
    }

    #[test]
    fn counters_persist_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        {
            let mut base = DosingBase::new(
                stores.clone(),
                Box::new(RecordingDoser::default()),
                "restart",
                14.0,
                0.6,
                "test",
            )
            .unwrap();
            base.execute_io_action(1.0, 1.5, 2.5).unwrap();
        }
        let base = DosingBase::new(
            stores,
            Box::new(RecordingDoser::default()),
            "restart",
            14.0,
            0.6,
            "test",
        )
        .unwrap();
        assert!((base.media_throughput - 1.0).abs() < 1e-9);
        assert!((base.alt_media_throughput - 1.5).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Chunking and ordering
    // -----------------------------------------------------------------------

    #[test]
    fn waste_is_always_drawn_first() {
        let (_dir, mut base, doser) = test_base("order");
        base.execute_io_action(0.5, 0.25, 0.5).unwrap();
        let calls = doser.calls.lock().unwrap();
        assert_eq!(calls[0].0, PumpKind::Waste);
        assert_eq!(calls[1].0, PumpKind::Media);
        assert_eq!(calls[2].0, PumpKind::AltMedia);
    }

    #[test]
    fn large_requests_are_chunked_under_the_cap() {
        let (_dir, mut base, doser) = test_base("chunks");
        base.execute_io_action(2.0, 0.0, 2.0).unwrap();
        let calls = doser.calls.lock().unwrap();
        assert!(calls.len() > 2, "expected interleaved chunks");
        for (kind, ml) in calls.iter() {
            assert!(
                *ml <= 0.6 + 1e-9,
                "{kind} chunk of {ml} ml exceeds the 0.6 ml cap"
            );
        }
        let media_total: f64 = calls
            .iter()
            .filter(|(k, _)| *k == PumpKind::Media)
            .map(|(_, ml)| ml)
            .sum();
        assert!((media_total - 2.0).abs() < 1e-9);
        // chunks interleave: a waste draw precedes every media chunk
        let first_media = calls.iter().position(|(k, _)| *k == PumpKind::Media).unwrap();
        assert_eq!(calls[first_media - 1].0, PumpKind::Waste);
    }

    #[test]
    fn zero_volumes_skip_their_pumps() {
        let (_dir, mut base, doser) = test_base("zeroes");
        base.execute_io_action(0.5, 0.0, 0.5).unwrap();
        let calls = doser.calls.lock().unwrap();
        assert!(calls.iter().all(|(k, _)| *k != PumpKind::AltMedia));
    }

    // -----------------------------------------------------------------------
    // Culture-state tracking
    // -----------------------------------------------------------------------

    #[test]
    fn od_and_rate_history_shift() {
        let (_dir, mut base, _) = test_base("history");
        base.record_normalized_od(1.0);
        base.record_growth_rate(0.01);
        base.record_normalized_od(1.1);
        base.record_growth_rate(0.02);
        assert_eq!(base.latest_normalized_od, Some(1.1));
        assert_eq!(base.previous_normalized_od, Some(1.0));
        assert_eq!(base.latest_growth_rate, Some(0.02));
        assert_eq!(base.previous_growth_rate, Some(0.01));
        assert!(base.most_stale_time().is_some());
    }
}
