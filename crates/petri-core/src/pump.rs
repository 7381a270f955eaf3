//! Calibrated pump driver.
//!
//! A dose is a PWM pulse of calibrated frequency/duty on the pump's pin,
//! held for `(ml − bias)/slope` seconds. The dosing event is published
//! **before** the pulse starts so the growth-rate filter can inflate its
//! observation variance before the disturbance shows up in the OD signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{BusClient, Qos};
use crate::calibration::{self};
pub use crate::calibration::PumpKind;
use crate::config::PwmPins;
use crate::error::{Error, Result};
use crate::hardware::gpio::GpioOutput;
use crate::hardware::pwm::Pwm;
use crate::stores::Stores;

/// Seconds per window in continuous mode.
pub const CONTINUOUS_WINDOW_SECS: f64 = 600.0;

/// How much liquid to move, or for how long.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PumpAmount {
    Ml(f64),
    DurationSecs(f64),
    /// Loop 600 s windows, republishing the event, until stopped.
    Continuous,
}

/// Wire record of one dosing action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DosingEvent {
    pub volume_change: f64,
    pub event: String,
    pub source_of_event: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DosingEvent {
    pub fn new(kind: PumpKind, ml: f64, source: Option<&str>) -> Self {
        Self {
            volume_change: ml,
            event: event_name(kind).to_string(),
            source_of_event: source.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// The event label downstream consumers dispatch on.
pub fn event_name(kind: PumpKind) -> &'static str {
    match kind {
        PumpKind::Media => "add_media",
        PumpKind::AltMedia => "add_alt_media",
        PumpKind::Waste => "remove_waste",
    }
}

pub fn pin_for(pins: &PwmPins, kind: PumpKind) -> u32 {
    match kind {
        PumpKind::Media => pins.media,
        PumpKind::AltMedia => pins.alt_media,
        PumpKind::Waste => pins.waste,
    }
}

/// Where dosing events go. Production publishes to the bus; tests record.
pub trait EventSink: Send + Sync {
    fn publish_dosing_event(&self, event: &DosingEvent) -> Result<()>;
}

pub struct BusEventSink {
    pub publisher: Arc<BusClient>,
    /// Full topic, `<ns>/<unit>/<exp>/dosing_events`.
    pub topic: String,
}

impl EventSink for BusEventSink {
    fn publish_dosing_event(&self, event: &DosingEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.publisher
            .publish(&self.topic, &payload, Qos::ExactlyOnce, false)
    }
}

/// Narrow dosing interface the automations depend on.
pub trait Doser: Send {
    fn dose(&self, kind: PumpKind, ml: f64, source: &str) -> Result<f64>;

    /// Run one pump until stopped, optionally overriding the calibrated
    /// duty cycle. Not every doser supports it.
    fn run_continuously(
        &self,
        kind: PumpKind,
        duty_cycle_override: Option<f64>,
        source: &str,
    ) -> Result<f64> {
        let _ = (kind, duty_cycle_override, source);
        Err(Error::InvalidArgument(
            "continuous pumping is not supported by this doser".into(),
        ))
    }
}

type OutputFactory = Box<dyn Fn(u32) -> Result<Box<dyn GpioOutput>> + Send + Sync>;

/// The three calibrated pumps of one node.
pub struct PumpBank {
    stores: Stores,
    sink: Arc<dyn EventSink>,
    pins: PwmPins,
    output_factory: OutputFactory,
    stop: Arc<AtomicBool>,
}

impl PumpBank {
    pub fn new(
        stores: Stores,
        sink: Arc<dyn EventSink>,
        pins: PwmPins,
        output_factory: OutputFactory,
    ) -> Self {
        Self {
            stores,
            sink,
            pins,
            output_factory,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag used to interrupt a running (or continuous) dose.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run one dose. Returns the ml actually requested of the pump.
    pub fn pump(&self, kind: PumpKind, amount: PumpAmount, source: &str) -> Result<f64> {
        self.pump_with_duty(kind, amount, source, None)
    }

    /// Like [`PumpBank::pump`] with an explicit duty-cycle override.
    pub fn pump_with_duty(
        &self,
        kind: PumpKind,
        amount: PumpAmount,
        source: &str,
        duty_cycle_override: Option<f64>,
    ) -> Result<f64> {
        let cal = calibration::current_pump_calibration(&self.stores, kind)?;

        let (ml, duration_secs, continuous) = match amount {
            PumpAmount::Ml(ml) => {
                if ml < 0.0 {
                    return Err(Error::InvalidArgument(format!(
                        "cannot pump {ml} ml; volume must be non-negative"
                    )));
                }
                (ml, cal.ml_to_duration(ml), false)
            }
            PumpAmount::DurationSecs(secs) => {
                if secs < 0.0 {
                    return Err(Error::InvalidArgument(
                        "duration must be non-negative".into(),
                    ));
                }
                (cal.duration_to_ml(secs), secs, false)
            }
            PumpAmount::Continuous => (
                cal.duration_to_ml(CONTINUOUS_WINDOW_SECS),
                CONTINUOUS_WINDOW_SECS,
                true,
            ),
        };
        let duration_secs = duration_secs.max(0.0);

        let event = DosingEvent::new(kind, ml, Some(source));
        // intent goes out before the first drop moves
        self.sink.publish_dosing_event(&event)?;
        log::info!("{}: {ml:.2} ml over {duration_secs:.1} s", event.event);

        let output = (self.output_factory)(pin_for(&self.pins, kind))?;
        let mut pwm = Pwm::new(pin_for(&self.pins, kind), cal.hz, output);
        if let Err(e) = pwm.lock() {
            log::error!("{kind} pump pin is busy; aborting dose: {e}");
            return Err(e);
        }
        pwm.start(duty_cycle_override.unwrap_or(cal.dc))?;

        let mut completed = interruptible_sleep(Duration::from_secs_f64(duration_secs), &self.stop);
        while completed && continuous {
            self.sink.publish_dosing_event(&event)?;
            completed = interruptible_sleep(Duration::from_secs_f64(duration_secs), &self.stop);
        }

        pwm.stop();
        pwm.cleanup();
        if continuous {
            log::info!("stopping {kind} pump");
        }
        Ok(ml)
    }
}

impl Doser for PumpBank {
    fn dose(&self, kind: PumpKind, ml: f64, source: &str) -> Result<f64> {
        self.pump(kind, PumpAmount::Ml(ml), source)
    }

    fn run_continuously(
        &self,
        kind: PumpKind,
        duty_cycle_override: Option<f64>,
        source: &str,
    ) -> Result<f64> {
        self.pump_with_duty(kind, PumpAmount::Continuous, source, duty_cycle_override)
    }
}

/// Sleep in short slices; false when the stop flag interrupted the wait.
fn interruptible_sleep(total: Duration, stop: &AtomicBool) -> bool {
    let slice = Duration::from_millis(25);
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{PumpCalibration, store_pump_calibration};
    use crate::hardware::gpio::SimOutput;
    use std::sync::Mutex;

    /// Interleaved trace of events and pin writes, for ordering assertions.
    #[derive(Clone, Default)]
    struct Trace(Arc<Mutex<Vec<&'static str>>>);

    struct TracingSink {
        trace: Trace,
        events: Arc<Mutex<Vec<DosingEvent>>>,
    }

    impl EventSink for TracingSink {
        fn publish_dosing_event(&self, event: &DosingEvent) -> Result<()> {
            self.trace.0.lock().unwrap().push("event");
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct TracingOutput {
        trace: Trace,
        inner: SimOutput,
    }

    impl GpioOutput for TracingOutput {
        fn set(&mut self, high: bool) -> Result<()> {
            self.trace.0.lock().unwrap().push("pwm");
            self.inner.set(high)
        }
    }

    fn fast_calibration(kind: PumpKind) -> PumpCalibration {
        PumpCalibration {
            name: "test".into(),
            timestamp: Utc::now(),
            pump: kind,
            duration_: 50.0, // 50 ml/s keeps test doses short
            bias_: 0.0,
            hz: 200.0,
            dc: 60.0,
            voltage: -1.0,
            durations: vec![0.0, 1.0],
            volumes: vec![0.0, 50.0],
        }
    }

    fn bank_with(
        stores: &Stores,
        pin_base: u32,
    ) -> (PumpBank, Trace, Arc<Mutex<Vec<DosingEvent>>>) {
        let trace = Trace::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(TracingSink {
            trace: trace.clone(),
            events: Arc::clone(&events),
        });
        let factory_trace = trace.clone();
        let bank = PumpBank::new(
            stores.clone(),
            sink,
            PwmPins {
                media: pin_base,
                alt_media: pin_base + 1,
                waste: pin_base + 2,
                stirring: pin_base + 3,
                heater: pin_base + 4,
            },
            Box::new(move |_pin| {
                Ok(Box::new(TracingOutput {
                    trace: factory_trace.clone(),
                    inner: SimOutput::new(),
                }) as Box<dyn GpioOutput>)
            }),
        );
        (bank, trace, events)
    }

    fn scratch() -> (tempfile::TempDir, Stores) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        (dir, stores)
    }

    // -----------------------------------------------------------------------
    // Calibration arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn ml_request_reports_requested_volume() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Media)).unwrap();
        let (bank, _, _) = bank_with(&stores, 800);
        let delivered = bank.pump(PumpKind::Media, PumpAmount::Ml(1.5), "test").unwrap();
        assert_eq!(delivered, 1.5);
    }

    #[test]
    fn duration_request_reports_converted_volume() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Waste)).unwrap();
        let (bank, _, _) = bank_with(&stores, 810);
        let delivered = bank
            .pump(PumpKind::Waste, PumpAmount::DurationSecs(0.02), "test")
            .unwrap();
        assert!((delivered - 1.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Failure modes
    // -----------------------------------------------------------------------

    #[test]
    fn missing_calibration_refuses_to_pump() {
        let (_dir, stores) = scratch();
        let (bank, _, events) = bank_with(&stores, 820);
        let result = bank.pump(PumpKind::AltMedia, PumpAmount::Ml(1.0), "test");
        assert!(matches!(result, Err(Error::Calibration(_))));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn negative_ml_is_rejected() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Media)).unwrap();
        let (bank, _, events) = bank_with(&stores, 830);
        let result = bank.pump(PumpKind::Media, PumpAmount::Ml(-0.5), "test");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn locked_pin_aborts_without_event_side_effects() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Media)).unwrap();
        let (bank, _, _) = bank_with(&stores, 840);
        let _held = crate::hardware::claim(crate::hardware::Resource::GpioPin(840)).unwrap();
        let result = bank.pump(PumpKind::Media, PumpAmount::Ml(0.5), "test");
        assert!(matches!(result, Err(Error::HardwareUnavailable(_))));
    }

    // -----------------------------------------------------------------------
    // Ordering and events
    // -----------------------------------------------------------------------

    #[test]
    fn event_is_published_before_actuation() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Media)).unwrap();
        let (bank, trace, events) = bank_with(&stores, 850);
        bank.pump(PumpKind::Media, PumpAmount::Ml(1.0), "chemostat").unwrap();

        let steps = trace.0.lock().unwrap();
        let first_event = steps.iter().position(|s| *s == "event").unwrap();
        let first_pwm = steps.iter().position(|s| *s == "pwm").unwrap();
        assert!(first_event < first_pwm, "event must precede the pulse: {steps:?}");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "add_media");
        assert_eq!(events[0].volume_change, 1.0);
        assert_eq!(events[0].source_of_event.as_deref(), Some("chemostat"));
    }

    #[test]
    fn event_names_follow_pump_kind() {
        assert_eq!(event_name(PumpKind::Media), "add_media");
        assert_eq!(event_name(PumpKind::AltMedia), "add_alt_media");
        assert_eq!(event_name(PumpKind::Waste), "remove_waste");
    }

    // -----------------------------------------------------------------------
    // Continuous mode
    // -----------------------------------------------------------------------

    #[test]
    fn continuous_mode_stops_promptly_when_flagged() {
        let (_dir, stores) = scratch();
        store_pump_calibration(&stores, &fast_calibration(PumpKind::Media)).unwrap();
        let (bank, _, _) = bank_with(&stores, 860);
        let stop = bank.stop_flag();

        let handle = std::thread::spawn(move || {
            bank.pump(PumpKind::Media, PumpAmount::Continuous, "test")
        });
        std::thread::sleep(Duration::from_millis(80));
        stop.store(true, Ordering::SeqCst);
        let started = std::time::Instant::now();
        let result = handle.join().unwrap();
        assert!(result.is_ok());
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "pump must release within a grace period"
        );
        assert!(!crate::hardware::is_claimed(
            &crate::hardware::Resource::GpioPin(860)
        ));
    }
}
