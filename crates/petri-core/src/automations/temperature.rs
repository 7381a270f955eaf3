//! Temperature automations: heater duty-cycle control.

use crate::automations::{AutomationArgs, AutomationEvent, register_temperature};
use crate::config::Config;
use crate::error::Result;
use crate::job::parse_setting;
use crate::math::clamp;
use crate::math::pid::PidController;

pub const JOB_NAME: &str = "temperature_automation";

/// Hardware seam: something that can hold a heater at a duty cycle.
pub trait Heater: Send {
    fn set_heater_dc(&mut self, duty_cycle: f64) -> Result<()>;
}

/// Shared heater state for temperature policies.
pub struct TemperatureIo {
    heater: Box<dyn Heater>,
    pub heater_dc: f64,
    pub latest_temperature: Option<f64>,
    pub previous_temperature: Option<f64>,
}

impl TemperatureIo {
    pub fn new(heater: Box<dyn Heater>) -> Self {
        Self {
            heater,
            heater_dc: 0.0,
            latest_temperature: None,
            previous_temperature: None,
        }
    }

    pub fn record_temperature(&mut self, celsius: f64) {
        self.previous_temperature = self.latest_temperature;
        self.latest_temperature = Some(celsius);
    }

    pub fn update_heater(&mut self, duty_cycle: f64) -> Result<()> {
        self.heater_dc = clamp(0.0, duty_cycle, 100.0);
        self.heater.set_heater_dc(self.heater_dc)
    }

    pub fn update_heater_with_delta(&mut self, delta: f64) -> Result<()> {
        self.update_heater(self.heater_dc + delta)
    }

    pub fn turn_off_heater(&mut self) {
        let _ = self.update_heater(0.0);
    }
}

pub trait TemperatureAutomation: Send {
    fn key(&self) -> &'static str;

    fn execute(&mut self, io: &mut TemperatureIo) -> AutomationEvent;

    fn settable_attrs(&self) -> &'static [&'static str] {
        &[]
    }

    fn set(&mut self, _attr: &str, _value: &str) -> Option<String> {
        None
    }
}

pub fn register_builtins() {
    register_temperature("silent", |_, _| Ok(Box::new(Silent)));
    register_temperature("pid_stable", PidStable::from_args);
}

/// Never drives the heater.
pub struct Silent;

impl TemperatureAutomation for Silent {
    fn key(&self) -> &'static str {
        "silent"
    }

    fn execute(&mut self, _io: &mut TemperatureIo) -> AutomationEvent {
        AutomationEvent::no_event("heater untouched")
    }
}

/// Hold a target temperature with a PID on the heater duty cycle.
///
/// The raw derivative is too noisy for the slow thermal loop, so the d-term
/// runs through a DEMA(0.60). The very first reading sets the duty cycle by
/// a linear jump on the error instead of waiting for the integral to wind
/// up.
pub struct PidStable {
    pub target_temperature: f64,
    pid: PidController,
    first_update: bool,
}

impl PidStable {
    pub fn from_args(
        args: &AutomationArgs,
        config: &Config,
    ) -> Result<Box<dyn TemperatureAutomation>> {
        let target_temperature = clamp(0.0, args.require_f64("target_temperature")?, 50.0);
        let gains = config.temperature.pid_stable;
        Ok(Box::new(Self {
            target_temperature,
            pid: PidController::new(gains.kp, gains.ki, gains.kd, target_temperature)
                .with_derivative_filter(0.60),
            first_update: true,
        }))
    }

    fn set_target_temperature(&mut self, value: f64) -> f64 {
        if value > 50.0 {
            log::warn!("temperatures over 50 ℃ are not supported; clamping to 50 ℃");
        }
        self.target_temperature = clamp(0.0, value, 50.0);
        self.pid.set_setpoint(self.target_temperature);
        self.target_temperature
    }
}

impl TemperatureAutomation for PidStable {
    fn key(&self) -> &'static str {
        "pid_stable"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["target_temperature"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        if attr != "target_temperature" {
            return None;
        }
        let parsed = parse_setting::<f64>(value)?;
        Some(self.set_target_temperature(parsed).to_string())
    }

    fn execute(&mut self, io: &mut TemperatureIo) -> AutomationEvent {
        let Some(temperature) = io.latest_temperature else {
            return AutomationEvent::error("no temperature reading has arrived yet");
        };

        if self.first_update {
            self.first_update = false;
            let delta_t = self.target_temperature - temperature;
            let initial_dc = if delta_t <= 0.0 { 0.0 } else { 3.0 * delta_t };
            return match io.update_heater(initial_dc) {
                Ok(()) => AutomationEvent::no_event(format!(
                    "seeded heater at {initial_dc:.1}% from a {delta_t:.1} ℃ error"
                )),
                Err(e) => AutomationEvent::error(e.to_string()),
            };
        }

        let delta = self.pid.update(temperature);
        match io.update_heater_with_delta(delta) {
            Ok(()) => AutomationEvent::no_event(format!(
                "heater at {:.1}% (Δ {delta:+.2})",
                io.heater_dc
            )),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Heater over PWM, and the job wrapper
// ---------------------------------------------------------------------------

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::Qos;
use crate::hardware::pwm::Pwm;
use crate::job::{JobHost, JobState, NodeCtx, SettingMeta};
use crate::timing::RepeatedTimer;

/// The dedicated heater PWM channel as a [`Heater`].
pub struct PwmHeater {
    pwm: Pwm,
    started: bool,
}

impl PwmHeater {
    pub fn new(mut pwm: Pwm) -> Result<Self> {
        pwm.lock()?;
        Ok(Self {
            pwm,
            started: false,
        })
    }
}

impl Heater for PwmHeater {
    fn set_heater_dc(&mut self, duty_cycle: f64) -> Result<()> {
        if !self.started {
            self.pwm.start(duty_cycle)?;
            self.started = true;
        } else {
            self.pwm.change_duty_cycle(duty_cycle);
        }
        Ok(())
    }
}

pub struct TemperatureJob {
    pub host: Arc<JobHost>,
    pub io: Arc<Mutex<TemperatureIo>>,
    timer: Arc<Mutex<Option<RepeatedTimer>>>,
}

/// Run `automation_key` against the heater every `duration` minutes,
/// following the temperature readings published on the bus.
pub fn start_temperature_automation(
    ctx: NodeCtx,
    config: &Config,
    automation_key: &str,
    args: &crate::automations::AutomationArgs,
    heater: Box<dyn Heater>,
) -> Result<TemperatureJob> {
    let automation = crate::automations::create_temperature(automation_key, args, config)?;
    let duration_minutes = args.get_f64("duration").unwrap_or(10.0);

    let host = JobHost::init(JOB_NAME, ctx)?;
    let io = Arc::new(Mutex::new(TemperatureIo::new(heater)));
    let automation = Arc::new(Mutex::new(automation));

    let settable_attrs = automation.lock().unwrap().settable_attrs();
    for &attr in settable_attrs {
        let setting_automation = Arc::clone(&automation);
        host.declare_setting(attr, SettingMeta::float(true, None), move |_, payload| {
            setting_automation.lock().unwrap().set(attr, payload)
        });
    }
    host.activate()?;

    let reading_io = Arc::clone(&io);
    host.subscribe(
        &[host.exp_topic("temperature_control/temperature").as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            if let Some(celsius) = message.payload_f64() {
                reading_io.lock().unwrap().record_temperature(celsius);
            }
        },
    )?;

    let timer_slot: Arc<Mutex<Option<RepeatedTimer>>> = Arc::new(Mutex::new(None));
    let disconnect_io = Arc::clone(&io);
    let disconnect_slot = Arc::clone(&timer_slot);
    host.on_disconnect(move |_| {
        if let Some(mut timer) = disconnect_slot.lock().unwrap().take() {
            timer.cancel();
        }
        // never leave the heater driving an unsupervised vial
        disconnect_io.lock().unwrap().turn_off_heater();
    });

    host.ready();
    log::info!("starting {automation_key} temperature automation");

    let tick_host = Arc::clone(&host);
    let tick_io = Arc::clone(&io);
    let tick_automation = Arc::clone(&automation);
    let timer = RepeatedTimer::new(
        Duration::from_secs_f64(duration_minutes * 60.0),
        true,
        move || {
            if tick_host.state() != JobState::Ready {
                return;
            }
            let event = {
                let mut io = tick_io.lock().unwrap();
                tick_automation.lock().unwrap().execute(&mut io)
            };
            log::debug!("triggered {event}");
            let heater_dc = tick_io.lock().unwrap().heater_dc;
            let _ = tick_host.publish_setting("heater_duty_cycle", heater_dc.to_string().as_bytes());
        },
    );
    *timer_slot.lock().unwrap() = Some(timer);

    Ok(TemperatureJob {
        host,
        io,
        timer: timer_slot,
    })
}

impl TemperatureJob {
    pub fn shutdown(&mut self) {
        self.host.transition(JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}
