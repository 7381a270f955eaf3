//! LED automations: scheduled control of the non-IR LED channels.

use std::collections::BTreeSet;

use crate::automations::{AutomationEvent, register_led};
use crate::error::Result;
use crate::hardware::dac::{Dac, LedChannel};
use crate::job::parse_setting;

pub const JOB_NAME: &str = "led_automation";

/// Culture state and DAC access shared by every LED policy.
pub struct LedIo {
    dac: Box<dyn Dac>,
    /// Channels this automation has touched; all are darkened on disconnect.
    pub edited_channels: BTreeSet<LedChannel>,
    pub latest_normalized_od: Option<f64>,
    pub latest_growth_rate: Option<f64>,
}

impl LedIo {
    pub fn new(dac: Box<dyn Dac>) -> Self {
        Self {
            dac,
            edited_channels: BTreeSet::new(),
            latest_normalized_od: None,
            latest_growth_rate: None,
        }
    }

    pub fn set_led_intensity(&mut self, channel: LedChannel, intensity: f64) -> Result<()> {
        self.edited_channels.insert(channel);
        self.dac.set_intensity(channel, intensity)
    }

    /// Darken every channel this automation edited.
    pub fn turn_off_edited(&mut self) {
        for channel in self.edited_channels.clone() {
            if let Err(e) = self.dac.set_intensity(channel, 0.0) {
                log::error!("failed to darken LED channel {channel}: {e}");
            }
        }
    }
}

pub trait LedAutomation: Send {
    fn key(&self) -> &'static str;

    fn execute(&mut self, io: &mut LedIo) -> AutomationEvent;

    fn settable_attrs(&self) -> &'static [&'static str] {
        &[]
    }

    fn set(&mut self, _attr: &str, _value: &str) -> Option<String> {
        None
    }
}

pub fn register_builtins() {
    register_led("silent", |_, _| Ok(Box::new(Silent)));
    register_led("light_dark_cycle", |args, _| {
        let channel = args
            .get("channel")
            .and_then(LedChannel::parse)
            .unwrap_or(LedChannel::B);
        Ok(Box::new(LightDarkCycle {
            light_intensity: args.get_f64("light_intensity").unwrap_or(50.0),
            hours_light: args.get_f64("hours_light").unwrap_or(16.0),
            hours_dark: args.get_f64("hours_dark").unwrap_or(8.0),
            channel,
            hours_in_phase: 0.0,
            in_light: false,
        }))
    });
}

/// Leaves the LEDs alone.
pub struct Silent;

impl LedAutomation for Silent {
    fn key(&self) -> &'static str {
        "silent"
    }

    fn execute(&mut self, _io: &mut LedIo) -> AutomationEvent {
        AutomationEvent::no_event("no LED change")
    }
}

/// Day/night rhythm: one channel lit for `hours_light`, dark for
/// `hours_dark`, assuming an hourly tick.
pub struct LightDarkCycle {
    pub light_intensity: f64,
    pub hours_light: f64,
    pub hours_dark: f64,
    pub channel: LedChannel,
    hours_in_phase: f64,
    in_light: bool,
}

impl LedAutomation for LightDarkCycle {
    fn key(&self) -> &'static str {
        "light_dark_cycle"
    }

    fn settable_attrs(&self) -> &'static [&'static str] {
        &["light_intensity", "hours_light", "hours_dark"]
    }

    fn set(&mut self, attr: &str, value: &str) -> Option<String> {
        let parsed = parse_setting::<f64>(value)?;
        let accepted = match attr {
            "light_intensity" => {
                self.light_intensity = parsed.clamp(0.0, 100.0);
                self.light_intensity
            }
            "hours_light" => {
                self.hours_light = parsed;
                parsed
            }
            "hours_dark" => {
                self.hours_dark = parsed;
                parsed
            }
            _ => return None,
        };
        Some(accepted.to_string())
    }

    fn execute(&mut self, io: &mut LedIo) -> AutomationEvent {
        let phase_budget = if self.in_light {
            self.hours_light
        } else {
            self.hours_dark
        };
        self.hours_in_phase += 1.0;
        if self.hours_in_phase < phase_budget {
            return AutomationEvent::no_event(format!(
                "{} for {} more h",
                if self.in_light { "light" } else { "dark" },
                phase_budget - self.hours_in_phase
            ));
        }

        self.in_light = !self.in_light;
        self.hours_in_phase = 0.0;
        let intensity = if self.in_light {
            self.light_intensity
        } else {
            0.0
        };
        match io.set_led_intensity(self.channel, intensity) {
            Ok(()) => AutomationEvent::no_event(format!(
                "switched channel {} to {intensity}%",
                self.channel
            )),
            Err(e) => AutomationEvent::error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Job wrapper
// ---------------------------------------------------------------------------

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::automations::AutomationArgs;
use crate::bus::Qos;
use crate::config::Config;
use crate::job::{JobHost, JobState, NodeCtx, SettingMeta};
use crate::timing::RepeatedTimer;

pub struct LedJob {
    pub host: Arc<JobHost>,
    pub io: Arc<Mutex<LedIo>>,
    timer: Arc<Mutex<Option<RepeatedTimer>>>,
}

/// Run `automation_key` every `duration` minutes against the LED DAC.
pub fn start_led_automation(
    ctx: NodeCtx,
    config: &Config,
    automation_key: &str,
    args: &AutomationArgs,
    dac: Box<dyn Dac>,
) -> crate::error::Result<LedJob> {
    let automation = crate::automations::create_led(automation_key, args, config)?;
    let duration_minutes = args.get_f64("duration").unwrap_or(60.0);

    let host = JobHost::init(JOB_NAME, ctx)?;
    let io = Arc::new(Mutex::new(LedIo::new(dac)));
    let automation = Arc::new(Mutex::new(automation));

    let settable_attrs = automation.lock().unwrap().settable_attrs();
    for &attr in settable_attrs {
        let setting_automation = Arc::clone(&automation);
        host.declare_setting(attr, SettingMeta::float(true, None), move |_, payload| {
            setting_automation.lock().unwrap().set(attr, payload)
        });
    }
    host.activate()?;

    let od_io = Arc::clone(&io);
    host.subscribe(
        &[host
            .exp_topic("growth_rate_calculating/od_filtered/#")
            .as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            if let Some(od) = message.payload_f64() {
                od_io.lock().unwrap().latest_normalized_od = Some(od);
            }
        },
    )?;
    let rate_io = Arc::clone(&io);
    host.subscribe(
        &[host
            .exp_topic("growth_rate_calculating/growth_rate")
            .as_str()],
        Qos::AtLeastOnce,
        true,
        move |message| {
            if let Some(rate) = message.payload_f64() {
                rate_io.lock().unwrap().latest_growth_rate = Some(rate);
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
        disconnect_io.lock().unwrap().turn_off_edited();
    });

    host.ready();
    log::info!("starting {automation_key} LED automation");

    let tick_host = Arc::clone(&host);
    let tick_io = Arc::clone(&io);
    let tick_automation = Arc::clone(&automation);
    let timer = RepeatedTimer::new(
        Duration::from_secs_f64(duration_minutes * 60.0),
        !args.get("skip_first_run").is_some_and(|v| v != "0"),
        move || {
            if tick_host.state() != JobState::Ready {
                return;
            }
            let event = {
                let mut io = tick_io.lock().unwrap();
                tick_automation.lock().unwrap().execute(&mut io)
            };
            log::info!("triggered {event}");
            if let Ok(payload) = serde_json::to_vec(&event) {
                let _ = tick_host.publish_setting("latest_event", &payload);
            }
        },
    );
    *timer_slot.lock().unwrap() = Some(timer);

    Ok(LedJob {
        host,
        io,
        timer: timer_slot,
    })
}

impl LedJob {
    pub fn shutdown(&mut self) {
        self.host.transition(JobState::Disconnected);
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::dac::SimDac;

    #[test]
    fn silent_touches_nothing() {
        let mut io = LedIo::new(Box::new(SimDac::new()));
        let mut algo = Silent;
        assert_eq!(algo.execute(&mut io).name(), "NoEvent");
        assert!(io.edited_channels.is_empty());
    }

    #[test]
    fn edited_channels_darken_on_teardown() {
        let dac = SimDac::new();
        let probe = dac.clone();
        let mut io = LedIo::new(Box::new(dac));
        io.set_led_intensity(LedChannel::B, 70.0).unwrap();
        io.set_led_intensity(LedChannel::C, 30.0).unwrap();
        assert_eq!(probe.level(LedChannel::B), 70.0);

        io.turn_off_edited();
        assert_eq!(probe.level(LedChannel::B), 0.0);
        assert_eq!(probe.level(LedChannel::C), 0.0);
    }

    #[test]
    fn light_dark_cycle_alternates_phases() {
        let dac = SimDac::new();
        let probe = dac.clone();
        let mut io = LedIo::new(Box::new(dac));
        let mut algo = LightDarkCycle {
            light_intensity: 40.0,
            hours_light: 2.0,
            hours_dark: 1.0,
            channel: LedChannel::B,
            hours_in_phase: 0.0,
            in_light: false,
        };

        // one dark hour, then the light comes on
        algo.execute(&mut io);
        assert_eq!(probe.level(LedChannel::B), 40.0);
        // two light hours, then dark again
        algo.execute(&mut io);
        algo.execute(&mut io);
        assert_eq!(probe.level(LedChannel::B), 0.0);
    }

    #[test]
    fn intensity_setting_is_clamped() {
        let mut algo = LightDarkCycle {
            light_intensity: 40.0,
            hours_light: 16.0,
            hours_dark: 8.0,
            channel: LedChannel::B,
            hours_in_phase: 0.0,
            in_light: false,
        };
        assert_eq!(algo.set("light_intensity", "130"), Some("100".into()));
        assert_eq!(algo.light_intensity, 100.0);
    }
}
