//! GPIO capability: level output, level input, and rising-edge collection.

use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gpio_cdev::{Chip, EventRequestFlags, LineRequestFlags};

use crate::error::{Error, Result};

/// Input bias. The character-device v1 ABI cannot set bias, so the Linux
/// implementations rely on board-level pulls and accept this for intent only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

pub trait GpioOutput: Send {
    fn set(&mut self, high: bool) -> Result<()>;
}

pub trait GpioInput: Send {
    fn read(&self) -> Result<bool>;
}

/// Rising-edge collector for pulse counting (hall sensors, buttons).
pub trait EdgeSource: Send {
    /// Observe for `window`, returning edge times in seconds since the call
    /// started. Edges closer than `debounce` to their predecessor are folded
    /// away.
    fn collect_edges(&mut self, window: Duration, debounce: Duration) -> Result<Vec<f64>>;
}

// ---------------------------------------------------------------------------
// Linux character-device implementations
// ---------------------------------------------------------------------------

pub struct CdevOutput {
    handle: gpio_cdev::LineHandle,
}

impl CdevOutput {
    pub fn open(chip_path: &str, pin: u32) -> Result<Self> {
        let mut chip = Chip::new(chip_path).map_err(gpio_err)?;
        let line = chip.get_line(pin).map_err(gpio_err)?;
        let handle = line
            .request(LineRequestFlags::OUTPUT, 0, "petri")
            .map_err(gpio_err)?;
        Ok(Self { handle })
    }
}

impl GpioOutput for CdevOutput {
    fn set(&mut self, high: bool) -> Result<()> {
        self.handle.set_value(u8::from(high)).map_err(gpio_err)
    }
}

pub struct CdevInput {
    handle: gpio_cdev::LineHandle,
}

impl CdevInput {
    pub fn open(chip_path: &str, pin: u32, _pull: Pull) -> Result<Self> {
        let mut chip = Chip::new(chip_path).map_err(gpio_err)?;
        let line = chip.get_line(pin).map_err(gpio_err)?;
        let handle = line
            .request(LineRequestFlags::INPUT, 0, "petri")
            .map_err(gpio_err)?;
        Ok(Self { handle })
    }
}

impl GpioInput for CdevInput {
    fn read(&self) -> Result<bool> {
        Ok(self.handle.get_value().map_err(gpio_err)? != 0)
    }
}

pub struct CdevEdgeSource {
    events: gpio_cdev::LineEventHandle,
}

impl CdevEdgeSource {
    pub fn open(chip_path: &str, pin: u32, _pull: Pull) -> Result<Self> {
        let mut chip = Chip::new(chip_path).map_err(gpio_err)?;
        let line = chip.get_line(pin).map_err(gpio_err)?;
        let events = line
            .events(
                LineRequestFlags::INPUT,
                EventRequestFlags::RISING_EDGE,
                "petri",
            )
            .map_err(gpio_err)?;
        Ok(Self { events })
    }
}

impl EdgeSource for CdevEdgeSource {
    fn collect_edges(&mut self, window: Duration, debounce: Duration) -> Result<Vec<f64>> {
        let started = Instant::now();
        let fd = self.events.as_raw_fd();
        let mut edges: Vec<f64> = Vec::new();

        loop {
            let remaining = window.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            // SAFETY: pollfd points at a live stack value for the duration of the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if rc < 0 {
                return Err(Error::Hardware(format!(
                    "poll on gpio event fd: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if rc == 0 {
                break;
            }
            self.events.get_event().map_err(gpio_err)?;
            let at = started.elapsed().as_secs_f64();
            if edges
                .last()
                .is_none_or(|prev| at - prev >= debounce.as_secs_f64())
            {
                edges.push(at);
            }
        }
        Ok(edges)
    }
}

fn gpio_err(e: gpio_cdev::Error) -> Error {
    Error::Hardware(format!("gpio: {e}"))
}

// ---------------------------------------------------------------------------
// Simulators
// ---------------------------------------------------------------------------

/// Records every level written; the shared history is inspectable from tests.
#[derive(Clone, Default)]
pub struct SimOutput {
    pub writes: Arc<Mutex<Vec<bool>>>,
}

impl SimOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<bool> {
        self.writes.lock().unwrap().last().copied()
    }
}

impl GpioOutput for SimOutput {
    fn set(&mut self, high: bool) -> Result<()> {
        self.writes.lock().unwrap().push(high);
        Ok(())
    }
}

/// Fixed or externally scripted input level.
#[derive(Clone, Default)]
pub struct SimInput {
    pub level: Arc<Mutex<bool>>,
}

impl GpioInput for SimInput {
    fn read(&self) -> Result<bool> {
        Ok(*self.level.lock().unwrap())
    }
}

/// Replays a scripted pulse train, `interval` seconds between edges.
pub struct SimEdgeSource {
    pub interval_secs: f64,
    /// Shrink the observation sleep so tests stay fast.
    pub time_scale: f64,
}

impl SimEdgeSource {
    pub fn steady(interval_secs: f64) -> Self {
        Self {
            interval_secs,
            time_scale: 0.0,
        }
    }
}

impl EdgeSource for SimEdgeSource {
    fn collect_edges(&mut self, window: Duration, debounce: Duration) -> Result<Vec<f64>> {
        if self.time_scale > 0.0 {
            std::thread::sleep(window.mul_f64(self.time_scale));
        }
        let mut edges = Vec::new();
        if self.interval_secs <= 0.0 {
            return Ok(edges);
        }
        let mut t = self.interval_secs;
        let mut last: Option<f64> = None;
        while t < window.as_secs_f64() {
            if last.is_none_or(|prev| t - prev >= debounce.as_secs_f64()) {
                edges.push(t);
                last = Some(t);
            }
            t += self.interval_secs;
        }
        Ok(edges)
    }
}
