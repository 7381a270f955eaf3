//! Software PWM over a GPIO output.
//!
//! A worker thread toggles the line at the configured frequency. The channel
//! must be locked (claimed in the registry) before it can start; a second
//! lock on the same pin fails. Double stop is a no-op, and cleanup runs on
//! drop so pumps release their pins on every exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::gpio::GpioOutput;
use super::{Claim, Resource};
use crate::error::{Error, Result};

pub struct Pwm {
    pin: u32,
    hz: f64,
    output: Arc<Mutex<Box<dyn GpioOutput>>>,
    claim: Option<Claim>,
    duty: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::SeqCst);
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::SeqCst))
}

impl Pwm {
    pub fn new(pin: u32, hz: f64, output: Box<dyn GpioOutput>) -> Self {
        Self {
            pin,
            hz,
            output: Arc::new(Mutex::new(output)),
            claim: None,
            duty: Arc::new(AtomicU64::new(0f64.to_bits())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Claim the pin. Must precede `start`; fails if anything else holds it.
    pub fn lock(&mut self) -> Result<()> {
        if self.claim.is_none() {
            self.claim = Some(super::claim(Resource::GpioPin(self.pin))?);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.claim.is_some()
    }

    /// Begin toggling at `duty_cycle` percent.
    pub fn start(&mut self, duty_cycle: f64) -> Result<()> {
        if self.claim.is_none() {
            return Err(Error::Hardware(format!(
                "pwm pin {} must be locked before start",
                self.pin
            )));
        }
        if self.running.load(Ordering::SeqCst) {
            self.change_duty_cycle(duty_cycle);
            return Ok(());
        }
        store_f64(&self.duty, duty_cycle.clamp(0.0, 100.0));
        self.running.store(true, Ordering::SeqCst);

        let output = Arc::clone(&self.output);
        let duty = Arc::clone(&self.duty);
        let running = Arc::clone(&self.running);
        let period = Duration::from_secs_f64(1.0 / self.hz.max(1e-3));

        self.worker = Some(
            std::thread::Builder::new()
                .name(format!("pwm-{}", self.pin))
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        let dc = load_f64(&duty) / 100.0;
                        let on = period.mul_f64(dc);
                        let off = period.mul_f64(1.0 - dc);
                        if !on.is_zero() {
                            let _ = output.lock().unwrap().set(true);
                            std::thread::sleep(on);
                        }
                        if !off.is_zero() {
                            let _ = output.lock().unwrap().set(false);
                            std::thread::sleep(off);
                        }
                    }
                    let _ = output.lock().unwrap().set(false);
                })
                .expect("spawn pwm worker"),
        );
        Ok(())
    }

    /// Retune the duty cycle; clamped to `[0, 100]`.
    pub fn change_duty_cycle(&mut self, duty_cycle: f64) {
        store_f64(&self.duty, duty_cycle.clamp(0.0, 100.0));
    }

    pub fn duty_cycle(&self) -> f64 {
        load_f64(&self.duty)
    }

    /// Stop toggling and drive the line low. No-op when already stopped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Stop and release the pin claim.
    pub fn cleanup(&mut self) {
        self.stop();
        self.claim = None;
    }
}

impl Drop for Pwm {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gpio::SimOutput;

    #[test]
    fn start_requires_lock() {
        let mut pwm = Pwm::new(930, 100.0, Box::new(SimOutput::new()));
        assert!(pwm.start(50.0).is_err());
        pwm.lock().unwrap();
        assert!(pwm.start(50.0).is_ok());
        pwm.cleanup();
    }

    #[test]
    fn second_lock_on_same_pin_fails() {
        let mut a = Pwm::new(931, 100.0, Box::new(SimOutput::new()));
        let mut b = Pwm::new(931, 100.0, Box::new(SimOutput::new()));
        a.lock().unwrap();
        assert!(b.lock().is_err());
        a.cleanup();
        assert!(b.lock().is_ok());
    }

    #[test]
    fn duty_cycle_is_clamped() {
        let mut pwm = Pwm::new(932, 100.0, Box::new(SimOutput::new()));
        pwm.change_duty_cycle(150.0);
        assert_eq!(pwm.duty_cycle(), 100.0);
        pwm.change_duty_cycle(-3.0);
        assert_eq!(pwm.duty_cycle(), 0.0);
    }

    #[test]
    fn stop_twice_is_a_noop() {
        let output = SimOutput::new();
        let mut pwm = Pwm::new(933, 200.0, Box::new(output.clone()));
        pwm.lock().unwrap();
        pwm.start(100.0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pwm.stop();
        pwm.stop();
        assert_eq!(output.last(), Some(false));
    }

    #[test]
    fn worker_toggles_line() {
        let output = SimOutput::new();
        let mut pwm = Pwm::new(934, 200.0, Box::new(output.clone()));
        pwm.lock().unwrap();
        pwm.start(50.0).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        pwm.cleanup();
        let writes = output.writes.lock().unwrap();
        assert!(writes.iter().any(|&level| level));
        assert!(writes.iter().any(|&level| !level));
    }

    #[test]
    fn cleanup_releases_pin() {
        let mut pwm = Pwm::new(935, 100.0, Box::new(SimOutput::new()));
        pwm.lock().unwrap();
        pwm.cleanup();
        assert!(!super::super::is_claimed(&Resource::GpioPin(935)));
    }
}
