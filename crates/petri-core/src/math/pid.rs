//! Publishing PID controller.
//!
//! Wraps the `pid` crate with the extras the control jobs need: a constant
//! `K0` offset, asymmetric output limits, an optional smoothed-derivative
//! filter (the raw d-term is too noisy for the heater), and a stats block
//! published to the bus on every update so the full controller state is
//! visible from outside the process.

use std::sync::Arc;

use serde::Serialize;

use super::ema::Dema;
use crate::bus::{BusClient, Qos};

#[derive(Debug, Clone, Serialize)]
struct PidStats {
    setpoint: f64,
    #[serde(rename = "Kp")]
    kp: f64,
    #[serde(rename = "Ki")]
    ki: f64,
    #[serde(rename = "Kd")]
    kd: f64,
    #[serde(rename = "K0")]
    k0: f64,
    integral: f64,
    proportional: f64,
    derivative: f64,
    last_input: f64,
    last_output: f64,
    output_limits: (Option<f64>, Option<f64>),
}

pub struct PidController {
    inner: pid::Pid<f64>,
    kp: f64,
    ki: f64,
    kd: f64,
    k0: f64,
    setpoint: f64,
    output_limits: (Option<f64>, Option<f64>),
    derivative_filter: Option<Dema>,
    last_input: Option<f64>,
    last_output: Option<f64>,
    publisher: Option<(Arc<BusClient>, String)>,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, setpoint: f64) -> Self {
        let mut inner = pid::Pid::new(setpoint, f64::MAX);
        inner.p(kp, f64::MAX).i(ki, f64::MAX).d(kd, f64::MAX);
        Self {
            inner,
            kp,
            ki,
            kd,
            k0: 0.0,
            setpoint,
            output_limits: (None, None),
            derivative_filter: None,
            last_input: None,
            last_output: None,
            publisher: None,
        }
    }

    /// Constant offset added to every output.
    pub fn with_k0(mut self, k0: f64) -> Self {
        self.k0 = k0;
        self
    }

    pub fn with_output_limits(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.output_limits = (lower, upper);
        self
    }

    /// Replace the raw d-term with `kd · DEMA(∆input)`.
    pub fn with_derivative_filter(mut self, alpha: f64) -> Self {
        self.derivative_filter = Some(Dema::new(alpha));
        // the inner controller must not double-count the derivative
        self.inner.d(0.0, f64::MAX);
        self
    }

    /// Publish the stats block to `topic` through `bus` on each update.
    pub fn with_stats_publisher(mut self, bus: Arc<BusClient>, topic: String) -> Self {
        self.publisher = Some((bus, topic));
        self
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
        self.inner.setpoint(setpoint);
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Feed one measurement, get the controller output.
    pub fn update(&mut self, input: f64) -> f64 {
        let out = self.inner.next_control_output(input);
        let derivative = match &mut self.derivative_filter {
            Some(filter) => {
                let delta = filter.update(input, self.last_input);
                // derivative on measurement opposes the input's motion
                -self.kd * delta
            }
            None => out.d,
        };

        let mut output = out.p + out.i + derivative + self.k0;
        if let Some(lower) = self.output_limits.0 {
            output = output.max(lower);
        }
        if let Some(upper) = self.output_limits.1 {
            output = output.min(upper);
        }

        self.last_input = Some(input);
        self.last_output = Some(output);
        self.publish_stats(out.p, out.i, derivative, input, output);
        output
    }

    fn publish_stats(&self, p: f64, i: f64, d: f64, input: f64, output: f64) {
        let Some((bus, topic)) = &self.publisher else {
            return;
        };
        let stats = PidStats {
            setpoint: self.setpoint,
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            k0: self.k0,
            integral: i,
            proportional: p,
            derivative: d,
            last_input: input,
            last_output: output,
            output_limits: self.output_limits,
        };
        if let Ok(payload) = serde_json::to_vec(&stats) {
            let _ = bus.publish(topic, &payload, Qos::AtMostOnce, false);
        }
    }
}
