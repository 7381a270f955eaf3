//! Exponential smoothing.

/// Exponential moving average: `v ← (1−α)·x + α·v`.
///
/// The first sample initializes the average directly.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(v) => (1.0 - self.alpha) * sample + self.alpha * v,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Smoothed derivative-on-change: `v ← α·(x − x_prev) + (1−α)·v`.
///
/// Starts at zero; samples without a predecessor leave the value untouched.
#[derive(Debug, Clone)]
pub struct Dema {
    alpha: f64,
    value: f64,
}

impl Dema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: 0.0 }
    }

    pub fn update(&mut self, sample: f64, previous: Option<f64>) -> f64 {
        if let Some(prev) = previous {
            self.value = self.alpha * (sample - prev) + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_first_sample_initializes() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.update(10.0), 10.0);
    }

    #[test]
    fn ema_blends_toward_new_samples() {
        let mut ema = Ema::new(0.5);
        ema.update(10.0);
        assert_eq!(ema.update(20.0), 15.0);
        // alpha weights the OLD value
        let mut sticky = Ema::new(0.9);
        sticky.update(10.0);
        assert!((sticky.update(20.0) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn ema_constant_input_is_fixed_point() {
        let mut ema = Ema::new(0.3);
        for _ in 0..50 {
            ema.update(4.2);
        }
        assert!((ema.value().unwrap() - 4.2).abs() < 1e-12);
    }

    #[test]
    fn dema_starts_at_zero_and_needs_a_predecessor() {
        let mut dema = Dema::new(0.6);
        assert_eq!(dema.update(5.0, None), 0.0);
        let v = dema.update(6.0, Some(5.0));
        assert!((v - 0.6).abs() < 1e-12);
    }

    #[test]
    fn dema_decays_without_change() {
        let mut dema = Dema::new(0.5);
        dema.update(1.0, Some(0.0)); // v = 0.5
        let v = dema.update(1.0, Some(1.0)); // v = 0.25
        assert!((v - 0.25).abs() < 1e-12);
    }
}
