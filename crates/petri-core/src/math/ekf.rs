//! Extended Kalman filter over filtered ODs and exponential growth rate.
//!
//! State `x = [od_1, …, od_k, r]` evolving as
//!
//! ```text
//! od_{i,t+1} = od_{i,t} · exp(r_t · ∆t)
//! r_{t+1}    = r_t
//! ```
//!
//! Only the ODs are observed. The observation variance is proportional to
//! the squared predicted signal, so bright channels are trusted no more in
//! relative terms than dim ones. Dosing events temporarily scale the OD
//! block of the covariance (see [`Ekf::scale_od_variance`]); the owning job
//! schedules the restore and cancels it when a newer event arrives.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

pub struct Ekf {
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    /// Diagonal of the observation noise matrix, one entry per OD channel.
    observation_noise: DVector<f64>,
    dt: f64,
    pre_scale_covariance: Option<DMatrix<f64>>,
}

impl Ekf {
    pub fn new(
        initial_state: DVector<f64>,
        initial_covariance: DMatrix<f64>,
        process_noise: DMatrix<f64>,
        observation_noise: DVector<f64>,
        dt: f64,
    ) -> Result<Self> {
        let d = initial_state.len();
        if d < 2 {
            return Err(Error::InvalidArgument(
                "state needs at least one OD channel and the rate".into(),
            ));
        }
        if initial_covariance.nrows() != d
            || initial_covariance.ncols() != d
            || process_noise.nrows() != d
            || process_noise.ncols() != d
        {
            return Err(Error::InvalidArgument("covariance shape mismatch".into()));
        }
        if observation_noise.len() != d - 1 {
            return Err(Error::InvalidArgument(
                "observation noise must cover exactly the OD channels".into(),
            ));
        }
        Ok(Self {
            state: initial_state,
            covariance: initial_covariance,
            process_noise,
            observation_noise,
            dt,
            pre_scale_covariance: None,
        })
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    /// Estimated exponential growth rate (per hour).
    pub fn growth_rate(&self) -> f64 {
        self.state[self.state.len() - 1]
    }

    /// Filtered OD of channel `i`.
    pub fn od(&self, i: usize) -> f64 {
        self.state[i]
    }

    pub fn od_count(&self) -> usize {
        self.state.len() - 1
    }

    fn predict_state(&self) -> DVector<f64> {
        let d = self.state.len();
        let rate = self.state[d - 1];
        let growth = (rate * self.dt).exp();
        let mut predicted = self.state.clone();
        for i in 0..d - 1 {
            predicted[i] *= growth;
        }
        predicted
    }

    fn process_jacobian(&self) -> DMatrix<f64> {
        let d = self.state.len();
        let rate = self.state[d - 1];
        let growth = (rate * self.dt).exp();
        let mut jacobian = DMatrix::zeros(d, d);
        for i in 0..d - 1 {
            jacobian[(i, i)] = growth;
            jacobian[(i, d - 1)] = self.state[i] * self.dt * growth;
        }
        jacobian[(d - 1, d - 1)] = 1.0;
        jacobian
    }

    /// One predict/update step on an OD observation vector.
    pub fn update(&mut self, observation: &[f64]) -> Result<()> {
        let d = self.state.len();
        let k = d - 1;
        if observation.len() != k {
            return Err(Error::InvalidArgument(format!(
                "expected {k} OD observations, got {}",
                observation.len()
            )));
        }

        let jacobian = self.process_jacobian();
        let predicted_state = self.predict_state();
        let predicted_covariance =
            &jacobian * &self.covariance * jacobian.transpose() + &self.process_noise;

        // residual over the observed block
        let mut residual = DVector::zeros(k);
        for i in 0..k {
            residual[i] = observation[i] - predicted_state[i];
        }

        // S = H P Hᵀ + diag(pred_od²)·R, with H = [I_k | 0]
        let mut residual_covariance = predicted_covariance.view((0, 0), (k, k)).into_owned();
        for i in 0..k {
            residual_covariance[(i, i)] +=
                predicted_state[i].powi(2) * self.observation_noise[i];
        }
        let inverse = residual_covariance.try_inverse().ok_or_else(|| {
            Error::InvalidArgument("residual covariance is singular".into())
        })?;

        // K = P Hᵀ S⁻¹, and P Hᵀ is just the first k columns of P
        let p_ht = predicted_covariance.view((0, 0), (d, k)).into_owned();
        let gain = &p_ht * inverse;

        self.state = &predicted_state + &gain * &residual;

        let mut identity_minus_kh = DMatrix::<f64>::identity(d, d);
        for row in 0..d {
            for col in 0..k {
                identity_minus_kh[(row, col)] -= gain[(row, col)];
            }
        }
        self.covariance = identity_minus_kh * predicted_covariance;
        Ok(())
    }

    /// Inflate the OD block of the covariance by `factor` (a dosing event is
    /// about to perturb the signal). Re-entrant: repeated calls keep the
    /// original covariance saved until [`Ekf::restore_od_variance`].
    pub fn scale_od_variance(&mut self, factor: f64) {
        let d = self.state.len();
        if self.pre_scale_covariance.is_none() {
            self.pre_scale_covariance = Some(self.covariance.clone());
        }
        let saved = self.pre_scale_covariance.as_ref().unwrap();
        let mut scaled = DMatrix::zeros(d, d);
        for i in 0..d {
            scaled[(i, i)] = saved[(i, i)];
        }
        for i in 0..d - 1 {
            scaled[(i, i)] *= factor;
        }
        self.covariance = scaled;
    }

    /// Undo [`Ekf::scale_od_variance`], restoring the saved covariance.
    pub fn restore_od_variance(&mut self) {
        if let Some(saved) = self.pre_scale_covariance.take() {
            self.covariance = saved;
        }
    }

    pub fn is_scaling_od_variance(&self) -> bool {
        self.pre_scale_covariance.is_some()
    }
}
