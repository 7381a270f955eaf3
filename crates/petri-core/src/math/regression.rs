//! Least-squares fits: simple OLS and sine regression at a known frequency.

use nalgebra::{Matrix3, Vector3};

/// Ordinary least squares `y = slope·x + bias`.
///
/// Returns `((slope, slope_std_err), (bias, bias_std_err), correlation)`.
pub fn simple_linear_regression(x: &[f64], y: &[f64]) -> ((f64, f64), (f64, f64), f64) {
    assert_eq!(x.len(), y.len());
    let n = x.len() as f64;
    if x.len() < 3 {
        return ((0.0, f64::INFINITY), (0.0, f64::INFINITY), 0.0);
    }

    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        sxx += (xi - mean_x).powi(2);
        syy += (yi - mean_y).powi(2);
        sxy += (xi - mean_x) * (yi - mean_y);
    }
    if sxx == 0.0 {
        return ((0.0, f64::INFINITY), (mean_y, f64::INFINITY), 0.0);
    }

    let slope = sxy / sxx;
    let bias = mean_y - slope * mean_x;
    let correlation = if syy > 0.0 { sxy / (sxx * syy).sqrt() } else { 0.0 };

    let rss: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - slope * xi - bias).powi(2))
        .sum();
    let residual_var = rss / (n - 2.0);
    let slope_std_err = (residual_var / sxx).sqrt();
    let bias_std_err = (residual_var * (1.0 / n + mean_x.powi(2) / sxx)).sqrt();

    ((slope, slope_std_err), (bias, bias_std_err), correlation)
}

/// OLS through the origin: `y = slope·x`.
pub fn simple_linear_regression_with_forced_zero_intercept(
    x: &[f64],
    y: &[f64],
) -> ((f64, f64), (f64, f64), f64) {
    assert_eq!(x.len(), y.len());
    let n = x.len() as f64;
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    if sxx == 0.0 || x.len() < 2 {
        return ((0.0, f64::INFINITY), (0.0, 0.0), 0.0);
    }
    let sxy: f64 = x.iter().zip(y).map(|(&xi, &yi)| xi * yi).sum();
    let slope = sxy / sxx;
    let rss: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - slope * xi).powi(2))
        .sum();
    let slope_std_err = (rss / (n - 1.0) / sxx).sqrt();

    let mean_y = y.iter().sum::<f64>() / n;
    let syy: f64 = y.iter().map(|&yi| (yi - mean_y).powi(2)).sum();
    let correlation = if syy > 0.0 {
        let mean_x = x.iter().sum::<f64>() / n;
        let sxx_c: f64 = x.iter().map(|&xi| (xi - mean_x).powi(2)).sum();
        let sxy_c: f64 = x
            .iter()
            .zip(y)
            .map(|(&xi, &yi)| (xi - mean_x) * (yi - mean_y))
            .sum();
        if sxx_c > 0.0 { sxy_c / (sxx_c * syy).sqrt() } else { 0.0 }
    } else {
        0.0
    };

    ((slope, slope_std_err), (0.0, 0.0), correlation)
}

/// Result of [`sine_regression`]: `y ≈ c + a·sin(2πf·t + phi)`.
#[derive(Debug, Clone, Copy)]
pub struct SineFit {
    pub c: f64,
    pub a: f64,
    pub phi: f64,
    /// `n·ln(RSS/n) + 2k` with k = 3; +∞ for degenerate or exact fits.
    pub aic: f64,
}

/// Residuals whose magnitude exceeds this multiple of the MAD-based robust
/// sigma are treated as outliers.
const OUTLIER_SIGMA_FACTOR: f64 = 4.0;
const MAX_OUTLIER_ROUNDS: usize = 3;

/// Weighted least-squares fit of `c + a·sin(2πf·t + phi)` at a known
/// frequency, solved on the basis `[1, sin, cos]` via 3×3 normal equations.
///
/// `prior_c` applies a Gaussian prior on the DC level with weight
/// `penalizer_c`: the penalty lands on the `[0,0]` entry of the normal
/// matrix and `penalizer_c · prior` on the right-hand side, so the pull is
/// independent of the overall scale of `y`.
///
/// Points are screened with iteratively reweighted residuals: while the
/// single largest |residual| exceeds 4× the robust sigma
/// (`1.4826 · MAD`), that point is dropped and the system re-solved.
pub fn sine_regression(
    x: &[f64],
    y: &[f64],
    freq: f64,
    prior_c: Option<f64>,
    penalizer_c: f64,
) -> SineFit {
    assert_eq!(x.len(), y.len());
    let degenerate = SineFit {
        c: 0.0,
        a: 0.0,
        phi: 0.0,
        aic: f64::INFINITY,
    };
    if x.len() < 4 {
        return degenerate;
    }
    if y.iter().all(|&v| v == 0.0) {
        return degenerate;
    }

    let mut xs: Vec<f64> = x.to_vec();
    let mut ys: Vec<f64> = y.to_vec();

    for round in 0..=MAX_OUTLIER_ROUNDS {
        let Some(fit) = solve_sine(&xs, &ys, freq, prior_c, penalizer_c) else {
            return SineFit {
                c: mean(&ys),
                a: 0.0,
                phi: 0.0,
                aic: f64::INFINITY,
            };
        };

        let residuals: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .map(|(&t, &v)| v - (fit.c + fit.a * (2.0 * std::f64::consts::PI * freq * t + fit.phi).sin()))
            .collect();

        let sigma = robust_sigma(&residuals);
        let (worst_idx, worst_abs) = residuals
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.abs()))
            .fold((0, 0.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let keep_screening =
            sigma > 0.0 && worst_abs > OUTLIER_SIGMA_FACTOR * sigma && xs.len() > 6;
        if !keep_screening || round == MAX_OUTLIER_ROUNDS {
            let n = xs.len() as f64;
            let rss: f64 = residuals.iter().map(|r| r * r).sum();
            let aic = if rss <= 1e-12 {
                f64::INFINITY
            } else {
                n * (rss / n).ln() + 2.0 * 3.0
            };
            return SineFit { aic, ..fit };
        }

        xs.remove(worst_idx);
        ys.remove(worst_idx);
    }
    unreachable!("screening loop always returns");
}

fn solve_sine(
    x: &[f64],
    y: &[f64],
    freq: f64,
    prior_c: Option<f64>,
    penalizer_c: f64,
) -> Option<SineFit> {
    let tau = 2.0 * std::f64::consts::PI * freq;
    let n = x.len() as f64;

    let mut sum_sin = 0.0;
    let mut sum_cos = 0.0;
    let mut sum_sin2 = 0.0;
    let mut sum_cos2 = 0.0;
    let mut sum_sincos = 0.0;
    let mut sum_y = 0.0;
    let mut sum_ysin = 0.0;
    let mut sum_ycos = 0.0;
    for (&t, &v) in x.iter().zip(y) {
        let (s, c) = (tau * t).sin_cos();
        sum_sin += s;
        sum_cos += c;
        sum_sin2 += s * s;
        sum_cos2 += c * c;
        sum_sincos += s * c;
        sum_y += v;
        sum_ysin += v * s;
        sum_ycos += v * c;
    }

    let (penalty, prior) = match prior_c {
        Some(prior) => (penalizer_c, prior),
        None => (0.0, 0.0),
    };

    let m = Matrix3::new(
        n + penalty,
        sum_sin,
        sum_cos,
        sum_sin,
        sum_sin2,
        sum_sincos,
        sum_cos,
        sum_sincos,
        sum_cos2,
    );
    let rhs = Vector3::new(sum_y + penalty * prior, sum_ysin, sum_ycos);
    let solution = m.lu().solve(&rhs)?;
    if !solution.iter().all(|v| v.is_finite()) {
        return None;
    }

    let (c, a_coef, b_coef) = (solution[0], solution[1], solution[2]);
    Some(SineFit {
        c,
        a: a_coef.hypot(b_coef),
        phi: b_coef.atan2(a_coef),
        aic: f64::NAN, // filled in by the caller once residuals are final
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// `1.4826 · median(|r − median(r)|)`, a sigma estimate the outlier itself
/// cannot inflate.
fn robust_sigma(residuals: &[f64]) -> f64 {
    let mut sorted = residuals.to_vec();
    let med = median(&mut sorted);
    let mut deviations: Vec<f64> = residuals.iter().map(|r| (r - med).abs()).collect();
    1.4826 * median(&mut deviations)
}
