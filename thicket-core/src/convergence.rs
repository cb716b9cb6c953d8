//! Convergence diagnostics
//!
//! Statistics over a single trace column, used by the convergence-based
//! stopping rules of [`crate::mcmc::StoppingRule`].
//!
//! The effective sample size follows Geyer's initial positive sequence: the
//! autocovariances are summed in adjacent pairs until a pair stops being
//! positive. The Geweke diagnostic compares the mean of an early window of
//! the trace with the mean of a late window, each with a variance corrected
//! for autocorrelation through its effective sample size.

use std::f64::consts::SQRT_2;

use statrs::function::erf::erfc;

/// Default fraction of the trace in the early Geweke window.
pub const GEWEKE_FIRST: f64 = 0.1;

/// Default fraction of the trace in the late Geweke window.
pub const GEWEKE_LAST: f64 = 0.5;

/// Effective number of independent samples in `samples`.
///
/// Never exceeds the number of samples. A constant trace (or one with fewer
/// than two samples) counts every sample as independent.
pub fn effective_sample_size(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return n as f64;
    }
    let mean = samples.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = samples.iter().map(|x| x - mean).collect();
    let autocovariance = |lag: usize| {
        centered[..n - lag]
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| a * b)
            .sum::<f64>()
            / n as f64
    };

    let variance = autocovariance(0);
    if !(variance > 0.0) {
        return n as f64;
    }
    let mut sum = -variance;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = autocovariance(lag) + autocovariance(lag + 1);
        if pair <= 0.0 {
            break;
        }
        sum += 2.0 * pair;
        lag += 2;
    }

    let autocorrelation_time = sum / variance;
    if autocorrelation_time <= 0.0 {
        return n as f64;
    }
    (n as f64 / autocorrelation_time).min(n as f64)
}

/// Two-sided p-value of the Geweke test that the first `first` and the last
/// `last` fractions of `samples` share a mean.
///
/// `None` while either window holds fewer than two samples, or when the
/// fractions are not positive or overlap.
pub fn geweke_p_value(samples: &[f64], first: f64, last: f64) -> Option<f64> {
    if !(first > 0.0 && last > 0.0 && first + last <= 1.0) {
        return None;
    }
    let n = samples.len();
    let early = (n as f64 * first).floor() as usize;
    let late = (n as f64 * last).floor() as usize;
    if early < 2 || late < 2 {
        return None;
    }

    let (mean_a, var_a) = mean_and_error(&samples[..early]);
    let (mean_b, var_b) = mean_and_error(&samples[n - late..]);
    let spread = (var_a + var_b).sqrt();
    if spread == 0.0 {
        return Some(if mean_a == mean_b { 1.0 } else { 0.0 });
    }
    let z = (mean_a - mean_b) / spread;
    Some(erfc(z.abs() / SQRT_2))
}

/// Mean of `samples` and the squared standard error of that mean.
fn mean_and_error(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance / effective_sample_size(samples).max(1.0))
}
