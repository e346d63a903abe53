use market_core::Quantile;
use serde::Serialize;
use statrs::statistics::Statistics;

/// Central 80% interval (between the 10th and 90th quantiles).
pub const WINKLER_ALPHA: f64 = 0.2;

/// Scores are rounded to three decimals for stable comparison.
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Pinball loss per observation at the given quantile.
pub fn pinball_per_observation(observed: &[f64], forecast: &[f64], quantile: Quantile) -> Vec<f64> {
    let q = quantile.level();
    observed
        .iter()
        .zip(forecast)
        .map(|(obs, pred)| {
            if obs > pred {
                q * (obs - pred)
            } else {
                (1.0 - q) * (pred - obs)
            }
        })
        .collect()
}

/// Mean pinball loss over the window, or `None` when empty.
pub fn pinball_loss(observed: &[f64], forecast: &[f64], quantile: Quantile) -> Option<f64> {
    if observed.is_empty() {
        return None;
    }
    Some(round3(
        pinball_per_observation(observed, forecast, quantile).mean(),
    ))
}

pub fn squared_error_per_observation(observed: &[f64], forecast: &[f64]) -> Vec<f64> {
    observed
        .iter()
        .zip(forecast)
        .map(|(obs, pred)| (obs - pred).powi(2))
        .collect()
}

/// Root mean square error, or `None` when empty.
pub fn rmse(observed: &[f64], forecast: &[f64]) -> Option<f64> {
    if observed.is_empty() {
        return None;
    }
    let mse = squared_error_per_observation(observed, forecast).mean();
    Some(round3(mse.sqrt()))
}

/// Mean absolute error, or `None` when empty.
pub fn mae(observed: &[f64], forecast: &[f64]) -> Option<f64> {
    if observed.is_empty() {
        return None;
    }
    let abs_errors: Vec<f64> = observed
        .iter()
        .zip(forecast)
        .map(|(obs, pred)| (obs - pred).abs())
        .collect();
    Some(round3(abs_errors.mean()))
}

/// Winkler score per observation: interval width plus coverage penalties.
pub fn winkler_per_observation(observed: &[f64], q10: &[f64], q90: &[f64]) -> Vec<f64> {
    observed
        .iter()
        .zip(q10.iter().zip(q90))
        .map(|(obs, (lo, hi))| {
            let width = hi - lo;
            let penalty_lower = (lo - obs).max(0.0);
            let penalty_upper = (obs - hi).max(0.0);
            width + (2.0 / WINKLER_ALPHA) * (penalty_lower + penalty_upper)
        })
        .collect()
}

/// Mean Winkler score over the window, or `None` when empty.
pub fn winkler(observed: &[f64], q10: &[f64], q90: &[f64]) -> Option<f64> {
    if observed.is_empty() {
        return None;
    }
    Some(round3(winkler_per_observation(observed, q10, q90).mean()))
}

/// Percentile with linear interpolation between closest ranks, `p` in [0, 1].
pub fn percentile_linear(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Five-number summary plus sample count.
///
/// Outliers are intentionally not identified here; doing so is a large
/// overhead for month-scale datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoxplotSummary {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub n_samples: usize,
}

pub fn boxplot_summary(values: &[f64]) -> Option<BoxplotSummary> {
    if values.is_empty() {
        return None;
    }
    Some(BoxplotSummary {
        min: round3(values.iter().copied().fold(f64::INFINITY, f64::min)),
        q1: round3(percentile_linear(values, 0.25)?),
        median: round3(percentile_linear(values, 0.5)?),
        q3: round3(percentile_linear(values, 0.75)?),
        max: round3(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        n_samples: values.len(),
    })
}
