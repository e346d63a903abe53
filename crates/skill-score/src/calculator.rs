use std::collections::{BTreeMap, HashMap};

use market_core::{Quantile, ScoreMetric, ScoreRecord, SubmittedForecast, SAMPLES_PER_DAY};
use market_frame::{TimeFrame, TimeSeries};
use tracing::warn;

use crate::metrics::{mae, pinball_loss, rmse, winkler};

/// Which id column a score row is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastIdKind {
    Submission,
    Ensemble,
}

impl ForecastIdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastIdKind::Submission => "submission",
            ForecastIdKind::Ensemble => "ensemble",
        }
    }
}

/// Compute recent skill scores per forecaster column.
///
/// For each column of `x_train` with the quantile's `_qXX` suffix, take the
/// last `n_days` of rows, pair against the `target` column of `y_train` on
/// the shared index dropping any-null rows, and score with RMSE for `q50` or
/// pinball loss otherwise. Columns with an empty pairing get no entry.
pub fn compute_scores(
    x_train: &TimeFrame,
    y_train: &TimeFrame,
    quantiles: &[Quantile],
    n_days: u32,
) -> HashMap<Quantile, HashMap<String, f64>> {
    let n_samples = n_days as usize * SAMPLES_PER_DAY;
    let x = x_train.tail(n_samples);
    let y = y_train.tail(n_samples);

    let target = y.column_series("target").unwrap_or_default();

    let mut scores: HashMap<Quantile, HashMap<String, f64>> = HashMap::new();
    for quantile in quantiles {
        let entry = scores.entry(*quantile).or_default();
        for col in x.columns_with_suffix(quantile.suffix()) {
            let (observed, forecast) = paired_values(&x, &col, &target);
            let score = if *quantile == Quantile::Q50 {
                rmse(&observed, &forecast)
            } else {
                pinball_loss(&observed, &forecast, *quantile)
            };
            if let Some(score) = score {
                entry.insert(col, score);
            }
        }
    }
    scores
}

/// Pair a frame column against an observation series on the frame index,
/// keeping only rows where both sides are non-null.
fn paired_values(frame: &TimeFrame, column: &str, observed: &TimeSeries) -> (Vec<f64>, Vec<f64>) {
    let mut obs = Vec::new();
    let mut pred = Vec::new();
    if let Some(values) = frame.column(column) {
        for (ts, value) in frame.index().iter().zip(values) {
            if let (Some(o), Some(p)) = (observed.value_at(*ts), *value) {
                obs.push(o);
                pred.push(p);
            }
        }
    }
    (obs, pred)
}

/// Pair a forecast series against observations on the forecast timestamps.
fn paired_series(forecast: &TimeSeries, observed: &TimeSeries) -> (Vec<f64>, Vec<f64>) {
    let mut obs = Vec::new();
    let mut pred = Vec::new();
    for (ts, value) in forecast.iter() {
        if let (Some(o), Some(p)) = (observed.value_at(ts), value) {
            obs.push(o);
            pred.push(p);
        }
    }
    (obs, pred)
}

/// Per-submission (or per-ensemble) skill scores for one challenge.
///
/// Emits one row per (forecast id, metric): `q50` forecasts get `pinball`,
/// `rmse` and `mae`; `q10`/`q90` forecasts get `pinball`, plus a shared
/// `winkler` row on both interval submissions when the same forecaster
/// provided both bounds. Forecasts whose evaluation window is empty are
/// skipped.
pub fn compute_forecasters_skill_scores(
    observed: &TimeSeries,
    forecasts: &[SubmittedForecast],
    id_kind: ForecastIdKind,
) -> Vec<ScoreRecord> {
    let mut records = Vec::new();

    // Interval bounds collected per forecaster for the Winkler pass.
    struct IntervalSide {
        id: String,
        series: TimeSeries,
    }
    let mut intervals: BTreeMap<String, HashMap<Quantile, IntervalSide>> = BTreeMap::new();

    for forecast in forecasts {
        let (obs, pred) = paired_series(&forecast.series, observed);
        if obs.is_empty() {
            warn!(
                id = %forecast.id,
                kind = id_kind.as_str(),
                "No overlapping observations for forecast, skipping"
            );
            continue;
        }

        match forecast.variable {
            Quantile::Q50 => {
                if let Some(v) = pinball_loss(&obs, &pred, Quantile::Q50) {
                    records.push(record(&forecast.id, ScoreMetric::Pinball, v));
                }
                if let Some(v) = rmse(&obs, &pred) {
                    records.push(record(&forecast.id, ScoreMetric::Rmse, v));
                }
                if let Some(v) = mae(&obs, &pred) {
                    records.push(record(&forecast.id, ScoreMetric::Mae, v));
                }
            }
            q => {
                if let Some(v) = pinball_loss(&obs, &pred, q) {
                    records.push(record(&forecast.id, ScoreMetric::Pinball, v));
                }
                intervals.entry(forecast.user_id.clone()).or_default().insert(
                    q,
                    IntervalSide {
                        id: forecast.id.clone(),
                        series: forecast.series.clone(),
                    },
                );
            }
        }
    }

    // Winkler needs both interval bounds from the same forecaster.
    for (user_id, sides) in &intervals {
        let (Some(lower), Some(upper)) = (sides.get(&Quantile::Q10), sides.get(&Quantile::Q90))
        else {
            warn!(user = %user_id, "Skipped user due to missing quantile forecasts");
            continue;
        };

        let mut obs = Vec::new();
        let mut q10 = Vec::new();
        let mut q90 = Vec::new();
        for (ts, lo) in lower.series.iter() {
            if let (Some(o), Some(lo), Some(hi)) =
                (observed.value_at(ts), lo, upper.series.value_at(ts))
            {
                obs.push(o);
                q10.push(lo);
                q90.push(hi);
            }
        }
        if let Some(v) = winkler(&obs, &q10, &q90) {
            records.push(record(&lower.id, ScoreMetric::Winkler, v));
            records.push(record(&upper.id, ScoreMetric::Winkler, v));
        }
    }

    records
}

fn record(id: &str, metric: ScoreMetric, value: f64) -> ScoreRecord {
    ScoreRecord {
        forecast_id: id.to_string(),
        metric,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use market_frame::date_range;

    fn ts(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, m, 0).unwrap()
    }

    fn day_index(day: u32) -> Vec<DateTime<Utc>> {
        date_range(
            ts(day, 0, 0),
            ts(day, 23, 45),
            Duration::minutes(15),
        )
    }

    fn training_frames() -> (TimeFrame, TimeFrame) {
        let index = day_index(1);
        let n = index.len();
        let mut x = TimeFrame::with_index(index.clone());
        // A is exact, B is offset by +4 everywhere.
        x.insert_aligned("a_q50", vec![Some(10.0); n]);
        x.insert_aligned("b_q50", vec![Some(14.0); n]);
        x.insert_aligned("a_q10", vec![Some(8.0); n]);
        let mut y = TimeFrame::with_index(index);
        y.insert_aligned("target", vec![Some(10.0); n]);
        (x, y)
    }

    #[test]
    fn compute_scores_rmse_for_q50() {
        let (x, y) = training_frames();
        let scores = compute_scores(&x, &y, &[Quantile::Q50], 1);
        let q50 = &scores[&Quantile::Q50];
        assert_eq!(q50["a_q50"], 0.0);
        assert_eq!(q50["b_q50"], 4.0);
    }

    #[test]
    fn compute_scores_pinball_for_interval_quantiles() {
        let (x, y) = training_frames();
        let scores = compute_scores(&x, &y, &[Quantile::Q10], 1);
        // obs=10, pred=8 everywhere: 0.1 * 2 = 0.2
        assert_eq!(scores[&Quantile::Q10]["a_q10"], 0.2);
    }

    #[test]
    fn compute_scores_is_idempotent() {
        let (x, y) = training_frames();
        let first = compute_scores(&x, &y, &Quantile::ALL, 6);
        let second = compute_scores(&x, &y, &Quantile::ALL, 6);
        assert_eq!(first, second);
    }

    #[test]
    fn compute_scores_skips_columns_without_overlap() {
        let index = day_index(1);
        let n = index.len();
        let mut x = TimeFrame::with_index(index.clone());
        x.insert_aligned("a_q50", vec![None; n]);
        let mut y = TimeFrame::with_index(index);
        y.insert_aligned("target", vec![Some(1.0); n]);
        let scores = compute_scores(&x, &y, &[Quantile::Q50], 1);
        assert!(scores[&Quantile::Q50].is_empty());
    }

    fn submitted(id: &str, user: &str, q: Quantile, values: Vec<f64>) -> SubmittedForecast {
        let index = day_index(2);
        SubmittedForecast {
            id: id.to_string(),
            user_id: user.to_string(),
            variable: q,
            series: TimeSeries::from_values(index[..values.len()].to_vec(), values),
        }
    }

    #[test]
    fn submission_scores_emit_deterministic_metrics_for_q50() {
        let index = day_index(2);
        let observed = TimeSeries::from_values(index[..2].to_vec(), vec![100.0, 100.0]);
        let forecasts = vec![submitted("s1", "u1", Quantile::Q50, vec![90.0, 110.0])];
        let records =
            compute_forecasters_skill_scores(&observed, &forecasts, ForecastIdKind::Submission);
        let metrics: Vec<ScoreMetric> = records.iter().map(|r| r.metric).collect();
        assert!(metrics.contains(&ScoreMetric::Pinball));
        assert!(metrics.contains(&ScoreMetric::Rmse));
        assert!(metrics.contains(&ScoreMetric::Mae));
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn submission_scores_pair_winkler_on_both_bounds() {
        let index = day_index(2);
        let observed = TimeSeries::from_values(index[..1].to_vec(), vec![150.0]);
        let forecasts = vec![
            submitted("lo", "u1", Quantile::Q10, vec![110.0]),
            submitted("hi", "u1", Quantile::Q90, vec![130.0]),
        ];
        let records =
            compute_forecasters_skill_scores(&observed, &forecasts, ForecastIdKind::Submission);
        let winklers: Vec<&ScoreRecord> = records
            .iter()
            .filter(|r| r.metric == ScoreMetric::Winkler)
            .collect();
        assert_eq!(winklers.len(), 2);
        for w in winklers {
            assert_eq!(w.value, 220.0);
        }
    }

    #[test]
    fn missing_interval_pair_skips_winkler_only() {
        let index = day_index(2);
        let observed = TimeSeries::from_values(index[..1].to_vec(), vec![100.0]);
        let forecasts = vec![submitted("lo", "u1", Quantile::Q10, vec![90.0])];
        let records =
            compute_forecasters_skill_scores(&observed, &forecasts, ForecastIdKind::Submission);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metric, ScoreMetric::Pinball);
    }

    #[test]
    fn empty_observation_overlap_emits_nothing() {
        let observed = TimeSeries::new();
        let forecasts = vec![submitted("s1", "u1", Quantile::Q50, vec![1.0, 2.0])];
        let records =
            compute_forecasters_skill_scores(&observed, &forecasts, ForecastIdKind::Submission);
        assert!(records.is_empty());
    }
}
