use std::collections::HashMap;

use market_core::{ForecastTable, MarketError, Quantile};
use market_frame::TimeFrame;
use serde_json::json;
use skill_score::compute_scores;
use tracing::{info, warn};

use crate::outlier::detect_outliers_dtw;
use crate::strategy::{
    forecaster_prefix, quantile_columns_or_all, Metadata, Strategy, StrategyParams,
    StrategyState, WeightMap,
};

/// Exponentially-weighted averaging over recent skill scores: the production
/// ensemble.
///
/// `w_i = exp(-beta * score_i) / sum_j exp(-beta * score_j)`, where lower
/// scores (better recent performance) get higher weights. Forecasters with
/// no computed score receive `default_score`, which is effectively infinite
/// so their weight collapses towards zero relative to scored peers.
#[derive(Debug)]
pub struct WeightedAverageStrategy {
    state: StrategyState,
    beta: f64,
    outlier_detection: bool,
    outlier_alpha: f64,
    min_forecasters: usize,
    default_score: f64,
    n_score_days: u32,
    scores: HashMap<Quantile, HashMap<String, f64>>,
}

pub fn factory(params: &StrategyParams) -> Box<dyn Strategy> {
    Box::new(WeightedAverageStrategy::new(params))
}

impl WeightedAverageStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            state: StrategyState::new(),
            beta: params.beta,
            outlier_detection: params.outlier_detection,
            outlier_alpha: params.outlier_alpha,
            min_forecasters: params.min_forecasters_for_outlier_detection,
            default_score: params.default_score,
            n_score_days: params.n_score_days,
            scores: HashMap::new(),
        }
    }
}

impl Strategy for WeightedAverageStrategy {
    fn name(&self) -> &'static str {
        "weighted_avg"
    }

    fn is_fitted(&self) -> bool {
        self.state.is_fitted()
    }

    fn fit(
        &mut self,
        x_train: &TimeFrame,
        y_train: &TimeFrame,
        quantiles: &[Quantile],
    ) -> Result<(), MarketError> {
        self.state.begin_fit();
        self.scores = compute_scores(x_train, y_train, quantiles, self.n_score_days);

        if self.scores.values().all(|m| m.is_empty()) {
            warn!(
                "No scores computed from training data. All forecasters will \
                 receive equal weights."
            );
        }

        self.state.add_metadata("beta", json!(self.beta));
        self.state
            .add_metadata("outlier_detection", json!(self.outlier_detection));
        self.state
            .add_metadata("n_score_days", json!(self.n_score_days));
        self.state.mark_fitted();
        Ok(())
    }

    fn predict(
        &mut self,
        x_test: &TimeFrame,
        quantiles: &[Quantile],
    ) -> Result<ForecastTable, MarketError> {
        self.state.ensure_fitted(self.name())?;

        let mut output = ForecastTable::new();
        for quantile in quantiles {
            let mut cols = quantile_columns_or_all(x_test, *quantile);
            if cols.is_empty() {
                warn!(quantile = %quantile, "No forecaster columns found");
                continue;
            }
            let mut forecasts = x_test.select(&cols);

            if self.outlier_detection && forecasts.n_cols() >= self.min_forecasters {
                let outliers =
                    detect_outliers_dtw(&forecasts, self.outlier_alpha, self.min_forecasters);
                if !outliers.is_empty() {
                    info!(
                        quantile = %quantile,
                        removed = outliers.len(),
                        "Outlier detection removed forecasters"
                    );
                    for name in &outliers {
                        forecasts.drop_column(name);
                    }
                    cols.retain(|c| !outliers.contains(c));
                    self.state.add_metadata(
                        &format!("outliers_{quantile}"),
                        json!(outliers),
                    );
                }
            }

            let quantile_scores = self.scores.get(quantile);
            let raw_scores: Vec<f64> = cols
                .iter()
                .map(|col| {
                    quantile_scores
                        .and_then(|m| m.get(col))
                        .copied()
                        .unwrap_or(self.default_score)
                })
                .collect();

            let exp_scores: Vec<f64> = raw_scores.iter().map(|s| (-self.beta * s).exp()).collect();
            let total: f64 = exp_scores.iter().sum();
            let weights: Vec<f64> = exp_scores.iter().map(|w| w / total).collect();

            let weight_map: HashMap<String, f64> = cols
                .iter()
                .zip(&weights)
                .map(|(col, w)| (forecaster_prefix(col).to_string(), *w))
                .collect();
            self.state.set_weights(*quantile, weight_map);

            let values = forecasts.row_weighted_sum(&cols, &weights);
            output.extend(
                self.state
                    .format_predictions(forecasts.index(), &values, *quantile),
            );
        }

        Ok(output)
    }

    fn weights(&self) -> WeightMap {
        self.state.weights()
    }

    fn metadata(&self) -> Metadata {
        self.state.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use market_frame::date_range;

    fn day_index(day: u32) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap();
        date_range(
            start,
            start + Duration::minutes(15 * 95),
            Duration::minutes(15),
        )
    }

    /// Training data that produces RMSE scores of exactly 10/20/30 for a/b/c.
    fn training_frames() -> (TimeFrame, TimeFrame) {
        let index = day_index(1);
        let n = index.len();
        let mut x = TimeFrame::with_index(index.clone());
        x.insert_aligned("a_q50", vec![Some(10.0); n]);
        x.insert_aligned("b_q50", vec![Some(20.0); n]);
        x.insert_aligned("c_q50", vec![Some(30.0); n]);
        let mut y = TimeFrame::with_index(index);
        y.insert_aligned("target", vec![Some(0.0); n]);
        (x, y)
    }

    fn test_frame(values: [f64; 3]) -> TimeFrame {
        let index = day_index(2);
        let n = index.len();
        let mut x = TimeFrame::with_index(index);
        x.insert_aligned("a_q50", vec![Some(values[0]); n]);
        x.insert_aligned("b_q50", vec![Some(values[1]); n]);
        x.insert_aligned("c_q50", vec![Some(values[2]); n]);
        x
    }

    fn fitted_strategy(beta: f64) -> WeightedAverageStrategy {
        let params = StrategyParams {
            beta,
            outlier_detection: false,
            ..StrategyParams::default()
        };
        let mut strategy = WeightedAverageStrategy::new(&params);
        let (x, y) = training_frames();
        strategy.fit(&x, &y, &[Quantile::Q50]).unwrap();
        strategy
    }

    #[test]
    fn predict_before_fit_fails_with_not_fitted() {
        let mut strategy = WeightedAverageStrategy::new(&StrategyParams::default());
        let err = strategy
            .predict(&test_frame([1.0, 2.0, 3.0]), &[Quantile::Q50])
            .unwrap_err();
        assert!(matches!(err, MarketError::NotFitted(_)));
    }

    #[test]
    fn exponential_weights_from_scores() {
        // Scores 10/20/30 with beta=0.1: weights exp(-1), exp(-2), exp(-3)
        // normalised ≈ 0.665 / 0.245 / 0.090.
        let mut strategy = fitted_strategy(0.1);
        strategy
            .predict(&test_frame([100.0, 100.0, 100.0]), &[Quantile::Q50])
            .unwrap();
        let weights = &strategy.weights()[&Quantile::Q50];
        assert!((weights["a"] - 0.665).abs() < 1e-3);
        assert!((weights["b"] - 0.245).abs() < 1e-3);
        assert!((weights["c"] - 0.090).abs() < 1e-3);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(weights.values().all(|w| *w >= 0.0));
    }

    #[test]
    fn constant_forecasts_pass_through() {
        let mut strategy = fitted_strategy(0.1);
        let predictions = strategy
            .predict(&test_frame([100.0, 100.0, 100.0]), &[Quantile::Q50])
            .unwrap();
        assert_eq!(predictions.len(), 96);
        for row in predictions.rows() {
            assert!((row.value - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn dispersed_forecasts_follow_weights() {
        let mut strategy = fitted_strategy(0.1);
        let predictions = strategy
            .predict(&test_frame([100.0, 200.0, 300.0]), &[Quantile::Q50])
            .unwrap();
        // 0.66524*100 + 0.24473*200 + 0.09003*300
        let expected = 142.479;
        for row in predictions.rows() {
            assert!((row.value - expected).abs() < 1e-2);
        }
    }

    #[test]
    fn unknown_forecasters_get_default_score_weight() {
        let mut strategy = fitted_strategy(0.001);
        let index = day_index(2);
        let n = index.len();
        let mut x = TimeFrame::with_index(index);
        x.insert_aligned("a_q50", vec![Some(100.0); n]);
        x.insert_aligned("zz_q50", vec![Some(500.0); n]);
        strategy.predict(&x, &[Quantile::Q50]).unwrap();
        let weights = &strategy.weights()[&Quantile::Q50];
        // The unscored forecaster carries the 999 999 sentinel.
        assert!(weights["zz"] < weights["a"]);
    }

    #[test]
    fn predict_on_empty_frame_returns_empty_table() {
        let mut strategy = fitted_strategy(0.1);
        let predictions = strategy
            .predict(&TimeFrame::new(), &Quantile::ALL)
            .unwrap();
        assert!(predictions.is_empty());
    }

    #[test]
    fn negative_ensemble_values_are_clipped() {
        let mut strategy = fitted_strategy(0.1);
        let predictions = strategy
            .predict(&test_frame([-50.0, -10.0, -20.0]), &[Quantile::Q50])
            .unwrap();
        for row in predictions.rows() {
            assert_eq!(row.value, 0.0);
        }
    }

    #[test]
    fn refit_resets_weights() {
        let mut strategy = fitted_strategy(0.1);
        strategy
            .predict(&test_frame([1.0, 2.0, 3.0]), &[Quantile::Q50])
            .unwrap();
        assert!(!strategy.weights().is_empty());
        let (x, y) = training_frames();
        strategy.fit(&x, &y, &[Quantile::Q50]).unwrap();
        assert!(strategy.weights().is_empty());
    }
}
