use std::collections::HashMap;

use chrono::{DateTime, Utc};
use market_core::{ForecastTable, MarketConfig, MarketError, Quantile};
use market_frame::TimeFrame;

pub type WeightMap = HashMap<Quantile, HashMap<String, f64>>;
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// An ensemble strategy: trained on historical forecaster predictions and
/// observations, then asked for a combined forecast per quantile.
///
/// Implementations must call [`StrategyState::begin_fit`] at the start of
/// every `fit` (weights are reset on refit) and
/// [`StrategyState::ensure_fitted`] at the start of `predict`.
pub trait Strategy: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn is_fitted(&self) -> bool;

    fn fit(
        &mut self,
        x_train: &TimeFrame,
        y_train: &TimeFrame,
        quantiles: &[Quantile],
    ) -> Result<(), MarketError>;

    fn predict(
        &mut self,
        x_test: &TimeFrame,
        quantiles: &[Quantile],
    ) -> Result<ForecastTable, MarketError>;

    /// Per-quantile forecaster contribution weights from the last predict.
    fn weights(&self) -> WeightMap;

    fn metadata(&self) -> Metadata;
}

/// Tunables handed to strategy factories, taken from the market config.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub beta: f64,
    pub outlier_detection: bool,
    pub outlier_alpha: f64,
    pub min_forecasters_for_outlier_detection: usize,
    pub default_score: f64,
    pub n_score_days: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            beta: 0.001,
            outlier_detection: true,
            outlier_alpha: 20.0,
            min_forecasters_for_outlier_detection: 4,
            default_score: 999_999.0,
            n_score_days: 6,
        }
    }
}

impl From<&MarketConfig> for StrategyParams {
    fn from(config: &MarketConfig) -> Self {
        Self {
            beta: config.weighting.beta,
            outlier_detection: config.outliers.enabled,
            outlier_alpha: config.outliers.alpha,
            min_forecasters_for_outlier_detection: config.outliers.min_forecasters,
            default_score: config.weighting.default_score,
            n_score_days: config.weighting.scores_calculation_days,
        }
    }
}

/// Shared bookkeeping embedded in every strategy: fitted flag, weight map,
/// metadata and the physical clip floor.
#[derive(Debug, Clone)]
pub struct StrategyState {
    fitted: bool,
    weights: WeightMap,
    metadata: Metadata,
    /// Predictions below this are clipped. `None` disables clipping for
    /// series that can legitimately go negative.
    clip_lower: Option<f64>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            fitted: false,
            weights: WeightMap::new(),
            metadata: Metadata::new(),
            clip_lower: Some(0.0),
        }
    }
}

impl StrategyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_clipping() -> Self {
        Self {
            clip_lower: None,
            ..Self::default()
        }
    }

    /// Reset weights and metadata at the start of a fit.
    pub fn begin_fit(&mut self) {
        self.fitted = false;
        self.weights.clear();
        self.metadata.clear();
    }

    pub fn mark_fitted(&mut self) {
        self.fitted = true;
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn ensure_fitted(&self, name: &str) -> Result<(), MarketError> {
        if self.fitted {
            Ok(())
        } else {
            Err(MarketError::NotFitted(name.to_string()))
        }
    }

    pub fn set_weights(&mut self, quantile: Quantile, weights: HashMap<String, f64>) {
        self.weights.insert(quantile, weights);
    }

    /// Equal weight `1/n` per forecaster, keyed by column prefix.
    pub fn set_equal_weights(&mut self, quantile: Quantile, columns: &[String]) {
        if columns.is_empty() {
            return;
        }
        let weight = 1.0 / columns.len() as f64;
        let weights = columns
            .iter()
            .map(|c| (forecaster_prefix(c).to_string(), weight))
            .collect();
        self.set_weights(quantile, weights);
    }

    pub fn has_weights(&self, quantile: Quantile) -> bool {
        self.weights.contains_key(&quantile)
    }

    pub fn weights(&self) -> WeightMap {
        self.weights.clone()
    }

    pub fn add_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    /// Format one quantile's values into long-form rows, applying the clip
    /// floor. Null rows (no contributing forecaster) are omitted.
    pub fn format_predictions(
        &self,
        index: &[DateTime<Utc>],
        values: &[Option<f64>],
        quantile: Quantile,
    ) -> ForecastTable {
        let mut table = ForecastTable::new();
        for (ts, value) in index.iter().zip(values) {
            if let Some(v) = value {
                let v = match self.clip_lower {
                    Some(floor) => v.max(floor),
                    None => *v,
                };
                table.push(*ts, quantile, v);
            }
        }
        table
    }
}

/// Forecaster id from a column name: `s1_q50` → `s1`. Names without a
/// suffix are returned unchanged.
pub fn forecaster_prefix(column: &str) -> &str {
    column.rsplit_once('_').map(|(p, _)| p).unwrap_or(column)
}

/// Columns for one quantile, falling back to all columns when the frame is
/// pre-filtered (no suffix matches).
pub fn quantile_columns_or_all(frame: &TimeFrame, quantile: Quantile) -> Vec<String> {
    let cols = frame.columns_with_suffix(quantile.suffix());
    if cols.is_empty() {
        frame.column_names().to_vec()
    } else {
        cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn prefix_strips_only_last_segment() {
        assert_eq!(forecaster_prefix("s1_q50"), "s1");
        assert_eq!(forecaster_prefix("forecaster1_q50_extra"), "forecaster1_q50");
        assert_eq!(forecaster_prefix("plain"), "plain");
    }

    #[test]
    fn equal_weights_sum_to_one() {
        let mut state = StrategyState::new();
        let cols = vec!["a_q50".to_string(), "b_q50".to_string(), "c_q50".to_string()];
        state.set_equal_weights(Quantile::Q50, &cols);
        let weights = &state.weights()[&Quantile::Q50];
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(weights["a"], weights["b"]);
    }

    #[test]
    fn format_clips_negative_predictions() {
        let state = StrategyState::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let table = state.format_predictions(&[ts], &[Some(-5.0)], Quantile::Q50);
        assert_eq!(table.rows()[0].value, 0.0);

        let unclipped = StrategyState::without_clipping();
        let table = unclipped.format_predictions(&[ts], &[Some(-5.0)], Quantile::Q50);
        assert_eq!(table.rows()[0].value, -5.0);
    }

    #[test]
    fn begin_fit_resets_weights() {
        let mut state = StrategyState::new();
        state.set_equal_weights(Quantile::Q50, &["a_q50".to_string()]);
        state.mark_fitted();
        state.begin_fit();
        assert!(!state.is_fitted());
        assert!(state.weights().is_empty());
    }
}
