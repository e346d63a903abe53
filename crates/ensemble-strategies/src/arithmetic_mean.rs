use market_core::{ForecastTable, MarketError, Quantile};
use market_frame::TimeFrame;
use serde_json::json;
use tracing::{info, warn};

use crate::outlier::detect_outliers_dtw;
use crate::strategy::{
    quantile_columns_or_all, Metadata, Strategy, StrategyParams, StrategyState, WeightMap,
};

/// Unweighted mean of all forecasters. Benchmark baseline; every survivor of
/// optional outlier removal gets weight `1/n`.
#[derive(Debug)]
pub struct ArithmeticMeanStrategy {
    state: StrategyState,
    outlier_detection: bool,
    outlier_alpha: f64,
    min_forecasters: usize,
}

pub fn factory(params: &StrategyParams) -> Box<dyn Strategy> {
    Box::new(ArithmeticMeanStrategy::new(params))
}

impl ArithmeticMeanStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            state: StrategyState::new(),
            outlier_detection: params.outlier_detection,
            outlier_alpha: params.outlier_alpha,
            min_forecasters: params.min_forecasters_for_outlier_detection,
        }
    }
}

impl Strategy for ArithmeticMeanStrategy {
    fn name(&self) -> &'static str {
        "arithmetic_mean"
    }

    fn is_fitted(&self) -> bool {
        self.state.is_fitted()
    }

    fn fit(
        &mut self,
        _x_train: &TimeFrame,
        _y_train: &TimeFrame,
        _quantiles: &[Quantile],
    ) -> Result<(), MarketError> {
        // No training needed; every forecaster contributes equally.
        self.state.begin_fit();
        self.state
            .add_metadata("outlier_detection", json!(self.outlier_detection));
        self.state
            .add_metadata("outlier_alpha", json!(self.outlier_alpha));
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
                    self.state
                        .add_metadata(&format!("outliers_{quantile}"), json!(outliers));
                }
            }

            self.state.set_equal_weights(*quantile, &cols);

            let values = forecasts.row_mean();
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
