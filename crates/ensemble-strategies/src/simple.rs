use market_core::{ForecastTable, MarketError, Quantile};
use market_frame::TimeFrame;
use serde_json::json;
use tracing::{debug, warn};

use crate::strategy::{Metadata, Strategy, StrategyState, WeightMap};

/// The core of a combine-only ensemble: given the forecaster columns for one
/// quantile, return one value per row.
///
/// Implementors that want non-equal weights can set them on the state; when
/// none are set, equal weights are applied after the combine.
pub trait Combine: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn combine(
        &mut self,
        forecasts: &TimeFrame,
        quantile: Quantile,
        state: &mut StrategyState,
    ) -> Vec<Option<f64>>;
}

/// Boilerplate host for [`Combine`] implementations: iterates quantiles,
/// extracts the suffix columns, formats the long-form output and applies
/// equal weighting by default.
#[derive(Debug)]
pub struct SimpleStrategy<C: Combine> {
    state: StrategyState,
    combiner: C,
}

impl<C: Combine> SimpleStrategy<C> {
    pub fn new(combiner: C) -> Self {
        Self {
            state: StrategyState::new(),
            combiner,
        }
    }
}

impl<C: Combine> Strategy for SimpleStrategy<C> {
    fn name(&self) -> &'static str {
        self.combiner.name()
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
        self.state.begin_fit();
        self.state.add_metadata("strategy_type", json!("simple"));
        self.state.mark_fitted();
        debug!(strategy = self.combiner.name(), "fitted (simple strategy)");
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
            let cols = x_test.columns_with_suffix(quantile.suffix());
            if cols.is_empty() {
                warn!(quantile = %quantile, "No forecaster columns found");
                continue;
            }
            let forecasts = x_test.select(&cols);

            let values = self.combiner.combine(&forecasts, *quantile, &mut self.state);

            if !self.state.has_weights(*quantile) {
                self.state.set_equal_weights(*quantile, &cols);
            }

            output.extend(
                self.state
                    .format_predictions(forecasts.index(), &values, *quantile),
            );
        }

        if output.is_empty() {
            warn!("No predictions generated - no valid quantile columns found");
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
    use std::collections::HashMap;

    #[derive(Debug)]
    struct FirstColumn;

    impl Combine for FirstColumn {
        fn name(&self) -> &'static str {
            "first_column"
        }
        fn combine(
            &mut self,
            forecasts: &TimeFrame,
            quantile: Quantile,
            state: &mut StrategyState,
        ) -> Vec<Option<f64>> {
            // Custom weights: everything on the first column.
            let first = forecasts.column_names()[0].clone();
            let mut weights = HashMap::new();
            weights.insert(crate::strategy::forecaster_prefix(&first).to_string(), 1.0);
            state.set_weights(quantile, weights);
            forecasts.column(&first).unwrap().to_vec()
        }
    }

    fn index(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        date_range(
            start,
            start + Duration::minutes(15 * (n as i64 - 1)),
            Duration::minutes(15),
        )
    }

    #[test]
    fn custom_weights_are_not_overwritten() {
        let mut strategy = SimpleStrategy::new(FirstColumn);
        strategy
            .fit(&TimeFrame::new(), &TimeFrame::new(), &[Quantile::Q50])
            .unwrap();

        let mut frame = TimeFrame::with_index(index(2));
        frame.insert_aligned("a_q50", vec![Some(1.0), Some(2.0)]);
        frame.insert_aligned("b_q50", vec![Some(9.0), Some(9.0)]);
        strategy.predict(&frame, &[Quantile::Q50]).unwrap();

        let weights = &strategy.weights()[&Quantile::Q50];
        assert_eq!(weights["a"], 1.0);
        assert_eq!(weights.len(), 1);
    }

    #[test]
    fn empty_test_frame_returns_empty_table() {
        let mut strategy = SimpleStrategy::new(FirstColumn);
        strategy
            .fit(&TimeFrame::new(), &TimeFrame::new(), &[Quantile::Q50])
            .unwrap();
        let predictions = strategy.predict(&TimeFrame::new(), &Quantile::ALL).unwrap();
        assert!(predictions.is_empty());
    }
}
