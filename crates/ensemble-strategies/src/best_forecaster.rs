use std::collections::HashMap;

use market_core::{ForecastTable, MarketError, Quantile};
use market_frame::TimeFrame;
use serde_json::json;
use skill_score::compute_scores;
use tracing::{info, warn};

use crate::strategy::{
    forecaster_prefix, Metadata, Strategy, StrategyParams, StrategyState, WeightMap,
};

/// Champion selection: per quantile, forward the forecaster with the lowest
/// recent skill score unchanged. Benchmark for whether ensembling beats the
/// best individual.
#[derive(Debug)]
pub struct BestForecasterStrategy {
    state: StrategyState,
    n_score_days: u32,
    /// Champion column per quantile, decided at fit time.
    best_forecasters: HashMap<Quantile, Option<String>>,
}

pub fn factory(params: &StrategyParams) -> Box<dyn Strategy> {
    Box::new(BestForecasterStrategy::new(params))
}

impl BestForecasterStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            state: StrategyState::new(),
            n_score_days: params.n_score_days,
            best_forecasters: HashMap::new(),
        }
    }
}

impl Strategy for BestForecasterStrategy {
    fn name(&self) -> &'static str {
        "best_forecaster"
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
        let scores = compute_scores(x_train, y_train, quantiles, self.n_score_days);

        self.best_forecasters.clear();
        for quantile in quantiles {
            let quantile_scores = scores.get(quantile);
            let best = quantile_scores.and_then(|m| {
                m.iter()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(col, score)| (col.clone(), *score))
            });
            match best {
                Some((col, score)) => {
                    info!(quantile = %quantile, champion = %col, score, "Best forecaster selected");
                    self.best_forecasters.insert(*quantile, Some(col));
                }
                None => {
                    warn!(
                        quantile = %quantile,
                        "No scores computed, will use first available forecaster"
                    );
                    self.best_forecasters.insert(*quantile, None);
                }
            }
        }

        let champions: HashMap<String, Option<String>> = self
            .best_forecasters
            .iter()
            .map(|(q, col)| (q.as_str().to_string(), col.clone()))
            .collect();
        self.state.add_metadata("best_forecasters", json!(champions));
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
            let cols = x_test.columns_with_suffix(quantile.suffix());
            if cols.is_empty() {
                warn!(quantile = %quantile, "No forecaster columns found");
                continue;
            }

            let champion = self.best_forecasters.get(quantile).cloned().flatten();
            let selected = match champion {
                Some(best) if cols.contains(&best) => best,
                Some(best) => {
                    warn!(
                        quantile = %quantile,
                        champion = %best,
                        fallback = %cols[0],
                        "Best forecaster not in test data, using first available"
                    );
                    cols[0].clone()
                }
                None => {
                    warn!(quantile = %quantile, fallback = %cols[0], "No best forecaster");
                    cols[0].clone()
                }
            };

            let mut weights = HashMap::new();
            weights.insert(forecaster_prefix(&selected).to_string(), 1.0);
            self.state.set_weights(*quantile, weights);

            if let Some(values) = x_test.column(&selected) {
                output.extend(
                    self.state
                        .format_predictions(x_test.index(), values, *quantile),
                );
            }
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
