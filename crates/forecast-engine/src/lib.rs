use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ensemble_strategies::{register_builtins, Metadata, Strategy, StrategyParams, WeightMap};
use market_core::{ForecastTable, MarketConfig, MarketError, Quantile};
use market_frame::TimeFrame;
use tracing::{debug, error, info, warn};

/// One strategy's output for one resource.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    pub strategy_name: String,
    pub predictions: ForecastTable,
    pub weights: WeightMap,
    pub metadata: Metadata,
}

/// Runs one or more ensemble strategies for a resource and collects their
/// results.
///
/// Strategy instances are created through the registry and cached per engine;
/// callers that need per-resource isolation create one engine per resource.
pub struct ForecastEngine {
    config: MarketConfig,
    params: StrategyParams,
    results: HashMap<String, HashMap<String, ForecastResult>>,
    strategies: HashMap<String, Box<dyn Strategy>>,
}

impl ForecastEngine {
    pub fn new(config: MarketConfig) -> Self {
        register_builtins();
        let params = StrategyParams::from(&config);
        Self {
            config,
            params,
            results: HashMap::new(),
            strategies: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Run forecasting for a resource.
    ///
    /// `strategies = None` falls back to the configuration (resource-specific
    /// list or the default strategy); an explicit empty list is rejected.
    /// A registry miss propagates as-is; any other strategy failure aborts
    /// the resource with a strategy-execution error.
    pub fn forecast(
        &mut self,
        resource_id: &str,
        x_train: &TimeFrame,
        y_train: &TimeFrame,
        x_test: &TimeFrame,
        forecast_range: &[DateTime<Utc>],
        strategies: Option<&[String]>,
        quantiles: Option<&[Quantile]>,
    ) -> Result<HashMap<String, ForecastResult>, MarketError> {
        let strategies: Vec<String> = match strategies {
            Some([]) => {
                return Err(MarketError::Validation(
                    "an explicit empty strategy list is not allowed".to_string(),
                ))
            }
            Some(list) => list.to_vec(),
            None => self.config.strategies_for_resource(resource_id),
        };
        let quantiles: Vec<Quantile> = match quantiles {
            Some(list) => list.to_vec(),
            None => self.config.quantiles.clone(),
        };

        info!(
            resource = resource_id,
            n_strategies = strategies.len(),
            ?strategies,
            "Running forecast strategies"
        );

        // Keep the test window aligned to the challenge range.
        let x_test = x_test.reindex(forecast_range);

        let mut results = HashMap::new();
        for strategy_name in &strategies {
            match self.run_strategy(strategy_name, x_train, y_train, &x_test, &quantiles) {
                Ok(result) => {
                    debug!(strategy = %strategy_name, "Strategy completed");
                    results.insert(strategy_name.clone(), result);
                }
                Err(err @ MarketError::StrategyNotFound { .. }) => return Err(err),
                Err(err) => {
                    error!(strategy = %strategy_name, %err, "Strategy failed");
                    return Err(MarketError::StrategyExecution {
                        strategy: strategy_name.clone(),
                        resource: resource_id.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        self.results.insert(resource_id.to_string(), results.clone());
        Ok(results)
    }

    fn run_strategy(
        &mut self,
        strategy_name: &str,
        x_train: &TimeFrame,
        y_train: &TimeFrame,
        x_test: &TimeFrame,
        quantiles: &[Quantile],
    ) -> Result<ForecastResult, MarketError> {
        let strategy = match self.strategies.entry(strategy_name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(ensemble_strategies::get(strategy_name, &self.params)?)
            }
        };

        strategy.fit(x_train, y_train, quantiles)?;
        let predictions = strategy.predict(x_test, quantiles)?;

        Ok(ForecastResult {
            strategy_name: strategy.name().to_string(),
            predictions,
            weights: strategy.weights(),
            metadata: strategy.metadata(),
        })
    }

    /// Stored results for a resource; fails when none exist.
    pub fn get_results(
        &self,
        resource_id: &str,
    ) -> Result<&HashMap<String, ForecastResult>, MarketError> {
        self.results.get(resource_id).ok_or_else(|| {
            let mut available: Vec<&str> = self.results.keys().map(|k| k.as_str()).collect();
            available.sort();
            MarketError::Forecast(format!(
                "No results found for resource '{resource_id}' (available: {})",
                available.join(", ")
            ))
        })
    }

    /// Wide frame with one column per (strategy, quantile) for side-by-side
    /// comparison of strategy outputs.
    pub fn get_comparison(&self, resource_id: &str) -> Result<TimeFrame, MarketError> {
        let results = self.get_results(resource_id)?;
        if results.len() < 2 {
            warn!(
                resource = resource_id,
                n_results = results.len(),
                "Comparison requested with fewer than two strategy results"
            );
        }

        let mut index: Vec<DateTime<Utc>> = results
            .values()
            .flat_map(|r| r.predictions.rows().iter().map(|p| p.datetime))
            .collect();
        index.sort();
        index.dedup();

        let mut frame = TimeFrame::with_index(index);
        let mut names: Vec<&String> = results.keys().collect();
        names.sort();
        for name in names {
            let result = &results[name];
            for quantile in result.predictions.quantiles() {
                let series = market_frame::TimeSeries::from_points(
                    result
                        .predictions
                        .values_for(quantile)
                        .into_iter()
                        .map(|(ts, v)| (ts, Some(v)))
                        .collect(),
                );
                frame.outer_join_column(&format!("{name}_{quantile}"), &series);
            }
        }
        Ok(frame)
    }

    pub fn clear_results(&mut self) {
        self.results.clear();
    }

    pub fn clear_strategy_cache(&mut self) {
        self.strategies.clear();
    }
}
