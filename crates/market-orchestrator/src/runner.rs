use std::collections::HashMap;

use forecast_engine::{ForecastEngine, ForecastResult};
use market_core::MarketConfig;
use market_frame::TimeFrame;
use market_loader::{validate_forecasters, BuyerContext};
use tracing::{error, info, warn};

/// Outcome of one resource's forecast run. Failures yield a marker with
/// `error = true` so the session can continue with the other resources.
#[derive(Debug)]
pub struct BuyerOutput {
    pub challenge_id: String,
    pub resource_id: String,
    pub user_id: String,
    pub sellers_features: Vec<String>,
    pub sellers_features_used: Vec<String>,
    pub results: HashMap<String, ForecastResult>,
    pub error: bool,
}

impl BuyerOutput {
    fn failure(buyer: &BuyerContext) -> Self {
        Self {
            challenge_id: buyer.challenge_id.clone(),
            resource_id: buyer.resource_id.clone(),
            user_id: buyer.user_id.clone(),
            sellers_features: Vec::new(),
            sellers_features_used: Vec::new(),
            results: HashMap::new(),
            error: true,
        }
    }
}

/// Run the configured ensemble strategies for one buyer resource.
///
/// Each invocation builds its own engine, so strategy instances are never
/// shared across resources.
pub fn forecast_buyer(buyer: BuyerContext, config: &MarketConfig) -> BuyerOutput {
    info!(resource = %buyer.resource_id, challenge = %buyer.challenge_id, "Forecasting buyer resource");

    if buyer.forecast_range.is_empty() || buyer.measurements.non_null_count() == 0 {
        warn!(
            user = %buyer.user_id,
            resource = %buyer.resource_id,
            "Forecast target dataset is empty for the available market \
             dataset dates. Aborting forecast."
        );
        return BuyerOutput::failure(&buyer);
    }

    let market = &buyer.sellers_forecasts;
    if market.is_empty() {
        // Sellers may lack sufficient submissions for the days prior to the
        // forecast target day.
        warn!(
            user = %buyer.user_id,
            resource = %buyer.resource_id,
            "Market features dataset is empty. Aborting forecast."
        );
        return BuyerOutput::failure(&buyer);
    }

    let sellers_features = market.column_names().to_vec();

    let (valid_forecasters, _with_history) = validate_forecasters(
        &buyer.forecast_range,
        market,
        config.weighting.min_history_samples,
    );
    if valid_forecasters.is_empty() {
        warn!(
            user = %buyer.user_id,
            resource = %buyer.resource_id,
            "No valid forecasters with submissions for all required \
             quantiles. Aborting forecast."
        );
        return BuyerOutput::failure(&buyer);
    }

    // Only forecasters that submitted all three quantiles stay in the
    // market matrix.
    let keep: Vec<String> = market
        .column_names()
        .iter()
        .filter(|c| {
            let prefix = c.rsplit_once('_').map(|(p, _)| p).unwrap_or(c);
            valid_forecasters.iter().any(|id| id == prefix)
        })
        .cloned()
        .collect();
    let market = market.select(&keep);

    let mut target = TimeFrame::with_index(buyer.dataset_range.clone());
    target.insert_aligned("target", buyer.measurements.values().to_vec());

    let forecast_start = buyer.forecast_range[0];
    let x_train = market.up_to(forecast_start);
    let y_train = target.up_to(forecast_start);
    let x_test = market.reindex(&buyer.forecast_range);

    let mut engine = ForecastEngine::new(config.clone());
    match engine.forecast(
        &buyer.resource_id,
        &x_train,
        &y_train,
        &x_test,
        &buyer.forecast_range,
        Some(&config.ensemble_models),
        None,
    ) {
        Ok(results) => {
            info!(resource = %buyer.resource_id, "Forecasting buyer resource ... Ok!");
            BuyerOutput {
                challenge_id: buyer.challenge_id.clone(),
                resource_id: buyer.resource_id.clone(),
                user_id: buyer.user_id.clone(),
                sellers_features,
                sellers_features_used: valid_forecasters,
                results,
                error: false,
            }
        }
        Err(err) => {
            error!(
                resource = %buyer.resource_id,
                %err,
                "Forecast engine failed for resource"
            );
            BuyerOutput::failure(&buyer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use market_core::{Challenge, Quantile, SubmissionKind, SubmissionMeta};
    use market_frame::{date_range, TimeSeries};

    fn ts(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, m, 0).unwrap()
    }

    fn challenge() -> Challenge {
        Challenge {
            id: "ch-1".to_string(),
            resource: "wind-1".to_string(),
            user: "buyer-1".to_string(),
            use_case: "wind_power".to_string(),
            start_datetime: ts(10, 0, 0),
            end_datetime: ts(10, 23, 45),
            target_day: chrono::NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            submission_list: vec![SubmissionMeta {
                id: "sub-1".to_string(),
                user: "s1".to_string(),
                variable: Quantile::Q50,
                submission_type: SubmissionKind::Normal,
            }],
        }
    }

    fn loaded_buyer() -> BuyerContext {
        let mut buyer = BuyerContext::new(&challenge(), Duration::minutes(15));
        // Eight days of history ending at the challenge end.
        let history_start = ts(2, 0, 0);
        let measurements = TimeSeries::from_values(
            date_range(history_start, ts(9, 23, 45), Duration::minutes(15)),
            vec![10.0; 8 * 96],
        );
        buyer.set_measurements(&measurements, Duration::minutes(15));

        let full_range = buyer.dataset_range.clone();
        let n = full_range.len();
        for seller in ["s1", "s2"] {
            for q in Quantile::ALL {
                let series = TimeSeries::from_values(full_range.clone(), vec![11.0; n]);
                buyer.add_seller(seller, &format!("{seller}{}", q.suffix()), &series);
            }
        }
        buyer
    }

    fn config() -> MarketConfig {
        let mut config = MarketConfig::default();
        // History gate below the fixture depth.
        config.weighting.min_history_samples = 96;
        config
    }

    #[test]
    fn successful_run_produces_strategy_results() {
        let output = forecast_buyer(loaded_buyer(), &config());
        assert!(!output.error);
        assert_eq!(output.sellers_features_used, vec!["s1", "s2"]);
        let result = &output.results["weighted_avg"];
        // 96 steps × 3 quantiles.
        assert_eq!(result.predictions.len(), 288);
        for quantile in Quantile::ALL {
            let weights = &result.weights[&quantile];
            let total: f64 = weights.values().sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn empty_measurements_yield_failure_marker() {
        let mut buyer = BuyerContext::new(&challenge(), Duration::minutes(15));
        buyer.set_measurements(&TimeSeries::new(), Duration::minutes(15));
        let output = forecast_buyer(buyer, &config());
        assert!(output.error);
        assert!(output.results.is_empty());
    }

    #[test]
    fn partial_quantile_sellers_abort_the_resource() {
        let mut buyer = BuyerContext::new(&challenge(), Duration::minutes(15));
        let measurements = TimeSeries::from_values(
            date_range(ts(2, 0, 0), ts(9, 23, 45), Duration::minutes(15)),
            vec![10.0; 8 * 96],
        );
        buyer.set_measurements(&measurements, Duration::minutes(15));
        let range = buyer.dataset_range.clone();
        let n = range.len();
        // Only q50 submitted: no valid forecasters.
        let series = TimeSeries::from_values(range, vec![11.0; n]);
        buyer.add_seller("s1", "s1_q50", &series);

        let output = forecast_buyer(buyer, &config());
        assert!(output.error);
    }
}
