use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use market_core::Challenge;
use market_frame::{date_range, floor_to_step, TimeFrame, TimeSeries};

/// Per-resource forecast context for one session: the challenge window, the
/// buyer's measurement series and the joined seller forecasts.
///
/// The context exclusively owns the joined forecast frame for the duration
/// of a session run.
#[derive(Debug, Clone)]
pub struct BuyerContext {
    pub user_id: String,
    pub resource_id: String,
    pub challenge_id: String,
    pub challenge_usecase: String,
    pub challenge_start: DateTime<Utc>,
    pub challenge_end: DateTime<Utc>,
    /// Canonical challenge window timestamps at market resolution.
    pub forecast_range: Vec<DateTime<Utc>>,
    /// Expected historical range, anchored at the first measurement and
    /// ending at the challenge end.
    pub dataset_range: Vec<DateTime<Utc>>,
    /// Measurement series reindexed onto the dataset range.
    pub measurements: TimeSeries,
    /// Seller forecasts, one `{user}_{quantile}` column each.
    pub sellers_forecasts: TimeFrame,
    /// Columns contributed per seller, for removal.
    sellers_metadata: HashMap<String, Vec<String>>,
}

impl BuyerContext {
    pub fn new(challenge: &Challenge, resolution: Duration) -> Self {
        let forecast_range = date_range(
            challenge.start_datetime,
            challenge.end_datetime,
            resolution,
        );
        Self {
            user_id: challenge.user.clone(),
            resource_id: challenge.resource.clone(),
            challenge_id: challenge.id.clone(),
            challenge_usecase: challenge.use_case.clone(),
            challenge_start: challenge.start_datetime,
            challenge_end: challenge.end_datetime,
            forecast_range,
            dataset_range: Vec::new(),
            measurements: TimeSeries::new(),
            sellers_forecasts: TimeFrame::new(),
            sellers_metadata: HashMap::new(),
        }
    }

    /// Attach measurements: derive the expected dataset range from the first
    /// observation (rounded onto the market grid) up to the challenge end,
    /// and reindex onto it. With no observations the dataset range collapses
    /// to the forecast window and the series stays all-null.
    pub fn set_measurements(&mut self, data: &TimeSeries, resolution: Duration) {
        self.dataset_range = match data.first_timestamp() {
            Some(first) => date_range(
                floor_to_step(first, resolution),
                self.challenge_end,
                resolution,
            ),
            None => self.forecast_range.clone(),
        };
        self.measurements = data.reindex(&self.dataset_range);
        // The forecast frame joins sellers onto the same expected range.
        self.sellers_forecasts = TimeFrame::with_index(self.dataset_range.clone());
    }

    /// Outer-join one seller's forecast series into the market frame.
    pub fn add_seller(&mut self, user_id: &str, forecast_variable: &str, forecasts: &TimeSeries) {
        self.sellers_metadata
            .entry(user_id.to_string())
            .or_default()
            .push(forecast_variable.to_string());
        self.sellers_forecasts
            .outer_join_column(forecast_variable, forecasts);
    }

    /// Drop every column contributed by a seller.
    pub fn remove_seller(&mut self, user_id: &str) {
        if let Some(columns) = self.sellers_metadata.remove(user_id) {
            for column in columns {
                self.sellers_forecasts.drop_column(&column);
            }
        }
    }

    pub fn seller_count(&self) -> usize {
        self.sellers_metadata.len()
    }

    pub fn has_seller(&self, user_id: &str) -> bool {
        self.sellers_metadata.contains_key(user_id)
    }
}
