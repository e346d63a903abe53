use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use market_core::{Challenge, MarketConfig, MarketError, Quantile, SAMPLES_PER_DAY};
use market_frame::TimeSeries;
use tracing::{debug, warn};

use crate::buyer::BuyerContext;

/// One seller's declared participation: which quantile they forecast for
/// which challenge resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellerResource {
    pub user: String,
    pub resource_id: String,
    pub variable: Quantile,
}

/// Seller forecast series keyed by user → resource → quantile.
pub type SellersForecasts = HashMap<String, HashMap<String, HashMap<Quantile, TimeSeries>>>;

/// Loads and validates session data: challenges, seller forecasts and buyer
/// measurements. Enforces the quantile and submission-history gates before
/// anything reaches the forecast engine.
pub struct DataLoader {
    config: MarketConfig,
    session_id: Option<i64>,
    pub buyers_data: BTreeMap<String, BuyerContext>,
    pub sellers_resources: Vec<SellerResource>,
}

impl DataLoader {
    pub fn new(config: MarketConfig) -> Self {
        Self {
            config,
            session_id: None,
            buyers_data: BTreeMap::new(),
            sellers_resources: Vec::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: i64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Load challenges, dropping those with an empty submission list. Fails
    /// with *no-buyers* when nothing remains.
    pub fn load_challenges(&mut self, challenges: &[Challenge]) -> Result<(), MarketError> {
        if challenges.is_empty() {
            return Err(MarketError::NoMarketBuyers(
                "No challenges available in the market session.".to_string(),
            ));
        }

        let mut retained = 0;
        for challenge in challenges {
            if challenge.submission_list.is_empty() {
                warn!(
                    challenge = %challenge.id,
                    session = ?self.session_id,
                    "Discarding challenge due to empty submission list"
                );
                continue;
            }
            self.buyers_data.insert(
                challenge.resource.clone(),
                BuyerContext::new(challenge, self.config.time_resolution()),
            );
            retained += 1;
        }

        if retained == 0 {
            return Err(MarketError::NoMarketBuyers(
                "No challenges available in the market session.".to_string(),
            ));
        }
        Ok(())
    }

    /// Join every seller's forecast series into its buyer context, then
    /// apply the submission-history gate: forecasters with fewer than
    /// `min_submission_days` full days of submissions over the lookback
    /// window are removed, unless that would leave the resource with no
    /// forecaster at all.
    pub fn load_forecasters(
        &mut self,
        sellers_resources: &[SellerResource],
        sellers_forecasts: &SellersForecasts,
    ) -> Result<(), MarketError> {
        debug!("Loading sellers data ...");
        if sellers_forecasts.is_empty() {
            return Err(MarketError::NoMarketUsers(
                "No sellers forecasts available in the market session.".to_string(),
            ));
        }

        self.sellers_resources = sellers_resources.to_vec();

        let weighting = self.config.weighting.clone();
        let min_required = (weighting.min_submission_days as usize) * SAMPLES_PER_DAY;

        let mut sellers_to_ignore: HashSet<(String, String)> = HashSet::new();
        let mut valid_sellers: HashSet<(String, String)> = HashSet::new();

        for resource in &self.sellers_resources {
            let Some(forecasts) = sellers_forecasts
                .get(&resource.user)
                .and_then(|by_resource| by_resource.get(&resource.resource_id))
                .and_then(|by_variable| by_variable.get(&resource.variable))
            else {
                continue;
            };

            let Some(buyer) = self.buyers_data.get_mut(&resource.resource_id) else {
                continue;
            };

            let forecast_variable = format!("{}_{}", resource.user, resource.variable);

            // Submission-history gate over the trailing lookback window.
            let key = (resource.resource_id.clone(), resource.user.clone());
            let recent = match forecasts.last_timestamp() {
                Some(last) => {
                    let lookback_start =
                        last - Duration::days(weighting.min_submission_days_lookback);
                    forecasts.non_null_count_since(lookback_start)
                }
                None => 0,
            };
            if recent < min_required {
                warn!(
                    seller = %resource.user,
                    resource = %resource.resource_id,
                    "Discarding seller from ensemble due to less than a week \
                     of submissions"
                );
                sellers_to_ignore.insert(key);
            } else {
                valid_sellers.insert(key);
            }

            buyer.add_seller(&resource.user, &forecast_variable, forecasts);
        }

        // Never leave a resource without forecasters: removals only apply
        // where at least one valid seller remains.
        for (resource_id, user_id) in &sellers_to_ignore {
            let resource_has_valid = valid_sellers.iter().any(|(r, _)| r == resource_id);
            if resource_has_valid {
                if let Some(buyer) = self.buyers_data.get_mut(resource_id) {
                    buyer.remove_seller(user_id);
                }
            }
        }

        debug!("Loading sellers data ... Ok!");
        Ok(())
    }

    /// Attach measurement series to each buyer, resampled to market
    /// resolution and reindexed onto the expected dataset range.
    pub fn load_buyer_measurements(&mut self, measurements: &HashMap<String, TimeSeries>) {
        let resolution = self.config.time_resolution();
        for (resource_id, buyer) in self.buyers_data.iter_mut() {
            let series = measurements.get(resource_id).cloned().unwrap_or_default();
            let resampled = series.resample_mean(resolution);
            buyer.set_measurements(&resampled, resolution);
        }
    }

    /// Resample to market resolution (mean) and reindex onto the expected
    /// timestamps; missing dates stay null.
    pub fn preprocess_buyer_data(
        data: &TimeSeries,
        expected_dates: &[DateTime<Utc>],
        resolution: Duration,
    ) -> TimeSeries {
        data.resample_mean(resolution).reindex(expected_dates)
    }

    /// The challenges that survived loading, as (challenge, resource, user).
    pub fn valid_challenges(&self) -> Vec<(String, String, String)> {
        self.buyers_data
            .values()
            .map(|b| {
                (
                    b.challenge_id.clone(),
                    b.resource_id.clone(),
                    b.user_id.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_core::{SubmissionKind, SubmissionMeta};
    use market_frame::date_range;

    fn ts(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, m, 0).unwrap()
    }

    fn challenge(id: &str, resource: &str, submissions: usize) -> Challenge {
        Challenge {
            id: id.to_string(),
            resource: resource.to_string(),
            user: "buyer-1".to_string(),
            use_case: "wind_power".to_string(),
            start_datetime: ts(10, 0, 0),
            end_datetime: ts(10, 23, 45),
            target_day: chrono::NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            submission_list: (0..submissions)
                .map(|i| SubmissionMeta {
                    id: format!("sub-{i}"),
                    user: format!("seller-{i}"),
                    variable: Quantile::Q50,
                    submission_type: SubmissionKind::Normal,
                })
                .collect(),
        }
    }

    /// A series spanning `days` full days ending right before the challenge.
    fn history(days: i64) -> TimeSeries {
        let end = ts(9, 23, 45);
        let start = end - Duration::days(days) + Duration::minutes(15);
        let index = date_range(start, end, Duration::minutes(15));
        let n = index.len();
        TimeSeries::from_values(index, vec![5.0; n])
    }

    fn forecasts_for(
        entries: &[(&str, &str, Quantile, TimeSeries)],
    ) -> (Vec<SellerResource>, SellersForecasts) {
        let mut resources = Vec::new();
        let mut forecasts: SellersForecasts = HashMap::new();
        for (user, resource, variable, series) in entries {
            resources.push(SellerResource {
                user: user.to_string(),
                resource_id: resource.to_string(),
                variable: *variable,
            });
            forecasts
                .entry(user.to_string())
                .or_default()
                .entry(resource.to_string())
                .or_default()
                .insert(*variable, series.clone());
        }
        (resources, forecasts)
    }

    #[test]
    fn empty_challenge_list_is_no_buyers() {
        let mut loader = DataLoader::new(MarketConfig::default());
        let err = loader.load_challenges(&[]).unwrap_err();
        assert!(matches!(err, MarketError::NoMarketBuyers(_)));
    }

    #[test]
    fn challenges_without_submissions_are_dropped() {
        let mut loader = DataLoader::new(MarketConfig::default());
        loader
            .load_challenges(&[challenge("ch-1", "wind-1", 0), challenge("ch-2", "wind-2", 2)])
            .unwrap();
        assert_eq!(loader.buyers_data.len(), 1);
        assert!(loader.buyers_data.contains_key("wind-2"));
    }

    #[test]
    fn all_challenges_dropped_is_no_buyers() {
        let mut loader = DataLoader::new(MarketConfig::default());
        let err = loader
            .load_challenges(&[challenge("ch-1", "wind-1", 0)])
            .unwrap_err();
        assert!(matches!(err, MarketError::NoMarketBuyers(_)));
    }

    #[test]
    fn no_seller_forecasts_is_no_users() {
        let mut loader = DataLoader::new(MarketConfig::default());
        loader
            .load_challenges(&[challenge("ch-1", "wind-1", 1)])
            .unwrap();
        let err = loader
            .load_forecasters(&[], &SellersForecasts::new())
            .unwrap_err();
        assert!(matches!(err, MarketError::NoMarketUsers(_)));
    }

    #[test]
    fn short_history_seller_removed_when_valid_one_remains() {
        let mut loader = DataLoader::new(MarketConfig::default());
        loader
            .load_challenges(&[challenge("ch-1", "wind-1", 2)])
            .unwrap();
        loader.load_buyer_measurements(&HashMap::new());

        // seller-ok has 7 full days, seller-thin only 2.
        let (resources, forecasts) = forecasts_for(&[
            ("seller-ok", "wind-1", Quantile::Q50, history(7)),
            ("seller-thin", "wind-1", Quantile::Q50, history(2)),
        ]);
        loader.load_forecasters(&resources, &forecasts).unwrap();

        let buyer = &loader.buyers_data["wind-1"];
        assert!(buyer.has_seller("seller-ok"));
        assert!(!buyer.has_seller("seller-thin"));
    }

    #[test]
    fn last_seller_is_never_removed() {
        let mut loader = DataLoader::new(MarketConfig::default());
        loader
            .load_challenges(&[challenge("ch-1", "wind-1", 1)])
            .unwrap();
        loader.load_buyer_measurements(&HashMap::new());

        let (resources, forecasts) =
            forecasts_for(&[("seller-thin", "wind-1", Quantile::Q50, history(2))]);
        loader.load_forecasters(&resources, &forecasts).unwrap();

        let buyer = &loader.buyers_data["wind-1"];
        assert!(buyer.has_seller("seller-thin"));
    }

    #[test]
    fn measurements_are_resampled_and_attached() {
        let mut loader = DataLoader::new(MarketConfig::default());
        loader
            .load_challenges(&[challenge("ch-1", "wind-1", 1)])
            .unwrap();

        // 5-minute raw data resampled onto the 15-minute grid.
        let raw = TimeSeries::from_points(vec![
            (ts(9, 0, 0), Some(1.0)),
            (ts(9, 0, 5), Some(2.0)),
            (ts(9, 0, 10), Some(3.0)),
        ]);
        let mut measurements = HashMap::new();
        measurements.insert("wind-1".to_string(), raw);
        loader.load_buyer_measurements(&measurements);

        let buyer = &loader.buyers_data["wind-1"];
        assert_eq!(buyer.measurements.value_at(ts(9, 0, 0)), Some(2.0));
    }
}
