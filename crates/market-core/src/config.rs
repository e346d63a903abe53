use std::collections::HashMap;

use chrono::Duration;
use chrono_tz::Tz;

use crate::error::MarketError;
use crate::types::Quantile;

/// Samples per day at the canonical 15-minute market resolution.
pub const SAMPLES_PER_DAY: usize = 96;

/// Configuration for forecaster weight calculation and eligibility gates.
#[derive(Debug, Clone)]
pub struct WeightingConfig {
    /// Exponential decay parameter: `w_i = exp(-beta * score_i)`.
    pub beta: f64,
    /// Lookback (days) for skill scores used as ensemble weights.
    pub scores_calculation_days: u32,
    /// Lookback window (days) for the submission-count gate.
    pub min_submission_days_lookback: i64,
    /// Minimum full days of submissions inside the lookback window.
    pub min_submission_days: i64,
    /// Score assigned to forecasters without a computed score.
    pub default_score: f64,
    /// Minimum non-null historical samples for "has training history".
    pub min_history_samples: usize,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            beta: 0.001,
            scores_calculation_days: 6,
            min_submission_days_lookback: 7,
            min_submission_days: 6,
            default_score: 999_999.0,
            min_history_samples: SAMPLES_PER_DAY * 31,
        }
    }
}

impl WeightingConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.min_submission_days > self.min_submission_days_lookback {
            return Err(MarketError::Validation(
                "min_submission_days must be less than or equal to \
                 min_submission_days_lookback"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// DTW outlier-detection settings shared by the averaging strategies.
#[derive(Debug, Clone)]
pub struct OutlierConfig {
    pub enabled: bool,
    /// MAD multiplier. Deliberately permissive: a safety net against
    /// degenerate submissions, not a general noise filter.
    pub alpha: f64,
    pub min_forecasters: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 20.0,
            min_forecasters: 4,
        }
    }
}

/// Monthly league assignment cutoffs.
#[derive(Debug, Clone)]
pub struct LeagueConfig {
    /// Ranks 1..=elite_cutoff are `elite`.
    pub elite_cutoff: usize,
    /// Ranks elite_cutoff+1..=challenger_cutoff are `challenger`.
    pub challenger_cutoff: usize,
    /// This single rank is `runner_up`; everything after is `unassigned`.
    pub runner_up_rank: usize,
    /// More than this many missing days in the month disqualifies.
    pub max_missing_days: usize,
    /// Quantile of the daily-score cells used as the missing-day penalty.
    pub penalty_quantile: f64,
}

impl Default for LeagueConfig {
    fn default() -> Self {
        Self {
            elite_cutoff: 5,
            challenger_cutoff: 10,
            runner_up_rank: 11,
            max_missing_days: 5,
            penalty_quantile: 0.75,
        }
    }
}

/// Engine-wide settings, threaded through constructors rather than read from
/// a process global.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub quantiles: Vec<Quantile>,
    /// Canonical market data resolution, in minutes.
    pub time_resolution_minutes: i64,
    /// Day-ahead horizon in resolution steps.
    pub forecast_horizon_steps: usize,
    pub default_strategy: String,
    /// Resource-specific strategy lists; resources not listed here run the
    /// default strategy.
    pub resource_strategies: HashMap<String, Vec<String>>,
    /// Ensemble models whose forecasts are scored alongside submissions.
    pub ensemble_models: Vec<String>,
    /// Worker pool size for per-resource forecasting.
    pub n_jobs: usize,
    pub weighting: WeightingConfig,
    pub outliers: OutlierConfig,
    pub league: LeagueConfig,
    /// Days of the month during which a score recompute reaches back into
    /// the previous month.
    pub score_recalc_grace_days: u32,
    /// Buyer-local zone used for daily score bucketing.
    pub local_tz: Tz,
    /// Zone in which the gate-closure hour is expressed.
    pub gate_closure_tz: Tz,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            quantiles: Quantile::ALL.to_vec(),
            time_resolution_minutes: 15,
            forecast_horizon_steps: SAMPLES_PER_DAY,
            default_strategy: "weighted_avg".to_string(),
            resource_strategies: HashMap::new(),
            ensemble_models: vec!["weighted_avg".to_string()],
            n_jobs: 1,
            weighting: WeightingConfig::default(),
            outliers: OutlierConfig::default(),
            league: LeagueConfig::default(),
            score_recalc_grace_days: 7,
            local_tz: chrono_tz::Europe::Brussels,
            gate_closure_tz: chrono_tz::CET,
        }
    }
}

impl MarketConfig {
    /// Default configuration with runtime settings (`N_JOBS`) taken from the
    /// environment.
    pub fn from_env() -> Result<Self, MarketError> {
        let mut config = Self::default();
        if let Ok(n_jobs) = std::env::var("N_JOBS") {
            config.n_jobs = n_jobs.parse().map_err(|_| {
                MarketError::Validation(format!("Invalid N_JOBS value '{n_jobs}'"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.quantiles.is_empty() {
            return Err(MarketError::Validation(
                "at least one quantile must be configured".to_string(),
            ));
        }
        if self.n_jobs == 0 {
            return Err(MarketError::Validation(
                "n_jobs must be at least 1".to_string(),
            ));
        }
        self.weighting.validate()
    }

    pub fn time_resolution(&self) -> Duration {
        Duration::minutes(self.time_resolution_minutes)
    }

    /// Strategies to run for a resource: the configured resource-specific
    /// list, or the single default strategy.
    pub fn strategies_for_resource(&self, resource_id: &str) -> Vec<String> {
        self.resource_strategies
            .get(resource_id)
            .cloned()
            .unwrap_or_else(|| vec![self.default_strategy.clone()])
    }
}
