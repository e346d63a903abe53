use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use market_frame::TimeSeries;
use serde::{Deserialize, Serialize};

use crate::error::MarketError;

/// Probabilistic forecast level. The market trades three fixed quantiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quantile {
    #[serde(rename = "q10")]
    Q10,
    #[serde(rename = "q50")]
    Q50,
    #[serde(rename = "q90")]
    Q90,
}

impl Quantile {
    pub const ALL: [Quantile; 3] = [Quantile::Q10, Quantile::Q50, Quantile::Q90];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantile::Q10 => "q10",
            Quantile::Q50 => "q50",
            Quantile::Q90 => "q90",
        }
    }

    /// Column suffix used for forecaster columns, e.g. `_q50`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Quantile::Q10 => "_q10",
            Quantile::Q50 => "_q50",
            Quantile::Q90 => "_q90",
        }
    }

    /// The quantile level, e.g. `q10` → 0.1.
    pub fn level(&self) -> f64 {
        match self {
            Quantile::Q10 => 0.1,
            Quantile::Q50 => 0.5,
            Quantile::Q90 => 0.9,
        }
    }

    pub fn from_label(label: &str) -> Result<Quantile, MarketError> {
        match label {
            "q10" => Ok(Quantile::Q10),
            "q50" => Ok(Quantile::Q50),
            "q90" => Ok(Quantile::Q90),
            other => Err(MarketError::Validation(format!(
                "Invalid quantile label '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation metric for a submitted or ensembled forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMetric {
    Rmse,
    Mae,
    Pinball,
    Winkler,
}

impl ScoreMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreMetric::Rmse => "rmse",
            ScoreMetric::Mae => "mae",
            ScoreMetric::Pinball => "pinball",
            ScoreMetric::Winkler => "winkler",
        }
    }

    pub fn from_label(label: &str) -> Result<ScoreMetric, MarketError> {
        match label {
            "rmse" => Ok(ScoreMetric::Rmse),
            "mae" => Ok(ScoreMetric::Mae),
            "pinball" => Ok(ScoreMetric::Pinball),
            "winkler" => Ok(ScoreMetric::Winkler),
            other => Err(MarketError::Validation(format!(
                "Invalid metric label '{other}'"
            ))),
        }
    }
}

/// Monthly evaluation dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Deterministic,
    Probabilistic,
}

impl Track {
    pub const ALL: [Track; 2] = [Track::Deterministic, Track::Probabilistic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Deterministic => "deterministic",
            Track::Probabilistic => "probabilistic",
        }
    }

    pub fn metric(&self) -> ScoreMetric {
        match self {
            Track::Deterministic => ScoreMetric::Rmse,
            Track::Probabilistic => ScoreMetric::Winkler,
        }
    }

    /// The quantile whose score rows carry this track's metric. The interval
    /// score is stored on both interval rows; `q90` is the reference.
    pub fn reference_quantile(&self) -> Quantile {
        match self {
            Track::Deterministic => Quantile::Q50,
            Track::Probabilistic => Quantile::Q90,
        }
    }
}

/// Monthly league band per forecaster per resource per track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum League {
    Elite,
    Challenger,
    RunnerUp,
    Unassigned,
    Unqualified,
}

impl League {
    pub fn as_str(&self) -> &'static str {
        match self {
            League::Elite => "elite",
            League::Challenger => "challenger",
            League::RunnerUp => "runner_up",
            League::Unassigned => "unassigned",
            League::Unqualified => "unqualified",
        }
    }
}

/// Market session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
    Running,
    Finished,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
        }
    }

    pub fn from_label(label: &str) -> Result<SessionStatus, MarketError> {
        match label {
            "open" => Ok(SessionStatus::Open),
            "closed" => Ok(SessionStatus::Closed),
            "running" => Ok(SessionStatus::Running),
            "finished" => Ok(SessionStatus::Finished),
            other => Err(MarketError::Validation(format!(
                "Invalid session status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gate-closure cycle as stored by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSession {
    pub id: i64,
    pub status: SessionStatus,
    #[serde(default)]
    pub open_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub launch_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gate_closure: Option<DateTime<Utc>>,
}

/// A physical resource registered by a buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    Normal,
    Continuous,
}

/// One forecaster's submission for one challenge and one quantile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionMeta {
    pub id: String,
    pub user: String,
    pub variable: Quantile,
    #[serde(default = "default_submission_kind")]
    pub submission_type: SubmissionKind,
}

fn default_submission_kind() -> SubmissionKind {
    SubmissionKind::Normal
}

/// A single 24-hour forecast task for one resource in one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub resource: String,
    pub user: String,
    pub use_case: String,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub target_day: NaiveDate,
    #[serde(default)]
    pub submission_list: Vec<SubmissionMeta>,
}

/// A submitted (or ensembled) forecast series loaded for scoring.
#[derive(Debug, Clone)]
pub struct SubmittedForecast {
    /// Submission id or ensemble id, depending on the evaluation target.
    pub id: String,
    /// Forecaster user id, or ensemble model name.
    pub user_id: String,
    pub variable: Quantile,
    pub series: TimeSeries,
}

/// One score row: `(forecast id, metric, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub forecast_id: String,
    pub metric: ScoreMetric,
    pub value: f64,
}

/// A single long-form prediction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub datetime: DateTime<Utc>,
    pub variable: Quantile,
    pub value: f64,
}

/// Long-form strategy output: rows over (forecast window × quantiles).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastTable {
    rows: Vec<ForecastPoint>,
}

impl ForecastTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, datetime: DateTime<Utc>, variable: Quantile, value: f64) {
        self.rows.push(ForecastPoint {
            datetime,
            variable,
            value,
        });
    }

    pub fn extend(&mut self, other: ForecastTable) {
        self.rows.extend(other.rows);
    }

    pub fn rows(&self) -> &[ForecastPoint] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct quantiles present, in `Quantile::ALL` order.
    pub fn quantiles(&self) -> Vec<Quantile> {
        Quantile::ALL
            .into_iter()
            .filter(|q| self.rows.iter().any(|r| r.variable == *q))
            .collect()
    }

    /// The rows for one quantile as `(timestamp, value)` pairs.
    pub fn values_for(&self, quantile: Quantile) -> Vec<(DateTime<Utc>, f64)> {
        self.rows
            .iter()
            .filter(|r| r.variable == quantile)
            .map(|r| (r.datetime, r.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_labels_round_trip() {
        for q in Quantile::ALL {
            assert_eq!(Quantile::from_label(q.as_str()).unwrap(), q);
        }
        assert!(Quantile::from_label("q42").is_err());
    }

    #[test]
    fn quantile_levels() {
        assert_eq!(Quantile::Q10.level(), 0.1);
        assert_eq!(Quantile::Q50.level(), 0.5);
        assert_eq!(Quantile::Q90.level(), 0.9);
    }

    #[test]
    fn track_references() {
        assert_eq!(Track::Deterministic.metric(), ScoreMetric::Rmse);
        assert_eq!(Track::Deterministic.reference_quantile(), Quantile::Q50);
        assert_eq!(Track::Probabilistic.metric(), ScoreMetric::Winkler);
        assert_eq!(Track::Probabilistic.reference_quantile(), Quantile::Q90);
    }

    #[test]
    fn forecast_table_filters_by_quantile() {
        let mut table = ForecastTable::new();
        let ts = DateTime::from_timestamp(0, 0).unwrap();
        table.push(ts, Quantile::Q50, 1.0);
        table.push(ts, Quantile::Q10, 2.0);
        assert_eq!(table.quantiles(), vec![Quantile::Q10, Quantile::Q50]);
        assert_eq!(table.values_for(Quantile::Q50), vec![(ts, 1.0)]);
    }
}
