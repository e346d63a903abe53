use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use kpi_engine::{ForecastRow, MonthlyKpiRecord};
use market_core::{Challenge, MarketError, Quantile, ScoreMetric, SubmittedForecast};
use market_frame::TimeSeries;
use market_loader::{SellerResource, SellersForecasts};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::backup::{write_scores_backup, ScoreBackupRow};

/// One monthly score row joined with its submission context.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub user_id: String,
    pub challenge_id: String,
    pub variable: Quantile,
    pub metric: ScoreMetric,
    pub target_day: NaiveDate,
    pub value: f64,
}

/// One submission row for partial-submission filtering.
#[derive(Debug, Clone)]
pub struct SubmissionRow {
    pub user_id: String,
    pub submission_id: String,
    pub challenge_id: String,
    pub variable: Quantile,
}

/// Start of the score-recompute window: within the grace period of a new
/// month the window reaches back to the previous month's first day,
/// otherwise it starts at the current month's first day.
pub fn scoring_window_start(today: NaiveDate, grace_days: u32) -> NaiveDate {
    let first_of_month = today.with_day(1).unwrap_or(today);
    if today.day() <= grace_days {
        let last_of_previous = first_of_month.pred_opt().unwrap_or(first_of_month);
        last_of_previous.with_day(1).unwrap_or(last_of_previous)
    } else {
        first_of_month
    }
}

fn db_err(e: sqlx::Error) -> MarketError {
    MarketError::Database(e.to_string())
}

fn parse_quantile(label: &str) -> Result<Quantile, MarketError> {
    Quantile::from_label(label)
}

/// Postgres access for the market's persistent state.
pub struct MarketDb {
    pool: PgPool,
}

impl MarketDb {
    /// Connect and verify the connection. A failure here is fatal before
    /// any work begins.
    pub async fn connect(database_url: &str) -> Result<Self, MarketError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        let db = Self { pool };
        db.test_connection().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn test_connection(&self) -> Result<(), MarketError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Connection string from `POSTGRES_{HOST,PORT,USER,PASSWORD,DB}`.
    pub fn url_from_env() -> Result<String, MarketError> {
        let host = std::env::var("POSTGRES_HOST")
            .map_err(|_| MarketError::Validation("POSTGRES_HOST is not set".to_string()))?;
        let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("POSTGRES_USER").unwrap_or_default();
        let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
        let db = std::env::var("POSTGRES_DB").unwrap_or_default();
        Ok(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
    }

    /// Raw measurement series per resource, deduplicated on timestamp.
    pub async fn measurements(
        &self,
        resource_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, TimeSeries>, MarketError> {
        info!("Querying measurements for resource list ...");
        let mut out = HashMap::new();
        let mut sorted = resource_ids.to_vec();
        sorted.sort();
        for resource_id in &sorted {
            let series = self.measurements_by_resource(resource_id, start, end).await?;
            if series.is_empty() {
                warn!(resource = %resource_id, "No historical data for resource");
            }
            out.insert(resource_id.clone(), series);
        }
        Ok(out)
    }

    pub async fn measurements_by_resource(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeSeries, MarketError> {
        debug!(resource = %resource_id, "Querying measurements");
        let rows: Vec<(DateTime<Utc>, Option<f64>)> = sqlx::query_as(
            "SELECT datetime, value FROM raw_data \
             WHERE resource_id = $1 AND datetime >= $2 AND datetime <= $3 \
             ORDER BY datetime ASC",
        )
        .bind(resource_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(TimeSeries::from_points(
            rows.into_iter().map(|(ts, v)| (ts, v)).collect(),
        ))
    }

    /// Submitted forecast history per (seller, resource, quantile), used as
    /// the ensemble training matrix.
    pub async fn sellers_forecasts(
        &self,
        sellers_resources: &[SellerResource],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SellersForecasts, MarketError> {
        info!("Querying forecasts for sellers forecasts list ...");
        let mut out: SellersForecasts = HashMap::new();
        for resource in sellers_resources {
            let rows: Vec<(DateTime<Utc>, Option<f64>)> = sqlx::query_as(
                "SELECT mssf.datetime, mssf.value \
                 FROM market_session_submission_forecasts AS mssf \
                 INNER JOIN market_session_submission AS mss \
                   ON mssf.submission_id = mss.id \
                 INNER JOIN market_session_challenge AS msc \
                   ON mss.market_session_challenge_id = msc.id \
                 WHERE msc.resource_id = $1 AND mss.user_id = $2 \
                   AND mss.variable = $3 \
                   AND mssf.datetime >= $4 AND mssf.datetime <= $5 \
                 ORDER BY mssf.datetime ASC",
            )
            .bind(&resource.resource_id)
            .bind(&resource.user)
            .bind(resource.variable.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            if rows.is_empty() {
                warn!(
                    user = %resource.user,
                    resource = %resource.resource_id,
                    "No forecasts data from user for target resource"
                );
            }

            out.entry(resource.user.clone())
                .or_default()
                .entry(resource.resource_id.clone())
                .or_default()
                .insert(resource.variable, TimeSeries::from_points(rows));
        }
        Ok(out)
    }

    /// Submitted forecast series for one challenge, grouped per submission.
    pub async fn sellers_submissions(
        &self,
        sellers_users: &[String],
        challenge_id: &str,
    ) -> Result<Vec<SubmittedForecast>, MarketError> {
        info!(challenge = %challenge_id, "Querying submitted forecasts");
        let rows: Vec<(String, String, String, DateTime<Utc>, Option<f64>)> = sqlx::query_as(
            "SELECT mss.id::text, mss.user_id::text, mss.variable, \
                    mssf.datetime, mssf.value \
             FROM market_session_submission_forecasts AS mssf \
             INNER JOIN market_session_submission AS mss \
               ON mssf.submission_id = mss.id \
             WHERE mss.user_id::text = ANY($1) \
               AND mss.market_session_challenge_id::text = $2 \
             ORDER BY mssf.datetime ASC",
        )
        .bind(sellers_users)
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Self::group_forecasts(rows)
    }

    /// Ensemble forecast series for one challenge, one group per ensemble
    /// registration (strategy model).
    pub async fn ensemble_forecasts(
        &self,
        ensemble_models: &[String],
        challenge_id: &str,
    ) -> Result<Vec<SubmittedForecast>, MarketError> {
        info!(challenge = %challenge_id, "Querying ensemble forecasts");
        let rows: Vec<(String, String, String, DateTime<Utc>, Option<f64>)> = sqlx::query_as(
            "SELECT mse.id::text, mse.model, mse.variable, \
                    msef.datetime, msef.value \
             FROM market_session_ensemble_forecasts AS msef \
             INNER JOIN market_session_ensemble AS mse \
               ON msef.ensemble_id = mse.id \
             WHERE mse.model = ANY($1) \
               AND mse.market_session_challenge_id::text = $2 \
             ORDER BY msef.datetime ASC",
        )
        .bind(ensemble_models)
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Self::group_forecasts(rows)
    }

    fn group_forecasts(
        rows: Vec<(String, String, String, DateTime<Utc>, Option<f64>)>,
    ) -> Result<Vec<SubmittedForecast>, MarketError> {
        let mut grouped: HashMap<String, (String, Quantile, Vec<(DateTime<Utc>, Option<f64>)>)> =
            HashMap::new();
        for (id, owner, variable, ts, value) in rows {
            let variable = parse_quantile(&variable)?;
            grouped
                .entry(id)
                .or_insert_with(|| (owner, variable, Vec::new()))
                .2
                .push((ts, value));
        }
        let mut out: Vec<SubmittedForecast> = grouped
            .into_iter()
            .map(|(id, (user_id, variable, points))| SubmittedForecast {
                id,
                user_id,
                variable,
                series: TimeSeries::from_points(points),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Challenges since `start_date` that have no submission scores yet.
    pub async fn challenges_for_scoring(
        &self,
        start_date: NaiveDate,
    ) -> Result<Vec<Challenge>, MarketError> {
        info!(%start_date, "Querying challenges without scores");
        let rows: Vec<(
            String,
            String,
            String,
            String,
            DateTime<Utc>,
            DateTime<Utc>,
            NaiveDate,
        )> = sqlx::query_as(
            "SELECT msc.id::text, msc.resource_id::text, msc.user_id::text, \
                    msc.use_case, msc.start_datetime, msc.end_datetime, \
                    msc.target_day \
             FROM market_session_challenge AS msc \
             WHERE msc.target_day >= $1 \
               AND NOT EXISTS ( \
                 SELECT 1 \
                 FROM market_session_submission_scores AS msss \
                 JOIN market_session_submission AS mss \
                   ON msss.submission_id = mss.id \
                 WHERE mss.market_session_challenge_id = msc.id) \
             ORDER BY msc.target_day ASC",
        )
        .bind(start_date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, resource, user, use_case, start_datetime, end_datetime, target_day)| {
                    Challenge {
                        id,
                        resource,
                        user,
                        use_case,
                        start_datetime,
                        end_datetime,
                        target_day,
                        submission_list: Vec::new(),
                    }
                },
            )
            .collect())
    }

    /// Monthly score rows for one resource, restricted to the evaluation
    /// metrics.
    pub async fn scores_per_resource(
        &self,
        resource_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        metrics: &[ScoreMetric],
    ) -> Result<Vec<ScoreRow>, MarketError> {
        info!(resource = %resource_id, "Querying scores for resource challenges");
        let metric_labels: Vec<String> =
            metrics.iter().map(|m| m.as_str().to_string()).collect();
        let rows: Vec<(String, String, String, String, NaiveDate, f64)> = sqlx::query_as(
            "SELECT mss.user_id::text, msc.id::text, mss.variable, msss.metric, \
                    msc.target_day, msss.value \
             FROM market_session_submission_scores AS msss \
             JOIN market_session_submission AS mss ON msss.submission_id = mss.id \
             JOIN market_session_challenge AS msc \
               ON msc.id = mss.market_session_challenge_id \
             WHERE msc.target_day >= $1 AND msc.target_day <= $2 \
               AND msss.metric = ANY($3) \
               AND msc.resource_id::text = $4 \
             ORDER BY msc.target_day ASC",
        )
        .bind(start)
        .bind(end)
        .bind(&metric_labels)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(user_id, challenge_id, variable, metric, target_day, value)| {
                Ok(ScoreRow {
                    user_id,
                    challenge_id,
                    variable: parse_quantile(&variable)?,
                    metric: ScoreMetric::from_label(&metric)?,
                    target_day,
                    value,
                })
            })
            .collect()
    }

    pub async fn submissions_by_resource(
        &self,
        resource_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SubmissionRow>, MarketError> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT mss.user_id::text, mss.id::text, msc.id::text, mss.variable \
             FROM market_session_submission AS mss \
             INNER JOIN market_session_challenge AS msc \
               ON mss.market_session_challenge_id = msc.id \
             WHERE msc.resource_id::text = $1 \
               AND msc.target_day >= $2 AND msc.target_day <= $3",
        )
        .bind(resource_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(user_id, submission_id, challenge_id, variable)| {
                Ok(SubmissionRow {
                    user_id,
                    submission_id,
                    challenge_id,
                    variable: parse_quantile(&variable)?,
                })
            })
            .collect()
    }

    /// Long-form submitted forecasts for one resource and month, for the
    /// error distributions.
    pub async fn sellers_forecasts_by_resource(
        &self,
        resource_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ForecastRow>, MarketError> {
        let rows: Vec<(String, String, DateTime<Utc>, Option<f64>)> = sqlx::query_as(
            "SELECT mss.user_id::text, mss.variable, mssf.datetime, mssf.value \
             FROM market_session_submission_forecasts AS mssf \
             INNER JOIN market_session_submission AS mss \
               ON mssf.submission_id = mss.id \
             INNER JOIN market_session_challenge AS msc \
               ON mss.market_session_challenge_id = msc.id \
             WHERE msc.resource_id::text = $1 \
               AND msc.target_day >= $2 AND msc.target_day <= $3",
        )
        .bind(resource_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::new();
        for (user_id, variable, datetime, value) in rows {
            let Some(value) = value else { continue };
            out.push(ForecastRow {
                user_id,
                variable: parse_quantile(&variable)?,
                datetime,
                value,
            });
        }
        Ok(out)
    }

    /// Fixed-payment flag per forecaster for one resource.
    pub async fn resource_participation(
        &self,
        resource_id: &str,
    ) -> Result<HashMap<String, bool>, MarketError> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT user_id::text, is_fixed_payment \
             FROM user_resource_participation \
             WHERE resource_id::text = $1",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().collect())
    }

    /// Continuous forecast rows for one user/resource over a window.
    pub async fn continuous_forecasts(
        &self,
        user_id: &str,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ForecastRow>, MarketError> {
        let rows: Vec<(String, DateTime<Utc>, Option<f64>)> = sqlx::query_as(
            "SELECT variable, datetime, value \
             FROM market_continuous_forecasts \
             WHERE user_id::text = $1 AND resource_id::text = $2 \
               AND datetime >= $3 AND datetime <= $4 \
             ORDER BY datetime ASC",
        )
        .bind(user_id)
        .bind(resource_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::new();
        for (variable, datetime, value) in rows {
            let Some(value) = value else { continue };
            out.push(ForecastRow {
                user_id: user_id.to_string(),
                variable: parse_quantile(&variable)?,
                datetime,
                value,
            });
        }
        Ok(out)
    }

    /// Destructive score recompute preparation: back up every submission and
    /// ensemble score in the recompute window to CSV, then delete each set
    /// in one transaction per table. The backups are a hard prerequisite;
    /// any backup failure aborts before deletion.
    ///
    /// Returns the window start plus the backed-up row counts.
    pub async fn delete_scores_with_backup(
        &self,
        today: NaiveDate,
        grace_days: u32,
        scores_dir: &Path,
    ) -> Result<(NaiveDate, usize, usize), MarketError> {
        let start = scoring_window_start(today, grace_days);

        let submission_rows = self.window_score_rows(start, today, false).await?;
        write_scores_backup(scores_dir, "sub_scores", start, today, &submission_rows)?;

        let ensemble_rows = self.window_score_rows(start, today, true).await?;
        write_scores_backup(scores_dir, "ens_scores", start, today, &ensemble_rows)?;

        let submission_ids = distinct_ids(&submission_rows);
        if !submission_ids.is_empty() {
            info!(n = submission_ids.len(), "Deleting past submission scores");
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query(
                "DELETE FROM market_session_submission_scores \
                 WHERE submission_id::text = ANY($1)",
            )
            .bind(&submission_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
        }

        let ensemble_ids = distinct_ids(&ensemble_rows);
        if !ensemble_ids.is_empty() {
            info!(n = ensemble_ids.len(), "Deleting past ensemble scores");
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query(
                "DELETE FROM market_session_ensemble_scores \
                 WHERE ensemble_id::text = ANY($1)",
            )
            .bind(&ensemble_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
        }

        Ok((start, submission_rows.len(), ensemble_rows.len()))
    }

    async fn window_score_rows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        ensembles: bool,
    ) -> Result<Vec<ScoreBackupRow>, MarketError> {
        let query = if ensembles {
            "SELECT mses.ensemble_id::text, mse.model, mse.variable, \
                    mses.metric, mses.value, msc.target_day \
             FROM market_session_ensemble_scores AS mses \
             JOIN market_session_ensemble AS mse ON mse.id = mses.ensemble_id \
             JOIN market_session_challenge AS msc \
               ON msc.id = mse.market_session_challenge_id \
             WHERE msc.target_day >= $1 AND msc.target_day <= $2"
        } else {
            "SELECT msss.submission_id::text, mss.user_id::text, mss.variable, \
                    msss.metric, msss.value, msc.target_day \
             FROM market_session_submission_scores AS msss \
             JOIN market_session_submission AS mss ON mss.id = msss.submission_id \
             JOIN market_session_challenge AS msc \
               ON msc.id = mss.market_session_challenge_id \
             WHERE msc.target_day >= $1 AND msc.target_day <= $2"
        };
        let rows: Vec<(String, String, String, String, f64, NaiveDate)> = sqlx::query_as(query)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(forecast_id, user_id, variable, metric, value, target_day)| ScoreBackupRow {
                    forecast_id,
                    user_id,
                    variable,
                    metric,
                    value,
                    target_day,
                },
            )
            .collect())
    }

    /// Monthly stats rewrite: delete the `(year, month, resource)` rows and
    /// insert the fresh records, both inside one transaction per resource.
    pub async fn replace_monthly_stats(
        &self,
        year: i32,
        month: u32,
        resource_id: &str,
        records: &[MonthlyKpiRecord],
    ) -> Result<(), MarketError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "DELETE FROM forecaster_monthly_stats \
             WHERE year = $1 AND month = $2 AND resource_id::text = $3",
        )
        .bind(year)
        .bind(month as i32)
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for record in records {
            let stats_json = serde_json::to_string(record)
                .map_err(|e| MarketError::Database(e.to_string()))?;
            sqlx::query(
                "INSERT INTO forecaster_monthly_stats \
                 (user_id, resource_id, year, month, metric, track, league_id, \
                  is_fixed_payment, stats) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&record.user)
            .bind(resource_id)
            .bind(year)
            .bind(month as i32)
            .bind(record.metric.as_str())
            .bind(record.track.as_str())
            .bind(record.league_id.as_str())
            .bind(record.is_fixed_payment)
            .bind(stats_json)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        info!(
            year,
            month,
            resource = %resource_id,
            records = records.len(),
            "Replaced monthly stats"
        );
        Ok(())
    }
}

fn distinct_ids(rows: &[ScoreBackupRow]) -> Vec<String> {
    let mut ids: Vec<String> = rows.iter().map(|r| r.forecast_id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_reaches_back_during_grace_period() {
        // Day 5 of the month, grace 7: window starts on the previous
        // month's first day.
        assert_eq!(
            scoring_window_start(day(2024, 5, 5), 7),
            day(2024, 4, 1)
        );
        // Grace boundary is inclusive.
        assert_eq!(
            scoring_window_start(day(2024, 5, 7), 7),
            day(2024, 4, 1)
        );
    }

    #[test]
    fn window_stays_in_month_after_grace_period() {
        assert_eq!(
            scoring_window_start(day(2024, 5, 8), 7),
            day(2024, 5, 1)
        );
        assert_eq!(
            scoring_window_start(day(2024, 5, 31), 7),
            day(2024, 5, 1)
        );
    }

    #[test]
    fn grace_period_crosses_year_boundary() {
        assert_eq!(
            scoring_window_start(day(2025, 1, 3), 7),
            day(2024, 12, 1)
        );
    }

    #[test]
    fn distinct_ids_dedup() {
        let row = |id: &str| ScoreBackupRow {
            forecast_id: id.to_string(),
            user_id: "u".to_string(),
            variable: "q50".to_string(),
            metric: "rmse".to_string(),
            value: 0.0,
            target_day: day(2024, 4, 1),
        };
        let ids = distinct_ids(&[row("b"), row("a"), row("b")]);
        assert_eq!(ids, vec!["a", "b"]);
    }
}
