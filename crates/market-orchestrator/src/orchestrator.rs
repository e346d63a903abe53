use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, Utc};
use kpi_engine::{monthly_records, DailyScore, KpiEngine, MonthlyKpiRecord};
use market_api_client::{ApiClient, ForecastValue, SessionUpdate};
use market_core::{
    Challenge, MarketConfig, MarketError, MarketSession, Quantile, ScoreMetric, SessionStatus,
    Track,
};
use market_db::{store_session_snapshot, MarketDb, ScoreRow, SubmissionRow};
use market_frame::{date_range, TimeSeries};
use market_loader::{DataLoader, SellerResource, SellersForecasts};
use skill_score::{compute_forecasters_skill_scores, ForecastIdKind};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runner::{forecast_buyer, BuyerOutput};
use crate::session::{gate_closure_utc, SessionState};
use crate::stats::log_session_stats;

/// Everything fetched for the latest closed session.
#[derive(Debug)]
pub struct SessionInfo {
    pub session: MarketSession,
    pub challenges: Vec<Challenge>,
    pub buyers_resources: Vec<String>,
    pub sellers_resources: Vec<SellerResource>,
}

/// Aggregate outcome of a scoring run, mapped onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringOutcome {
    AllOk,
    Partial,
    AllFailed,
}

impl ScoringOutcome {
    pub fn from_statuses(statuses: &[bool]) -> Self {
        let ok = statuses.iter().filter(|s| **s).count();
        if ok == statuses.len() {
            ScoringOutcome::AllOk
        } else if ok > 0 {
            ScoringOutcome::Partial
        } else {
            ScoringOutcome::AllFailed
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ScoringOutcome::AllOk => 0,
            ScoringOutcome::Partial => 1,
            ScoringOutcome::AllFailed => 2,
        }
    }
}

/// The calendar-month aggregation window: `(year, month, start, end)`.
/// Explicit year/month win over the `previous_month` flag.
pub fn month_window(
    today: NaiveDate,
    previous_month: bool,
    year: Option<i32>,
    month: Option<u32>,
) -> Result<(i32, u32, NaiveDate, NaiveDate), MarketError> {
    let start = match (year, month) {
        (Some(year), Some(month)) => NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| MarketError::Validation(format!("invalid month {year}-{month}")))?,
        _ if previous_month => {
            let first_of_month = today.with_day(1).unwrap_or(today);
            let last_of_previous = first_of_month.pred_opt().unwrap_or(first_of_month);
            last_of_previous.with_day(1).unwrap_or(last_of_previous)
        }
        _ => today.with_day(1).unwrap_or(today),
    };
    let end = (start + Months::new(1)).pred_opt().unwrap_or(start);
    Ok((start.year(), start.month(), start, end))
}

/// Drives the session lifecycle: open, run (per-resource parallel
/// forecasting), score, aggregate.
pub struct MarketOrchestrator {
    api: ApiClient,
    db: MarketDb,
    config: MarketConfig,
    sessions_dir: PathBuf,
    scores_dir: PathBuf,
}

impl MarketOrchestrator {
    pub fn new(api: ApiClient, db: MarketDb, config: MarketConfig, files_dir: PathBuf) -> Self {
        Self {
            api,
            db,
            config,
            sessions_dir: files_dir.join("sessions"),
            scores_dir: files_dir.join("scores"),
        }
    }

    /// Build from the environment: API login plus a verified database
    /// connection. Both are fatal when they fail; nothing can run without
    /// them.
    pub async fn connect() -> Result<Self, MarketError> {
        let mut api = ApiClient::from_env()?;
        let email = std::env::var("MARKET_EMAIL")
            .map_err(|_| MarketError::Validation("MARKET_EMAIL is not set".to_string()))?;
        let password = std::env::var("MARKET_PASSWORD")
            .map_err(|_| MarketError::Validation("MARKET_PASSWORD is not set".to_string()))?;
        api.login(&email, &password).await?;

        let db = MarketDb::connect(&MarketDb::url_from_env()?).await?;
        let config = MarketConfig::from_env()?;
        let files_dir = std::env::var("MARKET_FILES_DIR").unwrap_or_else(|_| "files".to_string());

        Ok(Self::new(api, db, config, PathBuf::from(files_dir)))
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Open the next market session at the coming gate-closure instant.
    /// With `force_new`, the current latest session is finished first.
    pub async fn open_session(
        &self,
        gate_closure_hour: u32,
        force_new: bool,
    ) -> Result<(), MarketError> {
        if force_new {
            warn!("Forcing a new market session ...");
            match self.api.list_last_session(None).await {
                Ok(current) => {
                    debug!(session = current.id, "Finishing current session");
                    self.finish(current.id).await?;
                }
                Err(MarketError::NoMarketSession(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let gate_closure =
            gate_closure_utc(Utc::now(), gate_closure_hour, self.config.gate_closure_tz)?;
        let session = self.api.create_market_session(Some(gate_closure)).await?;
        info!(
            session = session.id,
            %gate_closure,
            "Opened market session"
        );
        Ok(())
    }

    /// Close the current `open` session, stopping submissions.
    pub async fn close_session(&self) -> Result<(), MarketError> {
        let open = self.api.list_last_session(Some(SessionStatus::Open)).await?;
        let mut state = SessionState::new(open.status);
        state.transition(SessionStatus::Closed)?;
        self.api
            .update_market_session(
                open.id,
                &SessionUpdate {
                    status: Some(SessionStatus::Closed),
                    close_ts: Some(Utc::now()),
                    ..SessionUpdate::default()
                },
            )
            .await
    }

    /// Finish the latest session (or the latest `running` session). Useful
    /// for sessions stuck in earlier states.
    pub async fn finish_session(&self, is_running: bool) -> Result<(), MarketError> {
        let status = is_running.then_some(SessionStatus::Running);
        match self.api.list_last_session(status).await {
            Ok(session) if session.status != SessionStatus::Finished => {
                self.finish(session.id).await
            }
            Ok(_) => Ok(()),
            Err(MarketError::NoMarketSession(msg)) => {
                warn!(%msg, "Nothing to finish");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn finish(&self, session_id: i64) -> Result<(), MarketError> {
        self.api
            .update_market_session(
                session_id,
                &SessionUpdate {
                    status: Some(SessionStatus::Finished),
                    finish_ts: Some(Utc::now()),
                    ..SessionUpdate::default()
                },
            )
            .await
    }

    /// Fetch the latest closed session with its challenges, submissions and
    /// the derived seller participation list.
    pub async fn fetch_session_info(&self) -> Result<SessionInfo, MarketError> {
        info!("Fetching session data ...");
        let session = self
            .api
            .list_last_session(Some(SessionStatus::Closed))
            .await?;

        let mut challenges = self.api.list_challenges(Some(session.id), None).await?;
        let mut sellers_resources = Vec::new();
        for challenge in &mut challenges {
            let submissions = self.api.list_challenge_submissions(&challenge.id).await?;
            for submission in &submissions {
                sellers_resources.push(SellerResource {
                    user: submission.user.clone(),
                    resource_id: challenge.resource.clone(),
                    variable: submission.variable,
                });
            }
            challenge.submission_list = submissions;
        }
        let buyers_resources = challenges.iter().map(|c| c.resource.clone()).collect();

        info!("Fetching session data ... Ok!");
        Ok(SessionInfo {
            session,
            challenges,
            buyers_resources,
            sellers_resources,
        })
    }

    /// Run the latest closed session: fetch inputs, forecast every resource
    /// in parallel, publish the ensemble forecasts and finish the session.
    /// Returns `false` when the session had no challenges to run.
    pub async fn run_session(&self, backup_inputs: bool) -> Result<bool, MarketError> {
        let run_id = Uuid::new_v4();
        let info = self.fetch_session_info().await?;
        let launch_time = Utc::now();
        info!(%run_id, session = info.session.id, %launch_time, "Running session");

        if info.challenges.is_empty() {
            error!(
                "There are no open challenges for this session. Session will \
                 be closed without running the market."
            );
            return Ok(false);
        }

        log_session_stats(info.session.id, &info.challenges);

        let mut state = SessionState::new(info.session.status);
        state.transition(SessionStatus::Running)?;
        self.api
            .update_market_session(
                info.session.id,
                &SessionUpdate {
                    status: Some(SessionStatus::Running),
                    launch_ts: Some(launch_time),
                    ..SessionUpdate::default()
                },
            )
            .await?;

        // Forecast query limiter: the furthest challenge end.
        let forecast_end = info
            .challenges
            .iter()
            .map(|c| c.end_datetime)
            .max()
            .unwrap_or(launch_time);

        let history_start = launch_time - Months::new(1);
        let measurements = self
            .db
            .measurements(&info.buyers_resources, history_start, launch_time)
            .await?;
        let sellers_forecasts = self
            .db
            .sellers_forecasts(&info.sellers_resources, history_start, forecast_end)
            .await?;

        if backup_inputs {
            let snapshot = build_session_snapshot(
                info.session.id,
                &measurements,
                &sellers_forecasts,
                &info.challenges,
                &info.sellers_resources,
            );
            if let Err(err) =
                store_session_snapshot(&self.sessions_dir, info.session.id, &snapshot)
            {
                error!(%err, "Failed to backup session inputs");
            }
        }

        let mut loader =
            DataLoader::new(self.config.clone()).with_session_id(info.session.id);
        loader.load_challenges(&info.challenges)?;
        loader.load_buyer_measurements(&measurements);
        loader.load_forecasters(&info.sellers_resources, &sellers_forecasts)?;

        // Per-resource forecasts are embarrassingly parallel: each worker
        // owns its buyer context and builds its own engine.
        let semaphore = Arc::new(Semaphore::new(self.config.n_jobs));
        let buyers = std::mem::take(&mut loader.buyers_data);
        let mut handles = Vec::with_capacity(buyers.len());
        for (_, buyer) in buyers {
            let semaphore = semaphore.clone();
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                forecast_buyer(buyer, &config)
            }));
        }

        let mut outputs: Vec<BuyerOutput> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(output) => outputs.push(output),
                Err(err) => error!(%err, "Forecast worker panicked"),
            }
        }

        // Publication is sequential after the pool drains; forecasts are
        // small.
        for output in &outputs {
            if output.error {
                warn!(
                    resource = %output.resource_id,
                    "Skipping publication for failed resource forecast"
                );
                continue;
            }
            self.publish_forecasts(output).await;
        }

        state.transition(SessionStatus::Finished)?;
        self.finish(info.session.id).await?;
        info!(%run_id, session = info.session.id, "Session finished");
        Ok(true)
    }

    /// Post every (strategy, quantile) forecast vector for one resource.
    /// Publication failures are logged and counted, never fatal.
    async fn publish_forecasts(&self, output: &BuyerOutput) {
        for (strategy_name, result) in &output.results {
            if result.predictions.is_empty() {
                continue;
            }
            for quantile in result.predictions.quantiles() {
                let forecasts: Vec<ForecastValue> = result
                    .predictions
                    .values_for(quantile)
                    .into_iter()
                    .map(|(ts, value)| ForecastValue::new(ts, value))
                    .collect();
                if let Err(err) = self
                    .api
                    .post_ensemble_forecasts(
                        &output.challenge_id,
                        strategy_name,
                        quantile,
                        &forecasts,
                    )
                    .await
                {
                    error!(
                        strategy = %strategy_name,
                        user = %output.user_id,
                        %err,
                        "Failed to upload forecasts for buyer"
                    );
                }
            }
        }
    }

    /// Relay continuous forecasts: submit on behalf of forecasters that
    /// maintain continuous series but have not submitted all quantiles for
    /// a challenge. Partial coverage is skipped with an error log; the
    /// forecaster is considered again next session.
    pub async fn prepare_continuous_submissions(&self) -> Result<(), MarketError> {
        let info = self.fetch_session_info().await?;

        for challenge in &info.challenges {
            info!(challenge = %challenge.id, "Preparing continuous submissions");
            let expected_leadtimes = date_range(
                challenge.start_datetime,
                challenge.end_datetime,
                self.config.time_resolution(),
            )
            .len();

            let continuous_users = self
                .api
                .list_users_with_continuous_forecasts(
                    &challenge.resource,
                    challenge.start_datetime,
                    challenge.end_datetime,
                )
                .await?;

            // Normal submissions take priority over continuous ones.
            let mut normal_quantiles: HashMap<&str, HashSet<Quantile>> = HashMap::new();
            for submission in &challenge.submission_list {
                if submission.submission_type == market_core::SubmissionKind::Normal {
                    normal_quantiles
                        .entry(submission.user.as_str())
                        .or_default()
                        .insert(submission.variable);
                }
            }
            let fully_submitted: HashSet<&str> = normal_quantiles
                .iter()
                .filter(|(_, quantiles)| quantiles.len() == self.config.quantiles.len())
                .map(|(user, _)| *user)
                .collect();

            for user_id in continuous_users
                .iter()
                .filter(|u| !fully_submitted.contains(u.as_str()))
            {
                let rows = self
                    .db
                    .continuous_forecasts(
                        user_id,
                        &challenge.resource,
                        challenge.start_datetime,
                        challenge.end_datetime,
                    )
                    .await?;
                if rows.is_empty() {
                    continue;
                }

                let mut by_variable: HashMap<Quantile, Vec<ForecastValue>> = HashMap::new();
                for row in &rows {
                    by_variable
                        .entry(row.variable)
                        .or_default()
                        .push(ForecastValue::new(row.datetime, row.value));
                }

                if by_variable.len() != self.config.quantiles.len() {
                    error!(
                        user = %user_id,
                        resource = %challenge.resource,
                        "User has continuous forecasts but not for all \
                         quantiles for this challenge"
                    );
                    continue;
                }
                if by_variable.values().any(|v| v.len() != expected_leadtimes) {
                    error!(
                        user = %user_id,
                        resource = %challenge.resource,
                        "User has continuous forecasts but not for all lead \
                         times for this challenge"
                    );
                    continue;
                }

                for quantile in &self.config.quantiles {
                    let Some(forecasts) = by_variable.get(quantile) else {
                        continue;
                    };
                    match self
                        .api
                        .post_continuous_forecast(&challenge.id, user_id, *quantile, forecasts)
                        .await
                    {
                        Ok(submission_id) => info!(
                            user = %user_id,
                            challenge = %challenge.id,
                            quantile = %quantile,
                            submission_id,
                            "Submitted continuous forecasts on behalf of user"
                        ),
                        Err(err) => error!(
                            user = %user_id,
                            challenge = %challenge.id,
                            quantile = %quantile,
                            %err,
                            "Failed to submit continuous forecasts"
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Score every challenge missing scores in the window. With
    /// `update_scores`, existing scores in the window are backed up and
    /// deleted first so the whole window is recomputed.
    pub async fn calculate_scores(
        &self,
        update_scores: bool,
    ) -> Result<ScoringOutcome, MarketError> {
        let today = Utc::now().date_naive();

        let start_date = if update_scores {
            let (start, n_sub, n_ens) = self
                .db
                .delete_scores_with_backup(
                    today,
                    self.config.score_recalc_grace_days,
                    &self.scores_dir,
                )
                .await?;
            info!(
                %start,
                backed_up_submission_scores = n_sub,
                backed_up_ensemble_scores = n_ens,
                "Score recompute window prepared"
            );
            start
        } else {
            today.with_day(1).unwrap_or(today)
        };

        info!(update = update_scores, %start_date, "Fetching challenges without scores");
        let challenges = self.db.challenges_for_scoring(start_date).await?;
        if challenges.is_empty() {
            warn!(%start_date, "There are no challenges to score since start date");
            return Ok(ScoringOutcome::AllOk);
        }
        info!(n = challenges.len(), "Found challenges for scoring");

        let mut statuses = Vec::with_capacity(challenges.len());
        for challenge in &challenges {
            statuses.push(self.score_challenge(challenge).await);
        }

        Ok(ScoringOutcome::from_statuses(&statuses))
    }

    async fn score_challenge(&self, challenge: &Challenge) -> bool {
        info!(challenge = %challenge.id, resource = %challenge.resource, "Working on challenge");

        let measurements = match self
            .db
            .measurements_by_resource(
                &challenge.resource,
                challenge.start_datetime,
                challenge.end_datetime,
            )
            .await
        {
            Ok(series) => series,
            Err(err) => {
                error!(challenge = %challenge.id, %err, "Failed to query measurements");
                return false;
            }
        };

        // Every expected timestamp must be observed before scoring.
        let expected = date_range(
            challenge.start_datetime,
            challenge.end_datetime,
            self.config.time_resolution(),
        );
        if measurements.is_empty() || expected.iter().any(|ts| measurements.value_at(*ts).is_none())
        {
            error!(
                challenge = %challenge.id,
                resource = %challenge.resource,
                "Failed challenge due to insufficient measurements samples"
            );
            return false;
        }

        let submissions = match self.api.list_challenge_submissions(&challenge.id).await {
            Ok(list) => list,
            Err(err) => {
                error!(challenge = %challenge.id, %err, "Failed to list submissions");
                return false;
            }
        };
        let sellers_users: Vec<String> = {
            let unique: HashSet<String> = submissions.iter().map(|s| s.user.clone()).collect();
            unique.into_iter().collect()
        };

        let submission_forecasts = match self
            .db
            .sellers_submissions(&sellers_users, &challenge.id)
            .await
        {
            Ok(forecasts) => forecasts,
            Err(err) => {
                error!(challenge = %challenge.id, %err, "Failed to query submissions");
                return false;
            }
        };
        if submission_forecasts.is_empty() {
            error!(
                challenge = %challenge.id,
                resource = %challenge.resource,
                "Challenge has no forecaster submissions"
            );
            return false;
        }

        let forecaster_scores = compute_forecasters_skill_scores(
            &measurements,
            &submission_forecasts,
            ForecastIdKind::Submission,
        );
        if let Err(err) = self
            .api
            .post_submission_scores(&challenge.id, &forecaster_scores)
            .await
        {
            // Operator attention needed, but the scoring loop continues.
            error!(
                challenge = %challenge.id,
                %err,
                alert = true,
                "Failed to upload submission scores"
            );
        }

        let ensemble_forecasts = match self
            .db
            .ensemble_forecasts(&self.config.ensemble_models, &challenge.id)
            .await
        {
            Ok(forecasts) => forecasts,
            Err(err) => {
                error!(challenge = %challenge.id, %err, "Failed to query ensemble forecasts");
                return false;
            }
        };
        if ensemble_forecasts.is_empty() {
            error!(
                challenge = %challenge.id,
                resource = %challenge.resource,
                "Challenge has no ensemble forecasts"
            );
            return false;
        }

        let ensemble_scores = compute_forecasters_skill_scores(
            &measurements,
            &ensemble_forecasts,
            ForecastIdKind::Ensemble,
        );
        if let Err(err) = self
            .api
            .post_ensemble_scores(&challenge.id, &ensemble_scores)
            .await
        {
            error!(
                challenge = %challenge.id,
                %err,
                alert = true,
                "Failed to upload ensemble scores"
            );
        }

        info!(challenge = %challenge.id, "Working on challenge ... Ok!");
        true
    }

    /// Aggregate monthly scores into rankings, leagues and distributions,
    /// then rewrite the monthly stats per resource.
    pub async fn aggregate_scores(
        &self,
        previous_month: bool,
        year: Option<i32>,
        month: Option<u32>,
    ) -> Result<(), MarketError> {
        let today = Utc::now().date_naive();
        let (year, month, start, end) = month_window(today, previous_month, year, month)?;
        info!(year, month, %start, %end, "Aggregating monthly scores");

        let resources = self.api.list_user_resources().await?;
        let resources: Vec<_> = resources.into_iter().filter(|r| r.is_active).collect();
        info!(n = resources.len(), "Found active resources");

        for resource in &resources {
            info!(resource = %resource.id, "Working on resource");

            let participation = self.db.resource_participation(&resource.id).await?;
            let scores = self
                .db
                .scores_per_resource(
                    &resource.id,
                    start,
                    end,
                    &[ScoreMetric::Rmse, ScoreMetric::Winkler],
                )
                .await?;
            let submissions = self
                .db
                .submissions_by_resource(&resource.id, start, end)
                .await?;
            let scores = filter_partial_submissions(scores, &submissions);

            let seller_forecasts = self
                .db
                .sellers_forecasts_by_resource(&resource.id, start, end)
                .await?;
            let observed = match (
                seller_forecasts.iter().map(|f| f.datetime).min(),
                seller_forecasts.iter().map(|f| f.datetime).max(),
            ) {
                (Some(first), Some(last)) => {
                    self.db
                        .measurements_by_resource(&resource.id, first, last)
                        .await?
                }
                _ => TimeSeries::new(),
            };

            let mut records: Vec<MonthlyKpiRecord> = Vec::new();
            for track in Track::ALL {
                debug!(track = track.as_str(), "Calculating aggregate scores for track");
                let track_scores: Vec<DailyScore> = scores
                    .iter()
                    .filter(|s| {
                        s.metric == track.metric() && s.variable == track.reference_quantile()
                    })
                    .map(|s| DailyScore {
                        user_id: s.user_id.clone(),
                        challenge_id: s.challenge_id.clone(),
                        target_day: s.target_day,
                        value: s.value,
                    })
                    .collect();
                if track_scores.is_empty() {
                    warn!(
                        resource = %resource.id,
                        track = track.as_str(),
                        "No scores for track, skipping"
                    );
                    continue;
                }

                let mut engine = KpiEngine::new(track, self.config.league.clone())
                    .load_scores(track_scores);
                engine.remove_fixed_payment(&participation);
                engine.daily_ranking();
                engine.average_scores();
                engine.average_scores_with_penalty();
                engine.find_forecaster_league();
                engine.calculate_league_thresholds();
                engine.calculate_distributions(&seller_forecasts, &observed);

                records.extend(monthly_records(
                    &engine,
                    year,
                    month,
                    &resource.id,
                    track.metric(),
                    &participation,
                ));
            }

            if records.is_empty() {
                warn!(resource = %resource.id, "No monthly records for resource");
                continue;
            }
            self.db
                .replace_monthly_stats(year, month, &resource.id, &records)
                .await?;
        }

        Ok(())
    }
}

/// Drop score rows of (challenge, forecaster) pairs that did not submit all
/// three quantiles.
fn filter_partial_submissions(scores: Vec<ScoreRow>, submissions: &[SubmissionRow]) -> Vec<ScoreRow> {
    let mut quantiles: HashMap<(String, String), HashSet<Quantile>> = HashMap::new();
    for submission in submissions {
        quantiles
            .entry((submission.challenge_id.clone(), submission.user_id.clone()))
            .or_default()
            .insert(submission.variable);
    }

    let partial: HashSet<(String, String)> = quantiles
        .into_iter()
        .filter(|(_, set)| set.len() != Quantile::ALL.len())
        .map(|(key, _)| key)
        .collect();

    if !partial.is_empty() {
        warn!(
            n = partial.len(),
            "Found partial submissions. These will be removed from scores."
        );
    }

    scores
        .into_iter()
        .filter(|s| !partial.contains(&(s.challenge_id.clone(), s.user_id.clone())))
        .collect()
}

/// The session-input snapshot: four dataset slots keyed by session id.
fn build_session_snapshot(
    session_id: i64,
    measurements: &HashMap<String, TimeSeries>,
    sellers_forecasts: &SellersForecasts,
    challenges: &[Challenge],
    sellers_resources: &[SellerResource],
) -> serde_json::Value {
    let series_json = |series: &TimeSeries| -> serde_json::Value {
        series
            .iter()
            .map(|(ts, value)| {
                serde_json::json!({
                    "datetime": ts.to_rfc3339(),
                    "value": value,
                })
            })
            .collect()
    };

    let measurements_json: serde_json::Map<String, serde_json::Value> = measurements
        .iter()
        .map(|(resource, series)| (resource.clone(), series_json(series)))
        .collect();

    let mut forecasts_json = serde_json::Map::new();
    for (user, by_resource) in sellers_forecasts {
        let mut resource_map = serde_json::Map::new();
        for (resource, by_variable) in by_resource {
            let mut variable_map = serde_json::Map::new();
            for (variable, series) in by_variable {
                variable_map.insert(variable.as_str().to_string(), series_json(series));
            }
            resource_map.insert(resource.clone(), variable_map.into());
        }
        forecasts_json.insert(user.clone(), resource_map.into());
    }

    let resources_json: Vec<serde_json::Value> = sellers_resources
        .iter()
        .map(|r| {
            serde_json::json!({
                "user": r.user,
                "market_session_challenge_resource_id": r.resource_id,
                "variable": r.variable.as_str(),
            })
        })
        .collect();

    serde_json::json!({
        "session_id": session_id.to_string(),
        "buyer_measurements": measurements_json,
        "sellers_forecasts": forecasts_json,
        "challenges": challenges,
        "sellers_resources": resources_json,
    })
}
