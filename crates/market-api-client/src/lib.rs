use std::time::Duration;

use chrono::{DateTime, Utc};
use market_core::{
    Challenge, MarketError, MarketSession, Quantile, Resource, ScoreRecord, SessionStatus,
    SubmissionMeta,
};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One forecast point as posted to the platform.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastValue {
    pub datetime: String,
    pub value: f64,
}

impl ForecastValue {
    pub fn new(datetime: DateTime<Utc>, value: f64) -> Self {
        Self {
            datetime: datetime.format(TIMESTAMP_FORMAT).to_string(),
            // Six decimals is plenty for physical energy quantities.
            value: (value * 1e6).round() / 1e6,
        }
    }
}

/// Fields patched onto a market session on state transitions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Value,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
}

/// JSON-over-HTTP client for the market platform API. Authenticates with a
/// bearer token from the login endpoint and retries transient transport
/// failures with backoff.
pub struct ApiClient {
    base_url: String,
    client: Client,
    access_token: Option<String>,
    n_retries: u32,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        let n_retries: u32 = std::env::var("N_REQUEST_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            access_token: None,
            n_retries,
        }
    }

    /// Base URL from `RESTAPI_{PROTOCOL,HOST,PORT}`.
    pub fn from_env() -> Result<Self, MarketError> {
        let protocol = std::env::var("RESTAPI_PROTOCOL").unwrap_or_else(|_| "http".to_string());
        let host = std::env::var("RESTAPI_HOST")
            .map_err(|_| MarketError::Validation("RESTAPI_HOST is not set".to_string()))?;
        let port = std::env::var("RESTAPI_PORT").unwrap_or_default();
        let base_url = if port.is_empty() {
            format!("{protocol}://{host}/api/v1")
        } else {
            format!("{protocol}://{host}:{port}/api/v1")
        };
        Ok(Self::new(base_url))
    }

    /// Obtain a bearer token. Fatal for the caller when it fails; nothing
    /// works without it.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), MarketError> {
        debug!(email, "Logging in");
        let payload = json!({ "email": email, "password": password });
        let response = self
            .client
            .post(format!("{}/token", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| MarketError::Login(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| MarketError::Login(e.to_string()))?;
                self.access_token = Some(body.access);
                Ok(())
            }
            StatusCode::INTERNAL_SERVER_ERROR => Err(MarketError::InternalServer(
                "login failed with internal server error".to_string(),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(%status, body, "Login failed");
                Err(MarketError::Login(format!("status {status}: {body}")))
            }
        }
    }

    pub fn has_token(&self) -> bool {
        self.access_token.is_some()
    }

    fn token(&self) -> Result<&str, MarketError> {
        self.access_token.as_deref().ok_or_else(|| {
            MarketError::Api("Access token is not yet available. Login first.".to_string())
        })
    }

    /// Shared request template: bounded retries on transport failures, then
    /// status mapping (2xx ok, 500 internal-server-error, other statuses as
    /// typed errors carrying the server body).
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, MarketError> {
        let token = self.token()?.to_string();
        let url = format!("{}{}", self.base_url, path);

        let mut last_error = String::new();
        for attempt in 0..self.n_retries.max(1) {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        %url,
                        attempt = attempt + 1,
                        retries = self.n_retries,
                        error = %last_error,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(1 << attempt.min(4))).await;
                    continue;
                }
            };

            return match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let envelope: Envelope = response
                        .json()
                        .await
                        .map_err(|e| MarketError::Api(e.to_string()))?;
                    Ok(envelope.data)
                }
                StatusCode::INTERNAL_SERVER_ERROR => {
                    error!(%url, "Internal server error");
                    Err(MarketError::InternalServer(url.clone()))
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    error!(%url, %status, body, "Request failed");
                    Err(MarketError::Api(format!("{url}: status {status}: {body}")))
                }
            };
        }
        Err(MarketError::Api(format!(
            "{url}: transport failure after {} retries: {last_error}",
            self.n_retries
        )))
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, MarketError> {
        serde_json::from_value(value).map_err(|e| MarketError::Api(e.to_string()))
    }

    pub async fn list_market_sessions(
        &self,
        status: Option<SessionStatus>,
        latest_only: bool,
    ) -> Result<Vec<MarketSession>, MarketError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if latest_only {
            query.push(("latest_only", "true".to_string()));
        }
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        let data = self
            .request(Method::GET, "/market/session", &query, None)
            .await?;
        Self::parse(data)
    }

    /// Latest session, optionally restricted by status. Fails with
    /// *no-market-session* when none exists.
    pub async fn list_last_session(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<MarketSession, MarketError> {
        let sessions = self.list_market_sessions(status, true).await?;
        sessions.into_iter().next().ok_or_else(|| {
            MarketError::NoMarketSession("No market sessions available.".to_string())
        })
    }

    pub async fn create_market_session(
        &self,
        gate_closure: Option<DateTime<Utc>>,
    ) -> Result<MarketSession, MarketError> {
        let payload = json!({
            "status": SessionStatus::Open.as_str(),
            "gate_closure": gate_closure.map(|ts| ts.format(TIMESTAMP_FORMAT).to_string()),
        });
        let data = self
            .request(Method::POST, "/market/session", &[], Some(&payload))
            .await?;
        Self::parse(data)
    }

    pub async fn update_market_session(
        &self,
        session_id: i64,
        update: &SessionUpdate,
    ) -> Result<(), MarketError> {
        let payload = serde_json::to_value(update).map_err(|e| MarketError::Api(e.to_string()))?;
        self.request(
            Method::PATCH,
            &format!("/market/session/{session_id}"),
            &[],
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    pub async fn list_challenges(
        &self,
        session_id: Option<i64>,
        resource_id: Option<&str>,
    ) -> Result<Vec<Challenge>, MarketError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(session_id) = session_id {
            query.push(("market_session", session_id.to_string()));
        }
        if let Some(resource_id) = resource_id {
            query.push(("resource", resource_id.to_string()));
        }
        let data = self
            .request(Method::GET, "/market/challenge", &query, None)
            .await?;
        Self::parse(data)
    }

    pub async fn list_challenge_submissions(
        &self,
        challenge_id: &str,
    ) -> Result<Vec<SubmissionMeta>, MarketError> {
        let query = [("challenge", challenge_id.to_string())];
        let data = self
            .request(Method::GET, "/market/challenge/submission", &query, None)
            .await?;
        Self::parse(data)
    }

    pub async fn list_user_resources(&self) -> Result<Vec<Resource>, MarketError> {
        let data = self
            .request(Method::GET, "/user/resource", &[], None)
            .await?;
        Self::parse(data)
    }

    /// Post one ensemble's forecast vector for one quantile.
    pub async fn post_ensemble_forecasts(
        &self,
        challenge_id: &str,
        model_id: &str,
        variable: Quantile,
        forecasts: &[ForecastValue],
    ) -> Result<(), MarketError> {
        let payload = json!({
            "model": model_id,
            "variable": variable.as_str(),
            "forecasts": forecasts,
        });
        self.request(
            Method::POST,
            &format!("/market/challenge/ensemble-forecasts/{challenge_id}"),
            &[],
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    pub async fn post_submission_scores(
        &self,
        challenge_id: &str,
        scores: &[ScoreRecord],
    ) -> Result<(), MarketError> {
        self.post_scores(challenge_id, "submission", "submission-scores", scores)
            .await
    }

    pub async fn post_ensemble_scores(
        &self,
        challenge_id: &str,
        scores: &[ScoreRecord],
    ) -> Result<(), MarketError> {
        self.post_scores(challenge_id, "ensemble", "ensemble-scores", scores)
            .await
    }

    async fn post_scores(
        &self,
        challenge_id: &str,
        id_key: &str,
        segment: &str,
        scores: &[ScoreRecord],
    ) -> Result<(), MarketError> {
        let payload: Value = scores
            .iter()
            .map(|s| {
                json!({
                    id_key: s.forecast_id,
                    "metric": s.metric.as_str(),
                    "value": s.value,
                })
            })
            .collect();
        self.request(
            Method::POST,
            &format!("/market/challenge/{segment}/{challenge_id}"),
            &[],
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    /// Users that maintain continuous forecasts covering the given window.
    pub async fn list_users_with_continuous_forecasts(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, MarketError> {
        let query = [
            ("resource", resource_id.to_string()),
            ("start_date", start.format(TIMESTAMP_FORMAT).to_string()),
            ("end_date", end.format(TIMESTAMP_FORMAT).to_string()),
        ];
        let data = self
            .request(
                Method::GET,
                "/market/continuous-forecasts/users",
                &query,
                None,
            )
            .await?;
        Self::parse(data)
    }

    /// Submit a continuous forecast on a user's behalf. Returns the created
    /// submission id.
    pub async fn post_continuous_forecast(
        &self,
        challenge_id: &str,
        user_id: &str,
        variable: Quantile,
        forecasts: &[ForecastValue],
    ) -> Result<String, MarketError> {
        let payload = json!({
            "user_id": user_id,
            "variable": variable.as_str(),
            "forecasts": forecasts,
        });
        let data = self
            .request(
                Method::POST,
                &format!("/market/continuous-forecasts/submission/{challenge_id}"),
                &[],
                Some(&payload),
            )
            .await?;
        #[derive(Deserialize)]
        struct Created {
            submission_id: String,
        }
        Self::parse::<Created>(data).map(|c| c.submission_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn forecast_values_use_the_wire_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 2, 10, 15, 0).unwrap();
        let value = ForecastValue::new(ts, 12.3456789);
        assert_eq!(value.datetime, "2024-05-02T10:15:00Z");
        assert_eq!(value.value, 12.345679);
    }

    #[tokio::test]
    async fn requests_before_login_fail() {
        let client = ApiClient::new("http://localhost:1".to_string());
        let err = client.list_user_resources().await.unwrap_err();
        assert!(matches!(err, MarketError::Api(_)));
        assert!(!client.has_token());
    }

    #[test]
    fn session_update_skips_unset_fields() {
        let update = SessionUpdate {
            status: Some(SessionStatus::Running),
            ..SessionUpdate::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, serde_json::json!({ "status": "running" }));
    }
}
