//! External ads-platform collaborators: OAuth token refresh and the daily
//! spend report, behind traits so the sync orchestrator never names the
//! concrete platform.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info_span, warn};
use tradeboost_core::Micros;

pub const CRATE_NAME: &str = "tradeboost-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff applied to the report call only; the OAuth
/// exchange is a one-shot and never retried.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum AdsError {
    #[error("token refresh failed: {0}")]
    Auth(String),
    #[error("report request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ads api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed report response: {0}")]
    Malformed(String),
}

/// Inclusive calendar date range for a daily cost report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// One daily cost row from the report. `date` is `None` when the platform
/// omitted the segment; such rows are the caller's to skip, not a fetch
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRow {
    pub date: Option<NaiveDate>,
    pub cost_micros: Micros,
    pub currency_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken, AdsError>;
}

#[async_trait]
pub trait SpendReportSource: Send + Sync {
    async fn daily_spend(
        &self,
        access_token: &str,
        customer_id: &str,
        range: &DateRange,
    ) -> Result<Vec<SpendRow>, AdsError>;
}

#[derive(Debug, Clone)]
pub struct GoogleAdsConfig {
    pub developer_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub login_customer_id: Option<String>,
    pub api_base: String,
    pub oauth_token_url: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl GoogleAdsConfig {
    /// `None` when any required credential is absent; the sync layer
    /// surfaces that as an authentication error at use time.
    pub fn from_env() -> Option<Self> {
        let developer_token = std::env::var("GOOGLE_ADS_DEVELOPER_TOKEN").ok()?;
        let client_id = std::env::var("GOOGLE_ADS_CLIENT_ID").ok()?;
        let client_secret = std::env::var("GOOGLE_ADS_CLIENT_SECRET").ok()?;
        Some(Self {
            developer_token,
            client_id,
            client_secret,
            login_customer_id: std::env::var("GOOGLE_ADS_LOGIN_CUSTOMER_ID").ok(),
            api_base: std::env::var("GOOGLE_ADS_API_BASE")
                .unwrap_or_else(|_| "https://googleads.googleapis.com/v17".to_string()),
            oauth_token_url: std::env::var("GOOGLE_OAUTH_TOKEN_URL")
                .unwrap_or_else(|_| "https://oauth2.googleapis.com/token".to_string()),
            timeout: std::env::var("TB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(20)),
            backoff: BackoffPolicy::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Standard refresh-token grant against Google's OAuth endpoint. A single
/// exchange per sync attempt; failure is fatal to the attempt.
#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    client: reqwest::Client,
    config: GoogleAdsConfig,
}

impl GoogleOAuthClient {
    pub fn new(config: GoogleAdsConfig) -> Result<Self, AdsError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl TokenSource for GoogleOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken, AdsError> {
        let response = self
            .client
            .post(&self.config.oauth_token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| AdsError::Auth(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdsError::Auth(format!("status {status}: {body}")));
        }

        let token: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|err| AdsError::Auth(format!("decoding token response: {err}")))?;
        Ok(AccessToken {
            token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchStreamBatch {
    #[serde(default)]
    results: Vec<SearchStreamResult>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchStreamResult {
    #[serde(default)]
    segments: Option<ResultSegments>,
    #[serde(default)]
    metrics: Option<ResultMetrics>,
    #[serde(default)]
    customer: Option<ResultCustomer>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultSegments {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultMetrics {
    #[serde(default)]
    cost_micros: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultCustomer {
    #[serde(default)]
    currency_code: Option<String>,
}

/// Daily cost report via the Google Ads `searchStream` endpoint, with
/// bounded exponential backoff around the call.
#[derive(Debug, Clone)]
pub struct GoogleAdsReportClient {
    client: reqwest::Client,
    config: GoogleAdsConfig,
}

impl GoogleAdsReportClient {
    pub fn new(config: GoogleAdsConfig) -> Result<Self, AdsError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn search_url(&self, customer_id: &str) -> String {
        let customer_id: String = customer_id.chars().filter(|c| c.is_ascii_digit()).collect();
        format!(
            "{}/customers/{}/googleAds:searchStream",
            self.config.api_base.trim_end_matches('/'),
            customer_id
        )
    }
}

fn daily_cost_query(range: &DateRange) -> String {
    format!(
        "SELECT customer.currency_code, segments.date, metrics.cost_micros \
         FROM customer \
         WHERE segments.date BETWEEN '{}' AND '{}'",
        range.from.format("%Y-%m-%d"),
        range.to.format("%Y-%m-%d")
    )
}

/// Int64 fields arrive as JSON strings on the REST surface; tolerate bare
/// numbers as well.
fn micros_from_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn rows_from_batches(batches: Vec<SearchStreamBatch>) -> Vec<SpendRow> {
    batches
        .into_iter()
        .flat_map(|batch| batch.results)
        .map(|result| {
            let date = result
                .segments
                .and_then(|s| s.date)
                .and_then(|raw| raw.parse().ok());
            let cost_micros = result
                .metrics
                .and_then(|m| m.cost_micros)
                .and_then(|v| micros_from_value(&v))
                .unwrap_or(0);
            SpendRow {
                date,
                cost_micros: Micros(cost_micros),
                currency_code: result.customer.and_then(|c| c.currency_code),
            }
        })
        .collect()
}

#[async_trait]
impl SpendReportSource for GoogleAdsReportClient {
    async fn daily_spend(
        &self,
        access_token: &str,
        customer_id: &str,
        range: &DateRange,
    ) -> Result<Vec<SpendRow>, AdsError> {
        let url = self.search_url(customer_id);
        let query = daily_cost_query(range);
        let span = info_span!("ads_daily_spend", customer_id, from = %range.from, to = %range.to);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let mut request = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("developer-token", &self.config.developer_token)
                .json(&serde_json::json!({ "query": query }));
            if let Some(login_customer_id) = &self.config.login_customer_id {
                request = request.header("login-customer-id", login_customer_id);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let batches: Vec<SearchStreamBatch> = response
                            .json()
                            .await
                            .map_err(|err| AdsError::Malformed(err.to_string()))?;
                        return Ok(rows_from_batches(batches));
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying spend report");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(AdsError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(AdsError::Request(err));
                }
            }
        }

        Err(AdsError::Request(
            last_request_error.expect("retry loop captures a request error before exhausting"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn daily_cost_query_bounds_are_inclusive_dates() {
        let range = DateRange {
            from: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
        };
        let query = daily_cost_query(&range);
        assert!(query.contains("BETWEEN '2025-03-01' AND '2025-03-14'"));
        assert!(query.contains("metrics.cost_micros"));
        assert!(query.contains("customer.currency_code"));
    }

    #[test]
    fn report_rows_parse_from_search_stream_body() {
        let body = r#"[
            {"results": [
                {"customer": {"currencyCode": "GBP"},
                 "segments": {"date": "2025-03-01"},
                 "metrics": {"costMicros": "1500000"}},
                {"customer": {"currencyCode": "GBP"},
                 "metrics": {"costMicros": 250000}},
                {"customer": {"currencyCode": "GBP"},
                 "segments": {"date": "2025-03-02"},
                 "metrics": {}}
            ]},
            {"results": []}
        ]"#;
        let batches: Vec<SearchStreamBatch> = serde_json::from_str(body).unwrap();
        let rows = rows_from_batches(batches);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(rows[0].cost_micros, Micros(1_500_000));
        assert_eq!(rows[0].currency_code.as_deref(), Some("GBP"));
        // Missing date survives parsing; the orchestrator decides to skip it.
        assert_eq!(rows[1].date, None);
        assert_eq!(rows[1].cost_micros, Micros(250_000));
        // Missing metrics default to zero spend rather than a parse error.
        assert_eq!(rows[2].cost_micros, Micros(0));
    }

    #[test]
    fn search_url_strips_customer_id_dashes() {
        let config = GoogleAdsConfig {
            developer_token: "dev".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            login_customer_id: None,
            api_base: "https://googleads.googleapis.com/v17/".into(),
            oauth_token_url: "https://oauth2.googleapis.com/token".into(),
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        };
        let client = GoogleAdsReportClient::new(config).unwrap();
        assert_eq!(
            client.search_url("123-456-7890"),
            "https://googleads.googleapis.com/v17/customers/1234567890/googleAds:searchStream"
        );
    }
}
