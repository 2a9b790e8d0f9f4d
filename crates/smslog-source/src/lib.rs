//! Remote message source contract + LaML (Twilio-compatible) REST client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "smslog-source";

pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Message exactly as the remote API returns it. Every field may be absent or malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub date_sent: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_code: Option<JsonValue>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub price: Option<JsonValue>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub next_page_uri: Option<String>,
}

impl MessagePage {
    /// Continuation token, treating an empty string like an absent one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_page_uri.as_deref().filter(|uri| !uri.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// First page: day-granularity `DateSent>` filter.
    SentAfter(NaiveDate),
    /// Follow-up page: the remote `next_page_uri`, used verbatim.
    Continue(String),
}

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid continuation token {0:?}")]
    InvalidCursor(String),
    #[error("page failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<SourceError>,
    },
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } | Self::InvalidCursor(_) | Self::Exhausted { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Remote paginated message feed.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetches one page. Retries internally; an error means the page's budget is spent.
    async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, SourceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
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

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub every_records: usize,
    pub pause: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            every_records: 50,
            pause: Duration::from_millis(100),
        }
    }
}

/// Sleeps `pause` each time the running record count crosses a multiple of `every_records`.
#[derive(Debug)]
pub struct RecordThrottle {
    config: ThrottleConfig,
    seen: Mutex<usize>,
}

impl RecordThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            seen: Mutex::new(0),
        }
    }

    /// Returns how long the caller was paused.
    pub async fn record(&self, count: usize) -> Duration {
        if self.config.every_records == 0 || count == 0 {
            return Duration::ZERO;
        }
        let crossings = {
            let mut seen = self.seen.lock().await;
            let before = *seen / self.config.every_records;
            *seen += count;
            *seen / self.config.every_records - before
        };
        let pause = self.config.pause.saturating_mul(crossings as u32);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        pause
    }
}

#[derive(Debug, Clone)]
pub struct LamlClientConfig {
    /// Space host, e.g. `example.signalwire.com`. An explicit scheme is kept.
    pub space_url: String,
    pub project_id: String,
    pub auth_token: String,
    pub timeout: Duration,
    pub page_size: u32,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub throttle: ThrottleConfig,
}

impl LamlClientConfig {
    pub fn new(
        space_url: impl Into<String>,
        project_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            space_url: space_url.into(),
            project_id: project_id.into(),
            auth_token: auth_token.into(),
            timeout: Duration::from_secs(120),
            page_size: DEFAULT_PAGE_SIZE,
            user_agent: Some(format!("smslog/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// First message returned by a connection check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSample {
    pub sid: Option<String>,
    pub status: Option<String>,
    pub date_created: Option<String>,
}

#[derive(Debug)]
pub struct LamlClient {
    client: reqwest::Client,
    origin: String,
    messages_url: String,
    project_id: String,
    auth_token: String,
    page_size: u32,
    backoff: BackoffPolicy,
    throttle: RecordThrottle,
}

/// Normalizes a configured space into `scheme://host`, defaulting to https.
pub fn space_origin(space_url: &str) -> String {
    let trimmed = space_url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

impl LamlClient {
    pub fn new(config: LamlClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        let origin = space_origin(&config.space_url);
        let messages_url = format!(
            "{origin}/api/laml/2010-04-01/Accounts/{}/Messages.json",
            config.project_id
        );

        Ok(Self {
            client,
            origin,
            messages_url,
            project_id: config.project_id,
            auth_token: config.auth_token,
            page_size: config.page_size.max(1),
            backoff: config.backoff,
            throttle: RecordThrottle::new(config.throttle),
        })
    }

    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }

    /// Resolves a continuation token against the space origin without touching its query.
    pub fn continuation_url(&self, next_page_uri: &str) -> Result<String, SourceError> {
        let uri = next_page_uri.trim();
        if uri.is_empty() {
            return Err(SourceError::InvalidCursor(next_page_uri.to_string()));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(uri.to_string());
        }
        if uri.starts_with('/') {
            Ok(format!("{}{uri}", self.origin))
        } else {
            Ok(format!("{}/{uri}", self.origin))
        }
    }

    /// Fetches a tiny unfiltered page to prove credentials and reachability.
    pub async fn check_connection(&self) -> Result<Option<ConnectionSample>, SourceError> {
        let query = [("PageSize", "5".to_string())];
        let page = self.fetch_with_retry(&self.messages_url, &query).await?;
        Ok(page.messages.into_iter().next().map(|msg| ConnectionSample {
            sid: msg.sid,
            status: msg.status,
            date_created: msg.date_created,
        }))
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<MessagePage, SourceError> {
        let mut request = self
            .client
            .get(url)
            .basic_auth(&self.project_id, Some(&self.auth_token));
        if !query.is_empty() {
            request = request.query(query);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice::<MessagePage>(&body).map_err(|err| SourceError::Decode {
            url: final_url,
            message: err.to_string(),
        })
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<MessagePage, SourceError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.fetch_once(url, query).await {
                Ok(page) => return Ok(page),
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    if attempt >= max_attempts {
                        return Err(SourceError::Exhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, max_attempts, ?delay, error = %err, "page fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl MessageSource for LamlClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, SourceError> {
        let (url, query) = match request {
            PageRequest::SentAfter(date) => (
                self.messages_url.clone(),
                vec![
                    ("PageSize", self.page_size.to_string()),
                    ("DateSent>", date.format("%Y-%m-%d").to_string()),
                ],
            ),
            PageRequest::Continue(uri) => (self.continuation_url(uri)?, Vec::new()),
        };

        let span = info_span!("page_fetch", url = %url);
        let page = self.fetch_with_retry(&url, &query).instrument(span).await?;
        debug!(
            messages = page.messages.len(),
            has_next = page.next_cursor().is_some(),
            "fetched message page"
        );
        self.throttle.record(page.messages.len()).await;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MESSAGES_PATH: &str = "/api/laml/2010-04-01/Accounts/PJ123/Messages.json";

    fn test_client(server_uri: &str) -> LamlClient {
        let mut config = LamlClientConfig::new(server_uri, "PJ123", "secret");
        config.timeout = Duration::from_millis(300);
        config.backoff = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        };
        config.throttle = ThrottleConfig {
            every_records: 50,
            pause: Duration::ZERO,
        };
        LamlClient::new(config).expect("client")
    }

    #[test]
    fn backoff_is_fixed_by_default() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));

        let capped = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(capped.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(capped.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn space_origin_defaults_to_https() {
        assert_eq!(space_origin("acme.signalwire.com/"), "https://acme.signalwire.com");
        assert_eq!(space_origin("http://127.0.0.1:9000"), "http://127.0.0.1:9000");
    }

    #[test]
    fn continuation_is_resolved_against_origin_verbatim() {
        let client = test_client("https://acme.signalwire.com");
        let uri = "/api/laml/2010-04-01/Accounts/PJ123/Messages.json?PageSize=50&Page=1&PageToken=PA9";
        assert_eq!(
            client.continuation_url(uri).unwrap(),
            format!("https://acme.signalwire.com{uri}")
        );
        assert!(matches!(
            client.continuation_url("  "),
            Err(SourceError::InvalidCursor(_))
        ));
    }

    #[tokio::test]
    async fn throttle_pauses_once_per_crossing() {
        let throttle = RecordThrottle::new(ThrottleConfig {
            every_records: 50,
            pause: Duration::from_millis(1),
        });
        assert_eq!(throttle.record(30).await, Duration::ZERO);
        assert_eq!(throttle.record(30).await, Duration::from_millis(1));
        assert_eq!(throttle.record(100).await, Duration::from_millis(2));
    }

    #[tokio::test]
    async fn first_page_sends_day_filter_and_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .and(query_param("DateSent>", "2026-03-01"))
            .and(query_param("PageSize", "50"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"sid": "SM1", "status": "delivered", "price": "-0.0075"}],
                "next_page_uri": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let page = client.fetch_page(&PageRequest::SentAfter(date)).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].sid.as_deref(), Some("SM1"));
        assert!(page.next_cursor().is_none());
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_the_budget_is_spent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let err = client.fetch_page(&PageRequest::SentAfter(date)).await.unwrap_err();
        assert!(matches!(err, SourceError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn timeout_then_success_recovers_the_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"messages": []})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"sid": "SM2"}],
                "next_page_uri": "/next"
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let page = client.fetch_page(&PageRequest::SentAfter(date)).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.next_cursor(), Some("/next"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.check_connection().await.unwrap_err();
        assert!(matches!(err, SourceError::HttpStatus { status: 401, .. }));
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error_not_an_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MESSAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let err = client.fetch_page(&PageRequest::SentAfter(date)).await.unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
    }
}
