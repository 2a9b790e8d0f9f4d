//! Core message record and sync-run types for smslog.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smslog-core";

/// Upper bound on stored message body length, in characters.
pub const MAX_BODY_CHARS: usize = 500;

/// Lifecycle state reported upstream, always held lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageStatus {
    Queued,
    Accepted,
    Sending,
    Sent,
    Delivered,
    Failed,
    Undelivered,
    Receiving,
    Received,
    Other(String),
}

impl MessageStatus {
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "queued" => Self::Queued,
            "accepted" => Self::Accepted,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            "undelivered" => Self::Undelivered,
            "receiving" => Self::Receiving,
            "received" => Self::Received,
            "" => Self::Other("unknown".to_string()),
            _ => Self::Other(lowered),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Accepted => "accepted",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Undelivered => "undelivered",
            Self::Receiving => "receiving",
            Self::Received => "received",
            Self::Other(value) => value.as_str(),
        }
    }

    /// True once the message has left the queue for good (sent or terminal).
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Delivered | Self::Failed | Self::Undelivered | Self::Received
        )
    }
}

impl From<String> for MessageStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<MessageStatus> for String {
    fn from(value: MessageStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted message row, keyed by the upstream message id.
///
/// `created_at`, the addresses, `direction` and `body` are fixed once a row
/// exists. `status`, `error_code`, `error_message`, `sent_at` and `price` are
/// merged on every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub to_address: Option<String>,
    pub from_address: Option<String>,
    pub status: MessageStatus,
    pub error_code: Option<i32>,
    pub error_message: Option<String>,
    pub direction: Option<String>,
    pub price: f64,
    pub body: Option<String>,
}

/// Single status push received from the delivery-receipt webhook.
///
/// Shares the upsert path with batch sync but never carries a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub to_address: Option<String>,
    pub from_address: Option<String>,
    pub error_code: Option<i32>,
    pub error_message: Option<String>,
    pub direction: Option<String>,
    pub body: Option<String>,
}

/// Lookback window requested for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "lowercase")]
pub enum SyncWindow {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Default for SyncWindow {
    fn default() -> Self {
        Self::Hours(24)
    }
}

impl SyncWindow {
    pub fn duration(&self) -> Duration {
        match *self {
            Self::Minutes(n) => Duration::minutes(i64::from(n)),
            Self::Hours(n) => Duration::hours(i64::from(n)),
            Self::Days(n) => Duration::days(i64::from(n)),
        }
    }

    /// Exact lower bound on `created_at` for records kept by the run.
    ///
    /// `None` when the window reaches past the earliest representable date.
    pub fn start_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.duration())
    }

    /// Day-granularity date sent to the remote filter; always at or before the boundary.
    pub fn api_filter_date(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        self.start_boundary(now).map(|boundary| boundary.date_naive())
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minutes(n) => write!(f, "{n} minute(s)"),
            Self::Hours(n) => write!(f, "{n} hour(s)"),
            Self::Days(n) => write!(f, "{n} day(s)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Synchronous,
    Queued,
}

impl SyncMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Some(Self::Synchronous),
            "queued" | "queue" => Some(Self::Queued),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Queued => "queued",
        }
    }
}

/// Operator-visible counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub pages_fetched: u64,
    pub records_fetched: u64,
    pub records_saved: u64,
    pub records_skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Source,
    Storage,
}

/// Why a run ended in [`SyncStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Ids of the batch that could not be written, for operator follow-up.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_ids: Vec<String>,
}

impl SyncFailure {
    pub fn source(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Source,
            message: message.into(),
            batch_ids: Vec::new(),
        }
    }

    pub fn storage(message: impl Into<String>, batch_ids: Vec<String>) -> Self {
        Self {
            kind: FailureKind::Storage,
            message: message.into(),
            batch_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub window: SyncWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub progress: SyncProgress,
    pub limit_hit: bool,
    pub failure: Option<SyncFailure>,
}

impl SyncReport {
    pub fn is_completed(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    pub fn summary(&self) -> String {
        let p = &self.progress;
        let mut line = format!(
            "{}: fetched {} messages from {} pages, saved {}, skipped {}",
            match self.status {
                SyncStatus::Completed => "sync complete",
                SyncStatus::Cancelled => "sync cancelled",
                SyncStatus::Failed => "sync failed",
            },
            p.records_fetched,
            p.pages_fetched,
            p.records_saved,
            p.records_skipped
        );
        if self.limit_hit {
            line.push_str(
                "; page limit reached, more messages may exist (sync a smaller window)",
            );
        }
        if let Some(failure) = &self.failure {
            line.push_str(&format!("; {:?} error: {}", failure.kind, failure.message));
            if !failure.batch_ids.is_empty() {
                line.push_str(&format!(" ({} ids in failed batch)", failure.batch_ids.len()));
            }
        }
        line
    }
}
