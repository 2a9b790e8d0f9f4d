//! Raw remote message -> canonical [`MessageRecord`].
//!
//! Field-level problems never fail a record: timestamps, error codes and
//! prices fall back to safe values. Only a missing id or a creation time
//! before the run's exact boundary drops the record.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use smslog_core::{MessageRecord, MessageStatus, StatusNotification, MAX_BODY_CHARS};
use smslog_source::RawMessage;
use thiserror::Error;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Skip {
    #[error("message has no id")]
    MissingId,
    #[error("message was created before the sync window")]
    BeforeBoundary,
}

/// Parses the remote RFC 2822 form, falling back to ISO-8601. Naive times are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn parse_error_code(value: Option<&JsonValue>) -> Option<i32> {
    match value? {
        JsonValue::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

/// Absolute monetary cost; anything unparsable or non-finite is 0.
pub fn parse_price(value: Option<&JsonValue>) -> f64 {
    let parsed = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(price) if price.is_finite() => price.abs(),
        _ => 0.0,
    }
}

pub fn truncate_body(body: Option<&str>) -> Option<String> {
    body.map(|b| b.chars().take(MAX_BODY_CHARS).collect())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Maps one remote record. `boundary` is the exact start of the requested window.
pub fn normalize(
    raw: &RawMessage,
    boundary: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<MessageRecord, Skip> {
    let id = non_empty(raw.sid.as_deref()).ok_or(Skip::MissingId)?;

    let created_at = raw
        .date_created
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(now);
    if boundary.is_some_and(|start| created_at < start) {
        return Err(Skip::BeforeBoundary);
    }

    let status = MessageStatus::parse(raw.status.as_deref().unwrap_or_default());
    let sent_at = if status.is_finalized() {
        raw.date_sent.as_deref().and_then(parse_timestamp)
    } else {
        None
    };

    Ok(MessageRecord {
        id,
        created_at,
        sent_at,
        to_address: non_empty(raw.to.as_deref()),
        from_address: non_empty(raw.from.as_deref()),
        status,
        error_code: parse_error_code(raw.error_code.as_ref()),
        error_message: non_empty(raw.error_message.as_deref()),
        direction: non_empty(raw.direction.as_deref()),
        price: parse_price(raw.price.as_ref()),
        body: truncate_body(raw.body.as_deref()),
    })
}

fn form_field<'a>(form: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| form.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Maps a delivery-receipt webhook form into a status notification.
pub fn normalize_notification(
    form: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<StatusNotification, Skip> {
    let id = form_field(form, &["MessageSid", "SmsSid"])
        .map(ToString::to_string)
        .ok_or(Skip::MissingId)?;
    let status = MessageStatus::parse(
        form_field(form, &["MessageStatus", "SmsStatus"]).unwrap_or("unknown"),
    );
    let created_at = form_field(form, &["DateCreated"])
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let sent_at = status.is_finalized().then_some(now);
    let error_code = form_field(form, &["ErrorCode", "SmsErrorCode"])
        .and_then(|code| code.parse::<i32>().ok());

    Ok(StatusNotification {
        id,
        status,
        created_at,
        sent_at,
        to_address: form_field(form, &["To"]).map(ToString::to_string),
        from_address: form_field(form, &["From"]).map(ToString::to_string),
        error_code,
        error_message: form_field(form, &["ErrorMessage", "SmsErrorMessage"])
            .map(ToString::to_string),
        direction: Some(
            form_field(form, &["Direction"])
                .unwrap_or("outbound-api")
                .to_string(),
        ),
        body: truncate_body(form_field(form, &["Body", "MessageBody"])),
    })
}
