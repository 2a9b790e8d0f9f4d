//! Idempotent upsert storage for synced message records.
//!
//! Both backends apply the same merge rules: on an id conflict only the
//! mutable fields (`status`, `error_code`, `error_message`, `sent_at`,
//! `price`) change, and a missing `sent_at` never clears a stored one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smslog_core::{MessageRecord, StatusNotification};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryMessageStore;
pub use postgres::{PgMessageStore, MIGRATOR};

pub const CRATE_NAME: &str = "smslog-storage";

/// Largest batch a single `upsert_batch` call accepts.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("batch of {size} records exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_messages: i64,
    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Writes the whole batch in one transaction and returns the number of
    /// distinct ids applied. Nothing is written if this returns an error.
    async fn upsert_batch(&self, records: &[MessageRecord]) -> Result<usize, StoreError>;

    /// Upserts one webhook status push. Never touches `price`.
    async fn apply_notification(&self, notification: &StatusNotification)
        -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub(crate) fn check_batch_size(size: usize) -> Result<(), StoreError> {
    if size > MAX_BATCH_SIZE {
        return Err(StoreError::BatchTooLarge {
            size,
            limit: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Collapses repeated ids so one statement never touches a row twice.
/// The last occurrence wins; first-seen order is kept.
pub fn collapse_duplicate_ids(records: &[MessageRecord]) -> Vec<&MessageRecord> {
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&MessageRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.get(record.id.as_str()) {
            Some(&idx) => out[idx] = record,
            None => {
                slots.insert(record.id.as_str(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Applies the batch conflict rule to an existing row.
pub fn merge_record(existing: &mut MessageRecord, incoming: &MessageRecord) {
    existing.status = incoming.status.clone();
    existing.error_code = incoming.error_code;
    existing.error_message = incoming.error_message.clone();
    existing.sent_at = incoming.sent_at.or(existing.sent_at);
    existing.price = incoming.price;
}

/// Applies the webhook conflict rule to an existing row.
pub fn merge_notification(existing: &mut MessageRecord, incoming: &StatusNotification) {
    existing.status = incoming.status.clone();
    existing.error_code = incoming.error_code;
    existing.error_message = incoming.error_message.clone();
    existing.sent_at = incoming.sent_at.or(existing.sent_at);
}

/// Row created when a notification arrives before the batch sync saw the message.
pub fn record_from_notification(notification: &StatusNotification) -> MessageRecord {
    MessageRecord {
        id: notification.id.clone(),
        created_at: notification.created_at,
        sent_at: notification.sent_at,
        to_address: notification.to_address.clone(),
        from_address: notification.from_address.clone(),
        status: notification.status.clone(),
        error_code: notification.error_code,
        error_message: notification.error_message.clone(),
        direction: notification.direction.clone(),
        price: 0.0,
        body: notification.body.clone(),
    }
}
