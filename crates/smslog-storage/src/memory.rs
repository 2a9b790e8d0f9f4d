use std::collections::BTreeMap;

use async_trait::async_trait;
use smslog_core::{MessageRecord, StatusNotification};
use tokio::sync::Mutex;

use crate::{
    check_batch_size, collapse_duplicate_ids, merge_notification, merge_record,
    record_from_notification, MessageStore, StoreError, StoreStats,
};

/// In-process store with the same merge semantics as Postgres.
///
/// Backs `--dry-run` syncs and the orchestrator tests.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    rows: Mutex<BTreeMap<String, MessageRecord>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// All rows ordered by id.
    pub async fn snapshot(&self) -> Vec<MessageRecord> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn upsert_batch(&self, records: &[MessageRecord]) -> Result<usize, StoreError> {
        check_batch_size(records.len())?;
        let rows = collapse_duplicate_ids(records);
        let mut table = self.rows.lock().await;
        for incoming in &rows {
            match table.get_mut(&incoming.id) {
                Some(existing) => merge_record(existing, incoming),
                None => {
                    table.insert(incoming.id.clone(), (*incoming).clone());
                }
            }
        }
        Ok(rows.len())
    }

    async fn apply_notification(
        &self,
        notification: &StatusNotification,
    ) -> Result<(), StoreError> {
        let mut table = self.rows.lock().await;
        match table.get_mut(&notification.id) {
            Some(existing) => merge_notification(existing, notification),
            None => {
                table.insert(
                    notification.id.clone(),
                    record_from_notification(notification),
                );
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.rows.lock().await.get(id).cloned())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let table = self.rows.lock().await;
        Ok(StoreStats {
            total_messages: table.len() as i64,
            oldest_message: table.values().map(|r| r.created_at).min(),
            newest_message: table.values().map(|r| r.created_at).max(),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
