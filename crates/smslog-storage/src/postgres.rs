use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smslog_core::{MessageRecord, MessageStatus, StatusNotification};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{check_batch_size, collapse_duplicate_ids, MessageStore, StoreError, StoreStats};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INSERT_COLUMNS: &str = "INSERT INTO sms_logs \
    (id, date_created, date_sent, to_number, from_number, status, \
     error_code, error_message, direction, price, body) ";

const BATCH_CONFLICT: &str = " ON CONFLICT (id) DO UPDATE SET \
    status = EXCLUDED.status, \
    error_code = EXCLUDED.error_code, \
    error_message = EXCLUDED.error_message, \
    date_sent = COALESCE(EXCLUDED.date_sent, sms_logs.date_sent), \
    price = EXCLUDED.price";

const NOTIFICATION_CONFLICT: &str = " ON CONFLICT (id) DO UPDATE SET \
    status = EXCLUDED.status, \
    error_code = EXCLUDED.error_code, \
    error_message = EXCLUDED.error_message, \
    date_sent = COALESCE(EXCLUDED.date_sent, sms_logs.date_sent)";

/// Postgres-backed store. Construct once at process start and [`close`](Self::close) at shutdown.
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("sms_logs migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn push_record_values<'args>(
    builder: &mut QueryBuilder<'args, Postgres>,
    rows: impl IntoIterator<Item = MessageRecord>,
) {
    builder.push_values(rows, |mut b, r| {
        b.push_bind(r.id)
            .push_bind(r.created_at)
            .push_bind(r.sent_at)
            .push_bind(r.to_address)
            .push_bind(r.from_address)
            .push_bind(r.status.as_str().to_string())
            .push_bind(r.error_code)
            .push_bind(r.error_message)
            .push_bind(r.direction)
            .push_bind(r.price)
            .push_bind(r.body);
    });
}

fn record_from_row(row: &PgRow) -> Result<MessageRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("date_created")?,
        sent_at: row.try_get("date_sent")?,
        to_address: row.try_get("to_number")?,
        from_address: row.try_get("from_number")?,
        status: MessageStatus::parse(&status),
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        direction: row.try_get("direction")?,
        price: row.try_get("price")?,
        body: row.try_get("body")?,
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn upsert_batch(&self, records: &[MessageRecord]) -> Result<usize, StoreError> {
        check_batch_size(records.len())?;
        let rows = collapse_duplicate_ids(records);
        if rows.is_empty() {
            return Ok(0);
        }
        let applied = rows.len();

        let mut builder = QueryBuilder::<Postgres>::new(INSERT_COLUMNS);
        push_record_values(&mut builder, rows.into_iter().cloned());
        builder.push(BATCH_CONFLICT);

        // Dropping the transaction on error rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(applied, "upserted batch into sms_logs");
        Ok(applied)
    }

    async fn apply_notification(
        &self,
        notification: &StatusNotification,
    ) -> Result<(), StoreError> {
        let row = crate::record_from_notification(notification);
        let mut builder = QueryBuilder::<Postgres>::new(INSERT_COLUMNS);
        push_record_values(&mut builder, std::iter::once(row));
        builder.push(NOTIFICATION_CONFLICT);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, date_created, date_sent, to_number, from_number, status,
                   error_code, error_message, direction, price, body
              FROM sms_logs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   MIN(date_created) AS oldest,
                   MAX(date_created) AS newest
              FROM sms_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            total_messages: row.try_get("total")?,
            oldest_message: row.try_get::<Option<DateTime<Utc>>, _>("oldest")?,
            newest_message: row.try_get::<Option<DateTime<Utc>>, _>("newest")?,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Unavailable("connection pool closed".into()));
        }
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
