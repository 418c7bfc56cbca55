use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use fulfillment::{
    error::MarketError,
    model::{ModelId, OutboxEvent},
    storage::OutboxStorage,
};

/// How long a claimed event stays invisible to other relay workers.
const CLAIM_LEASE_SECS: f64 = 30.0;

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    payload: serde_json::Value,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = MarketError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: row.id,
            payload: serde_json::from_value(row.payload)?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// Outbox queue over the `outbox_events` table. Workers claim rows with
/// `FOR UPDATE SKIP LOCKED` and a visibility lease, so several relays can
/// run side by side.
#[derive(Clone)]
pub struct PgOutbox {
    pub pool: PgPool,
}

impl PgOutbox {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStorage for PgOutbox {
    async fn fetch_due(&self, limit: u32) -> Result<Vec<OutboxEvent>, MarketError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            UPDATE outbox_events
            SET next_attempt_at = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE delivered_at IS NULL
                  AND parked_at IS NULL
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts, next_attempt_at, last_error, created_at
            "#,
        )
        .bind(i64::from(limit))
        .bind(CLAIM_LEASE_SECS)
        .fetch_all(&self.pool)
        .await?;

        debug!(claimed = rows.len(), "Claimed outbox events");
        let mut events: Vec<OutboxEvent> = rows
            .into_iter()
            .map(OutboxEvent::try_from)
            .collect::<Result<_, _>>()?;
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn mark_delivered(&self, event_id: ModelId) -> Result<(), MarketError> {
        let result = sqlx::query("UPDATE outbox_events SET delivered_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MarketError::not_found("outbox event", event_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: ModelId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), MarketError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1,
                last_error = $2,
                next_attempt_at = $3,
                parked_at = CASE WHEN $3::timestamptz IS NULL THEN NOW() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MarketError::not_found("outbox event", event_id));
        }
        Ok(())
    }
}
