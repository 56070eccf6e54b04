//! Postgres outbox: transactional append plus the skip-locked lease used
//! by the propagator.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use foodmesh_core::ports::{EventOutcome, OutboxLease, OutboxStore, Result};
use foodmesh_core::types::{EventId, EventKind, NewOutboxEvent, OutboxEvent};
use foodmesh_core::CoreError;

/// Insert an event row inside the caller's open transaction. If the
/// transaction commits the event is durably queued; if it aborts the event
/// is never observed.
pub async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, aggregate_id, event_type, payload, created_at, published, trace_id)
        VALUES ($1, $2, $3, $4, now(), false, $5)
        "#,
    )
    .bind(event.id.0)
    .bind(event.aggregate_id)
    .bind(event.kind.as_str())
    .bind(&event.payload)
    .bind(event.correlation_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(())
}

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type EventRow = (
    Uuid,
    Uuid,
    String,
    serde_json::Value,
    DateTime<Utc>,
    bool,
    Option<DateTime<Utc>>,
    Uuid,
);

fn decode_event(row: EventRow) -> Result<OutboxEvent> {
    let (id, aggregate_id, event_type, payload, created_at, published, published_at, trace_id) =
        row;
    let kind = EventKind::from_str(&event_type).ok_or_else(|| {
        CoreError::InvariantViolation(format!("unknown event kind in outbox: {event_type}"))
    })?;
    Ok(OutboxEvent {
        id: EventId(id),
        aggregate_id,
        kind,
        payload,
        created_at,
        published,
        published_at,
        correlation_id: trace_id,
    })
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        append_in_tx(&mut tx, &event).await?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn lease_batch(&self, batch_size: i64) -> Result<Box<dyn OutboxLease>> {
        // Row locks are held by the lease's transaction until settle(), so
        // a second propagator instance skips these rows entirely.
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, aggregate_id, event_type, payload, created_at, published, published_at, trace_id
            FROM outbox_events
            WHERE published = false
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let events = rows
            .into_iter()
            .map(decode_event)
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(PgOutboxLease { tx, events }))
    }
}

pub struct PgOutboxLease {
    tx: Transaction<'static, Postgres>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxLease for PgOutboxLease {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn settle(mut self: Box<Self>, outcomes: Vec<EventOutcome>) -> Result<()> {
        if outcomes.len() != self.events.len() {
            return Err(CoreError::InvariantViolation(format!(
                "settle got {} outcomes for {} leased events",
                outcomes.len(),
                self.events.len()
            )));
        }
        for (event, outcome) in self.events.iter().zip(outcomes) {
            match outcome {
                EventOutcome::Published | EventOutcome::DroppedStale => {
                    sqlx::query(
                        r#"
                        UPDATE outbox_events
                        SET published = true, published_at = now()
                        WHERE id = $1
                        "#,
                    )
                    .bind(event.id.0)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                }
                // Left untouched; the row unlocks at commit and the next
                // poll retries it.
                EventOutcome::Retry => {}
            }
        }
        self.tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }
}
