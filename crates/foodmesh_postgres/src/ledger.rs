//! Postgres carbon ledger store.
//!
//! Appends are serialized with a transaction-scoped advisory lock on a
//! fixed key: every entry's previous-hash references the current tail, so
//! the single-writer discipline is absolute. Reads take no lock.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use foodmesh_core::ledger::{seal, GENESIS_HASH};
use foodmesh_core::ports::{LedgerStore, Result};
use foodmesh_core::types::{CarbonEntry, EntryId, FoodCategory, PendingEntry};
use foodmesh_core::CoreError;

/// Advisory lock key for ledger appends ("carbon" tail).
const LEDGER_APPEND_LOCK: i64 = 0x6361_7262_6f6e;

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type EntryRow = (
    Uuid,
    String,
    Uuid,
    String,
    f64,
    f64,
    DateTime<Utc>,
    String,
    String,
);

const ENTRY_COLUMNS: &str =
    "id, vendor_id, order_id, category, weight_kg, saved_kg, recorded_at, prev_hash, hash";

fn decode_entry(row: EntryRow) -> Result<CarbonEntry> {
    let (id, vendor_id, order_id, category, weight_kg, saved_kg, timestamp, prev_hash, hash) = row;
    Ok(CarbonEntry {
        id: EntryId(id),
        vendor_id,
        order_id,
        category: FoodCategory::from_str(&category).ok_or_else(|| {
            CoreError::InvariantViolation(format!("unknown food category: {category}"))
        })?,
        weight_kg,
        saved_kg,
        timestamp,
        previous_hash: prev_hash,
        own_hash: hash,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, mut entry: PendingEntry) -> Result<CarbonEntry> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        // Held until commit; concurrent appenders queue here.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEDGER_APPEND_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

        let tail = sqlx::query_as::<_, (String,)>(
            "SELECT hash FROM carbon_ledger ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;
        let previous_hash = tail.map(|(h,)| h).unwrap_or_else(|| GENESIS_HASH.to_string());

        // Stamped under the lock so chain order and timestamp order agree.
        entry.timestamp = chrono::Utc::now();
        let sealed = seal(entry, &previous_hash);

        sqlx::query(
            r#"
            INSERT INTO carbon_ledger
                (id, vendor_id, order_id, category, weight_kg, saved_kg, recorded_at, prev_hash, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(sealed.id.0)
        .bind(&sealed.vendor_id)
        .bind(sealed.order_id)
        .bind(sealed.category.as_str())
        .bind(sealed.weight_kg)
        .bind(sealed.saved_kg)
        .bind(sealed.timestamp)
        .bind(&sealed.previous_hash)
        .bind(&sealed.own_hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(sealed)
    }

    async fn entries_for_period(
        &self,
        vendor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CarbonEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM carbon_ledger
            WHERE vendor_id = $1 AND recorded_at >= $2 AND recorded_at <= $3
            ORDER BY recorded_at ASC
            "#
        ))
        .bind(vendor_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(decode_entry).collect()
    }

    async fn chain(&self) -> Result<Vec<CarbonEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM carbon_ledger ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(decode_entry).collect()
    }
}
