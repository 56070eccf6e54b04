//! Postgres surplus store: atomic post, the CAS claim transition, pickup
//! confirmation and the expiry sweep. Every method that pairs a domain
//! write with an outbox event runs both in one transaction.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use foodmesh_core::geo::GeoPoint;
use foodmesh_core::ports::{ClaimWrite, Result, SurplusStore};
use foodmesh_core::types::{
    ClaimReceipt, DeliveryCompletedPayload, EventKind, FoodCategory, NewOutboxEvent, SurplusId,
    SurplusItem, SurplusStatus,
};
use foodmesh_core::CoreError;

use crate::outbox::append_in_tx;

pub struct PgSurplusStore {
    pool: PgPool,
}

impl PgSurplusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type SurplusRow = (
    Uuid,
    String,
    f64,
    f64,
    i64,
    f64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    String,
    Option<String>,
    i64,
);

const SURPLUS_COLUMNS: &str = "id, provider_id, lat, lon, cell_id, quantity_kg, category, \
                               posted_at, expiry_time, status, claimed_by, version";

fn decode_item(row: SurplusRow) -> Result<SurplusItem> {
    let (
        id,
        provider_id,
        lat,
        lon,
        cell_id,
        quantity_kg,
        category,
        posted_at,
        expiry_time,
        status,
        claimed_by,
        version,
    ) = row;
    Ok(SurplusItem {
        id: SurplusId(id),
        provider_id,
        location: GeoPoint::new(lat, lon),
        cell_id: foodmesh_core::geo::CellId(cell_id as u64),
        quantity_kg,
        category: FoodCategory::from_str(&category).ok_or_else(|| {
            CoreError::InvariantViolation(format!("unknown food category: {category}"))
        })?,
        posted_at,
        expiry_time,
        status: SurplusStatus::from_str(&status).ok_or_else(|| {
            CoreError::InvariantViolation(format!("unknown surplus status: {status}"))
        })?,
        claimed_by,
        version,
    })
}

#[async_trait]
impl SurplusStore for PgSurplusStore {
    async fn create_with_event(&self, item: &SurplusItem, event: NewOutboxEvent) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        sqlx::query(
            r#"
            INSERT INTO surplus (id, provider_id, lat, lon, cell_id, quantity_kg, category,
                                 posted_at, expiry_time, status, claimed_by, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, 0)
            "#,
        )
        .bind(item.id.0)
        .bind(&item.provider_id)
        .bind(item.location.lat)
        .bind(item.location.lon)
        .bind(item.cell_id.0 as i64)
        .bind(item.quantity_kg)
        .bind(item.category.as_str())
        .bind(item.posted_at)
        .bind(item.expiry_time)
        .bind(item.status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        append_in_tx(&mut tx, &event).await?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn get(&self, id: SurplusId) -> Result<SurplusItem> {
        let row = sqlx::query_as::<_, SurplusRow>(&format!(
            "SELECT {SURPLUS_COLUMNS} FROM surplus WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        match row {
            Some(row) => decode_item(row),
            None => Err(CoreError::NotFound(format!("surplus {id}"))),
        }
    }

    async fn marketplace(&self, limit: i64) -> Result<Vec<SurplusItem>> {
        let rows = sqlx::query_as::<_, SurplusRow>(&format!(
            r#"
            SELECT {SURPLUS_COLUMNS}
            FROM surplus
            WHERE status = 'available' AND expiry_time > now()
            ORDER BY expiry_time ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(decode_item).collect()
    }

    async fn try_claim(&self, write: ClaimWrite) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        // The single-winner predicate, evaluated with the database clock.
        let result = sqlx::query(
            r#"
            UPDATE surplus
            SET status = 'claimed',
                claimed_by = $1,
                version = version + 1
            WHERE id = $2
              AND status = 'available'
              AND expiry_time > now()
              AND version = $3
            "#,
        )
        .bind(&write.claimant_id)
        .bind(write.item_id.0)
        .bind(write.expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| anyhow!(e))?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO deliveries (id, surplus_id, method, verification_code, status)
            VALUES ($1, $2, $3, $4, 'assigned')
            "#,
        )
        .bind(write.delivery.id)
        .bind(write.delivery.item_id.0)
        .bind(write.delivery.method.as_str())
        .bind(&write.delivery.verification_code)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        append_in_tx(&mut tx, &write.event).await?;

        if let Some(token) = &write.receipt_token {
            let receipt = serde_json::to_value(&write.receipt).map_err(|e| anyhow!(e))?;
            sqlx::query(
                r#"
                INSERT INTO claim_receipts (token, surplus_id, receipt)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(token)
            .bind(write.item_id.0)
            .bind(&receipt)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(true)
    }

    async fn find_receipt(&self, token: &str) -> Result<Option<ClaimReceipt>> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT receipt FROM claim_receipts WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(|(value,)| serde_json::from_value(value).map_err(|e| anyhow!(e).into()))
            .transpose()
    }

    async fn confirm_pickup(
        &self,
        provider_id: &str,
        verification_code: &str,
        correlation_id: Uuid,
    ) -> Result<Option<SurplusId>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let row = sqlx::query_as::<_, (Uuid, Uuid, String, f64)>(
            r#"
            SELECT d.id, s.id, s.category, s.quantity_kg
            FROM deliveries d
            JOIN surplus s ON s.id = d.surplus_id
            WHERE s.provider_id = $1
              AND d.verification_code = $2
              AND d.status = 'assigned'
            FOR UPDATE OF d, s
            "#,
        )
        .bind(provider_id)
        .bind(verification_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let Some((delivery_id, surplus_id, category, quantity_kg)) = row else {
            return Ok(None);
        };
        let category = FoodCategory::from_str(&category).ok_or_else(|| {
            CoreError::InvariantViolation(format!("unknown food category: {category}"))
        })?;

        sqlx::query("UPDATE deliveries SET status = 'delivered', updated_at = now() WHERE id = $1")
            .bind(delivery_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

        sqlx::query(
            "UPDATE surplus SET status = 'delivered', version = version + 1 WHERE id = $1",
        )
        .bind(surplus_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let payload = DeliveryCompletedPayload {
            vendor_id: provider_id.to_string(),
            order_id: surplus_id,
            category,
            weight_kg: quantity_kg,
        };
        let event = NewOutboxEvent::new(
            surplus_id,
            EventKind::DeliveryCompleted,
            serde_json::to_value(&payload).map_err(|e| anyhow!(e))?,
            correlation_id,
        );
        append_in_tx(&mut tx, &event).await?;

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(Some(SurplusId(surplus_id)))
    }

    async fn cancel_claim(&self, id: SurplusId, claimant_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE surplus
            SET status = 'cancelled',
                claimed_by = NULL,
                version = version + 1
            WHERE id = $1
              AND status = 'claimed'
              AND claimed_by = $2
            "#,
        )
        .bind(id.0)
        .bind(claimant_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_due(&self, correlation_id: Uuid) -> Result<Vec<SurplusId>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let expired = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE surplus
            SET status = 'expired', version = version + 1
            WHERE status = 'available' AND expiry_time <= now()
            RETURNING id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut ids = Vec::with_capacity(expired.len());
        for (id,) in expired {
            let event = NewOutboxEvent::new(
                id,
                EventKind::SurplusExpired,
                serde_json::json!({ "surplus_id": id }),
                correlation_id,
            );
            append_in_tx(&mut tx, &event).await?;
            ids.push(SurplusId(id));
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(ids)
    }
}
