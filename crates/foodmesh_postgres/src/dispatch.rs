//! Postgres dispatch store: delivery orders and all-or-nothing batch
//! commits.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use foodmesh_core::geo::GeoPoint;
use foodmesh_core::ports::{DispatchStore, Result};
use foodmesh_core::types::{
    Batch, BatchId, DeliveryOrder, OrderId, OrderStatus, SlaTier, SurplusId,
};
use foodmesh_core::CoreError;

pub struct PgDispatchStore {
    pool: PgPool,
}

impl PgDispatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type OrderRow = (
    Uuid,
    Uuid,
    f64,
    f64,
    f64,
    f64,
    DateTime<Utc>,
    String,
    String,
    f64,
    String,
    Option<Uuid>,
    DateTime<Utc>,
);

const ORDER_COLUMNS: &str = "id, surplus_id, pickup_lat, pickup_lon, dropoff_lat, dropoff_lon, \
                             expiry_time, requested_tier, effective_tier, quantity_kg, status, \
                             batch_id, created_at";

fn decode_order(row: OrderRow) -> Result<DeliveryOrder> {
    let (
        id,
        surplus_id,
        pickup_lat,
        pickup_lon,
        dropoff_lat,
        dropoff_lon,
        expiry_time,
        requested_tier,
        effective_tier,
        quantity_kg,
        status,
        batch_id,
        created_at,
    ) = row;
    let tier = |s: &str| {
        SlaTier::from_str(s)
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown SLA tier: {s}")))
    };
    Ok(DeliveryOrder {
        id: OrderId(id),
        item_id: SurplusId(surplus_id),
        pickup: GeoPoint::new(pickup_lat, pickup_lon),
        dropoff: GeoPoint::new(dropoff_lat, dropoff_lon),
        expiry_time,
        requested_tier: tier(&requested_tier)?,
        effective_tier: tier(&effective_tier)?,
        quantity_kg,
        status: OrderStatus::from_str(&status).ok_or_else(|| {
            CoreError::InvariantViolation(format!("unknown order status: {status}"))
        })?,
        batch_id: batch_id.map(BatchId),
        created_at,
    })
}

#[async_trait]
impl DispatchStore for PgDispatchStore {
    async fn insert_order(&self, order: &DeliveryOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_orders
                (id, surplus_id, pickup_lat, pickup_lon, dropoff_lat, dropoff_lon,
                 expiry_time, requested_tier, effective_tier, quantity_kg, status,
                 batch_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, $12)
            "#,
        )
        .bind(order.id.0)
        .bind(order.item_id.0)
        .bind(order.pickup.lat)
        .bind(order.pickup.lon)
        .bind(order.dropoff.lat)
        .bind(order.dropoff.lon)
        .bind(order.expiry_time)
        .bind(order.requested_tier.as_str())
        .bind(order.effective_tier.as_str())
        .bind(order.quantity_kg)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<DeliveryOrder> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM delivery_orders WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        match row {
            Some(row) => decode_order(row),
            None => Err(CoreError::NotFound(format!("delivery order {id}"))),
        }
    }

    async fn pending_orders(&self) -> Result<Vec<DeliveryOrder>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM delivery_orders
            WHERE status = 'pending_matching'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(decode_order).collect()
    }

    async fn commit_batch(
        &self,
        batch: &Batch,
        effective_tiers: &[(OrderId, SlaTier)],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let route = serde_json::to_value(&batch.route).map_err(|e| anyhow!(e))?;
        sqlx::query(
            r#"
            INSERT INTO batches (id, courier_id, score, route, created_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(batch.id.0)
        .bind(&batch.courier_id)
        .bind(batch.score)
        .bind(&route)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        for order_id in &batch.order_ids {
            let tier = effective_tiers
                .iter()
                .find(|(id, _)| id == order_id)
                .map(|(_, t)| *t)
                .ok_or_else(|| {
                    CoreError::InvariantViolation(format!(
                        "batch {} carries no effective tier for order {order_id}",
                        batch.id
                    ))
                })?;
            let result = sqlx::query(
                r#"
                UPDATE delivery_orders
                SET status = 'dispatched', batch_id = $1, effective_tier = $2
                WHERE id = $3 AND status = 'pending_matching'
                "#,
            )
            .bind(batch.id.0)
            .bind(tier.as_str())
            .bind(order_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            // Another cycle (or a force dispatch) got here first; abandon
            // the whole batch so no order is double-assigned.
            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(|e| anyhow!(e))?;
                tracing::debug!(batch_id = %batch.id, order_id = %order_id, "batch commit lost race");
                return Ok(false);
            }
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(true)
    }
}
