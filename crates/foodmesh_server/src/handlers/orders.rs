//! Dispatch endpoints: order creation, inspection and the operational
//! force-dispatch escape hatch.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use foodmesh_core::dispatch::OrderDraft;
use foodmesh_core::geo::GeoPoint;
use foodmesh_core::types::{OrderId, SlaTier, SurplusId};
use foodmesh_core::CoreError;

use crate::error::AppError;
use crate::state::AppState;
use crate::workers::dispatch::arm_escalation;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub surplus_id: Uuid,
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub dropoff_lat: f64,
    pub dropoff_lon: f64,
    pub expiry_time: DateTime<Utc>,
    pub sla_tier: String,
    pub quantity_kgs: f64,
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let tier = SlaTier::from_str(&req.sla_tier)
        .ok_or_else(|| CoreError::Validation(format!("unknown sla_tier: {}", req.sla_tier)))?;
    if tier == SlaTier::Critical {
        return Err(
            CoreError::Validation("CRITICAL is assigned by the system, not requested".into())
                .into(),
        );
    }

    let order = state
        .dispatch
        .create_order(OrderDraft {
            item_id: SurplusId(req.surplus_id),
            pickup: GeoPoint::new(req.pickup_lat, req.pickup_lon),
            dropoff: GeoPoint::new(req.dropoff_lat, req.dropoff_lon),
            expiry_time: req.expiry_time,
            requested_tier: tier,
            quantity_kg: req.quantity_kgs,
        })
        .await?;

    arm_escalation(state.dispatch.clone(), &order);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "order_id": order.id,
            "effective_tier": order.effective_tier.as_str(),
            "status": order.status.as_str(),
        })),
    ))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let order = state.dispatch.get_order(OrderId(id)).await?;
    Ok(Json(json!({
        "order_id": order.id,
        "surplus_id": order.item_id,
        "requested_tier": order.requested_tier.as_str(),
        "effective_tier": order.effective_tier.as_str(),
        "status": order.status.as_str(),
        "batch_id": order.batch_id,
        "expiry_time": order.expiry_time,
        "created_at": order.created_at,
    })))
}

pub async fn force_dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Surface a missing order as 404; "no longer pending" is a benign
    // no-op for the operator.
    let _ = state.dispatch.get_order(OrderId(id)).await?;
    let dispatched = state.dispatch.force_dispatch(OrderId(id)).await?;
    Ok(Json(json!({ "order_id": id, "dispatched": dispatched })))
}
