//! Surplus endpoints: posting, claiming, the marketplace listing and
//! pickup verification.

use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use foodmesh_core::claim::ClaimRequest;
use foodmesh_core::geo::GeoPoint;
use foodmesh_core::types::{
    FoodCategory, FulfillmentMethod, FulfillmentSpec, SlaTier, SurplusDraft, SurplusId,
};
use foodmesh_core::CoreError;

use crate::error::AppError;
use crate::middleware::CorrelationId;
use crate::state::AppState;

/// Deadline for the claim path; elapsed deadlines surface as 504.
const CLAIM_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct PostSurplusRequest {
    pub provider_id: String,
    pub lat: f64,
    pub lon: f64,
    pub quantity_kgs: f64,
    pub food_type: String,
    pub expiry_time: DateTime<Utc>,
}

pub async fn post_surplus(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(req): Json<PostSurplusRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let category = FoodCategory::from_str(&req.food_type)
        .ok_or_else(|| CoreError::Validation(format!("unknown food_type: {}", req.food_type)))?;
    let draft = SurplusDraft {
        provider_id: req.provider_id,
        location: GeoPoint::new(req.lat, req.lon),
        quantity_kg: req.quantity_kgs,
        category,
        expiry_time: req.expiry_time,
    };
    let item = state.claims.post(draft, correlation.0).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "surplus_id": item.id, "status": "posted" })),
    ))
}

pub async fn get_surplus(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let item = state.claims.get(SurplusId(id)).await?;
    Ok(Json(item_json(&item)))
}

#[derive(Debug, Deserialize)]
pub struct ClaimSurplusRequest {
    pub ngo_id: String,
    pub fulfillment_method: String,
    pub user_lat: f64,
    pub user_lon: f64,
    pub sla_tier: Option<String>,
}

pub async fn claim_surplus(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ClaimSurplusRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let waiver = headers
        .get("x-liability-waiver-accepted")
        .and_then(|v| v.to_str().ok());
    if waiver != Some("true") {
        return Err(AppError::WaiverRequired);
    }

    let method = match req.fulfillment_method.as_str() {
        "courier" => FulfillmentMethod::Courier,
        "self_pickup" => FulfillmentMethod::SelfPickup,
        other => {
            return Err(CoreError::Validation(format!(
                "unknown fulfillment_method: {other}"
            ))
            .into())
        }
    };
    let sla_tier = match &req.sla_tier {
        Some(raw) => Some(
            SlaTier::from_str(raw)
                .ok_or_else(|| CoreError::Validation(format!("unknown sla_tier: {raw}")))?,
        ),
        None => None,
    };
    let idempotency_token = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let claim = ClaimRequest {
        item_id: SurplusId(id),
        claimant_id: req.ngo_id,
        fulfillment: FulfillmentSpec {
            method,
            recipient_location: GeoPoint::new(req.user_lat, req.user_lon),
            sla_tier,
        },
        idempotency_token,
    };

    let receipt = tokio::time::timeout(CLAIM_DEADLINE, state.claims.claim(claim, correlation.0))
        .await
        .map_err(|_| CoreError::DeadlineExceeded("claim deadline elapsed".into()))??;

    Ok(Json(json!({ "status": "claimed", "fulfillment": receipt })))
}

#[derive(Debug, Deserialize)]
pub struct CancelClaimRequest {
    pub ngo_id: String,
}

pub async fn cancel_claim(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelClaimRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.claims.cancel(SurplusId(id), &req.ngo_id).await?;
    Ok(Json(json!({ "status": "cancelled", "surplus_id": id })))
}

pub async fn marketplace(
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    let items = state.claims.marketplace(100).await?;
    Ok(Json(items.iter().map(item_json).collect()))
}

#[derive(Debug, Deserialize)]
pub struct VerifyPickupRequest {
    pub provider_id: String,
    pub verification_code: String,
}

pub async fn verify_pickup(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(req): Json<VerifyPickupRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let surplus_id = state
        .claims
        .confirm_pickup(&req.provider_id, &req.verification_code, correlation.0)
        .await?;
    Ok(Json(json!({ "status": "verified", "surplus_id": surplus_id })))
}

fn item_json(item: &foodmesh_core::types::SurplusItem) -> serde_json::Value {
    let expires_in_minutes = (item.expiry_time - Utc::now()).num_minutes().max(0);
    json!({
        "id": item.id,
        "provider_id": item.provider_id,
        "lat": item.location.lat,
        "lon": item.location.lon,
        "quantity_kgs": item.quantity_kg,
        "food_type": item.category.as_str(),
        "status": item.status.as_str(),
        "expiry_time": item.expiry_time,
        "expires_in_minutes": expires_in_minutes,
    })
}
