//! Location reporting for recipients (geo index) and couriers (dispatch
//! pool).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use foodmesh_core::geo::GeoPoint;
use foodmesh_core::CoreError;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RecipientLocationRequest {
    pub recipient_id: String,
    pub lat: f64,
    pub lon: f64,
}

pub async fn update_recipient(
    State(state): State<AppState>,
    Json(req): Json<RecipientLocationRequest>,
) -> Result<StatusCode, AppError> {
    let point = GeoPoint::new(req.lat, req.lon);
    if !point.is_valid() {
        return Err(CoreError::Validation("coordinates out of range".into()).into());
    }
    state.geo.update_location(&req.recipient_id, point).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CourierLocationRequest {
    pub courier_id: String,
    pub lat: f64,
    pub lon: f64,
}

pub async fn update_courier(
    State(state): State<AppState>,
    Json(req): Json<CourierLocationRequest>,
) -> Result<StatusCode, AppError> {
    let point = GeoPoint::new(req.lat, req.lon);
    if !point.is_valid() {
        return Err(CoreError::Validation("coordinates out of range".into()).into());
    }
    state.couriers.update_location(&req.courier_id, point).await?;
    Ok(StatusCode::NO_CONTENT)
}
