//! Carbon ledger endpoints: the vendor period report and the full-chain
//! verification walk.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use foodmesh_core::ledger::{ChainVerdict, ImpactReport};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub vendor_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub async fn report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<ImpactReport>, AppError> {
    let report = state
        .ledger
        .report(&query.vendor_id, query.from, query.to)
        .await?;
    Ok(Json(report))
}

pub async fn verify(State(state): State<AppState>) -> Result<Json<ChainVerdict>, AppError> {
    Ok(Json(state.ledger.verify().await?))
}
