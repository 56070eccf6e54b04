//! Request middleware: correlation-id propagation and adaptive load
//! shedding.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use foodmesh_core::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// Correlation id for the request, propagated from the caller's
/// `x-correlation-id` header or freshly minted.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationId(pub Uuid);

pub async fn correlation(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    request.extensions_mut().insert(CorrelationId(id));

    let mut response = next.run(request).await;
    if let Ok(value) = id.to_string().parse() {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

/// Reject before doing any work while the shedder is tripped; otherwise
/// feed the observed latency back into the rolling window.
pub async fn load_shed(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.shedder.is_shedding() {
        return AppError::from(CoreError::Overload(
            "service is under heavy load, retry shortly".into(),
        ))
        .into_response();
    }
    let start = Instant::now();
    let response = next.run(request).await;
    state.shedder.record(start.elapsed());
    response
}
