//! Liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;

use crate::state::AppState;

pub async fn live() -> &'static str {
    "OK"
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if let Some(pool) = &state.db {
        let ping = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sqlx::query("SELECT 1").execute(pool),
        )
        .await;
        match ping {
            Ok(Ok(_)) => (StatusCode::OK, "READY"),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "database not ready"),
        }
    } else {
        (StatusCode::OK, "READY")
    }
}
