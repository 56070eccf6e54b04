//! HTTP error envelope: every failure serializes as `{code, message}` with
//! a stable code. Conflict and validation messages pass through verbatim;
//! everything else is replaced by an opaque message — the correlation id
//! echoed by the middleware is what operators trace with.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use foodmesh_core::CoreError;

#[derive(Debug)]
pub enum AppError {
    Core(CoreError),
    /// Claim attempted without accepting the food-safety liability waiver.
    WaiverRequired,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::WaiverRequired => {
                let envelope = ErrorEnvelope {
                    code: "ERR-403-WAIVER",
                    message: "the food safety liability waiver must be accepted".into(),
                };
                (StatusCode::FORBIDDEN, Json(envelope)).into_response()
            }
            Self::Core(err) => {
                if matches!(err, CoreError::Internal(_) | CoreError::InvariantViolation(_)) {
                    tracing::error!(error = %err, "request failed");
                } else {
                    tracing::debug!(error = %err, "request rejected");
                }
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = if err.user_visible() {
                    err.to_string()
                } else {
                    "request failed; contact support with the correlation id".to_string()
                };
                let envelope = ErrorEnvelope {
                    code: err.code(),
                    message,
                };
                let mut response = (status, Json(envelope)).into_response();
                if status == StatusCode::SERVICE_UNAVAILABLE {
                    response
                        .headers_mut()
                        .insert("retry-after", "1".parse().expect("static header"));
                }
                response
            }
        }
    }
}
