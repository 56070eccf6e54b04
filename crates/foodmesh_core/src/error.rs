use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Conflict(_) => 409,
            Self::NotFound(_) => 404,
            Self::Unprocessable(_) => 422,
            Self::UpstreamUnavailable(_) => 502,
            Self::Overload(_) => 503,
            Self::InvariantViolation(_) => 500,
            Self::DeadlineExceeded(_) => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ERR-400-VALIDATION",
            Self::Conflict(_) => "ERR-409-CONFLICT",
            Self::NotFound(_) => "ERR-404-NOT-FOUND",
            Self::Unprocessable(_) => "ERR-422-UNPROCESSABLE",
            Self::UpstreamUnavailable(_) => "ERR-502-UPSTREAM",
            Self::Overload(_) => "ERR-503-OVERLOAD",
            Self::InvariantViolation(_) => "ERR-500-INVARIANT",
            Self::DeadlineExceeded(_) => "ERR-504-DEADLINE",
            Self::Internal(_) => "ERR-500-INTERNAL",
        }
    }

    /// Whether the message is safe to show verbatim to callers.
    /// Conflict and validation messages are actionable; everything else is
    /// replaced by an opaque envelope plus the correlation id.
    pub fn user_visible(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound(_) | Self::Unprocessable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_agree() {
        let cases = [
            (CoreError::Validation("x".into()), 400, "ERR-400-VALIDATION"),
            (CoreError::Conflict("x".into()), 409, "ERR-409-CONFLICT"),
            (CoreError::NotFound("x".into()), 404, "ERR-404-NOT-FOUND"),
            (
                CoreError::Unprocessable("x".into()),
                422,
                "ERR-422-UNPROCESSABLE",
            ),
            (CoreError::Overload("x".into()), 503, "ERR-503-OVERLOAD"),
            (
                CoreError::DeadlineExceeded("x".into()),
                504,
                "ERR-504-DEADLINE",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.http_status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn internal_messages_are_not_user_visible() {
        assert!(!CoreError::Internal(anyhow::anyhow!("boom")).user_visible());
        assert!(!CoreError::InvariantViolation("chain".into()).user_visible());
        assert!(CoreError::Conflict("taken".into()).user_visible());
    }
}
