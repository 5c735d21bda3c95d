//! Application error type
//!
//! A single error enum carried through every fallible path in the service,
//! from parameter expansion to cache lookup to admission. Each variant maps
//! to a fixed HTTP status and a short stable key per the error-handling
//! design: callers never see a stack trace, an internal identifier, or a
//! key/token value.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors surfaced by the admission and execution subsystem.
///
/// `NumericalFailure` on an individual expanded point never reaches this
/// enum — the coordinator encodes it as a sentinel metric value instead, so
/// that one bad point never fails an entire sweep (see `coordinator.rs`).
/// This enum carries only errors that invalidate an entire response.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unauthorised")]
    Unauthorised { admin_realm: bool },

    /// Admin endpoint reached by a non-admin identity. Deliberately carries
    /// the same status and headers as `Unauthorised` in the admin realm —
    /// distinguishing the two would let a caller enumerate valid keys.
    #[error("forbidden")]
    Forbidden,

    #[error("over capacity")]
    OverCapacity {
        retry_after_seconds: u64,
        circuit_state: &'static str,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorised { .. } | AppError::Forbidden => StatusCode::UNAUTHORIZED,
            AppError::OverCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cancelled => StatusCode::from_u16(499).expect("valid status"),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            AppError::InvalidParameter(_) => "InvalidParameter",
            AppError::Unauthorised { .. } => "Unauthorised",
            AppError::Forbidden => "Forbidden",
            AppError::OverCapacity { .. } => "OverCapacity",
            AppError::Cancelled => "Cancelled",
            AppError::Internal(_) => "Internal",
        }
    }

    /// Short message safe to return to the client. Never includes the
    /// `anyhow` source chain, which may contain implementation detail.
    fn message(&self) -> String {
        match self {
            AppError::Internal(_) => "an internal error occurred".to_string(),
            AppError::Unauthorised { .. } | AppError::Forbidden => {
                "authentication required".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none", rename = "retryAfter")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "circuitState")]
    circuit_state: Option<&'static str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        } else if matches!(self, AppError::Cancelled) {
            tracing::debug!("request cancelled");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let status = self.status();
        let (retry_after, circuit_state) = match &self {
            AppError::OverCapacity {
                retry_after_seconds,
                circuit_state,
            } => (Some(*retry_after_seconds), Some(*circuit_state)),
            _ => (None, None),
        };
        let admin_realm = matches!(self, AppError::Forbidden)
            || matches!(self, AppError::Unauthorised { admin_realm: true });

        let body = ErrorBody {
            error: self.key(),
            message: self.message(),
            status_code: status.as_u16(),
            retry_after,
            circuit_state,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        if admin_realm {
            response
                .headers_mut()
                .insert("WWW-Authenticate", HeaderValue::from_static("Basic"));
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl crate::cache::CacheError for AppError {
    fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
