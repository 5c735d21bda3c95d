//! epc-service library crate
//!
//! Exposes the admission and execution subsystem as a library so
//! integration tests can exercise the real router and application state
//! without going through a spawned process.

pub mod app;
pub mod auth_gate;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod cost;
pub mod error;
pub mod expander;
pub mod fingerprint;
pub mod identity;
pub mod kernel;
pub mod types;
pub mod usage;
pub mod worker_pool;

pub use app::{build_state, create_router, AppState};

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = build_state(config::Config::from_env());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn docs_endpoint_is_public() {
        let state = build_state(config::Config::from_env());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/v1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
