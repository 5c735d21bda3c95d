//! End-to-end HTTP tests against the real router: sweep shape, cache
//! idempotence, matrix indexing, and admission rejection. Mirrors the
//! scenario families exercised in-process by `coordinator`'s own tests,
//! but through the actual HTTP surface including auth.

use axum_test::TestServer;
use epc_service::config::Config;
use epc_service::{build_state, create_router};
use serde_json::json;

fn test_server() -> TestServer {
    let mut config = Config::from_env();
    config.worker_pool.worker_count = 2;
    config.worker_pool.queue_capacity = 8;
    config.admin.password = "test-admin-password".to_string();
    let state = build_state(config);
    let app = create_router(state);
    TestServer::new(app).unwrap()
}

async fn issue_api_key(server: &TestServer) -> String {
    let response = server
        .post("/api/v1/admin/keys")
        .authorization_basic("admin", "test-admin-password")
        .json(&json!({"owner": "integration-test", "isAdmin": false}))
        .await;
    response.assert_status_ok();
    response.json::<serde_json::Value>()["key"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn health_check_bypasses_auth() {
    let server = test_server();
    let response = server.get("/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn compute_standard_requires_identity() {
    let server = test_server();
    let response = server
        .post("/api/v1/compute/standard")
        .json(&json!({
            "axes": {"SNR": {"kind": "scalar", "value": 5.0}},
            "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
            "metrics": ["error_probability"],
        }))
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sweep_produces_one_result_per_point() {
    let server = test_server();
    let key = issue_api_key(&server).await;

    let response = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .json(&json!({
            "axes": {"SNR": {"kind": "rangePoints", "min": 0.0, "max": 4.0, "points": 5}},
            "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
            "metrics": ["error_probability"],
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["meta"]["total_points"], 5);
    assert_eq!(body["results"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn repeated_sweep_is_served_from_cache() {
    let server = test_server();
    let key = issue_api_key(&server).await;
    let request_body = json!({
        "axes": {"SNR": {"kind": "rangePoints", "min": 0.0, "max": 2.0, "points": 3}},
        "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
        "metrics": ["error_probability"],
    });

    let first = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .json(&request_body)
        .await;
    first.assert_status_ok();
    let first_body: serde_json::Value = first.json();
    assert_eq!(first_body["meta"]["cached_points"], 0);

    let second = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .json(&request_body)
        .await;
    second.assert_status_ok();
    let body: serde_json::Value = second.json();
    assert_eq!(body["meta"]["cached_points"], 3);
}

#[tokio::test]
async fn matrix_layout_indexes_by_declared_axis_order() {
    let server = test_server();
    let key = issue_api_key(&server).await;

    let response = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .json(&json!({
            "axes": {
                "SNR": {"kind": "rangePoints", "min": 0.0, "max": 4.0, "points": 3},
                "R": {"kind": "rangePoints", "min": 0.1, "max": 0.9, "points": 2},
            },
            "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
            "metrics": ["error_probability"],
            "format": "matrix",
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["format"], "matrix");
    let rows = body["results"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn exceeding_max_points_is_rejected_before_compute() {
    let mut config = Config::from_env();
    config.max_points = 4;
    config.admin.password = "test-admin-password".to_string();
    let state = build_state(config);
    let app = create_router(state);
    let server = TestServer::new(app).unwrap();
    let key = issue_api_key(&server).await;

    let response = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .json(&json!({
            "axes": {"SNR": {"kind": "rangePoints", "min": 0.0, "max": 10.0, "points": 50}},
            "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
            "metrics": ["error_probability"],
        }))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn session_cancel_is_idempotent_without_an_active_sweep() {
    let server = test_server();
    let key = issue_api_key(&server).await;
    let response = server
        .post("/api/v1/session/cancel")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn distinct_session_ids_scope_cancellation_independently() {
    let server = test_server();
    let key = issue_api_key(&server).await;

    // Cancelling session "a" must not affect a concurrent sweep scoped to
    // session "b" under the same API key.
    let cancel_a = server
        .post("/api/v1/session/cancel")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .add_header(axum::http::HeaderName::from_static("x-session-id"), "a".parse().unwrap())
        .await;
    cancel_a.assert_status_ok();

    let response = server
        .post("/api/v1/compute/standard")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .add_header(axum::http::HeaderName::from_static("x-session-id"), "b".parse().unwrap())
        .json(&json!({
            "axes": {"SNR": {"kind": "scalar", "value": 5.0}},
            "modulation": {"type": "standard", "M": 4, "kind": "PAM", "snrUnit": "linear"},
            "metrics": ["error_probability"],
        }))
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn admin_endpoint_rejects_non_admin_key() {
    let server = test_server();
    let key = issue_api_key(&server).await;
    let response = server
        .get("/api/v1/admin/keys")
        .add_header(axum::http::HeaderName::from_static("x-api-key"), key.parse().unwrap())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}
