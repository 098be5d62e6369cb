#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! HTTP contract tests: response envelope shape, status-code mapping, and
//! health probes, driven through the router without a network listener.

mod support;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use snapdog::api::{build_router, AppState};
use snapdog::orchestrator::Orchestrator;

use support::{build_stack, fixture_config, single_zone_model, wait_connected, MockSnapcast};

struct Harness {
    router: axum::Router,
    orchestrator: Orchestrator,
}

async fn harness(snapcast_port: u16) -> Harness {
    let stack = build_stack(fixture_config(snapcast_port, 2, 2)).await;
    if snapcast_port > 1 {
        wait_connected(&stack.snapcast).await;
    }
    let orchestrator = Orchestrator::new();
    let state = AppState {
        store: stack.store.clone(),
        mediator: stack.mediator.clone(),
        snapcast: stack.snapcast.clone(),
        subsonic: None,
        grouping: stack.grouping.clone(),
        stats: stack.stats.clone(),
        startup: orchestrator.state_watch(),
        started_at: Instant::now(),
        mqtt_connected: watch::channel(false).1,
        knx_connected: watch::channel(false).1,
        icons: Arc::new((vec![Some("http://icons/kitchen.png".into()), None], vec![
            None, None,
        ])),
    };
    Harness {
        router: build_router(state),
        orchestrator,
    }
}

async fn request(router: &axum::Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value)
}

#[tokio::test]
async fn list_zones_returns_envelope() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "GET", "/api/v1/zones", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["index"], 1);
}

#[tokio::test]
async fn missing_zone_is_404_with_error_body() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "GET", "/api/v1/zones/9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NotFound");
}

#[tokio::test]
async fn invalid_volume_is_400_with_exact_message() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(
        &h.router,
        "PUT",
        "/api/v1/clients/1/volume",
        Some(json!({ "volume": 150 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "Invalid");
    assert_eq!(body["error"]["message"], "Volume must be between 0 and 100");
}

#[tokio::test]
async fn volume_write_returns_updated_snapshot() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(
        &h.router,
        "PUT",
        "/api/v1/zones/1/volume",
        Some(json!({ "volume": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["volume"], 60);

    // Reads reflect the write
    let (_, zone) = request(&h.router, "GET", "/api/v1/zones/1", None).await;
    assert_eq!(zone["data"]["volume"], 60);
}

#[tokio::test]
async fn volume_write_while_snapcast_down_is_503_and_state_unchanged() {
    // Port 1: nothing listens there
    let h = harness(1).await;
    let (status, body) = request(
        &h.router,
        "PUT",
        "/api/v1/zones/1/volume",
        Some(json!({ "volume": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "Unavailable");

    // Reads still serve the last known state
    let (status, zone) = request(&h.router, "GET", "/api/v1/zones/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(zone["data"]["volume"], 50);
}

#[tokio::test]
async fn playback_actions_route() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "POST", "/api/v1/zones/1/play", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["playback"], "playing");

    let (status, _) = request(&h.router, "POST", "/api/v1/zones/1/eject", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn client_zone_reassignment_via_api() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(
        &h.router,
        "PUT",
        "/api/v1/clients/2/zone",
        Some(json!({ "zoneIndex": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current_zone"], 2);

    let (_, zone) = request(&h.router, "GET", "/api/v1/zones/2", None).await;
    let members = zone["data"]["clients"].as_array().unwrap();
    assert!(members.iter().any(|v| v == 2));
}

#[tokio::test]
async fn system_endpoints_answer() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;

    let (status, body) = request(&h.router, "GET", "/api/v1/system/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["snapcast_connected"], true);

    let (status, body) = request(&h.router, "GET", "/api/v1/system/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["version"].is_string());

    let (status, body) = request(&h.router, "GET", "/api/v1/system/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["commands_processed"].is_number());

    let (status, body) = request(&h.router, "GET", "/api/v1/system/errors", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn snapcast_passthrough_reflects_server() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "GET", "/api/v1/snapcast/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["groups"][0]["id"], "g1");
}

#[tokio::test]
async fn cover_without_subsonic_is_503() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "GET", "/api/v1/cover/co-1", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "Unavailable");
}

#[tokio::test]
async fn icons_endpoint_keys_by_entity() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;
    let (status, body) = request(&h.router, "GET", "/api/v1/icons", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["zones"]["zone_1"], "http://icons/kitchen.png");
    assert!(body["data"]["zones"].get("zone_2").is_none());
}

#[tokio::test]
async fn health_probes_track_startup_state() {
    let mock = MockSnapcast::start(single_zone_model()).await;
    let h = harness(mock.addr.port()).await;

    let (status, _) = request(&h.router, "GET", "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);

    // Still starting up
    let (status, _) = request(&h.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    h.orchestrator.mark_running();
    let (status, _) = request(&h.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&h.router, "GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
}
