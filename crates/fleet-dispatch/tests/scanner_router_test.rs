//! Router tests for the scanner endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fleet_dispatch::{
    CallOrchestrator, DispatchConfig, ResourceProvisioner, ScannerConfig, ScannerServer,
    SessionPool, StaticUpstreamFactory, StatusResponse,
};
use fleet_proto::{Account, Fort, FortKind, MapCell, MapPayload, ObjectKind, Proxy, ScanResponse};
use fleet_store::{InMemoryInventory, InMemoryObjectStore, Inventory};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // For `oneshot` method

fn payload() -> MapPayload {
    MapPayload {
        cells: vec![MapCell {
            wild_pokemon: Vec::new(),
            forts: vec![
                Fort {
                    id: "stop-1".to_string(),
                    kind: FortKind::Checkpoint,
                    latitude: 1.0,
                    longitude: 2.0,
                    lure: None,
                    active_modifier: true,
                    owned_by_team: 0,
                },
                Fort {
                    id: "gym-1".to_string(),
                    kind: FortKind::Gym,
                    latitude: 1.5,
                    longitude: 2.5,
                    lure: None,
                    active_modifier: false,
                    owned_by_team: 3,
                },
            ],
        }],
    }
}

/// Helper to build a scanner router over an in-memory inventory
async fn create_test_router(accounts: &[&str], proxies: &[u64]) -> Router {
    let inventory = Arc::new(InMemoryInventory::with_accounts(
        accounts
            .iter()
            .map(|name| Account::new(*name, "pw", "ptc"))
            .collect(),
    ));
    for id in proxies {
        inventory.add_proxy(Proxy::new(*id)).await.unwrap();
    }

    let config = DispatchConfig {
        cooldown: Duration::ZERO,
        checkout_timeout: Duration::from_millis(50),
        login_interval: Duration::ZERO,
        call_interval: Duration::ZERO,
        ..DispatchConfig::default()
    };
    let provisioner =
        ResourceProvisioner::new(inventory, Arc::new(StaticUpstreamFactory::new(payload())));
    let orchestrator = CallOrchestrator::new(
        config,
        SessionPool::new(Vec::new()),
        provisioner,
        Arc::new(InMemoryObjectStore::new()),
    );

    let server = ScannerServer::new(
        ScannerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            secret: "hunter2".to_string(),
        },
        Arc::new(orchestrator),
    );
    server.build_router()
}

fn scan_request(body: &'static str) -> Request<Body> {
    Request::builder()
        .uri("/scan")
        .method("POST")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_scan_returns_map_objects() {
    let app = create_test_router(&["ash"], &[1]).await;

    let response = app.oneshot(scan_request("lat=52.5&lng=13.4")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let scan: ScanResponse = read_json(response).await;
    assert!(scan.ok);
    assert_eq!(scan.error, "");
    assert_eq!(scan.map_objects.len(), 2);
    assert_eq!(scan.map_objects[0].kind, ObjectKind::Pokestop);
    assert!(scan.map_objects[0].lured);
    assert_eq!(scan.map_objects[1].team, 3);
}

#[tokio::test]
async fn test_scan_then_cache_lists_stored_objects() {
    let app = create_test_router(&["ash"], &[1]).await;

    let response = app
        .clone()
        .oneshot(scan_request("lat=52.5&lng=13.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/cache?types=3")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    let cache: ScanResponse = read_json(response).await;
    assert!(cache.ok);
    assert_eq!(cache.map_objects.len(), 1);
    assert_eq!(cache.map_objects[0].id, "gym-1");
}

#[tokio::test]
async fn test_scan_without_resources_is_busy() {
    let app = create_test_router(&["ash"], &[]).await;

    let response = app.oneshot(scan_request("lat=1&lng=2")).await.unwrap();

    let scan: ScanResponse = read_json(response).await;
    assert!(!scan.ok);
    assert_eq!(scan.error, "All our minions are busy");
    assert!(scan.map_objects.is_empty());
}

#[tokio::test]
async fn test_scan_with_bad_coordinates() {
    let app = create_test_router(&["ash"], &[1]).await;

    let response = app.oneshot(scan_request("lat=north&lng=2")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let scan: ScanResponse = read_json(response).await;
    assert_eq!(scan.error, "Wrong format");
}

#[tokio::test]
async fn test_scan_with_wrong_method() {
    let app = create_test_router(&["ash"], &[1]).await;

    let request = Request::builder()
        .uri("/scan?lat=1&lng=2")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let scan: ScanResponse = read_json(response).await;
    assert!(!scan.ok);
    assert_eq!(scan.error, "Wrong method");
}

#[tokio::test]
async fn test_status_requires_secret() {
    let app = create_test_router(&["ash"], &[1]).await;

    let request = Request::builder()
        .uri("/status?secret=wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_status_lists_live_sessions() {
    let app = create_test_router(&["ash"], &[7]).await;

    app.clone()
        .oneshot(scan_request("lat=1&lng=2"))
        .await
        .unwrap();

    let request = Request::builder()
        .uri("/status?secret=hunter2")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let status: StatusResponse = read_json(response).await;
    assert_eq!(status.sessions.len(), 1);
    assert_eq!(status.sessions[0].account_name, "ash");
    assert_eq!(status.sessions[0].proxy_id, 7);
    assert_eq!(status.pooled, 1);
    assert_eq!(status.metrics.scans, 1);
}
