//! HTTP surface of a single Dispatcher.

use std::sync::Arc;
use std::time::Duration;

use assetstream::config::{DispatcherConfig, LogBackend, ServiceInfo};
use assetstream::dispatcher::{Dispatcher, DispatcherState};
use assetstream::http::{DispatcherAppState, dispatcher_router};
use assetstream::log::MemoryBroker;
use assetstream::types::GroupNaming;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;

fn dispatcher(broker: &MemoryBroker) -> Dispatcher {
    let mut config = DispatcherConfig::for_group("Weld", &GroupNaming::default());
    config.log_backend = LogBackend::Memory;
    config.drain_grace = Duration::from_millis(200);
    Dispatcher::new(config, Arc::new(broker.clone()))
}

async fn get(app: &axum::Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

fn request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn next_line(body: &mut axum::body::BodyDataStream) -> Value {
    let chunk = tokio::time::timeout(Duration::from_secs(3), body.next())
        .await
        .expect("timed out waiting for a line")
        .expect("stream ended")
        .unwrap();
    serde_json::from_slice(chunk.strip_suffix(b"\n").unwrap_or(&chunk)).unwrap()
}

#[tokio::test]
async fn test_ready_follows_consumer_state() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));

    let response = get(&app, request("/ready")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "not ready");

    dispatcher.start();
    assert!(
        dispatcher
            .wait_for_state(DispatcherState::Consuming, Duration::from_secs(3))
            .await
    );
    let response = get(&app, request("/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);

    dispatcher.shutdown().await;
    let response = get(&app, request("/ready")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_group_ready_answers_only_for_served_group() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));
    assert_eq!(
        get(&app, request("/group/Weld/ready")).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    dispatcher.start();
    assert!(
        dispatcher
            .wait_for_state(DispatcherState::Consuming, Duration::from_secs(3))
            .await
    );
    assert_eq!(get(&app, request("/group/Weld/ready")).await.status(), StatusCode::OK);

    let other = get(&app, request("/group/Paint/ready")).await;
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
    assert!(body_json(other).await["detail"].as_str().unwrap().contains("Weld"));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_stream_request_validation() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    dispatcher.start();
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));

    let missing = get(&app, request("/asset_stream?id=temp")).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let bad_token = get(&app, request("/asset_stream?asset_uuid=ASSET-42&after=soon")).await;
    assert_eq!(bad_token.status(), StatusCode::BAD_REQUEST);

    let wrong_group = get(&app, request("/group/Paint/asset_stream?asset_uuid=ASSET-42")).await;
    assert_eq!(wrong_group.status(), StatusCode::NOT_FOUND);

    assert_eq!(dispatcher.stats().sessions, 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_group_route_streams_ndjson() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    dispatcher.start();
    assert!(
        dispatcher
            .wait_for_state(DispatcherState::Consuming, Duration::from_secs(3))
            .await
    );
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));

    let response = get(&app, request("/group/Weld/asset_stream?asset_uuid=ASSET-42&id=temp")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(dispatcher.stats().sessions, 1);

    let log = broker.topic("asset_stream_Weld");
    log.append_json("ASSET-42", &json!({"id": "avail", "value": "AVAILABLE"}));
    log.append_json("ASSET-42", &json!({"id": "temp", "value": 22}));

    let mut body = response.into_body().into_data_stream();
    let line = next_line(&mut body).await;
    assert_eq!(line["event"], "asset_update");
    assert_eq!(line["sequence_token"], "0:1");
    assert_eq!(line["data"]["value"], 22);

    drop(body);
    assert_eq!(dispatcher.stats().sessions, 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    dispatcher.start();
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));

    let response = get(&app, request("/asset_stream?asset_uuid=ASSET-42")).await;
    let mut body = response.into_body().into_data_stream();

    dispatcher.shutdown().await;
    let end = tokio::time::timeout(Duration::from_secs(3), body.next()).await.unwrap();
    assert!(end.is_none());

    let rejected = get(&app, request("/asset_stream?asset_uuid=ASSET-42")).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_info_reports_stats() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::default()));
    let _sub = dispatcher
        .subscribe(assetstream::dispatcher::SessionFilter::entity("ASSET-42"), None)
        .unwrap();

    let info = body_json(get(&app, request("/info")).await).await;
    assert_eq!(info["service"], "dispatcher");
    assert_eq!(info["dispatcher"]["sessions"], 1);
    assert_eq!(info["sessions"].as_array().unwrap().len(), 1);
}
