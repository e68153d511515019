//! Routing layer end to end: router HTTP surface, on-demand provisioning of
//! embedded Dispatchers over the in-memory log, and NDJSON proxying.

use std::sync::Arc;
use std::time::Duration;

use assetstream::background_tasks::BackgroundTaskRegistry;
use assetstream::constants::DEFAULT_HEALTH_FAILURE_THRESHOLD;
use assetstream::config::{DispatcherConfig, LogBackend, RouterConfig, RoutingMode, ServiceInfo};
use assetstream::controller::{ControllerSettings, RoutingController};
use assetstream::deployment::{DeploymentPlatform, EmbeddedPlatform, MockPlatform, ServiceSpec};
use assetstream::dispatcher::Dispatcher;
use assetstream::grouping::{GroupResolver, StaticGroupingStrategy};
use assetstream::http::{DispatcherAppState, RouterAppState, dispatcher_router, routing_router};
use assetstream::log::MemoryBroker;
use assetstream::registry::GroupRegistry;
use assetstream::types::{GroupNaming, LifecycleState};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;

const TIMEOUT: Duration = Duration::from_secs(5);

fn strategy() -> Arc<StaticGroupingStrategy> {
    Arc::new(StaticGroupingStrategy::new(
        [
            ("ASSET-42".to_string(), "Weld".to_string()),
            ("ASSET-7".to_string(), "Weld".to_string()),
            ("ASSET-9".to_string(), "Paint".to_string()),
        ]
        .into_iter()
        .collect(),
    ))
}

fn router_config() -> RouterConfig {
    let mut config = RouterConfig {
        provisioning_timeout: Duration::from_secs(10),
        readiness_poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    config.dispatcher.log_backend = LogBackend::Memory;
    config.dispatcher.drain_grace = Duration::from_millis(200);
    config
}

fn controller(config: &RouterConfig, platform: Arc<dyn DeploymentPlatform>) -> Arc<RoutingController> {
    Arc::new(RoutingController::new(
        GroupResolver::new(strategy(), Duration::from_secs(60), 1000),
        GroupRegistry::new(config.health_failure_threshold),
        platform,
        ControllerSettings::from_config(config),
    ))
}

struct Harness {
    broker: MemoryBroker,
    platform: Arc<EmbeddedPlatform>,
    controller: Arc<RoutingController>,
    tasks: Arc<BackgroundTaskRegistry>,
    base_url: String,
}

impl Harness {
    async fn start() -> Self {
        let config = router_config();
        let broker = MemoryBroker::new();
        let tasks = Arc::new(BackgroundTaskRegistry::new());
        let platform = Arc::new(EmbeddedPlatform::new(
            config.dispatcher.clone(),
            Arc::new(broker.clone()),
            tasks.clone(),
        ));
        let controller = controller(&config, platform.clone());

        let state = RouterAppState::new(controller.clone(), &config, ServiceInfo::default()).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let app = routing_router(state);
        tasks.spawn("test-router", async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            broker,
            platform,
            controller,
            tasks,
            base_url,
        }
    }

    async fn stop(self) {
        self.platform.stop_all().await;
        self.tasks.shutdown_all_with_timeout(Duration::from_secs(2)).await;
    }
}

/// Splits a streamed response body into NDJSON lines.
struct LineReader {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Value {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return serde_json::from_slice(&line).expect("valid NDJSON line");
            }
            let chunk = tokio::time::timeout(TIMEOUT, self.body.next())
                .await
                .expect("timed out waiting for a line")
                .expect("stream ended")
                .expect("body error");
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// Next line that is not a keepalive.
    async fn next_update(&mut self) -> Value {
        loop {
            let line = self.next_line().await;
            if line["event"] != "keepalive" {
                return line;
            }
        }
    }
}

// ============================================================================
// Proxied streams over embedded Dispatchers
// ============================================================================

#[tokio::test]
async fn test_stream_is_proxied_from_provisioned_dispatcher() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/asset_stream", harness.base_url))
        .query(&[("asset_uuid", "ASSET-42"), ("ignored", "x")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");
    assert_eq!(response.headers()["x-asset-group"], "Weld");
    assert_eq!(harness.controller.registry().state("Weld"), LifecycleState::Active);
    assert_eq!(harness.platform.service_ids(), vec!["stream-api-group-weld".to_string()]);

    let log = harness.broker.topic("asset_stream_Weld");
    log.append_json("ASSET-7", &json!({"id": "temp", "value": 1}));
    log.append_json("ASSET-42", &json!({"id": "temp", "value": 21.5}));

    let mut lines = LineReader::new(response);
    let update = lines.next_update().await;
    assert_eq!(update["event"], "asset_update");
    assert_eq!(update["asset_uuid"], "ASSET-42");
    assert_eq!(update["id"], "temp");
    assert_eq!(update["sequence_token"], "0:1");
    assert_eq!(update["data"]["value"], 21.5);

    drop(lines);
    harness.stop().await;
}

#[tokio::test]
async fn test_item_filter_and_resume_are_forwarded() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    // First request provisions the group; let the Dispatcher buffer a few events.
    let first = client
        .get(format!("{}/asset_stream", harness.base_url))
        .query(&[("asset_uuid", "ASSET-42")])
        .send()
        .await
        .unwrap();
    let log = harness.broker.topic("asset_stream_Weld");
    log.append_json("ASSET-42", &json!({"id": "avail", "value": "AVAILABLE"}));
    let token = log.append_json("ASSET-42", &json!({"id": "temp", "value": 20}));
    log.append_json("ASSET-42", &json!({"id": "temp", "value": 21}));
    let mut first = LineReader::new(first);
    for _ in 0..3 {
        first.next_update().await;
    }

    let resumed = client
        .get(format!("{}/asset_stream", harness.base_url))
        .query(&[("asset_uuid", "ASSET-42"), ("id", "temp")])
        .header("Last-Event-ID", token.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resumed.status(), 200);
    let mut resumed = LineReader::new(resumed);
    let update = resumed.next_update().await;
    assert_eq!(update["sequence_token"], "0:2");
    assert_eq!(update["data"]["value"], 21);

    drop(first);
    drop(resumed);
    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_one_dispatcher() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let requests = (0..8).map(|i| {
        let client = client.clone();
        let url = format!("{}/asset_stream", harness.base_url);
        let entity = if i % 2 == 0 { "ASSET-42" } else { "ASSET-7" };
        async move { client.get(url).query(&[("asset_uuid", entity)]).send().await }
    });
    let responses = futures::future::join_all(requests).await;
    for response in &responses {
        assert_eq!(response.as_ref().unwrap().status(), 200);
    }

    assert_eq!(harness.platform.service_ids().len(), 1);
    let dispatcher = harness.platform.dispatcher("stream-api-group-weld").unwrap();
    assert_eq!(dispatcher.stats().sessions, 8);

    drop(responses);
    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_entity_is_404_without_provisioning() {
    let harness = Harness::start().await;
    let response = reqwest::Client::new()
        .get(format!("{}/asset_stream", harness.base_url))
        .query(&[("asset_uuid", "NOPE")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("NOPE"));
    assert!(harness.platform.service_ids().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn test_teardown_stops_embedded_dispatchers() {
    let harness = Harness::start().await;
    let results = harness.controller.provision_all().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(harness.platform.service_ids().len(), 2);

    let torn_down = harness.controller.teardown().await.unwrap();
    assert!(torn_down.iter().all(|(_, r)| r.is_ok()));
    assert!(harness.platform.service_ids().is_empty());
    assert!(harness.controller.registry().is_empty());
    harness.stop().await;
}

// ============================================================================
// Router surface over a mock platform
// ============================================================================

fn mock_app(mode: RoutingMode, state_api_url: Option<String>) -> (axum::Router, Arc<MockPlatform>, Arc<RoutingController>) {
    let mut config = router_config();
    config.routing_mode = mode;
    config.state_api_url = state_api_url;
    let platform = Arc::new(MockPlatform::new());
    let controller = controller(&config, platform.clone());
    let state = RouterAppState::new(controller.clone(), &config, ServiceInfo::default()).unwrap();
    (routing_router(state), platform, controller)
}

async fn get(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_redirect_mode_points_at_dispatcher() {
    let (app, platform, _) = mock_app(RoutingMode::Redirect, None);
    let response = get(&app, "/asset_stream?asset_uuid=ASSET-42&id=temp&secret=1").await;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://stream-api-group-weld.mock/group/Weld/asset_stream?asset_uuid=ASSET-42&id=temp"
    );
    assert_eq!(platform.ensure_count(), 1);
}

#[tokio::test]
async fn test_missing_asset_uuid_is_400() {
    let (app, platform, _) = mock_app(RoutingMode::Redirect, None);
    let response = get(&app, "/asset_stream?id=temp").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["detail"].as_str().unwrap().contains("asset_uuid"));
    assert_eq!(platform.ensure_count(), 0);
}

#[tokio::test]
async fn test_provisioning_failure_is_503_with_retry_after() {
    let mut config = router_config();
    config.routing_mode = RoutingMode::Redirect;
    config.provisioning_timeout = Duration::from_millis(200);
    let platform = Arc::new(MockPlatform::new());
    platform.set_never_ready(true);
    let controller = controller(&config, platform.clone());
    let app = routing_router(RouterAppState::new(controller.clone(), &config, ServiceInfo::default()).unwrap());

    let response = get(&app, "/asset_stream?asset_uuid=ASSET-9").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(controller.registry().state("Paint"), LifecycleState::Unknown);
}

#[tokio::test]
async fn test_ready_reports_degraded_groups() {
    let (app, _, controller) = mock_app(RoutingMode::Redirect, None);
    assert_eq!(get(&app, "/ready").await.status(), StatusCode::OK);

    controller.route("ASSET-42").await.unwrap();
    for _ in 0..DEFAULT_HEALTH_FAILURE_THRESHOLD {
        controller.registry().mark_unhealthy("Weld");
    }
    let response = get(&app, "/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "not ready");
    assert!(body["issues"]["group:Weld"].as_str().unwrap().contains("degraded"));
}

#[tokio::test]
async fn test_groups_lists_registry() {
    let (app, _, controller) = mock_app(RoutingMode::Redirect, None);
    controller.route("ASSET-9").await.unwrap();

    let body = body_json(get(&app, "/groups").await).await;
    let groups = body.as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["group_label"], "Paint");
    assert_eq!(groups[0]["state"], "ACTIVE");
    assert_eq!(groups[0]["endpoint"], "http://stream-api-group-paint.mock");
}

#[tokio::test]
async fn test_info_and_health() {
    let (app, _, _) = mock_app(RoutingMode::Redirect, None);
    let info = body_json(get(&app, "/info").await).await;
    assert_eq!(info["service"], "router");
    assert_eq!(info["grouping_strategy"], "static");
    assert_eq!(info["deployment_platform"], "mock");
    assert_eq!(info["routing_mode"], "redirect");

    let health = body_json(get(&app, "/health").await).await;
    assert_eq!(health["status"], "ok");
}

#[tokio::test]
async fn test_asset_state_disabled_without_state_api() {
    let (app, _, _) = mock_app(RoutingMode::Proxy, None);
    let response = get(&app, "/asset_state?asset_uuid=ASSET-42").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_asset_state_is_relayed_from_state_api() {
    let upstream = axum::Router::new().route(
        "/asset_state",
        axum::routing::get(
            |axum::extract::Query(params): axum::extract::Query<Vec<(String, String)>>| async move {
                if params.iter().any(|(k, _)| k == "secret") {
                    return (StatusCode::BAD_REQUEST, axum::Json(json!({"detail": "leaked"})));
                }
                let asset = params
                    .iter()
                    .find(|(k, _)| k == "asset_uuid")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                if asset == "ASSET-42" {
                    (StatusCode::OK, axum::Json(json!({"asset_uuid": asset, "dataItems": []})))
                } else {
                    (StatusCode::NOT_FOUND, axum::Json(json!({"detail": "no state"})))
                }
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move { axum::serve(listener, upstream).await });

    let (app, _, _) = mock_app(RoutingMode::Proxy, Some(url));
    let ok = get(&app, "/asset_state?asset_uuid=ASSET-42&secret=1").await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_json(ok).await["asset_uuid"], "ASSET-42");

    let missing = get(&app, "/asset_state?asset_uuid=ASSET-1").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    server.abort();
}

/// Reports every service ready at one fixed endpoint without probing it.
struct FixedEndpointPlatform(String);

#[async_trait::async_trait]
impl DeploymentPlatform for FixedEndpointPlatform {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn ensure_running(&self, _service_id: &str, _spec: &ServiceSpec) -> assetstream::Result<String> {
        Ok(self.0.clone())
    }

    async fn is_running(&self, _service_id: &str) -> assetstream::Result<bool> {
        Ok(true)
    }

    async fn stop(&self, _service_id: &str) -> assetstream::Result<()> {
        Ok(())
    }

    async fn check_ready(&self, _endpoint: &str, _group: &str) -> assetstream::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_unreachable_dispatcher_is_502_and_counts_against_health() {
    let config = router_config();
    let platform = Arc::new(FixedEndpointPlatform("http://127.0.0.1:1".to_string()));
    let controller = controller(&config, platform);
    let app = routing_router(RouterAppState::new(controller.clone(), &config, ServiceInfo::default()).unwrap());

    let response = tokio::time::timeout(TIMEOUT, get(&app, "/asset_stream?asset_uuid=ASSET-42"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(controller.registry().get("Weld").unwrap().consecutive_failures, 1);
}

#[tokio::test]
async fn test_dispatcher_of_another_group_is_404_and_forces_reprovisioning() {
    let broker = MemoryBroker::new();
    let mut paint_config = DispatcherConfig::for_group("Paint", &GroupNaming::default());
    paint_config.log_backend = LogBackend::Memory;
    let paint = Dispatcher::new(paint_config, Arc::new(broker.clone()));
    paint.start();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let paint_endpoint = format!("http://{}", listener.local_addr().unwrap());
    let app = dispatcher_router(DispatcherAppState::new(paint.clone(), ServiceInfo::default()));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let config = router_config();
    let controller = controller(&config, Arc::new(FixedEndpointPlatform(paint_endpoint)));
    let app = routing_router(RouterAppState::new(controller.clone(), &config, ServiceInfo::default()).unwrap());

    let response = tokio::time::timeout(TIMEOUT, get(&app, "/asset_stream?asset_uuid=ASSET-42"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["detail"].as_str().unwrap().contains("Paint"));
    assert_eq!(controller.registry().state("Weld"), LifecycleState::Stopped);
    assert_eq!(paint.stats().sessions, 0);

    paint.shutdown().await;
    server.abort();
}
