//! ksqlDB-backed grouping and state lookups against a fake ksqlDB server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetstream::controller::{ControllerSettings, RoutingController};
use assetstream::deployment::MockPlatform;
use assetstream::grouping::{GroupResolver, GroupingStrategy, UnsLevelGroupingStrategy};
use assetstream::http::{StateAppState, state_router};
use assetstream::ksql::KsqlClient;
use assetstream::registry::GroupRegistry;
use assetstream::state::{KsqlStateStore, StateStore};
use assetstream::types::GroupNaming;
use assetstream::Error;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};
use tower::ServiceExt;

const STATE_SCHEMA: &str = "`ASSET_UUID` STRING, `ID` STRING, `VALUE` STRING, `TYPE` STRING, `TAG` STRING, `TIMESTAMP` STRING";

/// Answers the handful of statements the crate issues, recording each one.
#[derive(Clone, Default)]
struct FakeKsql {
    statements: Arc<Mutex<Vec<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl FakeKsql {
    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn record(&self, body: &Value) -> Option<String> {
        let sql = body["ksql"].as_str()?.to_string();
        self.statements.lock().unwrap().push(sql.clone());
        Some(sql)
    }

    fn overloaded(&self) -> Option<Response> {
        self.unavailable.load(Ordering::SeqCst).then(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"@type": "generic_error", "message": "server overloaded"})),
            )
                .into_response()
        })
    }
}

fn frames(schema: &str, rows: &[Value]) -> Json<Value> {
    let mut frames = vec![json!({"header": {"queryId": "q1", "schema": schema}})];
    frames.extend(rows.iter().map(|row| json!({"row": {"columns": row}})));
    Json(Value::Array(frames))
}

fn state_row(asset: &str, id: &str, value: &str) -> Value {
    json!([asset, id, value, "Samples", "Temperature", "2026-10-19T08:00:00Z"])
}

async fn query(State(fake): State<FakeKsql>, Json(body): Json<Value>) -> Response {
    if let Some(response) = fake.overloaded() {
        return response;
    }
    let Some(sql) = fake.record(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if sql.contains("AS GRP") {
        let group = if sql.contains("'ASSET-42'") {
            vec![json!(["Weld"])]
        } else if sql.contains("'ASSET-9'") {
            vec![json!(["Paint"])]
        } else if sql.contains("'ASSET-0'") {
            vec![json!([null])]
        } else {
            Vec::new()
        };
        return frames("`GRP` STRING", &group).into_response();
    }
    if sql.contains("AS GROUPS") {
        let rows = [json!(["Weld"]), json!(["Paint"]), json!(["Weld"]), json!([""])];
        return frames("`GROUPS` STRING", &rows).into_response();
    }
    if sql.starts_with("SELECT ASSET_UUID FROM") {
        let rows = if sql.contains("'Weld'") {
            vec![json!(["ASSET-7"]), json!(["ASSET-42"])]
        } else {
            Vec::new()
        };
        return frames("`ASSET_UUID` STRING KEY", &rows).into_response();
    }
    if sql.contains("key = 'ASSET-42|temp'") {
        return frames(STATE_SCHEMA, &[state_row("ASSET-42", "temp", "21.5")]).into_response();
    }
    if sql.contains("asset_uuid = 'ASSET-42'") {
        let rows = [
            state_row("ASSET-42", "avail", "AVAILABLE"),
            state_row("ASSET-42", "temp", "21.5"),
        ];
        return frames(STATE_SCHEMA, &rows).into_response();
    }
    if sql.contains("O''Brien") {
        return frames(STATE_SCHEMA, &[]).into_response();
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"@type": "statement_error", "message": format!("unexpected query: {sql}")})),
    )
        .into_response()
}

async fn statement(State(fake): State<FakeKsql>, Json(body): Json<Value>) -> Response {
    if let Some(response) = fake.overloaded() {
        return response;
    }
    let Some(sql) = fake.record(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if sql.starts_with("SHOW TABLES") {
        return Json(json!([{
            "@type": "tables",
            "tables": [
                {"name": "ASSET_TO_UNS_MAP", "type": "TABLE"},
                {"name": "ASSETS", "type": "TABLE"}
            ]
        }]))
        .into_response();
    }
    Json(json!([{"@type": "currentStatus", "commandStatus": {"status": "SUCCESS"}}])).into_response()
}

async fn healthcheck(State(fake): State<FakeKsql>) -> Json<Value> {
    Json(json!({"isHealthy": !fake.unavailable.load(Ordering::SeqCst)}))
}

async fn start_fake() -> (FakeKsql, String) {
    let fake = FakeKsql::default();
    let app = axum::Router::new()
        .route("/query", post(query))
        .route("/ksql", post(statement))
        .route("/healthcheck", get(healthcheck))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await });
    (fake, url)
}

fn client(url: &str) -> KsqlClient {
    KsqlClient::new(url, Duration::from_secs(2)).unwrap()
}

fn strategy(url: &str, uns_map: &str) -> UnsLevelGroupingStrategy {
    UnsLevelGroupingStrategy::new(
        client(url),
        "workcenter",
        uns_map,
        "enriched_assets_stream",
        GroupNaming::default(),
    )
}

// ============================================================================
// Client
// ============================================================================

#[tokio::test]
async fn test_client_tables_and_healthcheck() {
    let (fake, url) = start_fake().await;
    let ksql = client(&url);

    assert_eq!(ksql.tables().await.unwrap(), vec!["ASSET_TO_UNS_MAP", "ASSETS"]);
    ksql.healthcheck().await.unwrap();

    fake.unavailable.store(true, Ordering::SeqCst);
    let err = ksql.tables().await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert!(err.to_string().contains("server overloaded"));
}

#[tokio::test]
async fn test_client_statement_error_is_upstream() {
    let (_, url) = start_fake().await;
    let err = client(&url).query("SELECT nonsense;").await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));
    assert!(err.to_string().contains("unexpected query"));
}

#[tokio::test]
async fn test_client_unreachable_server() {
    let err = client("http://127.0.0.1:1").tables().await.unwrap_err();
    assert!(err.is_retriable());
}

// ============================================================================
// UNS-level grouping
// ============================================================================

#[tokio::test]
async fn test_uns_level_lookups() {
    let (_, url) = start_fake().await;
    let strategy = strategy(&url, "asset_to_uns_map");

    assert_eq!(strategy.group_for("ASSET-42").await.unwrap().as_deref(), Some("Weld"));
    assert_eq!(strategy.group_for("ASSET-0").await.unwrap(), None);
    assert_eq!(strategy.group_for("UNKNOWN").await.unwrap(), None);
    assert_eq!(strategy.all_groups().await.unwrap(), vec!["Paint", "Weld"]);
    assert_eq!(strategy.assets_in_group("Weld").await.unwrap(), vec!["ASSET-42", "ASSET-7"]);
    assert!(strategy.readiness().await.is_ok());
}

#[tokio::test]
async fn test_uns_level_readiness_needs_mapping_table() {
    let (fake, url) = start_fake().await;
    let reason = strategy(&url, "missing_map").readiness().await.unwrap_err();
    assert!(reason.contains("missing_map"));

    fake.unavailable.store(true, Ordering::SeqCst);
    let reason = strategy(&url, "asset_to_uns_map").readiness().await.unwrap_err();
    assert!(reason.contains("connection failed"));
}

#[tokio::test]
async fn test_routing_creates_and_drops_derived_stream() {
    let (fake, url) = start_fake().await;
    let platform = Arc::new(MockPlatform::new());
    let controller = RoutingController::new(
        GroupResolver::new(
            Arc::new(strategy(&url, "asset_to_uns_map")),
            Duration::from_secs(60),
            1000,
        ),
        GroupRegistry::new(3),
        platform.clone(),
        ControllerSettings {
            readiness_poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let route = controller.route("ASSET-42").await.unwrap();
    assert_eq!(route.group, "Weld");
    assert_eq!(route.endpoint, "http://stream-api-group-weld.mock");
    assert!(fake
        .statements()
        .iter()
        .any(|s| s.starts_with("CREATE STREAM IF NOT EXISTS asset_stream_Weld")));

    let err = controller.route("UNKNOWN").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    controller.teardown_group("Weld").await.unwrap();
    assert!(fake
        .statements()
        .contains(&"DROP STREAM IF EXISTS asset_stream_Weld DELETE TOPIC;".to_string()));
    assert!(controller.registry().is_empty());
}

// ============================================================================
// State store and state API
// ============================================================================

#[tokio::test]
async fn test_state_store_queries() {
    let (fake, url) = start_fake().await;
    let store = KsqlStateStore::new(client(&url), "assets");

    let item = store.data_item("ASSET-42", "temp").await.unwrap().unwrap();
    assert_eq!(item.asset_uuid, "ASSET-42");
    assert_eq!(item.item.value, "21.5");
    assert_eq!(item.item.tag, "Temperature");

    let items = store.asset("ASSET-42").await.unwrap();
    assert_eq!(items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["avail", "temp"]);

    assert!(store.asset("O'Brien").await.unwrap().is_empty());
    assert!(fake.statements().iter().any(|s| s.contains("asset_uuid = 'O''Brien'")));
    assert!(store.readiness().await.is_ok());
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_state_api_over_ksql() {
    let (fake, url) = start_fake().await;
    let store = KsqlStateStore::new(client(&url), "assets");
    let app = state_router(StateAppState::new(Arc::new(store)));

    let (status, body) = get_json(&app, "/asset_state?asset_uuid=ASSET-42&id=temp").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["asset_uuid"], "ASSET-42");
    assert_eq!(body["id"], "temp");
    assert_eq!(body["type"], "Samples");

    let (status, body) = get_json(&app, "/asset_state?asset_uuid=ASSET-42").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dataItems"].as_array().unwrap().len(), 2);

    let (status, _) = get_json(&app, "/ready").await;
    assert_eq!(status, StatusCode::OK);

    fake.unavailable.store(true, Ordering::SeqCst);
    let (status, body) = get_json(&app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["issues"].as_str().unwrap().contains("unreachable"));
}
