//! Group registry behaviour under concurrent routing, driven through the
//! controller against the recording mock platform.

use std::sync::Arc;
use std::time::Duration;

use assetstream::controller::{ControllerSettings, RoutingController};
use assetstream::deployment::MockPlatform;
use assetstream::grouping::{GroupResolver, StaticGroupingStrategy};
use assetstream::registry::GroupRegistry;
use assetstream::types::LifecycleState;
use futures::future::join_all;

fn controller(platform: Arc<MockPlatform>, failure_threshold: u32) -> Arc<RoutingController> {
    let strategy = StaticGroupingStrategy::new(
        [
            ("ASSET-42".to_string(), "Weld".to_string()),
            ("ASSET-7".to_string(), "Weld".to_string()),
            ("ASSET-9".to_string(), "Paint".to_string()),
        ]
        .into_iter()
        .collect(),
    );
    Arc::new(RoutingController::new(
        GroupResolver::new(Arc::new(strategy), Duration::from_secs(60), 1000),
        GroupRegistry::new(failure_threshold),
        platform,
        ControllerSettings {
            readiness_poll_interval: Duration::from_millis(10),
            provisioning_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn test_concurrent_routes_provision_each_group_once() {
    let platform = Arc::new(MockPlatform::new());
    platform.set_ensure_delay(Duration::from_millis(50));
    let controller = controller(platform.clone(), 3);

    let entities = ["ASSET-42", "ASSET-7", "ASSET-9"];
    let routes = join_all((0..48).map(|i| {
        let controller = controller.clone();
        let entity = entities[i % entities.len()];
        async move { controller.route(entity).await }
    }))
    .await;

    for route in &routes {
        let route = route.as_ref().unwrap();
        let expected = if route.group == "Weld" {
            "http://stream-api-group-weld.mock"
        } else {
            "http://stream-api-group-paint.mock"
        };
        assert_eq!(route.endpoint, expected);
    }
    assert_eq!(platform.ensure_count(), 2);
    assert_eq!(controller.registry().len(), 2);
    assert_eq!(controller.registry().state("Weld"), LifecycleState::Active);
}

#[tokio::test]
async fn test_transient_deployment_failures_are_retried() {
    let platform = Arc::new(MockPlatform::new());
    platform.fail_next_ensures(2);
    let controller = controller(platform.clone(), 3);

    let route = controller.route("ASSET-42").await.unwrap();
    assert_eq!(route.group, "Weld");
    assert_eq!(platform.ensure_count(), 3);
    assert_eq!(controller.registry().state("Weld"), LifecycleState::Active);
}

#[tokio::test]
async fn test_slow_readiness_holds_back_endpoint() {
    let platform = Arc::new(MockPlatform::new());
    platform.set_not_ready_probes(5);
    let controller = controller(platform.clone(), 3);

    controller.route("ASSET-42").await.unwrap();
    let probes = platform
        .calls()
        .iter()
        .filter(|c| matches!(c, assetstream::deployment::MockCall::CheckReady(_)))
        .count();
    assert_eq!(probes, 6);
}

#[tokio::test]
async fn test_stopped_dispatcher_is_reprovisioned() {
    let platform = Arc::new(MockPlatform::new());
    let controller = controller(platform.clone(), 3);
    controller.route("ASSET-42").await.unwrap();

    platform.kill("stream-api-group-weld");
    controller.check_health().await;
    assert_eq!(controller.registry().state("Weld"), LifecycleState::Stopped);
    assert!(controller.readiness().await.contains_key("group:Weld"));

    controller.route("ASSET-7").await.unwrap();
    assert_eq!(platform.ensure_count(), 2);
    assert_eq!(controller.registry().state("Weld"), LifecycleState::Active);
    assert!(controller.readiness().await.is_empty());
}

#[tokio::test]
async fn test_failing_health_checks_degrade_then_recover() {
    let platform = Arc::new(MockPlatform::new());
    let controller = controller(platform.clone(), 2);
    controller.route("ASSET-9").await.unwrap();

    platform.set_never_ready(true);
    controller.check_health().await;
    assert_eq!(controller.registry().state("Paint"), LifecycleState::Active);
    controller.check_health().await;
    assert_eq!(controller.registry().state("Paint"), LifecycleState::Degraded);

    let issues = controller.readiness().await;
    assert!(issues["group:Paint"].contains("degraded"));

    platform.set_never_ready(false);
    controller.check_health().await;
    assert_eq!(controller.registry().state("Paint"), LifecycleState::Active);
}
