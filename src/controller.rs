//! Routing controller.
//!
//! Maps an entity to its group's live Dispatcher:
//!
//! 1. resolve the entity's group ([`GroupResolver`])
//! 2. ensure a registry entry for the group ([`GroupRegistry::ensure`])
//!    with a provisioner that creates the derived log, asks the
//!    [`DeploymentPlatform`] to run the group's Dispatcher, and polls the new
//!    Dispatcher until it reports ready
//!
//! The provisioner is bounded by `provisioning_timeout`. An endpoint is only
//! handed out once its Dispatcher's readiness probe succeeds, which in turn
//! requires an attached log consumer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde::Serialize;

use crate::background_tasks::BackgroundTaskRegistry;
use crate::config::{DispatcherConfig, RouterConfig};
use crate::deployment::{DeploymentPlatform, ServiceSpec};
use crate::error::{Error, Result};
use crate::grouping::{GroupResolver, GroupingStrategy, build_strategy};
use crate::metrics;
use crate::registry::GroupRegistry;
use crate::retry;
use crate::types::{GroupNaming, LifecycleState};

/// Result of routing one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub group: String,
    pub endpoint: String,
}

/// Timing and naming knobs of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub naming: GroupNaming,
    pub dispatcher: DispatcherConfig,
    pub provisioning_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub ready_probe_timeout: Duration,
    pub health_check_interval: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            naming: config.naming.clone(),
            dispatcher: config.dispatcher.clone(),
            provisioning_timeout: config.provisioning_timeout,
            readiness_poll_interval: config.readiness_poll_interval,
            ready_probe_timeout: config.ready_probe_timeout,
            health_check_interval: config.health_check_interval,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

/// Everything one provisioning round needs, detached from the controller.
#[derive(Clone)]
struct Provisioning {
    group: String,
    strategy: Arc<dyn GroupingStrategy>,
    platform: Arc<dyn DeploymentPlatform>,
    settings: ControllerSettings,
}

impl Provisioning {
    async fn run(self) -> Result<String> {
        let timeout = self.settings.provisioning_timeout;
        match tokio::time::timeout(timeout, self.provision()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProvisionTimeout {
                group: self.group.clone(),
                timeout,
            }),
        }
    }

    async fn provision(&self) -> Result<String> {
        let group = self.group.as_str();
        let naming = &self.settings.naming;
        let service_id = naming.service_id(group);

        retry::with_policy("create_derived_log", retry::metadata_policy(), || {
            self.strategy.create_derived_log(group)
        })
        .await?;

        let spec = ServiceSpec::for_group(group, naming, &self.settings.dispatcher);
        let endpoint = retry::with_policy("ensure_running", retry::deployment_policy(), || {
            self.platform.ensure_running(&service_id, &spec)
        })
        .await?;
        tracing::info!(group, service = %service_id, endpoint = %endpoint, "Waiting for dispatcher readiness");

        loop {
            match self.platform.check_ready(&endpoint, group).await {
                Ok(true) => return Ok(endpoint),
                Ok(false) => {}
                Err(e) => tracing::debug!(group, endpoint = %endpoint, error = %e, "Readiness probe failed"),
            }
            tokio::time::sleep(self.settings.readiness_poll_interval).await;
        }
    }
}

/// Routes entities to live group Dispatchers.
pub struct RoutingController {
    resolver: GroupResolver,
    registry: GroupRegistry,
    platform: Arc<dyn DeploymentPlatform>,
    settings: ControllerSettings,
}

impl RoutingController {
    pub fn new(
        resolver: GroupResolver,
        registry: GroupRegistry,
        platform: Arc<dyn DeploymentPlatform>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            resolver,
            registry,
            platform,
            settings,
        }
    }

    /// Build the strategy, resolver and registry named by `config`.
    pub fn from_config(config: &RouterConfig, platform: Arc<dyn DeploymentPlatform>) -> Result<Self> {
        let strategy = build_strategy(config)?;
        let resolver = GroupResolver::new(
            strategy,
            config.resolver_cache_ttl,
            config.resolver_cache_capacity,
        );
        let registry = GroupRegistry::new(config.health_failure_threshold);
        Ok(Self::new(
            resolver,
            registry,
            platform,
            ControllerSettings::from_config(config),
        ))
    }

    pub fn resolver(&self) -> &GroupResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn platform(&self) -> &Arc<dyn DeploymentPlatform> {
        &self.platform
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Group and live Dispatcher endpoint of `entity_id`.
    pub async fn route(&self, entity_id: &str) -> Result<Route> {
        let result = async {
            let group = self.resolver.resolve(entity_id).await?;
            let endpoint = self.ensure_group(&group).await?;
            Ok::<_, Error>(Route { group, endpoint })
        }
        .await;

        match &result {
            Ok(route) => {
                metrics::record_route("ok");
                tracing::debug!(entity_id, group = %route.group, endpoint = %route.endpoint, "Routed");
            }
            Err(e) => {
                metrics::record_route(e.as_metric_label());
                tracing::debug!(entity_id, error = %e, "Routing failed");
            }
        }
        result
    }

    /// Endpoint of `group`'s Dispatcher, provisioning it if necessary.
    pub async fn ensure_group(&self, group: &str) -> Result<String> {
        self.registry.ensure(group, self.provisioner(group)).await
    }

    fn provisioner(&self, group: &str) -> impl FnOnce() -> BoxFuture<'static, Result<String>> + Send + 'static {
        let provisioning = Provisioning {
            group: group.to_string(),
            strategy: self.resolver.strategy().clone(),
            platform: self.platform.clone(),
            settings: self.settings.clone(),
        };
        move || Box::pin(provisioning.run())
    }

    /// Provision every known group concurrently.
    ///
    /// Individual failures are logged and reported, never fatal.
    pub async fn provision_all(&self) -> Result<Vec<(String, Result<String>)>> {
        let groups = self.resolver.all_groups().await?;
        tracing::info!(groups = groups.len(), "Provisioning all known groups");

        let results = join_all(groups.into_iter().map(|group| async move {
            let result = self.ensure_group(&group).await;
            if let Err(e) = &result {
                tracing::warn!(group = %group, error = %e, "Eager provisioning failed");
            }
            (group, result)
        }))
        .await;

        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        tracing::info!(provisioned = ok, failed = results.len() - ok, "Eager provisioning finished");
        Ok(results)
    }

    /// Provision every known group ahead of traffic, for a router that exits
    /// right afterwards.
    ///
    /// Fails with `Config` when the platform's Dispatchers would die with
    /// this process.
    pub async fn deploy_all(&self) -> Result<Vec<(String, Result<String>)>> {
        if !self.platform.outlives_router() {
            return Err(Error::Config(format!(
                "deployment platform '{}' stops its dispatchers when the router exits; \
                 deploy needs a platform such as 'static'",
                self.platform.name()
            )));
        }
        self.provision_all().await
    }

    /// Stop `group`'s Dispatcher, drop its derived log and forget it.
    pub async fn teardown_group(&self, group: &str) -> Result<()> {
        let service_id = self.settings.naming.service_id(group);
        retry::with_policy("stop_service", retry::deployment_policy(), || {
            self.platform.stop(&service_id)
        })
        .await?;
        self.resolver
            .strategy()
            .remove_derived_log(group)
            .await?;
        self.registry.remove(group);
        tracing::info!(group, service = %service_id, "Group torn down");
        Ok(())
    }

    /// Tear down every known and registered group.
    pub async fn teardown(&self) -> Result<Vec<(String, Result<()>)>> {
        let mut groups: Vec<String> = match self.resolver.all_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list groups, tearing down registered groups only");
                Vec::new()
            }
        };
        groups.extend(self.registry.snapshot().into_iter().map(|e| e.group_label));
        groups.sort();
        groups.dedup();

        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let result = self.teardown_group(&group).await;
            if let Err(e) = &result {
                tracing::warn!(group = %group, error = %e, "Teardown failed");
            }
            results.push((group, result));
        }
        Ok(results)
    }

    /// Reasons the routing layer is not ready, keyed by component.
    pub async fn readiness(&self) -> BTreeMap<String, String> {
        let mut issues = BTreeMap::new();
        if let Err(reason) = self.resolver.strategy().readiness().await {
            issues.insert("grouping".to_string(), reason);
        }
        for entry in self.registry.snapshot() {
            let issue = match entry.state {
                LifecycleState::Degraded => format!(
                    "degraded after {} failed health checks",
                    entry.consecutive_failures
                ),
                LifecycleState::Stopped => "dispatcher stopped".to_string(),
                _ => continue,
            };
            issues.insert(format!("group:{}", entry.group_label), issue);
        }
        issues
    }

    /// Probe every ACTIVE or DEGRADED group once.
    pub async fn check_health(&self) {
        let probes = self.registry.monitored().into_iter().map(|(group, endpoint)| async move {
            let service_id = self.settings.naming.service_id(&group);
            if let Ok(false) = self.platform.is_running(&service_id).await {
                tracing::warn!(group = %group, service = %service_id, "Dispatcher no longer running");
                metrics::record_health_check(false);
                self.registry.mark_stopped(&group);
                return;
            }

            let ready = tokio::time::timeout(
                self.settings.ready_probe_timeout,
                self.platform.check_ready(&endpoint, &group),
            )
            .await;
            match ready {
                Ok(Ok(true)) => {
                    metrics::record_health_check(true);
                    self.registry.mark_healthy(&group);
                }
                outcome => {
                    metrics::record_health_check(false);
                    let state = self.registry.mark_unhealthy(&group);
                    tracing::debug!(group = %group, endpoint = %endpoint, ?outcome, ?state, "Health check failed");
                }
            }
        });
        join_all(probes).await;
    }

    /// Run [`check_health`](Self::check_health) every health check interval.
    pub fn spawn_health_monitor(self: &Arc<Self>, tasks: &BackgroundTaskRegistry) {
        let controller = self.clone();
        tasks.spawn_periodic(
            "health-monitor",
            self.settings.health_check_interval,
            move |_tick| {
                let controller = controller.clone();
                async move { controller.check_health().await }
            },
        );
    }
}

impl std::fmt::Debug for RoutingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingController")
            .field("resolver", &self.resolver)
            .field("registry", &self.registry)
            .field("platform", &self.platform.name())
            .finish()
    }
}
