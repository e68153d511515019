//! Deployment platforms that run per-group Dispatchers.
//!
//! The routing layer only needs three idempotent operations plus a readiness
//! probe, captured by [`DeploymentPlatform`]. Implementations are chosen at
//! startup from the fixed [`PLATFORMS`] table by `DEPLOYMENT_PLATFORM`:
//!
//! | Name | Runs Dispatchers as | Endpoint |
//! |------|---------------------|----------|
//! | `embedded` | tasks inside the router process | `http://127.0.0.1:<ephemeral>` |
//! | `process` | child processes of the router | `http://<host>:<port>`, see [`process`] |
//! | `static` | services of an external orchestrator | URL template |
//!
//! A recording [`MockPlatform`] is available with the `test-utilities`
//! feature.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::background_tasks::BackgroundTaskRegistry;
use crate::config::{DispatcherConfig, LogBackend, RouterConfig};
use crate::constants::DEFAULT_READY_PROBE_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::log::LogSourceFactory;
use crate::types::GroupNaming;

pub mod embedded;
#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;
pub mod process;
pub mod static_endpoints;

pub use embedded::EmbeddedPlatform;
#[cfg(any(test, feature = "test-utilities"))]
pub use mock::{MockCall, MockPlatform};
pub use process::ProcessPlatform;
pub use static_endpoints::StaticPlatform;

/// What a platform needs to start one group's Dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub group: String,
    pub derived_log_id: String,
    pub consumer_group: String,
    /// Environment handed to out-of-process Dispatchers.
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Spec for `group`, inheriting broker and tuning from `template`.
    pub fn for_group(group: &str, naming: &GroupNaming, template: &DispatcherConfig) -> Self {
        let derived_log_id = naming.derived_log_id(group);
        let consumer_group = naming.consumer_group(group);

        let mut env = BTreeMap::new();
        env.insert("GROUP".to_string(), group.to_string());
        env.insert("KAFKA_TOPIC".to_string(), derived_log_id.clone());
        env.insert("KAFKA_CONSUMER_GROUP_ID".to_string(), consumer_group.clone());
        env.insert("KAFKA_BROKER".to_string(), template.broker.clone());
        env.insert(
            "LOG_BACKEND".to_string(),
            match template.log_backend {
                LogBackend::Kafka => "kafka",
                LogBackend::Memory => "memory",
            }
            .to_string(),
        );
        env.insert("QUEUE_CAPACITY".to_string(), template.queue_capacity.to_string());
        env.insert(
            "FANOUT_BUFFER_CAPACITY".to_string(),
            template.fanout_buffer_capacity.to_string(),
        );
        env.insert(
            "KEEPALIVE_INTERVAL_SECS".to_string(),
            template.keepalive_interval.as_secs().to_string(),
        );

        Self {
            group: group.to_string(),
            derived_log_id,
            consumer_group,
            env,
        }
    }

    /// Dispatcher configuration for this spec on top of `template`.
    pub fn dispatcher_config(&self, template: &DispatcherConfig) -> DispatcherConfig {
        DispatcherConfig {
            group: self.group.clone(),
            topic: self.derived_log_id.clone(),
            consumer_group: self.consumer_group.clone(),
            ..template.clone()
        }
    }
}

static PROBE_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_READY_PROBE_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// `{endpoint}/group/{group}/{leaf}`, with `group` encoded as one path
/// segment.
pub fn group_url(endpoint: &str, group: &str, leaf: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| Error::Upstream(format!("invalid dispatcher endpoint '{endpoint}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::Upstream(format!("dispatcher endpoint '{endpoint}' cannot carry a path")))?
        .pop_if_empty()
        .extend(["group", group, leaf]);
    Ok(url)
}

/// `GET {endpoint}/group/{group}/ready`, true on a 2xx answer.
///
/// A Dispatcher serving another group answers 404, so a stale or colliding
/// endpoint never passes for `group`'s. Connection failures count as not
/// ready rather than as errors: a freshly started service is expected to
/// refuse connections for a while.
pub async fn probe_ready(client: &reqwest::Client, endpoint: &str, group: &str) -> Result<bool> {
    let url = group_url(endpoint, group, "ready")?;
    match client.get(url.clone()).send().await {
        Ok(response) => Ok(response.status().is_success()),
        Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
        Err(e) => Err(Error::Upstream(format!("readiness probe {url} failed: {e}"))),
    }
}

/// Runs, probes and stops per-group Dispatcher services.
#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the service unless it already runs and return its endpoint.
    async fn ensure_running(&self, service_id: &str, spec: &ServiceSpec) -> Result<String>;

    async fn is_running(&self, service_id: &str) -> Result<bool>;

    /// Stop the service. Stopping an unknown service succeeds.
    async fn stop(&self, service_id: &str) -> Result<()>;

    /// Whether the service behind `endpoint` is `group`'s Dispatcher and
    /// reports ready.
    async fn check_ready(&self, endpoint: &str, group: &str) -> Result<bool> {
        probe_ready(&PROBE_CLIENT, endpoint, group).await
    }

    /// Whether services keep running after this router process exits.
    fn outlives_router(&self) -> bool {
        true
    }
}

/// Shared resources a platform may need at construction.
#[derive(Clone)]
pub struct PlatformContext {
    pub tasks: Arc<BackgroundTaskRegistry>,
    pub log_factory: Arc<dyn LogSourceFactory>,
}

pub type PlatformFactory = fn(&RouterConfig, &PlatformContext) -> Result<Arc<dyn DeploymentPlatform>>;

fn embedded_platform(
    config: &RouterConfig,
    ctx: &PlatformContext,
) -> Result<Arc<dyn DeploymentPlatform>> {
    Ok(Arc::new(EmbeddedPlatform::new(
        config.dispatcher.clone(),
        ctx.log_factory.clone(),
        ctx.tasks.clone(),
    )))
}

fn process_platform(
    config: &RouterConfig,
    _ctx: &PlatformContext,
) -> Result<Arc<dyn DeploymentPlatform>> {
    Ok(Arc::new(ProcessPlatform::new(config.process.clone())))
}

fn static_platform(
    config: &RouterConfig,
    _ctx: &PlatformContext,
) -> Result<Arc<dyn DeploymentPlatform>> {
    Ok(Arc::new(StaticPlatform::new(&config.static_endpoint_template)))
}

/// Registered deployment platforms.
pub const PLATFORMS: &[(&str, PlatformFactory)] = &[
    ("embedded", embedded_platform),
    ("process", process_platform),
    ("static", static_platform),
];

/// Build the platform named by `config.deployment_platform`.
pub fn build_platform(
    config: &RouterConfig,
    ctx: &PlatformContext,
) -> Result<Arc<dyn DeploymentPlatform>> {
    let name = config.deployment_platform.to_lowercase();
    let factory = PLATFORMS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| f)
        .ok_or_else(|| {
            let known: Vec<_> = PLATFORMS.iter().map(|(n, _)| *n).collect();
            Error::Config(format!(
                "unknown deployment platform '{}'. Valid platforms: {}",
                config.deployment_platform,
                known.join(", ")
            ))
        })?;
    factory(config, ctx)
}
