//! Environment-style configuration for the three services.
//!
//! Each service has a plain config struct with a `Default` impl, a
//! `from_env()` constructor and a `validate()` pass:
//!
//! ```rust,no_run
//! use assetstream::config::RouterConfig;
//!
//! let config = RouterConfig::from_env().expect("invalid configuration");
//! if let Err(errors) = config.validate() {
//!     for e in errors {
//!         eprintln!("config: {e}");
//!     }
//! }
//! ```
//!
//! Unset or unparseable numeric variables fall back to the defaults in
//! [`crate::constants`]. Only addresses and enumerations fail hard.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::types::GroupNaming;

// ============================================================================
// Env helpers
// ============================================================================

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env_string(name)
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(default)
}

fn env_addr(name: &str, default: SocketAddr) -> Result<SocketAddr> {
    match env_string(name) {
        Some(v) => v
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name} '{v}': {e}"))),
        None => Ok(default),
    }
}

// ============================================================================
// Environment profile
// ============================================================================

/// Deployment environment the router runs in.
///
/// The environment only selects defaults (mainly the deployment platform);
/// every default can still be overridden explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Single host, Dispatchers embedded in the router process.
    #[default]
    Local,
    /// Single host, Dispatchers as local child processes.
    Dev,
    /// Orchestrated test cluster, Dispatchers reachable by service name.
    DevSwarm,
    /// Orchestrated production cluster.
    Production,
}

impl Environment {
    /// Deployment platform used when `DEPLOYMENT_PLATFORM` is unset.
    pub fn default_platform(&self) -> &'static str {
        match self {
            Environment::Local => "embedded",
            Environment::Dev => "process",
            Environment::DevSwarm | Environment::Production => "static",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Local => write!(f, "local"),
            Environment::Dev => write!(f, "dev"),
            Environment::DevSwarm => write!(f, "devswarm"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "dev" | "development" => Ok(Environment::Dev),
            "devswarm" => Ok(Environment::DevSwarm),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(format!(
                "Unknown environment '{}'. Valid environments: local, dev, devswarm, production",
                s
            )),
        }
    }
}

/// Which log a Dispatcher consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogBackend {
    /// Kafka-compatible broker.
    #[default]
    Kafka,
    /// Process-local in-memory log.
    Memory,
}

impl std::str::FromStr for LogBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kafka" => Ok(LogBackend::Kafka),
            "memory" => Ok(LogBackend::Memory),
            _ => Err(format!("Unknown log backend '{}'. Valid: kafka, memory", s)),
        }
    }
}

/// How the router hands a stream request to the resolved Dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Router streams the Dispatcher response through itself.
    #[default]
    Proxy,
    /// Router answers with a temporary redirect to the Dispatcher.
    Redirect,
}

impl std::str::FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proxy" => Ok(RoutingMode::Proxy),
            "redirect" => Ok(RoutingMode::Redirect),
            _ => Err(format!("Unknown routing mode '{}'. Valid: proxy, redirect", s)),
        }
    }
}

fn env_enum<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    env_string(name)
        .map(|v| v.parse::<T>().map_err(Error::Config))
        .transpose()
}

// ============================================================================
// Service info
// ============================================================================

/// Build metadata reported by `/info`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceInfo {
    pub version: String,
    pub build_origin: String,
    pub openfactory_version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            version: LOCAL_DEV_VERSION.to_string(),
            build_origin: LOCAL_DEV_VERSION.to_string(),
            openfactory_version: LOCAL_DEV_VERSION.to_string(),
        }
    }
}

impl ServiceInfo {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            version: env_string("APPLICATION_VERSION").unwrap_or(defaults.version),
            build_origin: env_string("APPLICATION_MANUFACTURER").unwrap_or(defaults.build_origin),
            openfactory_version: env_string("OPENFACTORY_VERSION")
                .unwrap_or(defaults.openfactory_version),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Configuration of one group's Dispatcher service.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Address the Dispatcher HTTP surface binds to.
    pub bind_addr: SocketAddr,

    /// Group label served by this Dispatcher.
    pub group: String,

    /// Derived log the Dispatcher consumes.
    pub topic: String,

    /// Consumer group used to commit positions.
    pub consumer_group: String,

    /// Log backend.
    pub log_backend: LogBackend,

    /// Broker bootstrap address.
    pub broker: String,

    /// Per-session delivery queue capacity.
    pub queue_capacity: usize,

    /// Events retained in the fan-out buffer.
    pub fanout_buffer_capacity: usize,

    /// Interval between keepalive lines on a quiet stream.
    pub keepalive_interval: Duration,

    /// Close sessions that received nothing for this long. Disabled when `None`.
    pub session_idle_timeout: Option<Duration>,

    /// Grace window for sessions to flush on shutdown.
    pub drain_grace: Duration,

    /// Maximum wait for a partition assignment when attaching.
    pub assignment_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let naming = GroupNaming::default();
        Self::for_group("default", &naming)
    }
}

impl DispatcherConfig {
    /// Defaults for a Dispatcher serving `group` under `naming`.
    pub fn for_group(group: &str, naming: &GroupNaming) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISPATCHER_PORT)),
            group: group.to_string(),
            topic: naming.derived_log_id(group),
            consumer_group: naming.consumer_group(group),
            log_backend: LogBackend::Kafka,
            broker: "localhost:9092".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fanout_buffer_capacity: DEFAULT_FANOUT_BUFFER_CAPACITY,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            session_idle_timeout: None,
            drain_grace: Duration::from_secs(DEFAULT_DRAIN_GRACE_SECS),
            assignment_timeout: Duration::from_secs(DEFAULT_ASSIGNMENT_TIMEOUT_SECS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `GROUP` is required. `KAFKA_TOPIC` and `KAFKA_CONSUMER_GROUP_ID` default
    /// to the derived-log naming convention for that group.
    pub fn from_env() -> Result<Self> {
        let group = env_string("GROUP").ok_or_else(|| Error::Config("GROUP is required".into()))?;
        let naming = GroupNaming {
            derived_log_prefix: env_string("DERIVED_LOG_PREFIX")
                .unwrap_or_else(|| GroupNaming::default().derived_log_prefix),
            ..GroupNaming::default()
        };
        let defaults = Self::for_group(&group, &naming);

        Ok(Self {
            bind_addr: env_addr("BIND_ADDR", defaults.bind_addr)?,
            topic: env_string("KAFKA_TOPIC").unwrap_or(defaults.topic),
            consumer_group: env_string("KAFKA_CONSUMER_GROUP_ID").unwrap_or(defaults.consumer_group),
            log_backend: env_enum("LOG_BACKEND")?.unwrap_or(defaults.log_backend),
            broker: env_string("KAFKA_BROKER").unwrap_or(defaults.broker),
            queue_capacity: env_parse("QUEUE_CAPACITY", defaults.queue_capacity),
            fanout_buffer_capacity: env_parse(
                "FANOUT_BUFFER_CAPACITY",
                defaults.fanout_buffer_capacity,
            ),
            keepalive_interval: Duration::from_secs(env_parse(
                "KEEPALIVE_INTERVAL_SECS",
                DEFAULT_KEEPALIVE_INTERVAL_SECS,
            )),
            session_idle_timeout: env_string("SESSION_IDLE_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            drain_grace: Duration::from_secs(env_parse(
                "DRAIN_GRACE_SECS",
                DEFAULT_DRAIN_GRACE_SECS,
            )),
            assignment_timeout: Duration::from_secs(env_parse(
                "ASSIGNMENT_TIMEOUT_SECS",
                DEFAULT_ASSIGNMENT_TIMEOUT_SECS,
            )),
            group,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.group.trim().is_empty() {
            errors.push("group must not be empty".to_string());
        }
        if self.topic.trim().is_empty() {
            errors.push("topic must not be empty".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be at least 1".to_string());
        }
        if self.keepalive_interval.is_zero() {
            errors.push("keepalive_interval must be positive".to_string());
        }
        if self.log_backend == LogBackend::Kafka && self.broker.trim().is_empty() {
            errors.push("broker must be set for the kafka log backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Settings for the process deployment platform.
#[derive(Debug, Clone)]
pub struct ProcessPlatformConfig {
    /// Dispatcher binary to spawn.
    pub binary: String,
    /// Host the spawned Dispatchers are reachable on.
    pub host: String,
    /// First port of the per-group port range.
    pub base_port: u16,
}

impl Default for ProcessPlatformConfig {
    fn default() -> Self {
        Self {
            binary: "assetstream-dispatcher".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: DEFAULT_PROCESS_BASE_PORT,
        }
    }
}

/// Configuration of the routing layer.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,

    /// Grouping strategy name, resolved against the registered table.
    pub grouping_strategy: String,
    /// UNS level used by the ksqlDB strategy (e.g. `workcenter`).
    pub grouping_level: String,
    pub ksqldb_url: String,
    pub ksqldb_uns_map: String,
    pub ksqldb_assets_stream: String,
    /// Entity → group table for the static strategy.
    pub static_groups: BTreeMap<String, String>,

    pub naming: GroupNaming,

    /// Deployment platform name, resolved against the registered table.
    pub deployment_platform: String,
    pub process: ProcessPlatformConfig,
    /// URL template for the static platform. `{service}` and `{group}` are substituted.
    pub static_endpoint_template: String,
    /// Template for Dispatchers started by the router (embedded and process platforms).
    pub dispatcher: DispatcherConfig,

    pub resolver_cache_ttl: Duration,
    pub resolver_cache_capacity: u64,

    pub health_check_interval: Duration,
    pub health_failure_threshold: u32,
    pub ready_probe_timeout: Duration,

    pub provisioning_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Pre-provision every known group at startup.
    pub eager_provisioning: bool,

    pub routing_mode: RoutingMode,
    pub proxy_connect_timeout: Duration,

    /// Base URL of the state query service. `/asset_state` is disabled when unset.
    pub state_api_url: Option<String>,
    pub state_proxy_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let naming = GroupNaming::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            environment: Environment::default(),
            grouping_strategy: "ksql".to_string(),
            grouping_level: "workcenter".to_string(),
            ksqldb_url: "http://localhost:8088".to_string(),
            ksqldb_uns_map: "asset_to_uns_map".to_string(),
            ksqldb_assets_stream: "enriched_assets_stream".to_string(),
            static_groups: BTreeMap::new(),
            dispatcher: DispatcherConfig::for_group("default", &naming),
            naming,
            deployment_platform: Environment::default().default_platform().to_string(),
            process: ProcessPlatformConfig::default(),
            static_endpoint_template: format!("http://{{service}}:{DEFAULT_DISPATCHER_PORT}"),
            resolver_cache_ttl: Duration::from_secs(DEFAULT_RESOLVER_CACHE_TTL_SECS),
            resolver_cache_capacity: DEFAULT_RESOLVER_CACHE_CAPACITY,
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            ready_probe_timeout: Duration::from_secs(DEFAULT_READY_PROBE_TIMEOUT_SECS),
            provisioning_timeout: Duration::from_secs(DEFAULT_PROVISIONING_TIMEOUT_SECS),
            readiness_poll_interval: Duration::from_millis(DEFAULT_READINESS_POLL_INTERVAL_MS),
            eager_provisioning: true,
            routing_mode: RoutingMode::default(),
            proxy_connect_timeout: Duration::from_secs(DEFAULT_PROXY_CONNECT_TIMEOUT_SECS),
            state_api_url: None,
            state_proxy_timeout: Duration::from_secs(DEFAULT_STATE_PROXY_TIMEOUT_SECS),
        }
    }
}

impl RouterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let environment: Environment = env_enum("ENVIRONMENT")?.unwrap_or(defaults.environment);

        let static_groups = match env_string("STATIC_GROUPS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("STATIC_GROUPS is not a JSON object: {e}")))?,
            None => defaults.static_groups,
        };

        let naming = GroupNaming {
            derived_log_prefix: env_string("DERIVED_LOG_PREFIX")
                .unwrap_or(defaults.naming.derived_log_prefix),
            service_prefix: env_string("SERVICE_PREFIX").unwrap_or(defaults.naming.service_prefix),
        };

        let mut dispatcher = defaults.dispatcher;
        dispatcher.log_backend = env_enum("LOG_BACKEND")?.unwrap_or(dispatcher.log_backend);
        dispatcher.broker = env_string("KAFKA_BROKER").unwrap_or(dispatcher.broker);
        dispatcher.queue_capacity = env_parse("QUEUE_CAPACITY", dispatcher.queue_capacity);
        dispatcher.fanout_buffer_capacity =
            env_parse("FANOUT_BUFFER_CAPACITY", dispatcher.fanout_buffer_capacity);

        Ok(Self {
            bind_addr: env_addr("BIND_ADDR", defaults.bind_addr)?,
            environment,
            grouping_strategy: env_string("GROUPING_STRATEGY")
                .unwrap_or(defaults.grouping_strategy),
            grouping_level: env_string("GROUPING_LEVEL").unwrap_or(defaults.grouping_level),
            ksqldb_url: env_string("KSQLDB_URL").unwrap_or(defaults.ksqldb_url),
            ksqldb_uns_map: env_string("KSQLDB_UNS_MAP").unwrap_or(defaults.ksqldb_uns_map),
            ksqldb_assets_stream: env_string("KSQLDB_ASSETS_STREAM")
                .unwrap_or(defaults.ksqldb_assets_stream),
            static_groups,
            naming,
            deployment_platform: env_string("DEPLOYMENT_PLATFORM")
                .unwrap_or_else(|| environment.default_platform().to_string()),
            process: ProcessPlatformConfig {
                binary: env_string("DISPATCHER_BINARY").unwrap_or(defaults.process.binary),
                host: env_string("DISPATCHER_HOST").unwrap_or(defaults.process.host),
                base_port: env_parse("PROCESS_BASE_PORT", defaults.process.base_port),
            },
            static_endpoint_template: env_string("STATIC_ENDPOINT_TEMPLATE")
                .unwrap_or(defaults.static_endpoint_template),
            dispatcher,
            resolver_cache_ttl: Duration::from_secs(env_parse(
                "RESOLVER_CACHE_TTL_SECS",
                DEFAULT_RESOLVER_CACHE_TTL_SECS,
            )),
            resolver_cache_capacity: env_parse(
                "RESOLVER_CACHE_CAPACITY",
                defaults.resolver_cache_capacity,
            ),
            health_check_interval: Duration::from_secs(env_parse(
                "HEALTH_CHECK_INTERVAL_SECS",
                DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            )),
            health_failure_threshold: env_parse(
                "HEALTH_FAILURE_THRESHOLD",
                defaults.health_failure_threshold,
            ),
            ready_probe_timeout: Duration::from_secs(env_parse(
                "READY_PROBE_TIMEOUT_SECS",
                DEFAULT_READY_PROBE_TIMEOUT_SECS,
            )),
            provisioning_timeout: Duration::from_secs(env_parse(
                "PROVISIONING_TIMEOUT_SECS",
                DEFAULT_PROVISIONING_TIMEOUT_SECS,
            )),
            readiness_poll_interval: Duration::from_millis(env_parse(
                "READINESS_POLL_INTERVAL_MS",
                DEFAULT_READINESS_POLL_INTERVAL_MS,
            )),
            eager_provisioning: env_bool("EAGER_PROVISIONING", defaults.eager_provisioning),
            routing_mode: env_enum("ROUTING_MODE")?.unwrap_or(defaults.routing_mode),
            proxy_connect_timeout: Duration::from_secs(env_parse(
                "PROXY_CONNECT_TIMEOUT_SECS",
                DEFAULT_PROXY_CONNECT_TIMEOUT_SECS,
            )),
            state_api_url: env_string("STATE_API_URL"),
            state_proxy_timeout: Duration::from_secs(env_parse(
                "STATE_PROXY_TIMEOUT_SECS",
                DEFAULT_STATE_PROXY_TIMEOUT_SECS,
            )),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.provisioning_timeout.is_zero() {
            errors.push("provisioning_timeout must be positive".to_string());
        }
        if self.readiness_poll_interval >= self.provisioning_timeout {
            errors.push(format!(
                "readiness_poll_interval ({:?}) must be less than provisioning_timeout ({:?})",
                self.readiness_poll_interval, self.provisioning_timeout
            ));
        }
        if self.health_check_interval.is_zero() {
            errors.push("health_check_interval must be positive".to_string());
        }
        if self.health_failure_threshold == 0 {
            errors.push("health_failure_threshold must be at least 1".to_string());
        }
        if self.resolver_cache_capacity == 0 {
            errors.push("resolver_cache_capacity must be at least 1".to_string());
        }
        if self.grouping_strategy == "static" && self.static_groups.is_empty() {
            errors.push("static grouping strategy requires STATIC_GROUPS".to_string());
        }
        if self.deployment_platform == "static"
            && !self.static_endpoint_template.contains("{service}")
            && !self.static_endpoint_template.contains("{group}")
        {
            errors.push(
                "static_endpoint_template must contain {service} or {group}".to_string(),
            );
        }
        if let Err(mut dispatcher_errors) = self.dispatcher.validate() {
            errors.append(&mut dispatcher_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// State API
// ============================================================================

/// Configuration of the state query service.
#[derive(Debug, Clone)]
pub struct StateApiConfig {
    pub bind_addr: SocketAddr,
    pub ksqldb_url: String,
    pub ksqldb_assets_table: String,
}

impl Default for StateApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            ksqldb_url: "http://localhost:8088".to_string(),
            ksqldb_assets_table: "assets".to_string(),
        }
    }
}

impl StateApiConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env_addr("BIND_ADDR", defaults.bind_addr)?,
            ksqldb_url: env_string("KSQLDB_URL").unwrap_or(defaults.ksqldb_url),
            ksqldb_assets_table: env_string("KSQLDB_ASSETS_TABLE")
                .unwrap_or(defaults.ksqldb_assets_table),
        })
    }
}
