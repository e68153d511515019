//! Default values shared across configuration and runtime code.

// ============================================================================
// Dispatcher
// ============================================================================

/// Per-session delivery queue capacity (events).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Events retained in a group's fan-out buffer for resume-after-token.
pub const DEFAULT_FANOUT_BUFFER_CAPACITY: usize = 4096;

/// Interval between keepalive lines on an idle stream.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 15;

/// Grace window given to sessions to flush their queues on shutdown.
pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 5;

/// Maximum wait for the log consumer to receive a partition assignment.
pub const DEFAULT_ASSIGNMENT_TIMEOUT_SECS: u64 = 100;

/// Port a Dispatcher service listens on inside its own host or container.
pub const DEFAULT_DISPATCHER_PORT: u16 = 5555;

// ============================================================================
// Routing
// ============================================================================

/// TTL of cached entity → group resolutions.
pub const DEFAULT_RESOLVER_CACHE_TTL_SECS: u64 = 60;

/// Maximum number of cached resolutions.
pub const DEFAULT_RESOLVER_CACHE_CAPACITY: u64 = 100_000;

/// Cadence of registry health revalidation.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Consecutive failed health checks before an entry becomes DEGRADED.
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// Upper bound on provisioning a group before the request fails.
pub const DEFAULT_PROVISIONING_TIMEOUT_SECS: u64 = 30;

/// Interval between readiness probes while provisioning.
pub const DEFAULT_READINESS_POLL_INTERVAL_MS: u64 = 500;

/// Timeout of a single readiness probe.
pub const DEFAULT_READY_PROBE_TIMEOUT_SECS: u64 = 2;

/// Connect timeout when proxying a stream to a Dispatcher.
pub const DEFAULT_PROXY_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Total timeout when proxying a state query.
pub const DEFAULT_STATE_PROXY_TIMEOUT_SECS: u64 = 5;

/// Base of the per-group port range used by the process platform.
pub const DEFAULT_PROCESS_BASE_PORT: u16 = 6000;

/// Width of the per-group port range used by the process platform.
pub const PROCESS_PORT_RANGE: u16 = 1000;

/// Value reported by `/info` when no version variables are set.
pub const LOCAL_DEV_VERSION: &str = "local-dev";
