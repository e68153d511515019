//! Named retry policies for collaborator boundaries.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `metadata_policy` | 100ms | 2s | 3 | Grouping / state lookups |
//! | `deployment_policy` | 200ms | 2s | 3 | Platform `ensure_running` / `stop` |
//! | `reconnect_policy` | 250ms | 30s | 10, then capped | Log consumer reconnects |
//!
//! # Example
//!
//! ```rust,no_run
//! use assetstream::retry;
//!
//! async fn lookup() -> assetstream::Result<String> {
//!     retry::with_policy("metadata", retry::metadata_policy(), || async {
//!         Ok::<_, assetstream::Error>("Weld".to_string())
//!     })
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};

use crate::error::{Error, Result};
use crate::metrics;

/// Policy for metadata service calls (ksqlDB, static tables, state API).
pub fn metadata_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for deployment platform calls.
pub fn deployment_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for log consumer reconnects.
///
/// Reconnects never give up while the Dispatcher is running; see
/// [`ReconnectBackoff`] which keeps yielding the capped delay once this
/// policy is exhausted.
pub fn reconnect_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(RECONNECT_MAX_DELAY)
        .with_max_times(10)
        .with_jitter()
}

const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay sequence for an unbounded reconnect loop.
///
/// Grows exponentially per [`reconnect_policy`] and stays at the cap after
/// that. `reset()` after a successful reconnect.
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            inner: reconnect_policy().build(),
            attempts: 0,
        }
    }

    /// Next delay to wait before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.inner.next().unwrap_or(RECONNECT_MAX_DELAY)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.inner = reconnect_policy().build();
        self.attempts = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `operation` under `policy`, retrying only retriable errors.
///
/// Attempts, exhaustion and late success are recorded under `operation_name`.
pub async fn with_policy<F, Fut, T>(
    operation_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retried = false;
    let result = operation
        .retry(policy)
        .when(|e: &Error| e.is_retriable())
        .notify(|e: &Error, delay: Duration| {
            retried = true;
            record_retry_attempt(operation_name, e, delay);
        })
        .await;

    match &result {
        Ok(_) if retried => record_retry_success(operation_name),
        Err(e) if e.is_retriable() => record_retry_exhausted(operation_name),
        _ => {}
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(operation: &str, error: &Error, delay: Duration) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation])
        .inc();
    tracing::debug!(operation, error = %error, ?delay, "Retrying");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(operation: &str) {
    metrics::RETRY_EXHAUSTED
        .with_label_values(&[operation])
        .inc();
    tracing::warn!(operation, "Retry policy exhausted");
}

/// Record a success after at least one retry.
pub fn record_retry_success(operation: &str) {
    metrics::RETRY_SUCCESS
        .with_label_values(&[operation])
        .inc();
}
