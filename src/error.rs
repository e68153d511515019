//! Crate level errors.
//!
//! # Error Taxonomy
//!
//! Every fallible operation in the crate returns [`Error`]. Variants are
//! grouped by how the caller is expected to react:
//!
//! - **Terminal**: [`Error::NotFound`], [`Error::InvalidRequest`],
//!   [`Error::Config`]. Surfaced as-is, never retried.
//! - **Retryable**: [`Error::Unavailable`], [`Error::ProvisionFailed`],
//!   [`Error::ProvisionTimeout`], [`Error::ShuttingDown`]. Retried with
//!   bounded backoff at the collaborator boundary, then surfaced as a
//!   retryable 5xx with a `Retry-After` hint.
//! - **Upstream**: [`Error::Upstream`]. A proxied Dispatcher or state service
//!   failed mid-request; surfaced as 502.
//! - **Log**: [`Error::Log`]. Consumer errors. These trigger reconnects inside
//!   the Dispatcher and never reach subscribers.
//!
//! Collaborator errors (`reqwest`, `rdkafka`, `serde_json`, `io`) are mapped
//! into this taxonomy at the boundary via `From` impls, so `?` works across
//! the crate.

use std::time::Duration;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors returned by routing, provisioning and dispatch operations.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// The entity, group or record is not known.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator (metadata service, log broker, platform) is unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The provisioner for a group failed. The registry entry was rolled back.
    #[error("provisioning failed for group '{group}': {reason}")]
    ProvisionFailed { group: String, reason: String },

    /// The group did not report ready within the provisioning timeout.
    #[error("provisioning group '{group}' timed out after {timeout:?}")]
    ProvisionTimeout { group: String, timeout: Duration },

    /// A proxied upstream service failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The log consumer failed.
    #[error("log error: {0}")]
    Log(String),

    /// The service is draining and accepts no new work.
    #[error("service is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An error in the network or filesystem.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
}

impl Error {
    /// Returns true if the caller may retry the same operation later.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::ProvisionFailed { .. } => true,
            Error::ProvisionTimeout { .. } => true,
            Error::ShuttingDown => true,
            Error::Log(_) => true,
            Error::Io(kind) => matches!(
                kind,
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),

            Error::NotFound(_) => false,
            Error::Upstream(_) => false,
            Error::InvalidRequest(_) => false,
            Error::Config(_) => false,
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::InvalidRequest(_) => 400,
            Error::Upstream(_) => 502,
            Error::Unavailable(_)
            | Error::ProvisionFailed { .. }
            | Error::ProvisionTimeout { .. }
            | Error::ShuttingDown
            | Error::Log(_) => 503,
            Error::Config(_) | Error::Io(_) => 500,
        }
    }

    /// Suggested client back-off for retryable errors, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::ProvisionTimeout { .. } => Some(5),
            Error::ProvisionFailed { .. } => Some(5),
            Error::Unavailable(_) | Error::Log(_) => Some(2),
            Error::ShuttingDown => Some(1),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Unavailable(_) => "unavailable",
            Error::ProvisionFailed { .. } => "provision_failed",
            Error::ProvisionTimeout { .. } => "provision_timeout",
            Error::Upstream(_) => "upstream",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Log(_) => "log",
            Error::ShuttingDown => "shutting_down",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Upstream(format!("malformed JSON: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Upstream(e.to_string())
        }
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for Error {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        Error::Log(e.to_string())
    }
}
