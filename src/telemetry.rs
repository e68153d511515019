//! Logging and optional trace export.
//!
//! # Basic Logging
//!
//! ```rust,no_run
//! use assetstream::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::Json).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: full filter directives, takes precedence
//! - `LOG_LEVEL`: single level when `RUST_LOG` is unset (default: `info`)
//!
//! # OpenTelemetry (Optional)
//!
//! With the `otel` feature, [`init_telemetry`] installs an OTLP exporter
//! next to the fmt layer. [`init_for_service`] picks it when an endpoint is
//! configured.
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` (default: `http://localhost:4317`)
//! - `OTEL_SERVICE_NAME` (default: `assetstream`)

use tracing_subscriber::prelude::*;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
#[cfg(feature = "otel")]
use tracing_opentelemetry::OpenTelemetryLayer;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// JSON format for log aggregators (Elasticsearch, Loki, etc.).
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from LOG_FORMAT environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Build the level filter.
///
/// `RUST_LOG` wins when set. Otherwise `LOG_LEVEL` (e.g. `debug`) applies to
/// the whole process, defaulting to `info`.
fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::try_new(level.to_lowercase())
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    })
}

/// Initialize logging with the specified format.
///
/// # Example
///
/// ```rust,no_run
/// use assetstream::telemetry::{LogFormat, init_logging};
///
/// init_logging(LogFormat::from_env()).expect("Failed to init logging");
/// ```
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}

/// OTLP trace export settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute.
    pub service_name: String,
    pub otlp_endpoint: String,
    /// Keep the fmt layer next to the exporter.
    pub enable_console: bool,
}

impl TelemetryConfig {
    /// Defaults for `service_name`, overridable through `OTEL_SERVICE_NAME`.
    pub fn for_service(service_name: &str) -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| service_name.to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_console: true,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::for_service("assetstream")
    }
}

/// Initialize tracing with OTLP export.
///
/// Call once at startup, before any spans are created.
#[cfg(feature = "otel")]
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::KeyValue;

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;
    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("assetstream");
    opentelemetry::global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(config.enable_console.then(tracing_subscriber::fmt::layer))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Without the `otel` feature there is nothing to export; logs still go to stdout.
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if config.enable_console {
        init_logging(LogFormat::from_env())?;
    }
    Ok(())
}

/// Logging setup for a service binary.
///
/// Exports traces when OTLP export is compiled in and
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set, logs per `LOG_FORMAT` otherwise.
pub fn init_for_service(service_name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if is_otel_enabled() && std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        init_telemetry(TelemetryConfig::for_service(service_name))
    } else {
        init_logging(LogFormat::from_env())
    }
}

/// Flush pending spans before exit.
#[cfg(feature = "otel")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(not(feature = "otel"))]
pub fn shutdown_telemetry() {}

pub fn is_otel_enabled() -> bool {
    cfg!(feature = "otel")
}
