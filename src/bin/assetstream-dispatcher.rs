//! One group's Dispatcher service.
//!
//! Consumes the group's derived log and streams NDJSON to subscribers.
//! Configured from the environment (`GROUP` is required), see
//! `DispatcherConfig::from_env`.

use std::sync::Arc;

use tracing::{error, info};

use assetstream::config::{DispatcherConfig, LogBackend, ServiceInfo};
use assetstream::dispatcher::Dispatcher;
use assetstream::http::{DispatcherAppState, dispatcher_router, serve, shutdown_signal};
use assetstream::log::{ConfiguredLogSourceFactory, MemoryBroker};
use assetstream::metrics::init_metrics;
use assetstream::telemetry::{init_for_service, shutdown_telemetry};

const SERVICE_NAME: &str = "assetstream-dispatcher";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_for_service(SERVICE_NAME).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = DispatcherConfig::from_env()?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(format!("invalid configuration: {}", errors.join("; ")).into());
    }
    init_metrics();

    // A standalone memory log is only useful for local experiments.
    let factory = match config.log_backend {
        LogBackend::Memory => ConfiguredLogSourceFactory::with_memory_broker(MemoryBroker::new()),
        LogBackend::Kafka => ConfiguredLogSourceFactory::new(),
    };

    info!(
        group = %config.group,
        topic = %config.topic,
        consumer_group = %config.consumer_group,
        addr = %config.bind_addr,
        "Starting dispatcher"
    );
    let bind_addr = config.bind_addr;
    let dispatcher = Dispatcher::new(config, Arc::new(factory));
    dispatcher.start();

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let app = dispatcher_router(DispatcherAppState::new(dispatcher.clone(), ServiceInfo::from_env()));

    // Drain sessions first so open streams end before the server stops.
    let draining = dispatcher.clone();
    serve(listener, app, async move {
        shutdown_signal().await;
        draining.shutdown().await;
    })
    .await?;

    dispatcher.shutdown().await;
    info!("Dispatcher stopped");
    shutdown_telemetry();
    Ok(())
}
