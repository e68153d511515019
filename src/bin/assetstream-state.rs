//! Asset state query service.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use assetstream::config::StateApiConfig;
use assetstream::http::{StateAppState, serve, shutdown_signal, state_router};
use assetstream::metrics::init_metrics;
use assetstream::state::KsqlStateStore;
use assetstream::telemetry::{init_for_service, shutdown_telemetry};

const KSQL_TIMEOUT: Duration = Duration::from_secs(10);

const SERVICE_NAME: &str = "assetstream-state";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_for_service(SERVICE_NAME).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let config = StateApiConfig::from_env()?;
    init_metrics();

    let store = KsqlStateStore::from_url(&config.ksqldb_url, &config.ksqldb_assets_table, KSQL_TIMEOUT)?;
    info!(
        addr = %config.bind_addr,
        ksqldb = %config.ksqldb_url,
        table = %config.ksqldb_assets_table,
        "Starting state service"
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    serve(listener, state_router(StateAppState::new(Arc::new(store))), shutdown_signal()).await?;
    shutdown_telemetry();
    Ok(())
}
