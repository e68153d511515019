//! Routing layer.
//!
//! ```text
//! assetstream-router [serve]   # HTTP routing layer (default)
//! assetstream-router deploy    # create every group's derived log and Dispatcher
//! assetstream-router teardown  # stop every group's Dispatcher and drop its derived log
//! ```
//!
//! All settings come from the environment, see `RouterConfig::from_env`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use assetstream::background_tasks::BackgroundTaskRegistry;
use assetstream::config::{RouterConfig, ServiceInfo};
use assetstream::controller::RoutingController;
use assetstream::deployment::{PlatformContext, build_platform};
use assetstream::http::{RouterAppState, routing_router, serve, shutdown_signal};
use assetstream::log::ConfiguredLogSourceFactory;
use assetstream::metrics::init_metrics;
use assetstream::telemetry::{init_for_service, shutdown_telemetry};

const SERVICE_NAME: &str = "assetstream-router";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "assetstream-router", version, about = "Routes asset stream clients to group dispatchers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP routing layer.
    Serve,
    /// Provision every known group and exit.
    Deploy,
    /// Tear down every known group and exit.
    Teardown,
}

fn load_config() -> Result<RouterConfig, Box<dyn std::error::Error>> {
    let config = RouterConfig::from_env()?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(format!("invalid configuration: {}", errors.join("; ")).into());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_for_service(SERVICE_NAME).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let cli = Cli::parse();
    let config = load_config()?;

    let tasks = Arc::new(BackgroundTaskRegistry::new());
    let ctx = PlatformContext {
        tasks: tasks.clone(),
        log_factory: Arc::new(ConfiguredLogSourceFactory::new()),
    };
    let platform = build_platform(&config, &ctx)?;
    let controller = Arc::new(RoutingController::from_config(&config, platform)?);
    info!(
        environment = %config.environment,
        grouping = controller.resolver().strategy().name(),
        platform = controller.platform().name(),
        "Routing controller ready"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, controller, tasks).await,
        Command::Deploy => {
            let results = controller.deploy_all().await?;
            let failed: Vec<_> = results
                .iter()
                .filter(|(_, r)| r.is_err())
                .map(|(g, _)| g.as_str())
                .collect();
            if failed.is_empty() {
                info!(groups = results.len(), "Deployment complete");
                Ok(())
            } else {
                Err(format!("failed to provision groups: {}", failed.join(", ")).into())
            }
        }
        Command::Teardown => {
            let results = controller.teardown().await?;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            info!(groups = results.len(), failed, "Teardown complete");
            if failed > 0 {
                return Err(format!("{failed} groups failed to tear down").into());
            }
            Ok(())
        }
    }
}

async fn run_server(
    config: RouterConfig,
    controller: Arc<RoutingController>,
    tasks: Arc<BackgroundTaskRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_metrics();

    if config.eager_provisioning {
        let eager = controller.clone();
        tasks.spawn("eager-provisioning", async move {
            if let Err(e) = eager.provision_all().await {
                warn!(error = %e, "Cannot enumerate groups for eager provisioning");
            }
        });
    }
    controller.spawn_health_monitor(&tasks);

    let state = RouterAppState::new(controller.clone(), &config, ServiceInfo::from_env())?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, mode = ?config.routing_mode, "Routing layer listening");

    serve(listener, routing_router(state), shutdown_signal()).await?;

    info!("Stopping background tasks");
    tasks.shutdown_all_with_timeout(SHUTDOWN_TIMEOUT).await;
    shutdown_telemetry();
    Ok(())
}
