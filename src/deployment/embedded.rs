//! Dispatchers running inside the router process.
//!
//! Each group gets its own [`Dispatcher`] and its own HTTP listener on an
//! ephemeral loopback port, so the router talks to embedded Dispatchers
//! exactly as it would to remote ones. The listener runs as a named task in
//! the shared [`BackgroundTaskRegistry`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{DeploymentPlatform, ServiceSpec};
use crate::background_tasks::BackgroundTaskRegistry;
use crate::config::{DispatcherConfig, ServiceInfo};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::http::{DispatcherAppState, dispatcher_router};
use crate::log::LogSourceFactory;

#[derive(Clone)]
struct EmbeddedService {
    dispatcher: Dispatcher,
    endpoint: String,
    task_name: String,
}

pub struct EmbeddedPlatform {
    template: DispatcherConfig,
    log_factory: Arc<dyn LogSourceFactory>,
    tasks: Arc<BackgroundTaskRegistry>,
    services: DashMap<String, EmbeddedService>,
}

impl EmbeddedPlatform {
    pub fn new(
        template: DispatcherConfig,
        log_factory: Arc<dyn LogSourceFactory>,
        tasks: Arc<BackgroundTaskRegistry>,
    ) -> Self {
        Self {
            template,
            log_factory,
            tasks,
            services: DashMap::new(),
        }
    }

    /// The embedded Dispatcher behind `service_id`.
    pub fn dispatcher(&self, service_id: &str) -> Option<Dispatcher> {
        self.services.get(service_id).map(|s| s.dispatcher.clone())
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every embedded Dispatcher.
    pub async fn stop_all(&self) {
        for service_id in self.service_ids() {
            if let Err(e) = self.stop(&service_id).await {
                tracing::warn!(service = %service_id, error = %e, "Failed to stop embedded dispatcher");
            }
        }
    }
}

#[async_trait]
impl DeploymentPlatform for EmbeddedPlatform {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn outlives_router(&self) -> bool {
        false
    }

    async fn ensure_running(&self, service_id: &str, spec: &ServiceSpec) -> Result<String> {
        if let Some(service) = self.services.get(service_id) {
            return Ok(service.endpoint.clone());
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        let dispatcher = Dispatcher::new(
            spec.dispatcher_config(&self.template),
            self.log_factory.clone(),
        );

        let service = EmbeddedService {
            dispatcher: dispatcher.clone(),
            endpoint: endpoint.clone(),
            task_name: format!("embedded-{service_id}"),
        };
        match self.services.entry(service_id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().endpoint.clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(service.clone());
            }
        }

        dispatcher.start();
        let app = dispatcher_router(DispatcherAppState::new(dispatcher, ServiceInfo::from_env()));
        let task_service = service_id.to_string();
        self.tasks.spawn(service.task_name.clone(), async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(service = %task_service, error = %e, "Embedded dispatcher server failed");
            }
        });

        tracing::info!(service = service_id, group = %spec.group, endpoint = %endpoint, "Embedded dispatcher started");
        Ok(endpoint)
    }

    async fn is_running(&self, service_id: &str) -> Result<bool> {
        Ok(self
            .services
            .get(service_id)
            .map(|s| self.tasks.is_running(&s.task_name))
            .unwrap_or(false))
    }

    async fn stop(&self, service_id: &str) -> Result<()> {
        let Some((_, service)) = self.services.remove(service_id) else {
            return Ok(());
        };
        service.dispatcher.shutdown().await;
        self.tasks.stop(&service.task_name);
        tracing::info!(service = service_id, "Embedded dispatcher stopped");
        Ok(())
    }
}

impl std::fmt::Debug for EmbeddedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedPlatform")
            .field("services", &self.services.len())
            .finish()
    }
}
