//! Dispatchers managed by an external orchestrator.
//!
//! The router never starts anything: the endpoint of a group's Dispatcher is
//! rendered from a URL template, e.g. `http://{service}:5555`, and liveness
//! is whatever the Dispatcher's `/health` answers.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DeploymentPlatform, ServiceSpec};
use crate::error::{Error, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct StaticPlatform {
    template: String,
    known: DashMap<String, String>,
    http: reqwest::Client,
}

impl StaticPlatform {
    pub fn new(template: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            template: template.to_string(),
            known: DashMap::new(),
            http,
        }
    }

    /// Render the endpoint template for a service.
    pub fn render(&self, service_id: &str, group: &str) -> String {
        self.template
            .replace("{service}", service_id)
            .replace("{group}", group)
            .trim_end_matches('/')
            .to_string()
    }
}

#[async_trait]
impl DeploymentPlatform for StaticPlatform {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn ensure_running(&self, service_id: &str, spec: &ServiceSpec) -> Result<String> {
        let endpoint = self.render(service_id, &spec.group);
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "endpoint template rendered a non-HTTP endpoint '{endpoint}'"
            )));
        }
        self.known.insert(service_id.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    async fn is_running(&self, service_id: &str) -> Result<bool> {
        let endpoint = match self.known.get(service_id) {
            Some(endpoint) => endpoint.clone(),
            None => self.render(service_id, service_id),
        };
        match self.http.get(format!("{endpoint}/health")).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, service_id: &str) -> Result<()> {
        self.known.remove(service_id);
        tracing::info!(
            service = service_id,
            "Static platform does not stop services; leaving it to the orchestrator"
        );
        Ok(())
    }
}
