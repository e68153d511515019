//! Dispatchers as local child processes.
//!
//! Each group's Dispatcher is the `assetstream-dispatcher` binary started
//! with the group's [`ServiceSpec`] environment. A group's preferred port is
//! `base + fnv1a(group) % range`. When that port is already assigned to
//! another service, or something else is bound to it, the next free port in
//! the range is taken. A service keeps its port across restarts.
//!
//! Children are killed when the router exits, so this platform cannot serve
//! a one-shot `deploy`.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::process::{Child, Command};

use super::{DeploymentPlatform, ServiceSpec};
use crate::config::ProcessPlatformConfig;
use crate::constants::PROCESS_PORT_RANGE;
use crate::error::{Error, Result};

/// 32-bit FNV-1a.
fn fnv1a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME))
}

fn preferred_offset(group: &str) -> u16 {
    (fnv1a(group.as_bytes()) % u32::from(PROCESS_PORT_RANGE)) as u16
}

/// Preferred port of `group`'s Dispatcher: `base_port + fnv1a(group) % range`.
pub fn port_for_group(base_port: u16, group: &str) -> u16 {
    base_port.saturating_add(preferred_offset(group))
}

struct ChildService {
    child: Child,
    endpoint: String,
}

pub struct ProcessPlatform {
    config: ProcessPlatformConfig,
    children: DashMap<String, ChildService>,
    /// port -> service id
    ports: DashMap<u16, String>,
}

impl ProcessPlatform {
    pub fn new(config: ProcessPlatformConfig) -> Self {
        Self {
            config,
            children: DashMap::new(),
            ports: DashMap::new(),
        }
    }

    /// Port assigned to `service_id`, probing linearly from `group`'s
    /// preferred port.
    pub fn assign_port(&self, service_id: &str, group: &str) -> Result<u16> {
        let start = preferred_offset(group);
        for step in 0..PROCESS_PORT_RANGE {
            let offset = (start + step) % PROCESS_PORT_RANGE;
            let Some(port) = self.config.base_port.checked_add(offset) else {
                continue;
            };
            match self.ports.entry(port) {
                Entry::Occupied(owner) if owner.get().as_str() == service_id => return Ok(port),
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    if !self.is_bindable(port) {
                        tracing::debug!(service = service_id, port, "Port in use, probing next");
                        continue;
                    }
                    vacant.insert(service_id.to_string());
                    if step > 0 {
                        tracing::info!(
                            service = service_id,
                            group,
                            port,
                            preferred = self.config.base_port.saturating_add(start),
                            "Preferred dispatcher port taken, using next free port"
                        );
                    }
                    return Ok(port);
                }
            }
        }
        Err(Error::Unavailable(format!(
            "no free dispatcher port in {}..{} for {service_id}",
            self.config.base_port,
            self.config.base_port.saturating_add(PROCESS_PORT_RANGE)
        )))
    }

    fn release_port(&self, service_id: &str) {
        self.ports.retain(|_, owner| owner.as_str() != service_id);
    }

    fn is_bindable(&self, port: u16) -> bool {
        std::net::TcpListener::bind((self.config.host.as_str(), port)).is_ok()
    }

    fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{}", self.config.host, port)
    }
}

#[async_trait]
impl DeploymentPlatform for ProcessPlatform {
    fn name(&self) -> &'static str {
        "process"
    }

    fn outlives_router(&self) -> bool {
        false
    }

    async fn ensure_running(&self, service_id: &str, spec: &ServiceSpec) -> Result<String> {
        if let Some(mut existing) = self.children.get_mut(service_id) {
            match existing.child.try_wait() {
                Ok(None) => return Ok(existing.endpoint.clone()),
                Ok(Some(status)) => {
                    tracing::warn!(service = service_id, %status, "Dispatcher process exited, restarting");
                }
                Err(e) => {
                    tracing::warn!(service = service_id, error = %e, "Cannot poll dispatcher process, restarting");
                }
            }
        }

        let port = self.assign_port(service_id, &spec.group)?;
        let endpoint = self.endpoint(port);
        let spawned = Command::new(&self.config.binary)
            .envs(&spec.env)
            .env("BIND_ADDR", format!("{}:{}", self.config.host, port))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.release_port(service_id);
                return Err(Error::Unavailable(format!(
                    "failed to spawn '{}' for {service_id}: {e}",
                    self.config.binary
                )));
            }
        };

        tracing::info!(
            service = service_id,
            group = %spec.group,
            pid = child.id(),
            endpoint = %endpoint,
            "Dispatcher process spawned"
        );
        self.children.insert(
            service_id.to_string(),
            ChildService {
                child,
                endpoint: endpoint.clone(),
            },
        );
        Ok(endpoint)
    }

    async fn is_running(&self, service_id: &str) -> Result<bool> {
        Ok(match self.children.get_mut(service_id) {
            Some(mut service) => matches!(service.child.try_wait(), Ok(None)),
            None => false,
        })
    }

    async fn stop(&self, service_id: &str) -> Result<()> {
        self.release_port(service_id);
        let Some((_, mut service)) = self.children.remove(service_id) else {
            return Ok(());
        };
        if let Err(e) = service.child.kill().await {
            tracing::warn!(service = service_id, error = %e, "Failed to kill dispatcher process");
            return Err(e.into());
        }
        tracing::info!(service = service_id, "Dispatcher process stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ProcessPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPlatform")
            .field("binary", &self.config.binary)
            .field("children", &self.children.len())
            .field("ports", &self.ports.len())
            .finish()
    }
}
