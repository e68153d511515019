//! Recording deployment platform for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DeploymentPlatform, ServiceSpec};
use crate::error::{Error, Result};

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    EnsureRunning { service_id: String, group: String },
    IsRunning(String),
    Stop(String),
    CheckReady(String),
}

/// Platform that records every call and never starts anything.
///
/// Endpoints are `http://<service_id>.mock`. Delays, failures and slow
/// readiness can be injected.
#[derive(Debug, Default)]
pub struct MockPlatform {
    calls: Mutex<Vec<MockCall>>,
    /// service id -> (endpoint, group)
    running: DashMap<String, (String, String)>,
    ensure_delay: Mutex<Duration>,
    failing_ensures: AtomicU32,
    not_ready_probes: AtomicU32,
    never_ready: AtomicBool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `ensure_running`.
    pub fn set_ensure_delay(&self, delay: Duration) {
        *self.ensure_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Fail the next `n` `ensure_running` calls with `Unavailable`.
    pub fn fail_next_ensures(&self, n: u32) {
        self.failing_ensures.store(n, Ordering::SeqCst);
    }

    /// Answer not-ready to the next `n` readiness probes.
    pub fn set_not_ready_probes(&self, n: u32) {
        self.not_ready_probes.store(n, Ordering::SeqCst);
    }

    pub fn set_never_ready(&self, never: bool) {
        self.never_ready.store(never, Ordering::SeqCst);
    }

    /// Forget a service as if it crashed.
    pub fn kill(&self, service_id: &str) {
        self.running.remove(service_id);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn ensure_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::EnsureRunning { .. }))
            .count()
    }

    pub fn stop_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Stop(_)))
            .count()
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn record(&self, call: MockCall) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);
    }
}

#[async_trait]
impl DeploymentPlatform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ensure_running(&self, service_id: &str, spec: &ServiceSpec) -> Result<String> {
        self.record(MockCall::EnsureRunning {
            service_id: service_id.to_string(),
            group: spec.group.clone(),
        });

        let delay = *self.ensure_delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_ensures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Unavailable(format!("mock platform refused {service_id}")));
        }

        let endpoint = format!("http://{service_id}.mock");
        self.running
            .insert(service_id.to_string(), (endpoint.clone(), spec.group.clone()));
        Ok(endpoint)
    }

    async fn is_running(&self, service_id: &str) -> Result<bool> {
        self.record(MockCall::IsRunning(service_id.to_string()));
        Ok(self.running.contains_key(service_id))
    }

    async fn stop(&self, service_id: &str) -> Result<()> {
        self.record(MockCall::Stop(service_id.to_string()));
        self.running.remove(service_id);
        Ok(())
    }

    async fn check_ready(&self, endpoint: &str, group: &str) -> Result<bool> {
        self.record(MockCall::CheckReady(endpoint.to_string()));
        if self.never_ready.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let waiting = self
            .not_ready_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!waiting
            && self
                .running
                .iter()
                .any(|e| e.value().0 == endpoint && e.value().1 == group))
    }
}
