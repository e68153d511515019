//! Group → endpoint registry with single-flight provisioning.
//!
//! # Concurrency
//!
//! Entries live in a sharded [`DashMap`]. Every mutation happens inside one
//! short shard-lock critical section that never awaits, so unrelated groups
//! never contend and no lock is ever held across a network call.
//!
//! `ensure` has three paths:
//!
//! 1. **Fast path**: an ACTIVE entry exists, its endpoint is cloned out
//!    under a shard read lock.
//! 2. **Leader path**: no usable entry exists. The caller atomically installs
//!    a PROVISIONING entry carrying a fresh `watch` channel, then spawns the
//!    provisioner on its own task. Running it detached means a caller that
//!    is cancelled (client disconnect) can never strand the entry in
//!    PROVISIONING.
//! 3. **Follower path**: the entry is PROVISIONING. The caller clones the
//!    entry's `watch` receiver and waits for the outcome.
//!
//! When the provisioner finishes, the entry is updated first and the outcome
//! is published second, so woken followers always observe the final state.
//! Failed provisioning removes the entry so the next request retries
//! cleanly.
//!
//! # Health
//!
//! [`mark_unhealthy`](GroupRegistry::mark_unhealthy) counts consecutive
//! failures. Once the configured threshold is reached an ACTIVE entry turns
//! DEGRADED, and the next `ensure` re-provisions it instead of handing out a
//! dead endpoint.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::metrics;
use crate::types::LifecycleState;

type Outcome = Option<Result<String>>;

struct Slot {
    state: LifecycleState,
    endpoint: Option<String>,
    last_health_ts: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    generation: u64,
    in_flight: Option<watch::Receiver<Outcome>>,
}

impl Slot {
    fn view(&self, group_label: &str) -> RegistryEntry {
        RegistryEntry {
            group_label: group_label.to_string(),
            endpoint: self.endpoint.clone(),
            state: self.state,
            last_health_ts: self.last_health_ts,
            in_flight_provision: self.in_flight.is_some(),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub group_label: String,
    pub endpoint: Option<String>,
    pub state: LifecycleState,
    pub last_health_ts: Option<DateTime<Utc>>,
    pub in_flight_provision: bool,
    pub consecutive_failures: u32,
}

/// Number of entries per lifecycle state, kept in step with the table so
/// gauges are updated per transition instead of by scanning every entry.
#[derive(Default)]
struct StateCounts([AtomicUsize; 5]);

impl StateCounts {
    fn slot(state: LifecycleState) -> usize {
        match state {
            LifecycleState::Unknown => 0,
            LifecycleState::Provisioning => 1,
            LifecycleState::Active => 2,
            LifecycleState::Degraded => 3,
            LifecycleState::Stopped => 4,
        }
    }

    fn get(&self, state: LifecycleState) -> usize {
        self.0[Self::slot(state)].load(Ordering::SeqCst)
    }

    /// Move one entry from `from` to `to`; `None` means absent from the table.
    fn transition(&self, from: Option<LifecycleState>, to: Option<LifecycleState>) {
        if from == to {
            return;
        }
        if let Some(state) = from {
            let counter = &self.0[Self::slot(state)];
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            metrics::set_registry_entries(state.as_str(), counter.load(Ordering::SeqCst));
        }
        if let Some(state) = to {
            let counter = &self.0[Self::slot(state)];
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_registry_entries(state.as_str(), count);
        }
    }
}

enum Step {
    Ready(String),
    Wait(watch::Receiver<Outcome>),
    Lead(watch::Sender<Outcome>, watch::Receiver<Outcome>, u64),
}

/// Process-wide group registry.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct GroupRegistry {
    entries: Arc<DashMap<String, Slot>>,
    generations: Arc<AtomicU64>,
    counts: Arc<StateCounts>,
    failure_threshold: u32,
}

impl GroupRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(1)),
            counts: Arc::new(StateCounts::default()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Endpoint of `group`, provisioning it if necessary.
    ///
    /// `provisioner` runs at most once per provisioning round, however many
    /// callers race on the same group. It is dropped unused when another
    /// caller is already provisioning or the entry is ACTIVE.
    pub async fn ensure<F, Fut>(&self, group: &str, provisioner: F) -> Result<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        if let Some(slot) = self.entries.get(group) {
            if slot.state == LifecycleState::Active {
                if let Some(endpoint) = &slot.endpoint {
                    return Ok(endpoint.clone());
                }
            }
        }

        match self.next_step(group) {
            Step::Ready(endpoint) => Ok(endpoint),
            Step::Wait(rx) => Self::wait(group, rx).await,
            Step::Lead(tx, rx, generation) => {
                self.spawn_provisioner(group, generation, tx, provisioner);
                Self::wait(group, rx).await
            }
        }
    }

    fn next_step(&self, group: &str) -> Step {
        let start = |slot: &mut Slot| {
            let (tx, rx) = watch::channel(None);
            let generation = self.generations.fetch_add(1, Ordering::SeqCst);
            slot.state = LifecycleState::Provisioning;
            slot.endpoint = None;
            slot.generation = generation;
            slot.in_flight = Some(rx.clone());
            Step::Lead(tx, rx, generation)
        };

        let step = match self.entries.entry(group.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match (&slot.in_flight, slot.state, &slot.endpoint) {
                    (Some(rx), _, _) => Step::Wait(rx.clone()),
                    (None, LifecycleState::Active, Some(endpoint)) => Step::Ready(endpoint.clone()),
                    _ => {
                        tracing::info!(group, state = %slot.state, "Re-provisioning group");
                        let previous = slot.state;
                        let step = start(slot);
                        self.counts
                            .transition(Some(previous), Some(LifecycleState::Provisioning));
                        step
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = Slot {
                    state: LifecycleState::Unknown,
                    endpoint: None,
                    last_health_ts: None,
                    consecutive_failures: 0,
                    generation: 0,
                    in_flight: None,
                };
                let step = start(&mut slot);
                vacant.insert(slot);
                self.counts.transition(None, Some(LifecycleState::Provisioning));
                step
            }
        };

        step
    }

    fn spawn_provisioner<F, Fut>(
        &self,
        group: &str,
        generation: u64,
        tx: watch::Sender<Outcome>,
        provisioner: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let registry = self.clone();
        let group = group.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            tracing::info!(group = %group, generation, "Provisioning group");

            let outcome = match AssertUnwindSafe(provisioner()).catch_unwind().await {
                Ok(Ok(endpoint)) => Ok(endpoint),
                Ok(Err(e @ (Error::ProvisionFailed { .. } | Error::ProvisionTimeout { .. }))) => {
                    Err(e)
                }
                Ok(Err(e)) => Err(Error::ProvisionFailed {
                    group: group.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(Error::ProvisionFailed {
                    group: group.clone(),
                    reason: "provisioner panicked".to_string(),
                }),
            };

            let elapsed = started.elapsed().as_secs_f64();
            match &outcome {
                Ok(endpoint) => {
                    tracing::info!(group = %group, endpoint = %endpoint, elapsed_secs = elapsed, "Group provisioned");
                    metrics::record_provision("success", elapsed);
                }
                Err(e) => {
                    tracing::warn!(group = %group, error = %e, elapsed_secs = elapsed, "Group provisioning failed");
                    metrics::record_provision(e.as_metric_label(), elapsed);
                }
            }

            registry.complete(&group, generation, &outcome);
            let _ = tx.send(Some(outcome));
        });
    }

    fn complete(&self, group: &str, generation: u64, outcome: &Result<String>) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(group.to_string()) {
            if occupied.get().generation != generation {
                // Removed and re-created while this round was running.
                return;
            }
            let previous = occupied.get().state;
            match outcome {
                Ok(endpoint) => {
                    let slot = occupied.get_mut();
                    slot.state = LifecycleState::Active;
                    slot.endpoint = Some(endpoint.clone());
                    slot.last_health_ts = Some(Utc::now());
                    slot.consecutive_failures = 0;
                    slot.in_flight = None;
                    self.counts.transition(Some(previous), Some(LifecycleState::Active));
                }
                Err(_) => {
                    occupied.remove();
                    self.counts.transition(Some(previous), None);
                }
            }
        }
    }

    async fn wait(group: &str, mut rx: watch::Receiver<Outcome>) -> Result<String> {
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(result) => result.clone(),
                None => Err(Error::ProvisionFailed {
                    group: group.to_string(),
                    reason: "provisioning outcome missing".to_string(),
                }),
            },
            Err(_) => Err(Error::ProvisionFailed {
                group: group.to_string(),
                reason: "provisioner exited without a result".to_string(),
            }),
        }
    }

    /// Record a successful health check.
    ///
    /// A DEGRADED entry that recovers before anyone re-provisions it returns
    /// to ACTIVE.
    pub fn mark_healthy(&self, group: &str) {
        if let Some(mut slot) = self.entries.get_mut(group) {
            slot.consecutive_failures = 0;
            slot.last_health_ts = Some(Utc::now());
            if slot.state == LifecycleState::Degraded && slot.in_flight.is_none() {
                slot.state = LifecycleState::Active;
                self.counts
                    .transition(Some(LifecycleState::Degraded), Some(LifecycleState::Active));
                tracing::info!(group, "Group recovered");
            }
        }
    }

    /// Record a failed health check and return the resulting state.
    pub fn mark_unhealthy(&self, group: &str) -> Option<LifecycleState> {
        let state = self.entries.get_mut(group).map(|mut slot| {
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
            if slot.state == LifecycleState::Active
                && slot.consecutive_failures >= self.failure_threshold
            {
                slot.state = LifecycleState::Degraded;
                self.counts
                    .transition(Some(LifecycleState::Active), Some(LifecycleState::Degraded));
                tracing::warn!(
                    group,
                    failures = slot.consecutive_failures,
                    "Group degraded, will re-provision on next access"
                );
            }
            slot.state
        });
        state
    }

    /// Mark a group's service as gone (not running on the platform).
    pub fn mark_stopped(&self, group: &str) {
        if let Some(mut slot) = self.entries.get_mut(group) {
            if slot.in_flight.is_none() {
                let previous = slot.state;
                slot.state = LifecycleState::Stopped;
                self.counts
                    .transition(Some(previous), Some(LifecycleState::Stopped));
            }
        }
    }

    /// Drop a group's entry (explicit teardown).
    pub fn remove(&self, group: &str) -> Option<RegistryEntry> {
        self.entries.remove(group).map(|(label, slot)| {
            self.counts.transition(Some(slot.state), None);
            slot.view(&label)
        })
    }

    pub fn get(&self, group: &str) -> Option<RegistryEntry> {
        self.entries.get(group).map(|slot| slot.view(group))
    }

    pub fn state(&self, group: &str) -> LifecycleState {
        self.entries
            .get(group)
            .map(|slot| slot.state)
            .unwrap_or(LifecycleState::Unknown)
    }

    /// Endpoint of an ACTIVE or DEGRADED entry.
    pub fn endpoint(&self, group: &str) -> Option<String> {
        self.entries.get(group).and_then(|slot| match slot.state {
            LifecycleState::Active | LifecycleState::Degraded => slot.endpoint.clone(),
            _ => None,
        })
    }

    /// Entries sorted by group label.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.value().view(e.key()))
            .collect();
        entries.sort_by(|a, b| a.group_label.cmp(&b.group_label));
        entries
    }

    /// `(group, endpoint)` of every entry that should be health checked.
    pub fn monitored(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, LifecycleState::Active | LifecycleState::Degraded))
            .filter_map(|e| e.endpoint.clone().map(|ep| (e.key().clone(), ep)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently in `state`.
    pub fn count_in_state(&self, state: LifecycleState) -> usize {
        self.counts.get(state)
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("entries", &self.entries.len())
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}
