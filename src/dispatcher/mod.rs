//! Per-group Dispatcher.
//!
//! # Lifecycle
//!
//! ```text
//! STARTING ──attach──▶ CONSUMING ──shutdown──▶ DRAINING ──▶ STOPPED
//!                        │    ▲
//!                 error  ▼    │ re-attach at committed position
//!                      (reconnecting, not ready)
//! ```
//!
//! One consumer task owns the group's [`LogSource`]. For each record it
//! decodes an [`Event`], publishes it to the [`FanoutBuffer`] (which queues
//! it for matching sessions), optionally forwards it to an
//! [`ExternalFanout`], and only then commits the record's position. A
//! consumer error never touches sessions: the task closes the source,
//! waits per [`ReconnectBackoff`], and attaches a fresh source at the last
//! committed position. Readiness is false until the first attach and while
//! reconnecting.
//!
//! # Shutdown
//!
//! [`Dispatcher::shutdown`] stops accepting sessions, gives existing sessions
//! `drain_grace` to empty their queues, closes them, then stops the consumer
//! with a final synchronous commit.

mod fanout;
mod session;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use fanout::{FanoutBuffer, PublishOutcome};
pub use session::{SessionFilter, SessionStats, Subscription};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::log::{CommitMode, LogRecord, LogSource, LogSourceFactory};
use crate::metrics;
use crate::retry::ReconnectBackoff;
use crate::types::{Event, SequenceToken};

const DRAIN_POLL: Duration = Duration::from_millis(25);
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DispatcherState {
    Starting = 0,
    Consuming = 1,
    Draining = 2,
    Stopped = 3,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Starting,
            1 => DispatcherState::Consuming,
            2 => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Starting => "STARTING",
            DispatcherState::Consuming => "CONSUMING",
            DispatcherState::Draining => "DRAINING",
            DispatcherState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional second fan-out tier for horizontally replicated Dispatchers.
///
/// Every consumed event is handed to the external layer after local fan-out.
/// Failures are logged and never stall consumption.
#[async_trait]
pub trait ExternalFanout: Send + Sync {
    async fn publish(&self, group: &str, event: &Event) -> Result<()>;
}

/// Point-in-time Dispatcher statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub group: String,
    pub topic: String,
    pub state: DispatcherState,
    pub attached: bool,
    pub sessions: usize,
    pub buffered: usize,
    pub consumed: u64,
    pub undecodable: u64,
    pub reconnects: u64,
    pub last_token: Option<SequenceToken>,
}

struct Inner {
    config: DispatcherConfig,
    factory: Arc<dyn LogSourceFactory>,
    external: Option<Arc<dyn ExternalFanout>>,
    fanout: Arc<FanoutBuffer>,
    state: AtomicU8,
    state_tx: watch::Sender<DispatcherState>,
    attached: AtomicBool,
    accepting: AtomicBool,
    last_error: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    consumed: AtomicU64,
    undecodable: AtomicU64,
    reconnects: AtomicU64,
    last_token: Mutex<Option<SequenceToken>>,
}

impl Inner {
    fn set_state(&self, state: DispatcherState) {
        let previous = DispatcherState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            tracing::info!(group = %self.config.group, from = %previous, to = %state, "Dispatcher state changed");
            self.state_tx.send_replace(state);
            metrics::set_dispatcher_state(&self.config.group, state as i64);
        }
    }

    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_attached(&self, attached: bool, error: Option<String>) {
        self.attached.store(attached, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    async fn handle_record(&self, record: LogRecord) {
        let group = &self.config.group;
        let token = record.token;
        match Event::from_record(
            record.key.as_deref(),
            &record.payload,
            token,
            record.timestamp_ms,
        ) {
            Ok(event) => {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                metrics::record_consumed(group);

                let forwarded = self.external.as_ref().map(|_| event.clone());
                self.fanout.publish(event);

                if let (Some(external), Some(event)) = (&self.external, forwarded) {
                    if let Err(e) = external.publish(group, &event).await {
                        tracing::warn!(group = %group, token = %token, error = %e, "External fan-out failed");
                    }
                }
            }
            Err(e) => {
                self.undecodable.fetch_add(1, Ordering::Relaxed);
                metrics::record_undecodable(group);
                tracing::warn!(group = %group, token = %token, error = %e, "Skipping undecodable record");
            }
        }
        *self.last_token.lock().unwrap_or_else(|p| p.into_inner()) = Some(token);
    }

    /// Wait `delay` unless shutdown is requested first. Returns false on shutdown.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop_requested(shutdown) => false,
        }
    }

    async fn run(self: Arc<Self>) {
        let group = self.config.group.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = ReconnectBackoff::new();

        'attach: loop {
            if *shutdown.borrow() {
                break;
            }

            let mut source: Box<dyn LogSource> = match self.factory.create(&self.config) {
                Ok(source) => source,
                Err(e) => {
                    tracing::error!(group = %group, error = %e, "Failed to build log source");
                    self.set_attached(false, Some(e.to_string()));
                    if self.pause(backoff.next_delay(), &mut shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            let connected = tokio::select! {
                result = source.connect() => result,
                _ = stop_requested(&mut shutdown) => break 'attach,
            };
            if let Err(e) = connected {
                let delay = backoff.next_delay();
                tracing::warn!(
                    group = %group,
                    source = %source.describe(),
                    error = %e,
                    attempt = backoff.attempts(),
                    ?delay,
                    "Log consumer attach failed"
                );
                metrics::record_consumer_reconnect(&group, false);
                self.set_attached(false, Some(e.to_string()));
                if self.pause(delay, &mut shutdown).await {
                    continue;
                }
                break;
            }

            if backoff.attempts() > 0 || self.reconnects.load(Ordering::Relaxed) > 0 {
                metrics::record_consumer_reconnect(&group, true);
            }
            backoff.reset();
            self.set_attached(true, None);
            self.set_state(DispatcherState::Consuming);
            tracing::info!(group = %group, source = %source.describe(), "Log consumer attached");

            let mut last_committed: Option<SequenceToken> = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = stop_requested(&mut shutdown) => {
                        if let Some(token) = last_committed {
                            if let Err(e) = source.commit(token, CommitMode::Sync).await {
                                tracing::warn!(group = %group, error = %e, "Final commit failed");
                            }
                        }
                        source.close().await;
                        break 'attach;
                    }
                    next = source.next_record() => next,
                };

                match next {
                    Ok(record) => {
                        let token = record.token;
                        self.handle_record(record).await;
                        match source.commit(token, CommitMode::Async).await {
                            Ok(()) => last_committed = Some(token),
                            Err(e) => {
                                metrics::record_commit_failure(&group);
                                tracing::warn!(group = %group, token = %token, error = %e, "Commit failed");
                            }
                        }
                    }
                    Err(e) => {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.set_attached(false, Some(e.to_string()));
                        source.close().await;
                        let delay = backoff.next_delay();
                        tracing::warn!(group = %group, error = %e, ?delay, "Log consumer failed, reconnecting");
                        if self.pause(delay, &mut shutdown).await {
                            continue 'attach;
                        }
                        break 'attach;
                    }
                }
            }
        }

        self.set_attached(false, None);
        tracing::info!(group = %group, "Log consumer stopped");
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// One group's Dispatcher.
///
/// Cheap to clone; clones share the same consumer and sessions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    consumer: Arc<Mutex<Option<JoinHandle<()>>>>,
    state_rx: watch::Receiver<DispatcherState>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, factory: Arc<dyn LogSourceFactory>) -> Self {
        Self::build(config, factory, None)
    }

    /// Dispatcher that also forwards every event to `external`.
    pub fn with_external_fanout(
        config: DispatcherConfig,
        factory: Arc<dyn LogSourceFactory>,
        external: Arc<dyn ExternalFanout>,
    ) -> Self {
        Self::build(config, factory, Some(external))
    }

    fn build(
        config: DispatcherConfig,
        factory: Arc<dyn LogSourceFactory>,
        external: Option<Arc<dyn ExternalFanout>>,
    ) -> Self {
        let fanout = FanoutBuffer::new(
            &config.group,
            config.fanout_buffer_capacity,
            config.queue_capacity,
        );
        let (state_tx, state_rx) = watch::channel(DispatcherState::Starting);
        let (shutdown_tx, _) = watch::channel(false);
        metrics::set_dispatcher_state(&config.group, DispatcherState::Starting as i64);

        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                external,
                fanout,
                state: AtomicU8::new(DispatcherState::Starting as u8),
                state_tx,
                attached: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                last_error: Mutex::new(None),
                shutdown_tx,
                consumed: AtomicU64::new(0),
                undecodable: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                last_token: Mutex::new(None),
            }),
            consumer: Arc::new(Mutex::new(None)),
            state_rx,
        }
    }

    /// Spawn the consumer task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock().unwrap_or_else(|p| p.into_inner());
        if consumer.is_some() || self.inner.state() != DispatcherState::Starting {
            return;
        }
        tracing::info!(
            group = %self.inner.config.group,
            topic = %self.inner.config.topic,
            consumer_group = %self.inner.config.consumer_group,
            "Starting dispatcher"
        );
        *consumer = Some(tokio::spawn(self.inner.clone().run()));
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    /// Ready once the consumer is attached and not draining.
    pub fn is_ready(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst) && self.state() == DispatcherState::Consuming
    }

    /// Why the Dispatcher is not ready, if it is not.
    pub fn readiness_issue(&self) -> Option<String> {
        if self.is_ready() {
            return None;
        }
        let last_error = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        Some(match (self.state(), last_error) {
            (DispatcherState::Consuming, Some(e)) => format!("log consumer reconnecting: {e}"),
            (DispatcherState::Starting, Some(e)) => format!("log consumer not attached: {e}"),
            (DispatcherState::Starting, None) => "log consumer not attached yet".to_string(),
            (state, _) => format!("dispatcher is {state}"),
        })
    }

    /// Wait until the Dispatcher reaches `state` or `timeout` elapses.
    pub async fn wait_for_state(&self, state: DispatcherState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Open a session for `filter`, optionally resuming after a token.
    pub fn subscribe(
        &self,
        filter: SessionFilter,
        after: Option<SequenceToken>,
    ) -> Result<Subscription> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if filter.entity_id.trim().is_empty() {
            return Err(Error::InvalidRequest("asset_uuid must not be empty".into()));
        }
        Ok(self.inner.fanout.subscribe(filter, after))
    }

    pub fn fanout(&self) -> &Arc<FanoutBuffer> {
        &self.inner.fanout
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            group: self.inner.config.group.clone(),
            topic: self.inner.config.topic.clone(),
            state: self.state(),
            attached: self.inner.attached.load(Ordering::SeqCst),
            sessions: self.inner.fanout.session_count(),
            buffered: self.inner.fanout.buffered(),
            consumed: self.inner.consumed.load(Ordering::Relaxed),
            undecodable: self.inner.undecodable.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            last_token: *self.inner.last_token.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    /// Drain sessions and stop the consumer.
    pub async fn shutdown(&self) {
        if self.state() == DispatcherState::Stopped {
            return;
        }
        let group = self.inner.config.group.clone();
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.set_state(DispatcherState::Draining);

        let grace = self.inner.config.drain_grace;
        let started = Instant::now();
        while self.inner.fanout.queued() > 0 && started.elapsed() < grace {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let unflushed = self.inner.fanout.queued();
        if unflushed > 0 {
            tracing::warn!(group = %group, unflushed, "Drain grace elapsed with queued events");
        }
        self.inner.fanout.close_all();

        self.inner.shutdown_tx.send_replace(true);
        let handle = self.consumer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CONSUMER_STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!(group = %group, "Consumer did not stop in time, aborting");
                handle.abort();
            }
        }

        self.inner.set_attached(false, None);
        self.inner.set_state(DispatcherState::Stopped);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("group", &self.inner.config.group)
            .field("state", &self.state())
            .field("sessions", &self.inner.fanout.session_count())
            .finish()
    }
}
