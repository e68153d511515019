//! Process-local derived logs.
//!
//! A [`MemoryLog`] is an append-only, single-partition log with per
//! consumer-group committed offsets. It backs the embedded local profile and
//! the test suite, and can inject connect and read failures to exercise the
//! Dispatcher's reconnect path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;

use super::{CommitMode, LogRecord, LogSource};
use crate::error::{Error, Result};
use crate::types::SequenceToken;

const PARTITION: i32 = 0;

#[derive(Default)]
struct LogInner {
    records: Mutex<Vec<LogRecord>>,
    appended: Notify,
    committed: DashMap<String, i64>,
    failing_connects: AtomicU32,
    failing_reads: AtomicU32,
}

/// Shared handle to one in-memory log.
#[derive(Clone)]
pub struct MemoryLog {
    name: Arc<str>,
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a JSON record keyed by `entity_id` and return its token.
    pub fn append_json(&self, entity_id: &str, payload: &serde_json::Value) -> SequenceToken {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        self.append(Some(entity_id.as_bytes()), &bytes)
    }

    /// Append a raw record and return its token.
    pub fn append(&self, key: Option<&[u8]>, payload: &[u8]) -> SequenceToken {
        let token = {
            let mut records = self.records();
            let token = SequenceToken::new(PARTITION, records.len() as i64);
            records.push(LogRecord {
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
                token,
                timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            });
            token
        };
        self.inner.appended.notify_waiters();
        token
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next offset `consumer_group` will read, if it ever committed.
    pub fn committed(&self, consumer_group: &str) -> Option<i64> {
        self.inner.committed.get(consumer_group).map(|o| *o)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail, simulating a broker disconnect.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.failing_reads.store(n, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLog")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Named collection of in-memory logs, one per derived log id.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<DashMap<String, MemoryLog>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The log named `topic`, created empty on first use.
    pub fn topic(&self, topic: &str) -> MemoryLog {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| MemoryLog::new(topic))
            .clone()
    }

    pub fn remove_topic(&self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// One consumer of a [`MemoryLog`].
pub struct MemoryLogSource {
    log: MemoryLog,
    consumer_group: String,
    position: Option<i64>,
}

impl MemoryLogSource {
    pub fn new(log: MemoryLog, consumer_group: &str) -> Self {
        Self {
            log,
            consumer_group: consumer_group.to_string(),
            position: None,
        }
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn connect(&mut self) -> Result<()> {
        if MemoryLog::take_failure(&self.log.inner.failing_connects) {
            return Err(Error::Unavailable(format!(
                "memory log '{}' refused connection",
                self.log.name()
            )));
        }
        self.position = Some(self.log.committed(&self.consumer_group).unwrap_or(0));
        Ok(())
    }

    async fn next_record(&mut self) -> Result<LogRecord> {
        let Some(position) = self.position else {
            return Err(Error::Log("memory log source is not connected".into()));
        };

        loop {
            let appended = self.log.inner.appended.notified();

            if MemoryLog::take_failure(&self.log.inner.failing_reads) {
                self.position = None;
                return Err(Error::Log(format!(
                    "memory log '{}' connection lost",
                    self.log.name()
                )));
            }

            let next = self.log.records().get(position as usize).cloned();
            if let Some(record) = next {
                self.position = Some(position + 1);
                return Ok(record);
            }

            appended.await;
        }
    }

    async fn commit(&mut self, token: SequenceToken, _mode: CommitMode) -> Result<()> {
        self.log
            .inner
            .committed
            .insert(self.consumer_group.clone(), token.offset + 1);
        Ok(())
    }

    async fn close(&mut self) {
        self.position = None;
    }

    fn describe(&self) -> String {
        format!("memory:{}/{}", self.log.name(), self.consumer_group)
    }
}
