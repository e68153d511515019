//! Ordered log sources consumed by a Dispatcher.
//!
//! A [`LogSource`] is one consumer attached to one group's derived log. It
//! hands out raw records in log order and commits positions on request;
//! decoding into [`Event`](crate::types::Event)s is the Dispatcher's job.
//!
//! Sources are single-use: after an error the Dispatcher closes the source
//! and asks its [`LogSourceFactory`] for a fresh one, which re-attaches at
//! the last committed position.

use async_trait::async_trait;

use crate::config::{DispatcherConfig, LogBackend};
use crate::error::{Error, Result};
use crate::types::SequenceToken;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaLogSource;
pub use memory::{MemoryBroker, MemoryLog, MemoryLogSource};

/// One raw record read from a derived log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub token: SequenceToken,
    /// Broker timestamp in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

/// Commit flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Fire and forget, used on the hot path.
    Async,
    /// Wait for the broker, used on shutdown.
    Sync,
}

/// A single ordered consumer of one derived log.
#[async_trait]
pub trait LogSource: Send {
    /// Attach at the last committed position (earliest on first run).
    ///
    /// Returns once the consumer owns its partitions.
    async fn connect(&mut self) -> Result<()>;

    /// Next record in log order. Waits until one is available.
    async fn next_record(&mut self) -> Result<LogRecord>;

    /// Commit `token` as consumed. The next attach resumes after it.
    async fn commit(&mut self, token: SequenceToken, mode: CommitMode) -> Result<()>;

    /// Detach from the log.
    async fn close(&mut self);

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Builds fresh sources for a Dispatcher.
pub trait LogSourceFactory: Send + Sync {
    fn create(&self, config: &DispatcherConfig) -> Result<Box<dyn LogSource>>;
}

/// Factory selecting the backend named in the Dispatcher's configuration.
///
/// The memory backend reads from the attached [`MemoryBroker`]; without one
/// it is rejected.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredLogSourceFactory {
    memory: Option<MemoryBroker>,
}

impl ConfiguredLogSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_broker(broker: MemoryBroker) -> Self {
        Self {
            memory: Some(broker),
        }
    }

    pub fn memory_broker(&self) -> Option<&MemoryBroker> {
        self.memory.as_ref()
    }
}

impl LogSourceFactory for ConfiguredLogSourceFactory {
    fn create(&self, config: &DispatcherConfig) -> Result<Box<dyn LogSource>> {
        match config.log_backend {
            LogBackend::Memory => {
                let broker = self.memory.as_ref().ok_or_else(|| {
                    Error::Config("memory log backend selected without a memory broker".into())
                })?;
                Ok(Box::new(MemoryLogSource::new(
                    broker.topic(&config.topic),
                    &config.consumer_group,
                )))
            }
            #[cfg(feature = "kafka")]
            LogBackend::Kafka => Ok(Box::new(KafkaLogSource::new(
                &config.broker,
                &config.topic,
                &config.consumer_group,
                config.assignment_timeout,
            ))),
            #[cfg(not(feature = "kafka"))]
            LogBackend::Kafka => Err(Error::Config(
                "kafka log backend requires the `kafka` feature".into(),
            )),
        }
    }
}

impl LogSourceFactory for MemoryBroker {
    fn create(&self, config: &DispatcherConfig) -> Result<Box<dyn LogSource>> {
        Ok(Box::new(MemoryLogSource::new(
            self.topic(&config.topic),
            &config.consumer_group,
        )))
    }
}
