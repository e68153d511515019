//! Kafka-backed log source (librdkafka via `rdkafka`).
//!
//! Auto-commit is disabled: positions are committed explicitly by the
//! Dispatcher after an event has been handed to its sessions, so a restart or
//! reconnect resumes from the last fanned-out record. A consumer group with
//! no committed offset starts from the earliest record.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use super::{CommitMode, LogRecord, LogSource};
use crate::error::{Error, Result};
use crate::types::SequenceToken;

const ASSIGNMENT_POLL: Duration = Duration::from_millis(500);

/// One Kafka consumer attached to a derived log topic.
pub struct KafkaLogSource {
    broker: String,
    topic: String,
    consumer_group: String,
    assignment_timeout: Duration,
    consumer: Option<StreamConsumer>,
    /// First record received while waiting for the partition assignment.
    pending: Option<LogRecord>,
}

impl KafkaLogSource {
    pub fn new(
        broker: &str,
        topic: &str,
        consumer_group: &str,
        assignment_timeout: Duration,
    ) -> Self {
        Self {
            broker: broker.to_string(),
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            assignment_timeout,
            consumer: None,
            pending: None,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.broker)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000");
        config
    }

    fn consumer(&self) -> Result<&StreamConsumer> {
        self.consumer
            .as_ref()
            .ok_or_else(|| Error::Log(format!("consumer for '{}' is not connected", self.topic)))
    }

    fn to_record(msg: &rdkafka::message::BorrowedMessage<'_>) -> LogRecord {
        LogRecord {
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            token: SequenceToken::new(msg.partition(), msg.offset()),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

#[async_trait]
impl LogSource for KafkaLogSource {
    async fn connect(&mut self) -> Result<()> {
        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| Error::Unavailable(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| Error::Unavailable(format!("failed to subscribe to '{}': {e}", self.topic)))?;

        // Partitions are assigned during polling. Poll until the assignment
        // is non-empty or a record arrives, keeping that record for later.
        let started = Instant::now();
        loop {
            match tokio::time::timeout(ASSIGNMENT_POLL, consumer.recv()).await {
                Ok(Ok(msg)) => {
                    self.pending = Some(Self::to_record(&msg));
                    break;
                }
                Ok(Err(e)) => return Err(Error::Unavailable(format!("consumer error: {e}"))),
                Err(_) => {}
            }

            let assigned = consumer.assignment().map(|a| a.count()).unwrap_or(0);
            if assigned > 0 {
                break;
            }
            if started.elapsed() >= self.assignment_timeout {
                return Err(Error::Unavailable(format!(
                    "no partition assignment for '{}' within {:?}",
                    self.topic, self.assignment_timeout
                )));
            }
            tracing::debug!(topic = %self.topic, "Waiting for partition assignment");
        }

        tracing::info!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Consumer attached"
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_record(&mut self) -> Result<LogRecord> {
        if let Some(record) = self.pending.take() {
            return Ok(record);
        }
        let consumer = self.consumer()?;
        let msg = consumer.recv().await?;
        Ok(Self::to_record(&msg))
    }

    async fn commit(&mut self, token: SequenceToken, mode: CommitMode) -> Result<()> {
        let consumer = self.consumer()?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, token.partition, Offset::Offset(token.offset + 1))?;
        let mode = match mode {
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
        };
        consumer.commit(&tpl, mode)?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        self.pending = None;
    }

    fn describe(&self) -> String {
        format!("kafka:{}/{}@{}", self.topic, self.consumer_group, self.broker)
    }
}
