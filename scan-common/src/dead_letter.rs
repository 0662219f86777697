//! # Dead letter publishing
//!
//! Messages that can never be processed are republished, untouched, to a dead letter topic along
//! with the reason they were rejected. The original message is only acknowledged once this
//! publish succeeded.
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::{info, instrument};

use crate::kafka_producer::KafkaContext;

/// Why a message is being dead lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ParseError,
    NormalizeError,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ParseError => "parse_error",
            RejectReason::NormalizeError => "normalize_error",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes attached to a dead lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterMetadata {
    pub reason: RejectReason,
    pub original_message_id: String,
    pub delivery_attempt: i32,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("dead letter publish timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish `payload` byte for byte. Returns once the publish is confirmed.
    async fn publish(
        &self,
        payload: &[u8],
        metadata: &DeadLetterMetadata,
    ) -> Result<(), PublishError>;

    /// Whether a successful publish leaves the message somewhere it can be inspected later.
    fn retains_messages(&self) -> bool {
        true
    }
}

/// Used when no dead letter topic is configured: rejected messages are logged and dropped.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(
        &self,
        payload: &[u8],
        metadata: &DeadLetterMetadata,
    ) -> Result<(), PublishError> {
        info!(
            message_id = metadata.original_message_id,
            reason = metadata.reason.as_str(),
            bytes = payload.len(),
            "no dead letter topic configured, dropping message"
        );
        Ok(())
    }

    fn retains_messages(&self) -> bool {
        false
    }
}

pub struct KafkaDeadLetterPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Upper bound for a single publish, including time spent in the producer queue.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DeadLetterPublisher for KafkaDeadLetterPublisher {
    #[instrument(skip_all, fields(message_id = %metadata.original_message_id))]
    async fn publish(
        &self,
        payload: &[u8],
        metadata: &DeadLetterMetadata,
    ) -> Result<(), PublishError> {
        let attempt = metadata.delivery_attempt.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "reason",
                value: Some(metadata.reason.as_str()),
            })
            .insert(Header {
                key: "orig_msg_id",
                value: Some(metadata.original_message_id.as_str()),
            })
            .insert(Header {
                key: "delivery_attempt",
                value: Some(attempt.as_str()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(metadata.original_message_id.as_str())
            .payload(payload)
            .headers(headers);

        let delivery = self.producer.send(record, Timeout::After(self.timeout));
        match tokio::time::timeout(self.timeout, delivery).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(PublishError::Kafka(error)),
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        }
    }
}
