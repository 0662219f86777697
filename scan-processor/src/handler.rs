//! # ScanHandler
//!
//! Resolves every delivery to exactly one outcome: the message is either acknowledged (stored,
//! or dead lettered) or handed back to the queue for redelivery.
use std::sync::Arc;
use std::time;

use metrics::counter;
use scan_common::dead_letter::{DeadLetterMetadata, DeadLetterPublisher, RejectReason};
use scan_common::envelope::ScanEnvelope;
use scan_common::metrics_consts::{
    DEAD_LETTER_PUBLISH_ERRORS, MESSAGES_DEAD_LETTERED, MESSAGES_DROPPED, RECORDS_PERSISTED,
    STORAGE_ERRORS, STORAGE_TIMEOUTS,
};
use scan_common::normalize::Normalizer;
use scan_common::pgqueue::Delivery;
use scan_common::repository::ScanRepository;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record was persisted, or an older scan was safely ignored.
    Acknowledged,
    /// The message can never be processed and now lives on the dead letter topic.
    DeadLettered(RejectReason),
    /// The message can never be processed and no dead letter topic is configured to keep it.
    Dropped(RejectReason),
    /// Something transient failed. The message must be delivered again.
    Retry,
}

impl Outcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Outcome::Retry)
    }
}

pub struct ScanHandler {
    repository: Arc<dyn ScanRepository>,
    dead_letter: Arc<dyn DeadLetterPublisher>,
    normalizer: Normalizer,
    persist_timeout: time::Duration,
}

impl ScanHandler {
    pub fn new(
        repository: Arc<dyn ScanRepository>,
        dead_letter: Arc<dyn DeadLetterPublisher>,
        normalizer: Normalizer,
        persist_timeout: time::Duration,
    ) -> Self {
        Self {
            repository,
            dead_letter,
            normalizer,
            persist_timeout,
        }
    }

    /// Decode, normalize and persist a single delivery. Nothing is retried in here: a transient
    /// failure is reported as `Outcome::Retry` and left to the queue.
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let message_id = delivery.message_id();

        let envelope = match ScanEnvelope::decode(&delivery.data) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(
                    message_id,
                    attempt = delivery.attempt,
                    %error,
                    "rejecting scan that cannot be decoded"
                );
                return self.reject(delivery, RejectReason::ParseError).await;
            }
        };

        let record = match self.normalizer.normalize(&envelope) {
            Ok(record) => record,
            Err(error) => {
                warn!(
                    message_id,
                    attempt = delivery.attempt,
                    scan = envelope.identity(),
                    data_version = envelope.data_version,
                    %error,
                    "rejecting scan that cannot be normalized"
                );
                return self.reject(delivery, RejectReason::NormalizeError).await;
            }
        };

        match tokio::time::timeout(self.persist_timeout, self.repository.upsert_latest(&record))
            .await
        {
            Ok(Ok(())) => {
                counter!(RECORDS_PERSISTED).increment(1);
                Outcome::Acknowledged
            }
            Ok(Err(error)) => {
                error!(
                    message_id,
                    attempt = delivery.attempt,
                    scan = envelope.identity(),
                    %error,
                    "failed to persist scan"
                );
                counter!(STORAGE_ERRORS).increment(1);
                Outcome::Retry
            }
            Err(_) => {
                error!(
                    message_id,
                    attempt = delivery.attempt,
                    scan = envelope.identity(),
                    timeout = ?self.persist_timeout,
                    "timed out persisting scan"
                );
                counter!(STORAGE_TIMEOUTS).increment(1);
                Outcome::Retry
            }
        }
    }

    async fn reject(&self, delivery: &Delivery, reason: RejectReason) -> Outcome {
        let metadata = DeadLetterMetadata {
            reason,
            original_message_id: delivery.message_id(),
            delivery_attempt: delivery.attempt,
        };

        match self.dead_letter.publish(&delivery.data, &metadata).await {
            Ok(()) if self.dead_letter.retains_messages() => {
                counter!(MESSAGES_DEAD_LETTERED, "reason" => reason.as_str()).increment(1);
                Outcome::DeadLettered(reason)
            }
            Ok(()) => {
                counter!(MESSAGES_DROPPED, "reason" => reason.as_str()).increment(1);
                Outcome::Dropped(reason)
            }
            Err(error) => {
                // Acknowledging now would lose the message, so it goes back to the queue.
                error!(
                    message_id = metadata.original_message_id,
                    attempt = delivery.attempt,
                    reason = reason.as_str(),
                    %error,
                    "failed to publish dead letter"
                );
                counter!(DEAD_LETTER_PUBLISH_ERRORS, "reason" => reason.as_str()).increment(1);
                Outcome::Retry
            }
        }
    }
}
