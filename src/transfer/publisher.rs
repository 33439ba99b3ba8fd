//! Offset allocator / publisher
//!
//! Packets go to the transfer's topic one at a time, keyed by transfer id,
//! so every ack lands on one partition. The first and last acks become the
//! transfer's offset range.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::broker::{BrokerClient, BrokerMessage, PublishAck};
use super::packet::Packet;
use super::types::{BrokerBinding, TransferRecord};
use crate::config::BrokerConfig;
use crate::error::{Result, TransferError};

/// Per-packet retry budget for transient broker errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling and capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_retries: config.publish_max_retries,
            initial_backoff: Duration::from_millis(config.publish_backoff_ms),
            max_backoff: Duration::from_millis(config.publish_backoff_max_ms),
        }
    }
}

/// A publish that stopped early, with how many packets were already durable
#[derive(Debug, thiserror::Error)]
#[error("{error} ({committed} packet(s) committed)")]
pub struct PublishError {
    #[source]
    pub error: TransferError,
    pub committed: u64,
}

/// Publishes a packet stream and derives the broker binding
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(broker: Arc<dyn BrokerClient>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Publish every packet in order.
    ///
    /// Does not touch the record's state; the caller applies the outcome.
    pub async fn publish(
        &self,
        record: &TransferRecord,
        mut packets: BoxStream<'static, Result<Packet>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<BrokerBinding, PublishError> {
        let topic = record.topic();
        let partition_key = record.partition_key();

        let mut first: Option<PublishAck> = None;
        let mut last: Option<PublishAck> = None;
        let mut committed = 0u64;

        let stop = |error: TransferError, committed: u64| PublishError { error, committed };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(stop(TransferError::Cancelled, committed)),
                next = packets.next() => next,
            };

            let packet = match next {
                None => break,
                Some(Ok(packet)) => packet,
                Some(Err(e)) => return Err(stop(e, committed)),
            };

            let sequence = packet.sequence;
            let ack = self
                .publish_with_retry(topic, &partition_key, packet.into_message(), sequence, cancel)
                .await
                .map_err(|e| stop(e, committed))?;

            if let Some(previous) = last {
                if ack.partition != previous.partition || ack.offset <= previous.offset {
                    return Err(stop(
                        TransferError::OffsetDiscontinuity(format!(
                            "packet {} acked at {}/{} after {}/{}",
                            sequence, ack.partition, ack.offset, previous.partition, previous.offset
                        )),
                        committed + 1,
                    ));
                }
            }

            first.get_or_insert(ack);
            last = Some(ack);
            committed += 1;

            tracing::debug!(
                transfer_id = %record.id(),
                sequence = sequence,
                partition = ack.partition,
                offset = ack.offset,
                "Packet published"
            );
        }

        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(stop(
                    TransferError::OffsetDiscontinuity("no packets were published".into()),
                    committed,
                ))
            }
        };

        BrokerBinding::new(
            first.partition,
            first.offset,
            last.offset,
            record.packet_count(),
        )
        .map_err(|e| stop(e, committed))
    }

    async fn publish_with_retry(
        &self,
        topic: &str,
        partition_key: &str,
        message: BrokerMessage,
        sequence: u64,
        cancel: &CancellationToken,
    ) -> Result<PublishAck> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                result = self.broker.publish(topic, partition_key, message.clone()) => result,
            };

            match result {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        topic = topic,
                        sequence = sequence,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient publish failure, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(TransferError::PublishExhausted {
                        sequence,
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
            }
        }
    }
}
