//! Broker client contract
//!
//! The relay only needs an ordered, partitioned, append-only log: publish a
//! keyed message and learn its `(partition, offset)`, then read an inclusive
//! offset range back. [`MemoryBroker`] implements that contract in-process.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use super::packet::packet_key;
use super::types::TransferRecord;

// ============================================================================
// Messages
// ============================================================================

/// A keyed message with string-named binary headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub value: Vec<u8>,
}

impl BrokerMessage {
    /// Deletion marker for a previously published key
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            headers: Vec::new(),
            value: Vec::new(),
        }
    }

    /// First header with the given name
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty() && self.headers.is_empty()
    }
}

/// A message as stored in a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub partition: i32,
    pub offset: i64,
    pub message: BrokerMessage,
}

/// Position assigned to a durably written message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub partition: i32,
    pub offset: i64,
}

/// Broker error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Worth retrying (leader election, timeouts, throttling)
    #[error("Transient broker error: {0}")]
    Transient(String),

    #[error("Broker error: {0}")]
    Fatal(String),

    #[error("Unknown topic or partition: {topic}/{partition}")]
    UnknownPartition { topic: String, partition: i32 },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ============================================================================
// Broker Client Trait
// ============================================================================

/// Trait for broker backends
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Append a message; messages sharing a partition key share a partition
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        message: BrokerMessage,
    ) -> Result<PublishAck, BrokerError>;

    /// Read `start_offset..=end_offset` from one partition, in offset order
    async fn read_range(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<BoxStream<'static, Result<BrokerRecord, BrokerError>>, BrokerError>;

    /// Mark a key as deleted for compaction
    async fn tombstone(
        &self,
        topic: &str,
        partition_key: &str,
        key: &str,
    ) -> Result<PublishAck, BrokerError> {
        self.publish(topic, partition_key, BrokerMessage::tombstone(key))
            .await
    }
}

/// Tombstone the first `count` packets of a transfer.
///
/// Failures are logged and stop the purge; retention on the broker is the
/// backstop. Returns how many packets were tombstoned.
pub async fn purge_packets(broker: &dyn BrokerClient, record: &TransferRecord, count: u64) -> u64 {
    let partition_key = record.partition_key();
    let mut purged = 0;

    for sequence in 0..count {
        let key = packet_key(record.id(), sequence);
        if let Err(e) = broker.tombstone(record.topic(), &partition_key, &key).await {
            tracing::warn!(
                transfer_id = %record.id(),
                sequence = sequence,
                error = %e,
                "Failed to purge transfer packets"
            );
            break;
        }
        purged += 1;
    }

    if purged > 0 {
        tracing::debug!(
            transfer_id = %record.id(),
            purged = purged,
            "Purged transfer packets"
        );
    }

    purged
}

// ============================================================================
// In-Memory Broker
// ============================================================================

/// Default partitions per topic for [`MemoryBroker`]
pub const DEFAULT_PARTITIONS: usize = 3;

/// In-process broker: topics are created on first publish, offsets start at
/// zero per partition and never repeat.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

struct MemoryBrokerInner {
    partitions: usize,

    /// Topic -> partitions -> records (index == offset)
    topics: Mutex<HashMap<String, Vec<Vec<BrokerRecord>>>>,

    /// Errors returned by upcoming publishes, in order
    injected_failures: Mutex<VecDeque<BrokerError>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                partitions: partitions.max(1),
                topics: Mutex::new(HashMap::new()),
                injected_failures: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Make the next publishes fail with these errors, one per call
    pub fn fail_next_publishes(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.inner.injected_failures.lock().extend(errors);
    }

    /// Whether a topic has been created
    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.topics.lock().contains_key(topic)
    }

    /// Snapshot of one partition
    pub fn records(&self, topic: &str, partition: i32) -> Vec<BrokerRecord> {
        let topics = self.inner.topics.lock();
        topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a stored value in place, keeping key and headers
    pub fn overwrite_value(&self, topic: &str, partition: i32, offset: i64, value: Vec<u8>) -> bool {
        let mut topics = self.inner.topics.lock();
        let record = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .and_then(|records| records.get_mut(offset as usize));

        match record {
            Some(record) => {
                record.message.value = value;
                true
            }
            None => false,
        }
    }

    fn partition_for(&self, partition_key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        message: BrokerMessage,
    ) -> Result<PublishAck, BrokerError> {
        if let Some(err) = self.inner.injected_failures.lock().pop_front() {
            return Err(err);
        }

        let partition = self.partition_for(partition_key);
        let mut topics = self.inner.topics.lock();
        let partitions = topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.inner.partitions]);

        let records = &mut partitions[partition as usize];
        let offset = records.len() as i64;
        records.push(BrokerRecord {
            partition,
            offset,
            message,
        });

        Ok(PublishAck { partition, offset })
    }

    async fn read_range(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<BoxStream<'static, Result<BrokerRecord, BrokerError>>, BrokerError> {
        let topics = self.inner.topics.lock();
        let records = topics
            .get(topic)
            .and_then(|partitions| {
                usize::try_from(partition)
                    .ok()
                    .and_then(|index| partitions.get(index))
            })
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        let start = start_offset.max(0) as usize;
        let end = (end_offset.saturating_add(1)).max(0) as usize;
        let slice: Vec<BrokerRecord> = records
            .get(start.min(records.len())..end.min(records.len()))
            .map(|slice| slice.to_vec())
            .unwrap_or_default();

        Ok(stream::iter(slice.into_iter().map(Ok)).boxed())
    }
}

// ============================================================================
// Tests
// ============================================================================
