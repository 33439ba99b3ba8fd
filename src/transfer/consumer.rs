//! Consumer / reassembler
//!
//! Delivery from the broker is at-least-once and may arrive out of order
//! within a range. The reassembler keeps the first copy of each sequence
//! index, buffers early arrivals, and releases packets strictly in order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::broker::BrokerClient;
use super::packet::{Packet, PacketDecodeError};
use super::types::TransferRecord;
use crate::error::{Result, TransferError};

// ============================================================================
// Reassembler
// ============================================================================

/// How payload sizes relate to the source chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadLayout {
    /// Payload is the source chunk itself; lengths must match exactly
    #[default]
    Exact,
    /// A sealer may have changed the payload length
    Sealed,
}

/// Orders, de-duplicates and verifies the packets of one transfer
#[derive(Debug)]
pub struct Reassembler {
    transfer_id: Uuid,
    expected: u64,
    total_bytes: u64,
    chunk_size: u64,
    layout: PayloadLayout,
    next: u64,
    pending: BTreeMap<u64, Packet>,
    duplicates: u64,
}

impl Reassembler {
    pub fn new(record: &TransferRecord) -> Self {
        Self::with_layout(record, PayloadLayout::Exact)
    }

    pub fn with_layout(record: &TransferRecord, layout: PayloadLayout) -> Self {
        Self {
            transfer_id: record.id(),
            expected: record.packet_count(),
            total_bytes: record.descriptor().size_bytes,
            chunk_size: record.chunk_size_bytes(),
            layout,
            next: 0,
            pending: BTreeMap::new(),
            duplicates: 0,
        }
    }

    /// Accept one packet and return every packet that is now in order
    pub fn accept(&mut self, packet: Packet) -> Result<Vec<Packet>> {
        let sequence = packet.sequence;

        if sequence >= self.expected {
            return Err(TransferError::IntegrityViolation {
                sequence,
                detail: format!("sequence outside 0..{}", self.expected),
            });
        }

        if sequence < self.next || self.pending.contains_key(&sequence) {
            self.duplicates += 1;
            tracing::debug!(
                transfer_id = %self.transfer_id,
                sequence = sequence,
                "Duplicate packet ignored"
            );
            return Ok(Vec::new());
        }

        if packet.total_bytes != self.total_bytes {
            return Err(TransferError::IntegrityViolation {
                sequence,
                detail: format!(
                    "declares {} total bytes, expected {}",
                    packet.total_bytes, self.total_bytes
                ),
            });
        }

        if packet.is_last != (sequence + 1 == self.expected) {
            return Err(TransferError::IntegrityViolation {
                sequence,
                detail: "last-packet flag does not match packet count".into(),
            });
        }

        let chunk_offset = sequence * self.chunk_size;
        if packet.offset != chunk_offset {
            return Err(TransferError::IntegrityViolation {
                sequence,
                detail: format!(
                    "offset {} does not match chunk position {}",
                    packet.offset, chunk_offset
                ),
            });
        }

        if self.layout == PayloadLayout::Exact {
            let chunk_len = self.chunk_size.min(self.total_bytes - chunk_offset);
            if packet.payload.len() as u64 != chunk_len {
                return Err(TransferError::IntegrityViolation {
                    sequence,
                    detail: format!(
                        "payload has {} bytes, chunk has {}",
                        packet.payload.len(),
                        chunk_len
                    ),
                });
            }
        }

        if !packet.verify() {
            return Err(TransferError::IntegrityViolation {
                sequence,
                detail: "digest mismatch".into(),
            });
        }

        self.pending.insert(sequence, packet);

        let mut ready = Vec::new();
        while let Some(packet) = self.pending.remove(&self.next) {
            ready.push(packet);
            self.next += 1;
        }
        Ok(ready)
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.expected
    }

    /// Distinct packets accepted so far
    pub fn received(&self) -> u64 {
        self.next + self.pending.len() as u64
    }

    /// Lowest sequence index not yet released
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Outcome of a successful download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub packets: u64,
    pub bytes_written: u64,
    pub duplicates: u64,
    /// Records in the range that belonged to another transfer
    pub skipped: u64,
}

/// Reads a transfer's offset range and writes its ciphertext to a sink
#[derive(Clone)]
pub struct Consumer {
    broker: Arc<dyn BrokerClient>,
    read_timeout: Duration,
}

impl Consumer {
    pub fn new(broker: Arc<dyn BrokerClient>, read_timeout: Duration) -> Self {
        Self {
            broker,
            read_timeout,
        }
    }

    /// Stream the transfer into `sink` in sequence order and flush it.
    ///
    /// Does not touch the record's state; the caller applies the outcome.
    pub async fn stream_to<W>(
        &self,
        record: &TransferRecord,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<DownloadStats>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.stream_with_layout(record, PayloadLayout::Exact, sink, cancel)
            .await
    }

    /// Like [`Consumer::stream_to`], choosing how payload lengths are checked
    pub async fn stream_with_layout<W>(
        &self,
        record: &TransferRecord,
        layout: PayloadLayout,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<DownloadStats>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let binding = record
            .state()
            .binding()
            .copied()
            .ok_or(TransferError::TransferNotAvailable(record.status()))?;

        let mut records = self
            .broker
            .read_range(
                record.topic(),
                binding.partition(),
                binding.start_offset(),
                binding.end_offset(),
            )
            .await?;

        let mut reassembler = Reassembler::with_layout(record, layout);
        let mut stats = DownloadStats::default();

        while !reassembler.is_complete() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, records.next()) => next,
            };

            let item = match next {
                Err(_) => {
                    tracing::warn!(
                        transfer_id = %record.id(),
                        received = reassembler.received(),
                        expected = record.packet_count(),
                        timeout_ms = self.read_timeout.as_millis() as u64,
                        "Read window elapsed"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(item)) => item?,
            };

            let packet = match Packet::from_message(&item.message, record.id()) {
                Ok(packet) => packet,
                Err(PacketDecodeError::Foreign) => {
                    stats.skipped += 1;
                    tracing::debug!(
                        transfer_id = %record.id(),
                        offset = item.offset,
                        key = %item.message.key,
                        "Skipping record from another transfer"
                    );
                    continue;
                }
                Err(PacketDecodeError::Malformed(detail)) => {
                    return Err(TransferError::IntegrityViolation {
                        sequence: reassembler.next_sequence(),
                        detail: format!("malformed packet at offset {}: {}", item.offset, detail),
                    });
                }
            };

            for ready in reassembler.accept(packet)? {
                sink.write_all(&ready.payload).await?;
                stats.packets += 1;
                stats.bytes_written += ready.payload.len() as u64;
            }
        }

        if !reassembler.is_complete() {
            return Err(TransferError::IncompleteTransfer {
                received: reassembler.received(),
                expected: record.packet_count(),
            });
        }

        if layout == PayloadLayout::Exact && stats.bytes_written != record.descriptor().size_bytes {
            return Err(TransferError::IntegrityViolation {
                sequence: record.packet_count() - 1,
                detail: format!(
                    "wrote {} bytes, transfer declares {}",
                    stats.bytes_written,
                    record.descriptor().size_bytes
                ),
            });
        }

        sink.flush().await?;
        stats.duplicates = reassembler.duplicates();
        Ok(stats)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::broker::{BrokerError, BrokerMessage, BrokerRecord, PublishAck};
    use crate::transfer::test_support::{pending_record, sample_bytes};
    use crate::transfer::types::{BrokerBinding, TransferState};
    use futures::stream::{self, BoxStream};

    /// Serves a fixed sequence of records for any range
    struct ScriptedBroker {
        records: Vec<BrokerRecord>,
        hang_after: bool,
    }

    #[async_trait::async_trait]
    impl BrokerClient for ScriptedBroker {
        async fn publish(
            &self,
            _topic: &str,
            _partition_key: &str,
            _message: BrokerMessage,
        ) -> std::result::Result<PublishAck, BrokerError> {
            Err(BrokerError::Fatal("read-only".into()))
        }

        async fn read_range(
            &self,
            _topic: &str,
            _partition: i32,
            _start_offset: i64,
            _end_offset: i64,
        ) -> std::result::Result<
            BoxStream<'static, std::result::Result<BrokerRecord, BrokerError>>,
            BrokerError,
        > {
            let items = stream::iter(self.records.clone().into_iter().map(Ok));
            if self.hang_after {
                Ok(items.chain(stream::pending()).boxed())
            } else {
                Ok(items.boxed())
            }
        }
    }

    fn available_record(size: i64, chunk: i64) -> TransferRecord {
        let mut record = pending_record(size, chunk);
        let count = record.packet_count();
        record.state = TransferState::Available {
            binding: BrokerBinding::new(0, 0, count as i64 - 1, count).unwrap(),
        };
        record
    }

    fn packets(record: &TransferRecord, data: &[u8]) -> Vec<Packet> {
        let chunk = record.chunk_size_bytes() as usize;
        data.chunks(chunk)
            .enumerate()
            .map(|(i, bytes)| {
                Packet::new(
                    record.id(),
                    i as u64,
                    (i * chunk) as u64,
                    data.len() as u64,
                    i + 1 == record.packet_count() as usize,
                    bytes.to_vec(),
                )
            })
            .collect()
    }

    fn script(packets: impl IntoIterator<Item = Packet>) -> Vec<BrokerRecord> {
        packets
            .into_iter()
            .enumerate()
            .map(|(offset, packet)| BrokerRecord {
                partition: 0,
                offset: offset as i64,
                message: packet.into_message(),
            })
            .collect()
    }

    fn consumer(records: Vec<BrokerRecord>) -> Consumer {
        Consumer::new(
            Arc::new(ScriptedBroker {
                records,
                hang_after: false,
            }),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_reassembler_orders_and_deduplicates() {
        let record = available_record(10, 3);
        let p = packets(&record, &sample_bytes(10));
        let mut reassembler = Reassembler::new(&record);

        assert!(reassembler.accept(p[1].clone()).unwrap().is_empty());
        assert!(reassembler.accept(p[1].clone()).unwrap().is_empty());
        let ready = reassembler.accept(p[0].clone()).unwrap();
        assert_eq!(ready.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![0, 1]);
        assert!(reassembler.accept(p[0].clone()).unwrap().is_empty());

        reassembler.accept(p[2].clone()).unwrap();
        reassembler.accept(p[3].clone()).unwrap();
        assert!(reassembler.is_complete());
        assert_eq!(reassembler.duplicates(), 2);
    }

    #[test]
    fn test_reassembler_rejects_out_of_range_sequence() {
        let record = available_record(10, 3);
        let mut reassembler = Reassembler::new(&record);
        let stray = Packet::new(record.id(), 4, 12, 10, true, vec![0]);

        assert!(matches!(
            reassembler.accept(stray),
            Err(TransferError::IntegrityViolation { sequence: 4, .. })
        ));
    }

    #[test]
    fn test_reassembler_checks_chunk_position_and_length() {
        let record = available_record(10, 3);
        let mut reassembler = Reassembler::new(&record);

        // digest is recomputed, so only the structural checks can catch these
        let shifted = Packet::new(record.id(), 1, 4, 10, false, vec![1, 2, 3]);
        assert!(matches!(
            reassembler.accept(shifted),
            Err(TransferError::IntegrityViolation { sequence: 1, .. })
        ));

        let truncated = Packet::new(record.id(), 2, 6, 10, false, vec![1, 2]);
        assert!(matches!(
            reassembler.accept(truncated),
            Err(TransferError::IntegrityViolation { sequence: 2, .. })
        ));

        let padded_last = Packet::new(record.id(), 3, 9, 10, true, vec![7, 7, 7]);
        assert!(matches!(
            reassembler.accept(padded_last),
            Err(TransferError::IntegrityViolation { sequence: 3, .. })
        ));
    }

    #[test]
    fn test_sealed_layout_allows_longer_payloads() {
        let record = available_record(10, 3);
        let mut reassembler = Reassembler::with_layout(&record, PayloadLayout::Sealed);

        for sequence in 0..4u64 {
            let sealed = Packet::new(
                record.id(),
                sequence,
                sequence * 3,
                10,
                sequence == 3,
                vec![sequence as u8; 19],
            );
            reassembler.accept(sealed).unwrap();
        }
        assert!(reassembler.is_complete());

        let mut strict = Reassembler::new(&record);
        let sealed = Packet::new(record.id(), 0, 0, 10, false, vec![0; 19]);
        assert!(strict.accept(sealed).is_err());
    }

    #[tokio::test]
    async fn test_rewritten_packet_with_matching_digest_is_rejected() {
        let record = available_record(10, 3);
        let data = sample_bytes(10);
        let mut forged = packets(&record, &data);
        forged[1] = Packet::new(record.id(), 1, 3, 10, false, vec![0xAA; 5]);

        let mut sink = Vec::new();
        let result = consumer(script(forged))
            .stream_to(&record, &mut sink, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IntegrityViolation { sequence: 1, .. })
        ));
        assert_eq!(sink, data[..3].to_vec());
    }

    #[tokio::test]
    async fn test_streams_in_order() {
        let record = available_record(10, 3);
        let data = sample_bytes(10);
        let mut sink = Vec::new();

        let stats = consumer(script(packets(&record, &data)))
            .stream_to(&record, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.bytes_written, 10);
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_order_packets() {
        let record = available_record(10, 3);
        let data = sample_bytes(10);
        let p = packets(&record, &data);
        let order = vec![
            p[0].clone(),
            p[2].clone(),
            p[1].clone(),
            p[1].clone(),
            p[3].clone(),
        ];
        let mut sink = Vec::new();

        let stats = consumer(script(order))
            .stream_to(&record, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_foreign_records_are_skipped() {
        let record = available_record(4, 2);
        let data = sample_bytes(4);
        let p = packets(&record, &data);
        let other = Packet::new(Uuid::new_v4(), 0, 0, 1, true, vec![7]);
        let mut sink = Vec::new();

        let stats = consumer(script(vec![p[0].clone(), other, p[1].clone()]))
            .stream_to(&record, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_tampered_payload_is_integrity_violation() {
        let record = available_record(10, 3);
        let mut records = script(packets(&record, &sample_bytes(10)));
        records[2].message.value = vec![0, 0, 0];

        let result = consumer(records)
            .stream_to(&record, &mut Vec::new(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IntegrityViolation { sequence: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_headers_are_integrity_violation() {
        let record = available_record(4, 2);
        let mut records = script(packets(&record, &sample_bytes(4)));
        records[1]
            .message
            .headers
            .retain(|(name, _)| name != crate::transfer::packet::HEADER_DIGEST);

        let result = consumer(records)
            .stream_to(&record, &mut Vec::new(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IntegrityViolation { sequence: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_packet_is_incomplete() {
        let record = available_record(10, 3);
        let mut p = packets(&record, &sample_bytes(10));
        p.remove(2);

        let result = consumer(script(p))
            .stream_to(&record, &mut Vec::new(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IncompleteTransfer {
                received: 3,
                expected: 4
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_window_elapses() {
        let record = available_record(10, 3);
        let mut p = packets(&record, &sample_bytes(10));
        p.truncate(2);
        let consumer = Consumer::new(
            Arc::new(ScriptedBroker {
                records: script(p),
                hang_after: true,
            }),
            Duration::from_secs(2),
        );

        let result = consumer
            .stream_to(&record, &mut Vec::new(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IncompleteTransfer {
                received: 2,
                expected: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_download() {
        let record = available_record(10, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = consumer(script(packets(&record, &sample_bytes(10))))
            .stream_to(&record, &mut Vec::new(), &cancel)
            .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pending_record_has_no_range() {
        let record = pending_record(10, 3);

        let result = consumer(Vec::new())
            .stream_to(&record, &mut Vec::new(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TransferError::TransferNotAvailable(_))));
    }
}
