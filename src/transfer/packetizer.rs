//! Splits a byte source into sequenced packets
//!
//! The stream is lazy and deterministic per sequence index: re-reading the
//! same source from byte 0 yields identical packets, which keeps
//! de-duplication on the receiving side safe.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::packet::Packet;
use super::types::TransferRecord;
use crate::error::{Result, TransferError};

/// Encrypts one chunk at a time on behalf of the sender device
pub trait ChunkSealer: Send + Sync {
    fn seal(&self, sequence: u64, chunk: Vec<u8>) -> Result<Vec<u8>>;
}

/// Source bytes are already ciphertext
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSealer;

impl ChunkSealer for PassthroughSealer {
    fn seal(&self, _sequence: u64, chunk: Vec<u8>) -> Result<Vec<u8>> {
        Ok(chunk)
    }
}

/// Packetizer for one pending transfer
pub struct Packetizer<R> {
    transfer_id: Uuid,
    total_bytes: u64,
    chunk_size: u64,
    packet_count: u64,
    source: R,
    sealer: Arc<dyn ChunkSealer>,
    next_sequence: u64,
}

impl<R> Packetizer<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// The record must be pending with an envelope bound
    pub fn new(record: &TransferRecord, source: R) -> Result<Self> {
        record.ensure_publishable()?;
        record.envelope().ensure_bound()?;

        Ok(Self {
            transfer_id: record.id(),
            total_bytes: record.descriptor().size_bytes,
            chunk_size: record.chunk_size_bytes(),
            packet_count: record.packet_count(),
            source,
            sealer: Arc::new(PassthroughSealer),
            next_sequence: 0,
        })
    }

    pub fn with_sealer(mut self, sealer: Arc<dyn ChunkSealer>) -> Self {
        self.sealer = sealer;
        self
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Consume the packetizer as an ordered stream of packets.
    ///
    /// Ends with `SourceRead` if the source is shorter or longer than the
    /// declared size.
    pub fn into_stream(self) -> BoxStream<'static, Result<Packet>> {
        stream::try_unfold(self, |mut this| async move {
            if this.next_sequence >= this.packet_count {
                return Ok(None);
            }

            let packet = this.read_packet().await?;
            this.next_sequence += 1;
            Ok(Some((packet, this)))
        })
        .boxed()
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        let sequence = self.next_sequence;
        let offset = sequence * self.chunk_size;
        let len = self.chunk_size.min(self.total_bytes - offset) as usize;

        let mut chunk = vec![0u8; len];
        self.source.read_exact(&mut chunk).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransferError::SourceRead(format!(
                    "source ended inside packet {} ({} bytes declared)",
                    sequence, self.total_bytes
                ))
            } else {
                TransferError::SourceRead(e.to_string())
            }
        })?;

        let is_last = sequence + 1 == self.packet_count;
        if is_last {
            let mut tail = [0u8; 1];
            let extra = self
                .source
                .read(&mut tail)
                .await
                .map_err(|e| TransferError::SourceRead(e.to_string()))?;
            if extra > 0 {
                return Err(TransferError::SourceRead(format!(
                    "source is longer than the declared {} bytes",
                    self.total_bytes
                )));
            }
        }

        let payload = self.sealer.seal(sequence, chunk)?;

        Ok(Packet::new(
            self.transfer_id,
            sequence,
            offset,
            self.total_bytes,
            is_last,
            payload,
        ))
    }
}
