//! Transfer module
//!
//! Brokered file transfers between paired devices. The sender registers a
//! transfer, streams its ciphertext through the broker as ordered packets,
//! and the target device reads them back once the whole range is durable.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──publish──▶ available ──download──▶ downloading ──▶ downloaded
//!    │                    │                        │
//!    └────────────────────┴──────▶ failed / expired ◀┘
//! ```
//!
//! - Packets of one transfer share a topic and partition key, so their
//!   offsets are contiguous and ordered
//! - Each packet carries a SHA-256 digest checked on the way out
//! - The relay never holds keys; the encryption envelope is opaque

mod broker;
mod consumer;
mod directory;
mod envelope;
mod packet;
mod packetizer;
mod publisher;
mod reaper;
mod repository;
mod service;
mod sqlite;
mod state;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use broker::{
    purge_packets, BrokerClient, BrokerError, BrokerMessage, BrokerRecord, MemoryBroker,
    PublishAck, DEFAULT_PARTITIONS,
};
pub use consumer::{Consumer, DownloadStats, PayloadLayout, Reassembler};
pub use directory::{DeviceDirectory, MemoryDeviceDirectory};
pub use envelope::EncryptionEnvelope;
pub use packet::{compute_digest, packet_key, Packet, PacketDecodeError};
pub use packetizer::{ChunkSealer, Packetizer, PassthroughSealer};
pub use publisher::{PublishError, Publisher, RetryPolicy};
pub use reaper::{ExpiryReaper, ReaperHandle, SweepReport};
pub use repository::{MemoryTransferRepository, TransferRepository};
pub use service::TransferService;
pub use sqlite::SqliteTransferRepository;
pub use types::{
    packet_count, BrokerBinding, Caller, FailureKind, FailureReason, NewTransfer, Parties,
    PayloadDescriptor, RegisterTransfer, TransferRecord, TransferState, TransferStatus,
    DEFAULT_CHUNK_SIZE, DEFAULT_EXPIRY_MINUTES, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_TOPIC_PREFIX,
};
