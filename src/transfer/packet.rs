//! Packet wire format
//!
//! One packet per chunk. The message key is `"{transfer_id}:{sequence:08}"`
//! and the value is the ciphertext chunk; everything the receiver needs to
//! reassemble and verify travels in headers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::broker::BrokerMessage;

pub const HEADER_TRANSFER_ID: &str = "transferId";
pub const HEADER_PACKET_INDEX: &str = "packetIndex";
pub const HEADER_OFFSET: &str = "offset";
pub const HEADER_LENGTH: &str = "length";
pub const HEADER_TOTAL_BYTES: &str = "totalBytes";
pub const HEADER_IS_LAST: &str = "isLast";
pub const HEADER_DIGEST: &str = "digest";

/// One sequenced chunk of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub transfer_id: Uuid,
    pub sequence: u64,
    /// Byte offset of the chunk within the source
    pub offset: u64,
    pub total_bytes: u64,
    pub is_last: bool,
    /// SHA-256 hex of `payload`
    pub digest: String,
    pub payload: Vec<u8>,
}

/// Why a broker message could not be read as a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// Belongs to another transfer, or carries no packet headers at all
    Foreign,
    /// Claims this transfer but its headers are unusable
    Malformed(String),
}

impl Packet {
    pub fn new(
        transfer_id: Uuid,
        sequence: u64,
        offset: u64,
        total_bytes: u64,
        is_last: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            transfer_id,
            sequence,
            offset,
            total_bytes,
            is_last,
            digest: compute_digest(&payload),
            payload,
        }
    }

    pub fn key(&self) -> String {
        packet_key(self.transfer_id, self.sequence)
    }

    /// Whether the payload still matches the digest it was sent with
    pub fn verify(&self) -> bool {
        compute_digest(&self.payload) == self.digest
    }

    pub fn into_message(self) -> BrokerMessage {
        let headers = vec![
            header(HEADER_TRANSFER_ID, self.transfer_id.to_string()),
            header(HEADER_PACKET_INDEX, self.sequence.to_string()),
            header(HEADER_OFFSET, self.offset.to_string()),
            header(HEADER_LENGTH, self.payload.len().to_string()),
            header(HEADER_TOTAL_BYTES, self.total_bytes.to_string()),
            header(HEADER_IS_LAST, if self.is_last { "1" } else { "0" }.to_string()),
            header(HEADER_DIGEST, self.digest.clone()),
        ];

        BrokerMessage {
            key: self.key(),
            headers,
            value: self.payload,
        }
    }

    /// Decode a message published for `transfer_id`.
    ///
    /// Messages for other transfers (and tombstones) are `Foreign`. The
    /// digest is carried over as sent; call [`Packet::verify`] to check it.
    pub fn from_message(
        message: &BrokerMessage,
        transfer_id: Uuid,
    ) -> Result<Self, PacketDecodeError> {
        let owner = match message.header(HEADER_TRANSFER_ID) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok()),
            None => None,
        };
        if owner != Some(transfer_id) {
            return Err(PacketDecodeError::Foreign);
        }

        let sequence: u64 = parse_header(message, HEADER_PACKET_INDEX)?;
        let offset: u64 = parse_header(message, HEADER_OFFSET)?;
        let length: usize = parse_header(message, HEADER_LENGTH)?;
        let total_bytes: u64 = parse_header(message, HEADER_TOTAL_BYTES)?;
        let is_last = match text_header(message, HEADER_IS_LAST)? {
            "1" => true,
            "0" => false,
            other => {
                return Err(PacketDecodeError::Malformed(format!(
                    "{} is {:?}",
                    HEADER_IS_LAST, other
                )))
            }
        };
        let digest = text_header(message, HEADER_DIGEST)?.to_string();

        if length != message.value.len() {
            return Err(PacketDecodeError::Malformed(format!(
                "{} is {} but value has {} bytes",
                HEADER_LENGTH,
                length,
                message.value.len()
            )));
        }

        Ok(Self {
            transfer_id,
            sequence,
            offset,
            total_bytes,
            is_last,
            digest,
            payload: message.value.clone(),
        })
    }
}

/// Message key for one packet of a transfer
pub fn packet_key(transfer_id: Uuid, sequence: u64) -> String {
    format!("{}:{:08}", transfer_id, sequence)
}

/// Compute SHA-256 hash of data
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn header(name: &str, value: String) -> (String, Vec<u8>) {
    (name.to_string(), value.into_bytes())
}

fn text_header<'a>(message: &'a BrokerMessage, name: &str) -> Result<&'a str, PacketDecodeError> {
    let raw = message
        .header(name)
        .ok_or_else(|| PacketDecodeError::Malformed(format!("missing {}", name)))?;
    std::str::from_utf8(raw)
        .map_err(|_| PacketDecodeError::Malformed(format!("{} is not UTF-8", name)))
}

fn parse_header<T: std::str::FromStr>(
    message: &BrokerMessage,
    name: &str,
) -> Result<T, PacketDecodeError> {
    let text = text_header(message, name)?;
    text.parse()
        .map_err(|_| PacketDecodeError::Malformed(format!("{} is {:?}", name, text)))
}
