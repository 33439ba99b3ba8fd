//! Transfer types for the brokered relay

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::EncryptionEnvelope;
use crate::error::{Result, TransferError, ValidationError};

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 512KB
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// Default transfer expiry: 60 minutes
pub const DEFAULT_EXPIRY_MINUTES: i64 = 60;

/// Largest chunk a registration may ask for (16 MiB)
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default topic prefix; each transfer gets `{prefix}.{transfer_id}`
pub const DEFAULT_TOPIC_PREFIX: &str = "relay.transfers";

/// Number of packets needed to carry `size_bytes` in `chunk_size` slices.
///
/// Returns `None` when either argument is zero.
pub fn packet_count(size_bytes: u64, chunk_size: u64) -> Option<u64> {
    if size_bytes == 0 || chunk_size == 0 {
        return None;
    }
    Some(size_bytes.div_ceil(chunk_size))
}

// ============================================================================
// Status
// ============================================================================

/// Flat transfer status, used as the compare-and-swap key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Registered, nothing durable on the broker yet
    Pending,
    /// Every packet is durable and the offset range is recorded
    Available,
    /// The target device has started reading
    Downloading,
    /// Reassembled and verified by the target device
    Downloaded,
    /// Terminal failure with a recorded reason
    Failed,
    /// Expired by the reaper
    Expired,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed | Self::Expired)
    }

    /// Statuses the reaper may move to `Expired`
    pub const NON_TERMINAL: [TransferStatus; 3] =
        [Self::Pending, Self::Available, Self::Downloading];
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "available" => Ok(Self::Available),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(TransferError::Storage(format!(
                "Unknown transfer status: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Failure Reasons
// ============================================================================

/// Category of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SourceReadError,
    PublishExhausted,
    OffsetDiscontinuity,
    IntegrityViolation,
    IncompleteTransfer,
    ReadError,
    Cancelled,
    Rejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceReadError => "SourceReadError",
            Self::PublishExhausted => "PublishExhausted",
            Self::OffsetDiscontinuity => "OffsetDiscontinuity",
            Self::IntegrityViolation => "IntegrityViolation",
            Self::IncompleteTransfer => "IncompleteTransfer",
            Self::ReadError => "ReadError",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SourceReadError" => Self::SourceReadError,
            "PublishExhausted" => Self::PublishExhausted,
            "OffsetDiscontinuity" => Self::OffsetDiscontinuity,
            "IntegrityViolation" => Self::IntegrityViolation,
            "IncompleteTransfer" => Self::IncompleteTransfer,
            "ReadError" => Self::ReadError,
            "Cancelled" => Self::Cancelled,
            "Rejected" => Self::Rejected,
            _ => return None,
        })
    }
}

/// Human-readable reason stored with a failed transfer.
///
/// Rendered as `"{kind}: {detail}"`; the detail is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let detail = if detail.trim().is_empty() {
            kind.as_str().to_string()
        } else {
            detail
        };
        Self { kind, detail }
    }

    /// Classify an error that ended a publish attempt
    pub fn from_publish_error(error: &TransferError) -> Self {
        let kind = match error {
            TransferError::SourceRead(_) | TransferError::Io(_) => FailureKind::SourceReadError,
            TransferError::OffsetDiscontinuity(_) => FailureKind::OffsetDiscontinuity,
            TransferError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::PublishExhausted,
        };
        Self::new(kind, error.to_string())
    }

    /// Classify an error that ended a download attempt
    pub fn from_download_error(error: &TransferError) -> Self {
        let kind = match error {
            TransferError::IntegrityViolation { .. } => FailureKind::IntegrityViolation,
            TransferError::IncompleteTransfer { .. } => FailureKind::IncompleteTransfer,
            TransferError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::ReadError,
        };
        Self::new(kind, error.to_string())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl FromStr for FailureReason {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, detail) = s.split_once(": ").unwrap_or((s, ""));
        let kind = FailureKind::parse(kind).ok_or_else(|| {
            TransferError::Storage(format!("Unknown failure reason: {}", s))
        })?;
        Ok(Self::new(kind, detail))
    }
}

// ============================================================================
// Broker Binding
// ============================================================================

/// Partition and inclusive offset range holding one transfer's packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerBinding {
    partition: i32,
    start_offset: i64,
    end_offset: i64,
}

impl BrokerBinding {
    /// Build a binding, requiring `end - start + 1 == packet_count`
    pub fn new(partition: i32, start_offset: i64, end_offset: i64, packet_count: u64) -> Result<Self> {
        if start_offset < 0 || end_offset < start_offset {
            return Err(TransferError::OffsetDiscontinuity(format!(
                "invalid range {}..={}",
                start_offset, end_offset
            )));
        }

        let span = (end_offset - start_offset) as u64 + 1;
        if span != packet_count {
            return Err(TransferError::OffsetDiscontinuity(format!(
                "range {}..={} spans {} offsets for {} packets",
                start_offset, end_offset, span, packet_count
            )));
        }

        Ok(Self {
            partition,
            start_offset,
            end_offset,
        })
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    /// Number of offsets covered
    pub fn span(&self) -> u64 {
        (self.end_offset - self.start_offset) as u64 + 1
    }
}

// ============================================================================
// Transfer State
// ============================================================================

/// Status plus the fields that are only meaningful in that status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Available {
        binding: BrokerBinding,
    },
    Downloading {
        binding: BrokerBinding,
    },
    Downloaded {
        binding: BrokerBinding,
        completed_at: DateTime<Utc>,
    },
    Failed {
        reason: FailureReason,
        binding: Option<BrokerBinding>,
    },
    Expired {
        binding: Option<BrokerBinding>,
    },
}

impl TransferState {
    pub fn status(&self) -> TransferStatus {
        match self {
            Self::Pending => TransferStatus::Pending,
            Self::Available { .. } => TransferStatus::Available,
            Self::Downloading { .. } => TransferStatus::Downloading,
            Self::Downloaded { .. } => TransferStatus::Downloaded,
            Self::Failed { .. } => TransferStatus::Failed,
            Self::Expired { .. } => TransferStatus::Expired,
        }
    }

    pub fn binding(&self) -> Option<&BrokerBinding> {
        match self {
            Self::Pending => None,
            Self::Available { binding }
            | Self::Downloading { binding }
            | Self::Downloaded { binding, .. } => Some(binding),
            Self::Failed { binding, .. } | Self::Expired { binding } => binding.as_ref(),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Downloaded { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

// ============================================================================
// Parties
// ============================================================================

/// Authenticated user and device issuing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub device_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Sender and target of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Parties {
    pub sender_user_id: String,
    pub target_user_id: String,
    pub sender_device_id: String,
    pub target_device_id: String,
}

impl Parties {
    pub fn is_sender(&self, caller: &Caller) -> bool {
        self.sender_user_id == caller.user_id && self.sender_device_id == caller.device_id
    }

    pub fn is_target(&self, caller: &Caller) -> bool {
        self.target_user_id == caller.user_id && self.target_device_id == caller.device_id
    }

    /// Whether the caller's user is on either side of the transfer
    pub fn involves_user(&self, user_id: &str) -> bool {
        self.sender_user_id == user_id || self.target_user_id == user_id
    }
}

/// What is being transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDescriptor {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

// ============================================================================
// Registration
// ============================================================================

/// Request to register a new transfer, issued by the sender device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTransfer {
    pub target_user_id: String,
    pub target_device_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,

    /// Optional: chunk size (defaults to the configured chunk size)
    #[serde(default)]
    pub chunk_size_bytes: Option<i64>,

    pub encryption_envelope: Option<String>,

    /// Optional: time-to-live in seconds (defaults to the configured expiry)
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// Fully resolved registration input, validated by [`TransferRecord::create`]
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sender_user_id: String,
    pub target_user_id: String,
    pub sender_device_id: String,
    pub target_device_id: String,
    pub chunk_size_bytes: i64,
    pub encryption_envelope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Transfer Record
// ============================================================================

/// One file transfer attempt.
///
/// Everything but `state` is fixed at creation; the state only changes
/// through a repository compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub(crate) id: Uuid,
    pub(crate) descriptor: PayloadDescriptor,
    pub(crate) parties: Parties,
    pub(crate) chunk_size_bytes: u64,
    pub(crate) packet_count: u64,
    pub(crate) topic: String,
    #[serde(skip)]
    pub(crate) envelope: EncryptionEnvelope,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) state: TransferState,
}

impl TransferRecord {
    /// Validate a registration and build a pending record with a fresh id
    pub fn create(new: NewTransfer, topic_prefix: &str) -> std::result::Result<Self, ValidationError> {
        if new.file_name.trim().is_empty() {
            return Err(ValidationError::FileNameMissing);
        }
        if new.content_type.trim().is_empty() {
            return Err(ValidationError::ContentTypeMissing);
        }
        if new.size_bytes <= 0 {
            return Err(ValidationError::FileSizeMustBePositive);
        }
        if new.chunk_size_bytes <= 0 {
            return Err(ValidationError::ChunkSizeMustBePositive);
        }
        if new.sender_user_id.trim().is_empty() {
            return Err(ValidationError::SenderUserIdMissing);
        }
        if new.target_user_id.trim().is_empty() {
            return Err(ValidationError::TargetUserIdMissing);
        }
        if new.sender_device_id.trim().is_empty() {
            return Err(ValidationError::SenderDeviceIdMissing);
        }
        if new.target_device_id.trim().is_empty() {
            return Err(ValidationError::TargetDeviceIdMissing);
        }
        let envelope = EncryptionEnvelope::bind(new.encryption_envelope)?;
        if new.expires_at <= new.created_at {
            return Err(ValidationError::ExpiryNotAfterCreation);
        }

        let size_bytes = new.size_bytes as u64;
        let chunk_size_bytes = new.chunk_size_bytes as u64;
        let packet_count = packet_count(size_bytes, chunk_size_bytes)
            .ok_or(ValidationError::ChunkSizeMustBePositive)?;
        let id = Uuid::new_v4();

        Ok(Self {
            id,
            descriptor: PayloadDescriptor {
                file_name: new.file_name,
                content_type: new.content_type,
                size_bytes,
            },
            parties: Parties {
                sender_user_id: new.sender_user_id,
                target_user_id: new.target_user_id,
                sender_device_id: new.sender_device_id,
                target_device_id: new.target_device_id,
            },
            chunk_size_bytes,
            packet_count,
            topic: format!("{}.{}", topic_prefix, id),
            envelope,
            created_at: new.created_at,
            expires_at: new.expires_at,
            state: TransferState::Pending,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &PayloadDescriptor {
        &self.descriptor
    }

    pub fn parties(&self) -> &Parties {
        &self.parties
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_bytes
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition key used for every packet of this transfer
    pub fn partition_key(&self) -> String {
        self.id.to_string()
    }

    pub fn envelope(&self) -> &EncryptionEnvelope {
        &self.envelope
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn status(&self) -> TransferStatus {
        self.state.status()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.completed_at()
    }

    /// Past expiry and not yet terminal
    pub fn is_expirable(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at && !self.status().is_terminal()
    }

    /// Length of the chunk at `sequence`; only the last one may be short
    pub fn chunk_len(&self, sequence: u64) -> u64 {
        let start = sequence * self.chunk_size_bytes;
        self.chunk_size_bytes
            .min(self.descriptor.size_bytes.saturating_sub(start))
    }
}

// ============================================================================
// Tests
// ============================================================================
