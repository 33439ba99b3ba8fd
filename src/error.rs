//! Error types for the transfer relay

use thiserror::Error;
use uuid::Uuid;

use crate::transfer::BrokerError;
use crate::transfer::{FailureReason, TransferStatus};

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, TransferError>;

/// Registration input that was rejected before anything was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("File name cannot be empty")]
    FileNameMissing,

    #[error("Content type cannot be empty")]
    ContentTypeMissing,

    #[error("File size must be greater than zero")]
    FileSizeMustBePositive,

    #[error("Chunk size must be greater than zero")]
    ChunkSizeMustBePositive,

    #[error("Chunk size exceeds the configured maximum")]
    ChunkSizeTooLarge,

    #[error("Sender user ID cannot be empty")]
    SenderUserIdMissing,

    #[error("Target user ID cannot be empty")]
    TargetUserIdMissing,

    #[error("Sender device ID cannot be empty")]
    SenderDeviceIdMissing,

    #[error("Target device ID cannot be empty")]
    TargetDeviceIdMissing,

    #[error("Encryption envelope missing")]
    EncryptionEnvelopeMissing,

    #[error("Transfer must expire after it is created")]
    ExpiryNotAfterCreation,
}

impl ValidationError {
    /// Stable identifier, matching the variant name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNameMissing => "FileNameMissing",
            Self::ContentTypeMissing => "ContentTypeMissing",
            Self::FileSizeMustBePositive => "FileSizeMustBePositive",
            Self::ChunkSizeMustBePositive => "ChunkSizeMustBePositive",
            Self::ChunkSizeTooLarge => "ChunkSizeTooLarge",
            Self::SenderUserIdMissing => "SenderUserIdMissing",
            Self::TargetUserIdMissing => "TargetUserIdMissing",
            Self::SenderDeviceIdMissing => "SenderDeviceIdMissing",
            Self::TargetDeviceIdMissing => "TargetDeviceIdMissing",
            Self::EncryptionEnvelopeMissing => "EncryptionEnvelopeMissing",
            Self::ExpiryNotAfterCreation => "ExpiryNotAfterCreation",
        }
    }
}

/// Transfer error types
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ValidationError),

    #[error("Source read failed: {0}")]
    SourceRead(String),

    #[error("Publish failed for packet {sequence} after {attempts} attempt(s): {last_error}")]
    PublishExhausted {
        sequence: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Integrity violation at packet {sequence}: {detail}")]
    IntegrityViolation { sequence: u64, detail: String },

    #[error("Incomplete transfer: received {received} of {expected} packets")]
    IncompleteTransfer { received: u64, expected: u64 },

    #[error("Offset range is not contiguous: {0}")]
    OffsetDiscontinuity(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(Uuid),

    #[error("Transfer is not owned by the requesting user")]
    TransferNotOwnedByUser,

    #[error("Transfer does not target this device")]
    TransferNotForDevice,

    #[error("Transfer already completed")]
    TransferAlreadyCompleted,

    #[error("Transfer expired")]
    TransferExpired,

    #[error("Transfer not available for download (status: {0})")]
    TransferNotAvailable(TransferStatus),

    #[error("Transfer failed: {0}")]
    TransferFailed(FailureReason),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Stale state: expected {expected}, found {actual}")]
    StaleState {
        expected: TransferStatus,
        actual: TransferStatus,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Machine-readable code for callers deciding whether to re-initiate
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::SourceRead(_) => "SOURCE_READ_ERROR",
            Self::PublishExhausted { .. } => "PUBLISH_EXHAUSTED",
            Self::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            Self::IncompleteTransfer { .. } => "INCOMPLETE_TRANSFER",
            Self::OffsetDiscontinuity(_) => "OFFSET_DISCONTINUITY",
            Self::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            Self::TransferNotOwnedByUser => "TRANSFER_NOT_OWNED_BY_USER",
            Self::TransferNotForDevice => "TRANSFER_NOT_FOR_DEVICE",
            Self::TransferAlreadyCompleted => "TRANSFER_ALREADY_COMPLETED",
            Self::TransferExpired => "TRANSFER_EXPIRED",
            Self::TransferNotAvailable(_) => "TRANSFER_NOT_AVAILABLE",
            Self::TransferFailed(_) => "TRANSFER_FAILED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::StaleState { .. } => "STALE_STATE",
            Self::Cancelled => "CANCELLED",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
