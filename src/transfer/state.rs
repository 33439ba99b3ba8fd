//! Transfer state machine
//!
//! ```text
//! pending ──> available ──> downloading ──> downloaded
//!    │            │              │
//!    └────────────┴──────────────┴──> failed | expired
//! ```
//!
//! Transitions compute the next [`TransferState`] from a record and never
//! mutate it. Repositories apply the result with a compare-and-swap keyed on
//! the status the transition was computed from.

use chrono::{DateTime, Utc};

use super::types::{BrokerBinding, FailureReason, TransferRecord, TransferState, TransferStatus};
use crate::error::{Result, TransferError};

impl TransferRecord {
    /// Error a caller sees when acting on a record in a terminal state
    pub fn terminal_error(&self) -> Option<TransferError> {
        match &self.state {
            TransferState::Downloaded { .. } => Some(TransferError::TransferAlreadyCompleted),
            TransferState::Expired { .. } => Some(TransferError::TransferExpired),
            TransferState::Failed { reason, .. } => {
                Some(TransferError::TransferFailed(reason.clone()))
            }
            _ => None,
        }
    }

    /// Only pending transfers accept packets
    pub fn ensure_publishable(&self) -> Result<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        match self.status() {
            TransferStatus::Pending => Ok(()),
            from => Err(TransferError::InvalidTransition {
                from,
                to: TransferStatus::Available,
            }),
        }
    }

    /// `pending → available` once every packet is durable
    pub fn mark_available(&self, binding: BrokerBinding) -> Result<TransferState> {
        self.ensure_publishable()?;

        if binding.span() != self.packet_count {
            return Err(TransferError::OffsetDiscontinuity(format!(
                "binding spans {} offsets for {} packets",
                binding.span(),
                self.packet_count
            )));
        }

        Ok(TransferState::Available { binding })
    }

    /// `available → downloading`, re-entrant while already downloading
    pub fn begin_download(&self) -> Result<TransferState> {
        match &self.state {
            TransferState::Pending => Err(TransferError::TransferNotAvailable(
                TransferStatus::Pending,
            )),
            TransferState::Available { binding } | TransferState::Downloading { binding } => {
                Ok(TransferState::Downloading { binding: *binding })
            }
            TransferState::Downloaded { .. } => Err(TransferError::TransferAlreadyCompleted),
            TransferState::Failed { reason, .. } => {
                Err(TransferError::TransferFailed(reason.clone()))
            }
            TransferState::Expired { .. } => Err(TransferError::TransferExpired),
        }
    }

    /// `downloading → downloaded`, stamping the completion time
    pub fn complete_download(&self, now: DateTime<Utc>) -> Result<TransferState> {
        match &self.state {
            TransferState::Downloading { binding } => Ok(TransferState::Downloaded {
                binding: *binding,
                completed_at: now,
            }),
            TransferState::Pending | TransferState::Available { .. } => {
                Err(TransferError::TransferNotAvailable(self.status()))
            }
            TransferState::Downloaded { .. } => Err(TransferError::TransferAlreadyCompleted),
            TransferState::Failed { reason, .. } => {
                Err(TransferError::TransferFailed(reason.clone()))
            }
            TransferState::Expired { .. } => Err(TransferError::TransferExpired),
        }
    }

    /// Any non-terminal state `→ failed`
    pub fn fail(&self, reason: FailureReason) -> Result<TransferState> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        Ok(TransferState::Failed {
            reason,
            binding: self.state.binding().copied(),
        })
    }

    /// Any non-terminal state `→ expired`, only once `now > expires_at`
    pub fn expire(&self, now: DateTime<Utc>) -> Result<TransferState> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        if now <= self.expires_at {
            return Err(TransferError::InvalidTransition {
                from: self.status(),
                to: TransferStatus::Expired,
            });
        }

        Ok(TransferState::Expired {
            binding: self.state.binding().copied(),
        })
    }
}
