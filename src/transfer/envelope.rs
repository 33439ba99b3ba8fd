//! Encryption envelope
//!
//! The envelope is produced and consumed by the devices; the relay only
//! checks that one is bound before any packet is published. Its content is
//! never parsed, and `Debug` output does not include it.

use std::fmt;

use crate::error::ValidationError;

/// Opaque, non-blank envelope bound to a transfer at registration
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope(String);

impl EncryptionEnvelope {
    /// Bind an envelope, rejecting a missing or blank value
    pub fn bind(value: Option<String>) -> Result<Self, ValidationError> {
        match value {
            Some(value) if !value.trim().is_empty() => Ok(Self(value)),
            _ => Err(ValidationError::EncryptionEnvelopeMissing),
        }
    }

    /// Precondition checked before packetization starts
    pub fn ensure_bound(&self) -> Result<(), ValidationError> {
        if self.0.trim().is_empty() {
            return Err(ValidationError::EncryptionEnvelopeMissing);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for EncryptionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionEnvelope({} bytes)", self.0.len())
    }
}
