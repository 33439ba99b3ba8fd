//! Transfer Relay Library
//!
//! Brokered, chunked file transfers between a user's paired devices. The
//! relay sees only ciphertext: senders publish ordered, digest-checked
//! packets to a message broker and the target device reassembles them.
//!
//! # Modules
//!
//! - `transfer`: Records, packets, publish/download pipeline, reaper
//! - `db`: SQLite pool and schema for transfer records
//! - `config`: Environment-driven configuration
//! - `clock`: Injectable time source

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod transfer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Result, TransferError, ValidationError};
pub use transfer::{
    Caller, ExpiryReaper, RegisterTransfer, TransferRecord, TransferService, TransferStatus,
};
