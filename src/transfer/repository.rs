//! Transfer repository
//!
//! Every state change is a compare-and-swap keyed on the status the caller
//! read. Of two racing updates from the same status, exactly one succeeds;
//! the other gets `StaleState`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{TransferRecord, TransferState, TransferStatus};
use crate::error::{Result, TransferError};

// ============================================================================
// Repository Trait
// ============================================================================

/// Trait for transfer record storage backends
#[async_trait::async_trait]
pub trait TransferRepository: Send + Sync {
    /// Store a new record
    async fn create(&self, record: &TransferRecord) -> Result<()>;

    /// Get a record by id
    async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>>;

    /// Replace the state if the stored status is still `expected`
    async fn update_state(
        &self,
        id: Uuid,
        expected: TransferStatus,
        state: TransferState,
    ) -> Result<TransferRecord>;

    /// Non-terminal records with `expires_at < now`
    async fn list_expirable(&self, now: DateTime<Utc>) -> Result<Vec<TransferRecord>>;

    /// Records where the user is sender or target, newest first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TransferRecord>>;

    /// Available records targeting a device, newest first
    async fn list_available_for_device(&self, device_id: &str) -> Result<Vec<TransferRecord>>;
}

// ============================================================================
// In-Memory Repository
// ============================================================================

/// In-memory repository (for tests and single-process deployments)
#[derive(Clone, Default)]
pub struct MemoryTransferRepository {
    records: Arc<RwLock<HashMap<Uuid, TransferRecord>>>,
}

impl MemoryTransferRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut records: Vec<TransferRecord>) -> Vec<TransferRecord> {
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}

#[async_trait::async_trait]
impl TransferRepository for MemoryTransferRepository {
    async fn create(&self, record: &TransferRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(TransferError::Storage(format!(
                "Transfer already exists: {}",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: Uuid,
        expected: TransferStatus,
        state: TransferState,
    ) -> Result<TransferRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or(TransferError::TransferNotFound(id))?;

        let actual = record.status();
        if actual != expected {
            return Err(TransferError::StaleState { expected, actual });
        }

        record.state = state;
        Ok(record.clone())
    }

    async fn list_expirable(&self, now: DateTime<Utc>) -> Result<Vec<TransferRecord>> {
        let records = self.records.read().await;
        let mut expirable: Vec<TransferRecord> = records
            .values()
            .filter(|r| r.is_expirable(now))
            .cloned()
            .collect();
        expirable.sort_by_key(|r| r.expires_at);
        Ok(expirable)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TransferRecord>> {
        let records = self.records.read().await;
        let matching = records
            .values()
            .filter(|r| r.parties.involves_user(user_id))
            .cloned()
            .collect();
        Ok(Self::newest_first(matching))
    }

    async fn list_available_for_device(&self, device_id: &str) -> Result<Vec<TransferRecord>> {
        let records = self.records.read().await;
        let matching = records
            .values()
            .filter(|r| {
                r.parties.target_device_id == device_id
                    && r.status() == TransferStatus::Available
            })
            .cloned()
            .collect();
        Ok(Self::newest_first(matching))
    }
}
