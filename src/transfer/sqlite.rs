//! SQLite transfer repository
//!
//! The compare-and-swap is a single `UPDATE ... WHERE id = ? AND status = ?`;
//! zero affected rows means the record is missing or its status moved on.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::envelope::EncryptionEnvelope;
use super::repository::TransferRepository;
use super::types::{
    BrokerBinding, Parties, PayloadDescriptor, TransferRecord, TransferState, TransferStatus,
};
use crate::error::{Result, TransferError};

const SELECT_COLUMNS: &str = r#"
    SELECT id, file_name, content_type, size_bytes,
           sender_user_id, target_user_id, sender_device_id, target_device_id,
           chunk_size_bytes, packet_count, topic,
           broker_partition, start_offset, end_offset,
           encryption_envelope, status, failure_reason,
           created_at, expires_at, completed_at
    FROM file_transfers
"#;

/// Transfer row as stored
#[derive(Debug, Clone, sqlx::FromRow)]
struct TransferRow {
    id: String,
    file_name: String,
    content_type: String,
    size_bytes: i64,
    sender_user_id: String,
    target_user_id: String,
    sender_device_id: String,
    target_device_id: String,
    chunk_size_bytes: i64,
    packet_count: i64,
    topic: String,
    broker_partition: Option<i32>,
    start_offset: Option<i64>,
    end_offset: Option<i64>,
    encryption_envelope: String,
    status: String,
    failure_reason: Option<String>,
    created_at: String,
    expires_at: String,
    completed_at: Option<String>,
}

impl TransferRow {
    fn into_record(self) -> Result<TransferRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| TransferError::Storage(format!("Invalid transfer id {}: {}", self.id, e)))?;
        let packet_count = self.packet_count as u64;

        let binding = match (self.broker_partition, self.start_offset, self.end_offset) {
            (Some(partition), Some(start), Some(end)) => Some(
                BrokerBinding::new(partition, start, end, packet_count)
                    .map_err(|e| TransferError::Storage(e.to_string()))?,
            ),
            (None, None, None) => None,
            _ => {
                return Err(TransferError::Storage(format!(
                    "Transfer {} has a partial offset range",
                    id
                )))
            }
        };

        let status: TransferStatus = self.status.parse()?;
        let require_binding = || {
            binding.ok_or_else(|| {
                TransferError::Storage(format!("Transfer {} is {} without offsets", id, status))
            })
        };

        let state = match status {
            TransferStatus::Pending => TransferState::Pending,
            TransferStatus::Available => TransferState::Available {
                binding: require_binding()?,
            },
            TransferStatus::Downloading => TransferState::Downloading {
                binding: require_binding()?,
            },
            TransferStatus::Downloaded => {
                let completed_at = self.completed_at.as_deref().ok_or_else(|| {
                    TransferError::Storage(format!("Transfer {} is downloaded without completed_at", id))
                })?;
                TransferState::Downloaded {
                    binding: require_binding()?,
                    completed_at: parse_timestamp(completed_at)?,
                }
            }
            TransferStatus::Failed => {
                let reason = self.failure_reason.as_deref().ok_or_else(|| {
                    TransferError::Storage(format!("Transfer {} failed without a reason", id))
                })?;
                TransferState::Failed {
                    reason: reason.parse()?,
                    binding,
                }
            }
            TransferStatus::Expired => TransferState::Expired { binding },
        };

        let envelope = EncryptionEnvelope::bind(Some(self.encryption_envelope))
            .map_err(|e| TransferError::Storage(format!("Transfer {}: {}", id, e)))?;

        Ok(TransferRecord {
            id,
            descriptor: PayloadDescriptor {
                file_name: self.file_name,
                content_type: self.content_type,
                size_bytes: self.size_bytes as u64,
            },
            parties: Parties {
                sender_user_id: self.sender_user_id,
                target_user_id: self.target_user_id,
                sender_device_id: self.sender_device_id,
                target_device_id: self.target_device_id,
            },
            chunk_size_bytes: self.chunk_size_bytes as u64,
            packet_count,
            topic: self.topic,
            envelope,
            created_at: parse_timestamp(&self.created_at)?,
            expires_at: parse_timestamp(&self.expires_at)?,
            state,
        })
    }
}

/// Columns that change with the state
struct StateColumns {
    status: &'static str,
    partition: Option<i32>,
    start_offset: Option<i64>,
    end_offset: Option<i64>,
    failure_reason: Option<String>,
    completed_at: Option<String>,
}

impl From<&TransferState> for StateColumns {
    fn from(state: &TransferState) -> Self {
        let binding = state.binding();
        Self {
            status: state.status().as_str(),
            partition: binding.map(|b| b.partition()),
            start_offset: binding.map(|b| b.start_offset()),
            end_offset: binding.map(|b| b.end_offset()),
            failure_reason: state.failure_reason().map(|r| r.to_string()),
            completed_at: state.completed_at().map(format_timestamp),
        }
    }
}

/// Fixed-width so text comparison orders like time
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| TransferError::Storage(format!("Invalid timestamp {:?}: {}", raw, e)))
}

/// Transfer repository over a SQLite pool
#[derive(Clone)]
pub struct SqliteTransferRepository {
    pool: SqlitePool,
}

impl SqliteTransferRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_all(&self, sql: &str, bind: &str) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRow>(sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferRow::into_record).collect()
    }
}

#[async_trait::async_trait]
impl TransferRepository for SqliteTransferRepository {
    async fn create(&self, record: &TransferRecord) -> Result<()> {
        let columns = StateColumns::from(&record.state);

        sqlx::query(
            r#"
            INSERT INTO file_transfers (
                id, file_name, content_type, size_bytes,
                sender_user_id, target_user_id, sender_device_id, target_device_id,
                chunk_size_bytes, packet_count, topic,
                broker_partition, start_offset, end_offset,
                encryption_envelope, status, failure_reason,
                created_at, expires_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.descriptor.file_name)
        .bind(&record.descriptor.content_type)
        .bind(record.descriptor.size_bytes as i64)
        .bind(&record.parties.sender_user_id)
        .bind(&record.parties.target_user_id)
        .bind(&record.parties.sender_device_id)
        .bind(&record.parties.target_device_id)
        .bind(record.chunk_size_bytes as i64)
        .bind(record.packet_count as i64)
        .bind(&record.topic)
        .bind(columns.partition)
        .bind(columns.start_offset)
        .bind(columns.end_offset)
        .bind(record.envelope.as_str())
        .bind(columns.status)
        .bind(&columns.failure_reason)
        .bind(format_timestamp(record.created_at))
        .bind(format_timestamp(record.expires_at))
        .bind(&columns.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransferRow::into_record).transpose()
    }

    async fn update_state(
        &self,
        id: Uuid,
        expected: TransferStatus,
        state: TransferState,
    ) -> Result<TransferRecord> {
        let columns = StateColumns::from(&state);

        let result = sqlx::query(
            r#"
            UPDATE file_transfers
            SET status = ?, broker_partition = ?, start_offset = ?, end_offset = ?,
                failure_reason = ?, completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(columns.status)
        .bind(columns.partition)
        .bind(columns.start_offset)
        .bind(columns.end_offset)
        .bind(&columns.failure_reason)
        .bind(&columns.completed_at)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let current = self
            .get(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))?;

        if result.rows_affected() == 0 {
            return Err(TransferError::StaleState {
                expected,
                actual: current.status(),
            });
        }

        Ok(current)
    }

    async fn list_expirable(&self, now: DateTime<Utc>) -> Result<Vec<TransferRecord>> {
        let sql = format!(
            "{} WHERE expires_at < ? AND status IN ('pending', 'available', 'downloading') ORDER BY expires_at ASC",
            SELECT_COLUMNS
        );
        self.fetch_all(&sql, &format_timestamp(now)).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TransferRecord>> {
        let sql = format!(
            "{} WHERE sender_user_id = ?1 OR target_user_id = ?1 ORDER BY created_at DESC",
            SELECT_COLUMNS
        );
        self.fetch_all(&sql, user_id).await
    }

    async fn list_available_for_device(&self, device_id: &str) -> Result<Vec<TransferRecord>> {
        let sql = format!(
            "{} WHERE target_device_id = ? AND status = 'available' ORDER BY created_at DESC",
            SELECT_COLUMNS
        );
        self.fetch_all(&sql, device_id).await
    }
}
