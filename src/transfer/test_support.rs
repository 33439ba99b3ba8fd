//! Fixtures shared by unit tests

use chrono::{Duration, Utc};

use super::types::{NewTransfer, TransferRecord};

pub fn new_transfer(size_bytes: i64, chunk_size_bytes: i64) -> NewTransfer {
    let now = Utc::now();
    NewTransfer {
        file_name: "holiday.mp4".to_string(),
        content_type: "video/mp4".to_string(),
        size_bytes,
        sender_user_id: "alice".to_string(),
        target_user_id: "bob".to_string(),
        sender_device_id: "alice-phone".to_string(),
        target_device_id: "bob-laptop".to_string(),
        chunk_size_bytes,
        encryption_envelope: Some("sealed-key-material".to_string()),
        created_at: now,
        expires_at: now + Duration::minutes(60),
    }
}

pub fn pending_record(size_bytes: i64, chunk_size_bytes: i64) -> TransferRecord {
    TransferRecord::create(new_transfer(size_bytes, chunk_size_bytes), "test.transfers")
        .expect("valid fixture")
}

/// Deterministic, non-repeating test content
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
