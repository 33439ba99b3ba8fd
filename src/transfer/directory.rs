//! Device directory
//!
//! Answers whether a device is registered to a user. Pairing and device
//! management live elsewhere; the relay only asks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;

/// Trait for device ownership lookups
#[async_trait::async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn device_belongs_to(&self, user_id: &str, device_id: &str) -> Result<bool>;
}

/// In-memory device directory
#[derive(Clone, Default)]
pub struct MemoryDeviceDirectory {
    devices: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl MemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: impl Into<String>, device_id: impl Into<String>) {
        self.devices
            .write()
            .await
            .entry(user_id.into())
            .or_default()
            .insert(device_id.into());
    }

    pub async fn remove(&self, user_id: &str, device_id: &str) -> bool {
        match self.devices.write().await.get_mut(user_id) {
            Some(devices) => devices.remove(device_id),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for MemoryDeviceDirectory {
    async fn device_belongs_to(&self, user_id: &str, device_id: &str) -> Result<bool> {
        Ok(self
            .devices
            .read()
            .await
            .get(user_id)
            .is_some_and(|devices| devices.contains(device_id)))
    }
}
