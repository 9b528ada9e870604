use crate::errors::Result;
use crate::model::{Category, DeviceId, TelemetryRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable, append-only telemetry persistence, one table per category.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Appends one record to its category's table.
    async fn insert(&self, record: &TelemetryRecord) -> Result<()>;

    /// The record with the greatest timestamp in `category` for `device_id`.
    async fn latest(&self, device_id: &DeviceId, category: Category)
        -> Result<Option<TelemetryRecord>>;
}

/// Keeps every record in memory. Used for tests and `--store memory`.
#[derive(Default)]
pub struct InMemoryTelemetryStore {
    tables: RwLock<HashMap<(DeviceId, Category), Vec<TelemetryRecord>>>,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn count(&self, device_id: &DeviceId, category: Category) -> usize {
        self.tables
            .read()
            .await
            .get(&(device_id.clone(), category))
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub async fn records(&self, device_id: &DeviceId, category: Category) -> Vec<TelemetryRecord> {
        self.tables
            .read()
            .await
            .get(&(device_id.clone(), category))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn insert(&self, record: &TelemetryRecord) -> Result<()> {
        let key = (record.device_id().clone(), record.category());
        self.tables
            .write()
            .await
            .entry(key)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn latest(
        &self,
        device_id: &DeviceId,
        category: Category,
    ) -> Result<Option<TelemetryRecord>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(&(device_id.clone(), category)) else {
            return Ok(None);
        };

        // Ties go to the row inserted last
        let latest = rows
            .iter()
            .enumerate()
            .max_by_key(|(seq, record)| (record.timestamp(), *seq))
            .map(|(_, record)| record.clone());

        Ok(latest)
    }
}
