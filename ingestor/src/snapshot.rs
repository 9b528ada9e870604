use crate::errors::Result;
use crate::model::{Category, DeviceId, TelemetryRecord};
use crate::store::TelemetryStore;

/// Latest persisted record per category for one device, derived from the store on every load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    records: Vec<TelemetryRecord>,
}

impl Snapshot {
    /// Queries each category in replay order (sensor, actuator, status), skipping empty ones.
    pub async fn load(store: &dyn TelemetryStore, device_id: &DeviceId) -> Result<Self> {
        let mut records = Vec::with_capacity(Category::REPLAY_ORDER.len());
        for category in Category::REPLAY_ORDER {
            if let Some(record) = store.latest(device_id, category).await? {
                records.push(record);
            }
        }
        Ok(Snapshot { records })
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TelemetryRecord> {
        self.records
    }
}
