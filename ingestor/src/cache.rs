use crate::model::{DeviceChange, DeviceState, TelemetryRecord};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Latest known state per device.
///
/// Updates are last-writer-wins by source timestamp: a record that is not
/// newer than what the cache already reflects leaves it untouched. Entries are
/// never removed.
#[derive(Debug, Default)]
pub struct DeviceStateCache {
    devices: RwLock<HashMap<String, DeviceState>>,
}

impl DeviceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a record. Returns the change to broadcast, or `None` when the
    /// record is stale for its device.
    pub fn apply(&self, record: &TelemetryRecord) -> Option<DeviceChange> {
        let mut devices = self.devices.write();

        match devices.get_mut(record.device_id()) {
            Some(state) => {
                if record.timestamp() <= state.timestamp {
                    return None;
                }
                state.timestamp = record.timestamp();
                state.updated_at = Utc::now();
                for (name, value) in record.fields() {
                    state.fields.insert(name.clone(), value.clone());
                }
            }
            None => {
                devices.insert(
                    record.device_id().to_string(),
                    DeviceState {
                        device_id: record.device_id().to_string(),
                        timestamp: record.timestamp(),
                        updated_at: Utc::now(),
                        fields: record.fields().clone(),
                    },
                );
            }
        }

        Some(DeviceChange {
            device_id: record.device_id().to_string(),
            timestamp: record.timestamp(),
            fields: record.fields().clone(),
        })
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.read().get(device_id).cloned()
    }

    /// Copy of every device, sorted by id. Later updates never show through.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        let mut states: Vec<DeviceState> = self.devices.read().values().cloned().collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
