//! Per-volume record registry.
//!
//! One record per volume ID, each behind its own async mutex. A lifecycle
//! operation holds its volume's mutex for its whole duration, so operations
//! on one ID are totally ordered while different IDs proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use super::state::{VolumeRecord, VolumeStatus};
use crate::driver::layout::FilesystemLayout;

pub type VolumeHandle = Arc<AsyncMutex<VolumeRecord>>;

pub struct VolumeRegistry {
    layout: FilesystemLayout,
    records: Mutex<HashMap<String, VolumeHandle>>,
}

impl VolumeRegistry {
    pub fn new(layout: FilesystemLayout) -> Self {
        Self {
            layout,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for `volume_id`, creating the record on first use.
    ///
    /// A new record starts as `Materialized` when the host already carries
    /// completed content for the ID (e.g. after a plugin restart).
    /// The caller must have validated the ID.
    pub fn get_or_create(&self, volume_id: &str) -> VolumeHandle {
        let mut records = self.records.lock();
        if let Some(handle) = records.get(volume_id) {
            return Arc::clone(handle);
        }

        let record = match self.layout.volume(volume_id) {
            Ok(layout) if layout.is_materialized() => {
                let mut record = VolumeRecord::new(volume_id, VolumeStatus::Materialized);
                record.image = layout.materialized_image();
                tracing::debug!(
                    volume_id = %volume_id,
                    image = ?record.image,
                    "Recovered materialized volume from host"
                );
                record
            }
            _ => VolumeRecord::new(volume_id, VolumeStatus::Unmaterialized),
        };

        let handle = Arc::new(AsyncMutex::new(record));
        records.insert(volume_id.to_string(), Arc::clone(&handle));
        handle
    }

    /// Drop the record of a volume without content once nobody else holds it.
    ///
    /// `Released` and `Unmaterialized` records carry nothing that
    /// [`get_or_create`](Self::get_or_create) could not rebuild from the host.
    pub fn prune(&self, volume_id: &str) {
        let mut records = self.records.lock();
        let Some(handle) = records.get(volume_id) else {
            return;
        };
        // Another request waiting on the record keeps it alive.
        if Arc::strong_count(handle) > 1 {
            return;
        }
        let idle = handle.try_lock().is_ok_and(|record| {
            matches!(
                record.status,
                VolumeStatus::Released | VolumeStatus::Unmaterialized
            )
        });
        if idle {
            records.remove(volume_id);
        }
    }

    /// Current status of a volume, if a record exists and is not busy.
    pub fn status(&self, volume_id: &str) -> Option<VolumeStatus> {
        let records = self.records.lock();
        let handle = records.get(volume_id)?;
        handle.try_lock().ok().map(|record| record.status)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
