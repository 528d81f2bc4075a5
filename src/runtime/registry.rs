use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::debug;

/// Tracks disks with a removal in flight, so the UI can hide their stale
/// "present" state until polling confirms the deletion.
///
/// Cloning shares the underlying map. Each key keeps a holder count, so
/// overlapping removals of the same disk keep the marker until the last one
/// unregisters. Operations on different keys do not contend.
#[derive(Clone, Default)]
pub struct PendingTaskRegistry {
    removals: Arc<DashMap<String, usize>>,
}

impl PendingTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pending_removal(&self, disk_id: &str) {
        let mut holders = self.removals.entry(disk_id.to_string()).or_insert(0);
        *holders += 1;
        debug!(disk_id, holders = *holders, "pending removal registered");
    }

    pub fn unregister_pending_removal(&self, disk_id: &str) {
        if let Entry::Occupied(mut entry) = self.removals.entry(disk_id.to_string()) {
            if *entry.get() <= 1 {
                entry.remove();
                debug!(disk_id, "pending removal cleared");
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    pub fn is_removal_pending(&self, disk_id: &str) -> bool {
        self.removals.contains_key(disk_id)
    }

    /// Disk ids with a pending removal, sorted.
    pub fn pending_removals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.removals.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
    }

    /// Register a pending removal that unregisters itself when dropped.
    pub fn hold_removal(&self, disk_id: &str) -> PendingRemoval {
        self.register_pending_removal(disk_id);
        PendingRemoval {
            registry: self.clone(),
            disk_id: disk_id.to_string(),
        }
    }
}

/// Guard returned by `PendingTaskRegistry::hold_removal`. The marker is
/// cleared on drop, including when the owning task is cancelled or aborted.
pub struct PendingRemoval {
    registry: PendingTaskRegistry,
    disk_id: String,
}

impl PendingRemoval {
    pub fn disk_id(&self) -> &str {
        &self.disk_id
    }

    pub fn release(self) {}
}

impl Drop for PendingRemoval {
    fn drop(&mut self) {
        self.registry.unregister_pending_removal(&self.disk_id);
    }
}
