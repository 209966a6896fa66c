//! Per-device arena
//!
//! Maps each [`DeviceKey`] to its serialization lock, current slot and latest
//! snapshot. Every command path (transition, workflow step, toolbox
//! operation) acquires the device's lock first, so at most one operation is
//! in flight per device while different devices proceed in parallel.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::device::{DeviceKey, DeviceSnapshot, SlotId};

/// Exclusive right to issue commands to one device
pub type DeviceGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
struct DeviceEntry {
    lock: Arc<Mutex<()>>,
    slot: Option<SlotId>,
    /// `None` once the device has detached
    latest: Option<Arc<DeviceSnapshot>>,
}

impl DeviceEntry {
    fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            slot: None,
            latest: None,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<DeviceKey, DeviceEntry>,
    slots: HashMap<SlotId, DeviceKey>,
}

/// Identity-keyed device arena
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation
    ///
    /// Returns the key the snapshot was attributed to. Detach snapshots carry
    /// no identity and are attributed through the slot map.
    pub fn observe(&self, snapshot: &Arc<DeviceSnapshot>) -> Option<DeviceKey> {
        let mut inner = self.inner.write();

        if snapshot.is_detached() {
            let key = inner.slots.remove(&snapshot.slot)?;
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.slot = None;
                entry.latest = None;
            }
            return Some(key);
        }

        let key = snapshot.key()?;

        // A device that re-enumerated under a new slot leaves its old slot behind
        let previous_slot = inner.entries.get(&key).and_then(|e| e.slot.clone());
        if let Some(old) = previous_slot.filter(|old| old != &snapshot.slot) {
            inner.slots.remove(&old);
        }

        inner.slots.insert(snapshot.slot.clone(), key.clone());
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(DeviceEntry::new);
        entry.slot = Some(snapshot.slot.clone());
        entry.latest = Some(Arc::clone(snapshot));

        Some(key)
    }

    /// Latest snapshot of a present device
    pub fn latest(&self, key: &DeviceKey) -> Option<Arc<DeviceSnapshot>> {
        self.inner
            .read()
            .entries
            .get(key)
            .and_then(|e| e.latest.clone())
    }

    pub fn key_for_slot(&self, slot: &SlotId) -> Option<DeviceKey> {
        self.inner.read().slots.get(slot).cloned()
    }

    pub fn is_present(&self, key: &DeviceKey) -> bool {
        self.latest(key).is_some()
    }

    /// All present devices, ordered by key
    pub fn devices(&self) -> Vec<Arc<DeviceSnapshot>> {
        let inner = self.inner.read();
        let mut devices: Vec<_> = inner
            .entries
            .iter()
            .filter_map(|(key, e)| e.latest.clone().map(|s| (key.clone(), s)))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices.into_iter().map(|(_, s)| s).collect()
    }

    fn lock_for(&self, key: &DeviceKey) -> Arc<Mutex<()>> {
        if let Some(entry) = self.inner.read().entries.get(key) {
            return Arc::clone(&entry.lock);
        }
        let mut inner = self.inner.write();
        Arc::clone(
            &inner
                .entries
                .entry(key.clone())
                .or_insert_with(DeviceEntry::new)
                .lock,
        )
    }

    /// Wait for exclusive access to a device
    pub async fn acquire(&self, key: &DeviceKey) -> DeviceGuard {
        self.lock_for(key).lock_owned().await
    }

    /// Whether an operation currently holds the device
    pub fn is_busy(&self, key: &DeviceKey) -> bool {
        self.lock_for(key).try_lock().is_err()
    }
}
