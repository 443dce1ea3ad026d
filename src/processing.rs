//! Zones this process is currently handling.
//!
//! Advisory only: the store's lease decides ownership. The set keeps the
//! scanner from re-sending zones that are already in the pipeline and
//! bounds how many zones one process works on at once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct ProcessingZones {
    zones: Arc<Mutex<HashSet<String>>>,
}

impl ProcessingZones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, queue_zone: &str) -> bool {
        self.zones
            .lock()
            .expect("processing zones poisoned")
            .contains(queue_zone)
    }

    pub fn len(&self) -> usize {
        self.zones.lock().expect("processing zones poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `queue_zone` unless it is already present or the set holds
    /// `bound` zones. The zone is released when the returned claim drops.
    pub fn try_register(&self, queue_zone: &str, bound: usize) -> Option<ZoneClaim> {
        let mut guard = self.zones.lock().expect("processing zones poisoned");
        if guard.len() >= bound || guard.contains(queue_zone) {
            return None;
        }
        guard.insert(queue_zone.to_string());
        Some(ZoneClaim {
            queue_zone: queue_zone.to_string(),
            zones: Arc::clone(&self.zones),
        })
    }

    /// Keep only the zones not already being processed.
    pub fn retain_unprocessed<T, F>(&self, candidates: Vec<T>, key: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        let guard = self.zones.lock().expect("processing zones poisoned");
        candidates
            .into_iter()
            .filter(|candidate| !guard.contains(key(candidate)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .zones
            .lock()
            .expect("processing zones poisoned")
            .iter()
            .cloned()
            .collect();
        zones.sort();
        zones
    }
}

/// Membership of one zone in [`ProcessingZones`]. Dropping it releases the
/// zone.
pub struct ZoneClaim {
    queue_zone: String,
    zones: Arc<Mutex<HashSet<String>>>,
}

impl ZoneClaim {
    pub fn queue_zone(&self) -> &str {
        &self.queue_zone
    }
}

impl fmt::Debug for ZoneClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ZoneClaim").field(&self.queue_zone).finish()
    }
}

impl Drop for ZoneClaim {
    fn drop(&mut self) {
        // A poisoned set only loses an advisory entry; never panic in drop.
        if let Ok(mut guard) = self.zones.lock() {
            guard.remove(&self.queue_zone);
        }
    }
}
