//! Process-wide handle to record mapping.

use {
    super::{backend::Handle, bo::Bo},
    std::{collections::HashMap, sync::Arc},
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Sparse mapping from kernel handle to buffer object record.
///
/// Records live behind `Arc`, so a reader may retain one across later
/// inserts. The registry lock also serializes record initialization, the
/// import-revival race and the reclaim re-check; it is the outermost lock
/// and the only one under which the cache lock may additionally be taken.
pub(super) struct Registry {
    records: Mutex<HashMap<Handle, Arc<Bo>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` as one critical section over the record table.
    pub fn with<R>(&self, f: impl FnOnce(&mut HashMap<Handle, Arc<Bo>>) -> R) -> R {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut records = self.records.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut records = records.unwrap();

        f(&mut records)
    }

    pub fn insert(&self, bo: Arc<Bo>) {
        self.with(|records| {
            let handle = bo.handle();
            let prev = records.insert(handle, bo);

            assert!(prev.is_none(), "backend reused live handle {handle}");
        });
    }

    #[cfg(test)]
    pub fn get(&self, handle: Handle) -> Option<Arc<Bo>> {
        self.with(|records| records.get(&handle).cloned())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.with(|records| records.len())
    }
}
