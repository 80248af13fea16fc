use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Per-container mutual exclusion. A name is present in the set while an
/// operation for it is in flight; the entry disappears when the holding
/// guard drops, so the table never accumulates names of long-deleted
/// containers.
#[derive(Default)]
pub struct LockTable {
    inflight: Mutex<HashSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable::default()
    }

    /// Claims `name`, or returns None if an operation for it is already in
    /// flight. The returned guard releases the claim on drop, which is the
    /// last thing a worker does.
    pub fn try_acquire(self: &Arc<Self>, name: &str) -> Option<TargetLock> {
        let mut inflight = self.inflight.lock();
        if !inflight.insert(name.to_string()) {
            return None;
        }
        Some(TargetLock {
            table: Arc::clone(self),
            name: name.to_string(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.inflight.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    fn release(&self, name: &str) {
        self.inflight.lock().remove(name);
    }
}

pub struct TargetLock {
    table: Arc<LockTable>,
    name: String,
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        self.table.release(&self.name);
    }
}
