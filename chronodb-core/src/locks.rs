//! Per-table apply locks

use crate::TableId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Registry of apply locks, one per table.
///
/// A lock is a lease: `try_acquire` never blocks, and the lease is released
/// when the returned guard is dropped. Locks are not reentrant.
#[derive(Default)]
pub struct TableLockRegistry {
    locks: Mutex<HashMap<TableId, Arc<AtomicBool>>>,
}

/// Held apply lock of one table
#[derive(Debug)]
pub struct ApplyLockGuard {
    table_id: TableId,
    flag: Arc<AtomicBool>,
}

impl ApplyLockGuard {
    pub fn table_id(&self) -> TableId {
        self.table_id
    }
}

impl Drop for ApplyLockGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl TableLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the apply lock of a table, `None` if someone else holds it
    pub fn try_acquire(&self, table_id: TableId) -> Option<ApplyLockGuard> {
        let flag = self
            .locks
            .lock()
            .entry(table_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ApplyLockGuard { table_id, flag })
    }

    /// Whether the apply lock of a table is currently held
    pub fn is_locked(&self, table_id: TableId) -> bool {
        self.locks
            .lock()
            .get(&table_id)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let registry = TableLockRegistry::new();
        let guard = registry.try_acquire(1).unwrap();
        assert!(registry.try_acquire(1).is_none());
        assert!(registry.is_locked(1));

        // other tables are independent
        assert!(registry.try_acquire(2).is_some());

        drop(guard);
        assert!(!registry.is_locked(1));
        assert!(registry.try_acquire(1).is_some());
    }
}
