//! Per-engagement async locks.
//!
//! At most one stop or restore runs per engagement at a time. Different
//! engagements never contend: there is no global lock around checkpoint I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use sentinel_core::EngagementId;

#[derive(Debug, Default)]
pub struct EngagementLocks {
    table: Mutex<HashMap<EngagementId, Arc<AsyncMutex<()>>>>,
}

impl EngagementLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `id`. Acquire with `lock_owned()` to hold it across tasks.
    pub fn handle(&self, id: &EngagementId) -> Arc<AsyncMutex<()>> {
        self.table.lock().entry(id.clone()).or_default().clone()
    }

    /// Forget the lock for `id` once nobody else holds or waits on it.
    ///
    /// Call after dropping your own guard and handle.
    pub fn release(&self, id: &EngagementId) {
        let mut table = self.table.lock();
        if table.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(id);
        }
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.table.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
