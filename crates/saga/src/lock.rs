//! Per-instance dispatch locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::CorrelationId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<CorrelationId, Arc<AsyncMutex<()>>>>>;

/// Serializes dispatches that target the same instance.
///
/// Entries exist only while some task holds or waits for them.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyedLocks {
    table: Table,
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits until no other task holds the lock for `key`.
    pub(crate) async fn lock(&self, key: CorrelationId) -> KeyGuard {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(key).or_default())
        };
        // Registered before awaiting so a cancelled waiter still cleans up.
        let registration = Registration {
            key,
            entry: Arc::clone(&entry),
            table: Arc::clone(&self.table),
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of keys currently held or awaited.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct Registration {
    key: CorrelationId,
    entry: Arc<AsyncMutex<()>>,
    table: Table,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference held by the table, one by this registration.
        if let Some(current) = table.get(&self.key)
            && Arc::ptr_eq(current, &self.entry)
            && Arc::strong_count(&self.entry) == 2
        {
            table.remove(&self.key);
        }
    }
}

/// Held for the duration of one dispatch.
pub(crate) struct KeyGuard {
    // Field order matters: the mutex guard is released before the
    // registration checks whether the entry is still in use.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}
