//! Per-batch extraction locks.
//!
//! [`BatchLockManager`] hands out in-process exclusive locks keyed by a
//! semaphore key. Entries are reference counted under the map mutex, so an
//! entry is only removed once no thread holds or waits on it.
//! [`acquire_staging_lock`] adds the cross-process file lock used for
//! shared batches.

use batchsync_core::Clock;
use batchsync_storage::{StagingKey, StagingLock, StagingStore};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct LockEntry {
    held: Mutex<bool>,
    released: Condvar,
}

#[derive(Debug)]
struct Slot {
    entry: Arc<LockEntry>,
    refs: usize,
}

/// Process-wide table of batch locks.
#[derive(Debug, Default)]
pub struct BatchLockManager {
    slots: Mutex<HashMap<String, Slot>>,
}

impl BatchLockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free and takes it.
    pub fn acquire(&self, key: &str) -> BatchLockGuard<'_> {
        let entry = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                entry: Arc::new(LockEntry::default()),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.entry)
        };
        {
            let mut held = entry.held.lock();
            while *held {
                entry.released.wait(&mut held);
            }
            *held = true;
        }
        BatchLockGuard {
            manager: self,
            key: key.to_string(),
            entry,
        }
    }

    /// Holders plus waiters of `key`.
    pub fn ref_count(&self, key: &str) -> usize {
        self.slots.lock().get(key).map_or(0, |s| s.refs)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no lock is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str, entry: &LockEntry) {
        {
            let mut held = entry.held.lock();
            *held = false;
            entry.released.notify_one();
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
    }
}

/// Holds a batch lock until dropped.
#[derive(Debug)]
pub struct BatchLockGuard<'a> {
    manager: &'a BatchLockManager,
    key: String,
    entry: Arc<LockEntry>,
}

impl BatchLockGuard<'_> {
    /// Key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for BatchLockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.key, &self.entry);
    }
}

/// Takes the cross-process staging lock of `key`.
///
/// Retries with the configured backoff. A lock older than
/// `stale_lock_age` is broken with a warning; otherwise the wait gives up
/// after `file_lock_timeout` on `clock` with [`SyncError::LockTimeout`].
pub fn acquire_staging_lock(
    staging: &dyn StagingStore,
    clock: &dyn Clock,
    owner: &str,
    key: &StagingKey,
    config: &EngineConfig,
) -> SyncResult<Box<dyn StagingLock>> {
    let started = clock.now_millis();
    let mut attempt = 0u32;
    loop {
        let mut lock = staging.acquire_file_lock(owner, key)?;
        if lock.is_acquired() {
            return Ok(lock);
        }
        let age = lock.age();
        if age >= config.stale_lock_age {
            tracing::warn!(
                key = %key,
                holder = ?lock.owner(),
                age_secs = age.as_secs(),
                "breaking stale staging lock"
            );
            if lock.break_lock()? {
                return Ok(lock);
            }
        }
        let waited = Duration::from_millis(clock.now_millis().saturating_sub(started));
        if waited >= config.file_lock_timeout {
            return Err(SyncError::LockTimeout {
                key: key.to_string(),
            });
        }
        attempt += 1;
        std::thread::sleep(config.lock_retry.delay_for_attempt(attempt));
    }
}
