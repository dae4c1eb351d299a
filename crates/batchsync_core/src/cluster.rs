//! Cluster-wide named locks.
//!
//! Several engine instances may share one ledger. Jobs that must run on
//! exactly one of them take a named lock first and skip their run when
//! another instance holds it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::CoreResult;

/// Lock held while reload requests are turned into reload events.
pub const SYNC_TRIGGERS: &str = "SYNC_TRIGGERS";
/// Lock held while queueing initial loads.
pub const INITIAL_LOAD_QUEUE: &str = "INITIAL_LOAD_QUEUE";
/// Lock held while processing reload extract requests.
pub const INITIAL_LOAD_EXTRACT: &str = "INITIAL_LOAD_EXTRACT";

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock name.
    pub name: String,
    /// Server id of the holder.
    pub owner: String,
    /// When the lock was taken.
    pub acquired_at: u64,
    /// When the lease runs out unless refreshed.
    pub expires_at: u64,
}

/// Named mutual exclusion across engine instances.
pub trait ClusterService: Send + Sync {
    /// Takes `name` if it is free or its lease has expired.
    fn lock(&self, name: &str) -> CoreResult<bool>;

    /// Releases `name` if this instance holds it.
    fn unlock(&self, name: &str) -> CoreResult<bool>;

    /// Extends the lease of a lock this instance holds.
    fn refresh_lock(&self, name: &str) -> CoreResult<bool>;

    /// All currently held locks.
    fn find_locks(&self) -> CoreResult<BTreeMap<String, LockInfo>>;

    /// Identity of this instance.
    fn server_id(&self) -> &str;
}

/// Cluster locks shared by instances within one process.
#[derive(Debug, Clone)]
pub struct LocalClusterService {
    server_id: String,
    clock: Arc<dyn Clock>,
    lease: Duration,
    locks: Arc<Mutex<BTreeMap<String, LockInfo>>>,
}

impl LocalClusterService {
    /// Creates a service with a random server id.
    pub fn new(clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            clock,
            lease,
            locks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Another instance that competes for the same locks.
    pub fn peer(&self) -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            clock: Arc::clone(&self.clock),
            lease: self.lease,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl ClusterService for LocalClusterService {
    fn lock(&self, name: &str) -> CoreResult<bool> {
        let now = self.clock.now_millis();
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(name) {
            if held.expires_at > now {
                return Ok(false);
            }
            tracing::warn!(lock = name, owner = %held.owner, "taking over expired cluster lock");
        }
        locks.insert(
            name.to_string(),
            LockInfo {
                name: name.to_string(),
                owner: self.server_id.clone(),
                acquired_at: now,
                expires_at: now + self.lease.as_millis() as u64,
            },
        );
        Ok(true)
    }

    fn unlock(&self, name: &str) -> CoreResult<bool> {
        let mut locks = self.locks.lock();
        match locks.get(name) {
            Some(held) if held.owner == self.server_id => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn refresh_lock(&self, name: &str) -> CoreResult<bool> {
        let now = self.clock.now_millis();
        let mut locks = self.locks.lock();
        match locks.get_mut(name) {
            Some(held) if held.owner == self.server_id => {
                held.expires_at = now + self.lease.as_millis() as u64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_locks(&self) -> CoreResult<BTreeMap<String, LockInfo>> {
        Ok(self.locks.lock().clone())
    }

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

/// Releases a cluster lock on drop.
pub struct ClusterLockGuard<'a> {
    cluster: &'a dyn ClusterService,
    name: String,
}

impl<'a> ClusterLockGuard<'a> {
    /// Takes `name`, or returns `None` if another instance holds it.
    pub fn try_acquire(cluster: &'a dyn ClusterService, name: &str) -> CoreResult<Option<Self>> {
        if cluster.lock(name)? {
            Ok(Some(Self {
                cluster,
                name: name.to_string(),
            }))
        } else {
            tracing::debug!(lock = name, "cluster lock held elsewhere");
            Ok(None)
        }
    }

    /// Extends the lease.
    pub fn refresh(&self) -> CoreResult<bool> {
        self.cluster.refresh_lock(&self.name)
    }
}

impl Drop for ClusterLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.cluster.unlock(&self.name) {
            tracing::warn!(lock = %self.name, error = %e, "failed to release cluster lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn peers_exclude_each_other() {
        let clock = Arc::new(ManualClock::new(0));
        let a = LocalClusterService::new(clock.clone(), Duration::from_secs(60));
        let b = a.peer();

        assert!(a.lock(INITIAL_LOAD_EXTRACT).unwrap());
        assert!(!b.lock(INITIAL_LOAD_EXTRACT).unwrap());
        assert!(!b.unlock(INITIAL_LOAD_EXTRACT).unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(a.refresh_lock(INITIAL_LOAD_EXTRACT).unwrap());
        clock.advance(Duration::from_secs(59));
        assert!(!b.lock(INITIAL_LOAD_EXTRACT).unwrap());
        clock.advance(Duration::from_secs(2));
        assert!(b.lock(INITIAL_LOAD_EXTRACT).unwrap());
        assert_eq!(b.find_locks().unwrap()[INITIAL_LOAD_EXTRACT].owner, b.server_id());
    }

    #[test]
    fn guard_releases_on_drop() {
        let a = LocalClusterService::new(Arc::new(ManualClock::new(0)), Duration::from_secs(60));
        let b = a.peer();
        {
            let guard = ClusterLockGuard::try_acquire(&a, SYNC_TRIGGERS).unwrap();
            assert!(guard.is_some());
            assert!(ClusterLockGuard::try_acquire(&b, SYNC_TRIGGERS).unwrap().is_none());
        }
        assert!(a.find_locks().unwrap().is_empty());
    }
}
