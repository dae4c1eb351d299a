//! In-memory staging store.

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{StagingError, StagingResult};
use crate::lock::MemoryStagingLock;
use crate::staging::{
    checksum_hex, sha256, DiskUsage, ResourceState, StagedResource, StagingKey, StagingLock,
    StagingStore,
};

/// Default capacity reported by [`InMemoryStaging::usage`].
const DEFAULT_CAPACITY: u64 = 1 << 30;

/// An in-memory staging store.
///
/// Suitable for:
/// - Unit and integration tests
/// - Engines that stream batches straight to a transport
///
/// Capacity is only used to report [`DiskUsage`]; writes beyond it still
/// succeed so callers decide how to react to a full medium.
///
/// # Thread Safety
///
/// The store and its resources can be shared across threads.
#[derive(Debug)]
pub struct InMemoryStaging {
    resources: RwLock<BTreeMap<StagingKey, Arc<MemoryResource>>>,
    locks: Arc<Mutex<HashMap<StagingKey, (String, Instant)>>>,
    capacity: u64,
}

impl InMemoryStaging {
    /// Creates an empty store with a 1 GiB nominal capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty store reporting `capacity` total bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
            locks: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Bytes held by all resources.
    pub fn used_bytes(&self) -> u64 {
        self.resources.read().values().map(|r| r.size()).sum()
    }

    /// Replaces a resource's bytes without touching its recorded checksum.
    ///
    /// Simulates damaged staging media.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::NotFound`] if no resource exists for `key`.
    pub fn overwrite(&self, key: &StagingKey, data: &[u8]) -> StagingResult<()> {
        let resources = self.resources.read();
        let resource = resources
            .get(key)
            .ok_or_else(|| StagingError::NotFound(key.to_string()))?;
        let mut inner = resource.inner.write();
        inner.data = BytesMut::from(data);
        Ok(())
    }
}

impl Default for InMemoryStaging {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingStore for InMemoryStaging {
    fn create(&self, key: &StagingKey) -> StagingResult<Arc<dyn StagedResource>> {
        let resource = Arc::new(MemoryResource::new(key.clone()));
        if let Some(previous) = self.resources.write().insert(key.clone(), resource.clone()) {
            previous.inner.write().deleted = true;
        }
        Ok(resource)
    }

    fn find(&self, key: &StagingKey) -> StagingResult<Option<Arc<dyn StagedResource>>> {
        Ok(self
            .resources
            .read()
            .get(key)
            .filter(|r| r.exists())
            .map(|r| r.clone() as Arc<dyn StagedResource>))
    }

    fn keys(&self) -> StagingResult<Vec<StagingKey>> {
        Ok(self
            .resources
            .read()
            .iter()
            .filter(|(_, r)| r.exists())
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn acquire_file_lock(&self, owner: &str, key: &StagingKey) -> StagingResult<Box<dyn StagingLock>> {
        Ok(Box::new(MemoryStagingLock::acquire(
            self.locks.clone(),
            key.clone(),
            owner,
        )))
    }

    fn usage(&self) -> StagingResult<DiskUsage> {
        Ok(DiskUsage {
            available: self.capacity.saturating_sub(self.used_bytes()),
            total: self.capacity,
        })
    }
}

#[derive(Debug)]
struct MemoryInner {
    data: BytesMut,
    state: ResourceState,
    checksum: Option<[u8; 32]>,
    deleted: bool,
}

/// A resource held in memory.
#[derive(Debug)]
struct MemoryResource {
    key: StagingKey,
    inner: RwLock<MemoryInner>,
    references: AtomicUsize,
}

impl MemoryResource {
    fn new(key: StagingKey) -> Self {
        Self {
            key,
            inner: RwLock::new(MemoryInner {
                data: BytesMut::new(),
                state: ResourceState::Building,
                checksum: None,
                deleted: false,
            }),
            references: AtomicUsize::new(0),
        }
    }
}

impl StagedResource for MemoryResource {
    fn key(&self) -> &StagingKey {
        &self.key
    }

    fn state(&self) -> ResourceState {
        self.inner.read().state
    }

    fn set_state(&self, state: ResourceState) -> StagingResult<()> {
        let mut inner = self.inner.write();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        inner.checksum = match state {
            ResourceState::Done => Some(sha256(&inner.data)),
            ResourceState::Building => None,
        };
        inner.state = state;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> StagingResult<()> {
        let mut inner = self.inner.write();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        if inner.state == ResourceState::Done {
            return Err(StagingError::ReadOnly(self.key.to_string()));
        }
        inner.data.extend_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> StagingResult<Vec<u8>> {
        let inner = self.inner.read();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        let start = (offset as usize).min(inner.data.len());
        let end = start.saturating_add(len).min(inner.data.len());
        Ok(inner.data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.inner.read().data.len() as u64
    }

    fn checksum(&self) -> Option<[u8; 32]> {
        self.inner.read().checksum
    }

    fn verify(&self) -> StagingResult<()> {
        let inner = self.inner.read();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        let Some(expected) = inner.checksum else {
            return Ok(());
        };
        let actual = sha256(&inner.data);
        if actual != expected {
            return Err(StagingError::ChecksumMismatch {
                key: self.key.to_string(),
                expected: checksum_hex(&expected),
                actual: checksum_hex(&actual),
            });
        }
        Ok(())
    }

    fn reference(&self) -> usize {
        self.references.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn dereference(&self) -> usize {
        let previous = self
            .references
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn reference_count(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    fn exists(&self) -> bool {
        !self.inner.read().deleted
    }

    fn close(&self) -> StagingResult<()> {
        Ok(())
    }

    fn delete(&self) -> StagingResult<bool> {
        let mut inner = self.inner.write();
        let existed = !inner.deleted;
        inner.deleted = true;
        inner.data = BytesMut::new();
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_write_done_read() {
        let staging = InMemoryStaging::new();
        let key = StagingKey::outgoing("n1", 5);
        let resource = staging.create(&key).unwrap();
        resource.append(b"abc").unwrap();
        resource.append(b"def").unwrap();
        resource.set_state(ResourceState::Done).unwrap();

        assert!(matches!(resource.append(b"x"), Err(StagingError::ReadOnly(_))));
        assert_eq!(resource.read_at(2, 3).unwrap(), b"cde");
        assert_eq!(resource.read_at(4, 100).unwrap(), b"ef");
        assert!(resource.checksum().is_some());

        let found = staging.find(&key).unwrap().unwrap();
        assert_eq!(found.state(), ResourceState::Done);
        assert_eq!(found.size(), 6);
    }

    #[test]
    fn memory_overwrite_breaks_checksum() {
        let staging = InMemoryStaging::new();
        let key = StagingKey::outgoing("n1", 6);
        let resource = staging.create(&key).unwrap();
        resource.append(b"batch,6\ncommit,6\n").unwrap();
        resource.set_state(ResourceState::Done).unwrap();
        resource.verify().unwrap();

        staging.overwrite(&key, b"garbage").unwrap();
        let err = resource.verify().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn memory_delete_hides_resource() {
        let staging = InMemoryStaging::new();
        let key = StagingKey::outgoing("n1", 7);
        let resource = staging.create(&key).unwrap();
        assert!(resource.delete().unwrap());
        assert!(!resource.delete().unwrap());
        assert!(staging.find(&key).unwrap().is_none());
        assert!(staging.keys().unwrap().is_empty());
        assert!(matches!(resource.read_at(0, 1), Err(StagingError::Deleted(_))));
    }

    #[test]
    fn memory_reference_counting() {
        let staging = InMemoryStaging::new();
        let resource = staging.create(&StagingKey::outgoing("n1", 8)).unwrap();
        assert_eq!(resource.reference(), 1);
        assert_eq!(resource.reference(), 2);
        assert!(resource.is_in_use());
        assert_eq!(resource.dereference(), 1);
        assert_eq!(resource.dereference(), 0);
        assert_eq!(resource.dereference(), 0);
        assert!(!resource.is_in_use());
    }

    #[test]
    fn memory_usage_tracks_capacity() {
        let staging = InMemoryStaging::with_capacity(100);
        let resource = staging.create(&StagingKey::outgoing("n1", 9)).unwrap();
        resource.append(&[0u8; 40]).unwrap();
        let usage = staging.usage().unwrap();
        assert_eq!(usage.available, 60);
        assert_eq!(usage.total, 100);
    }

    #[test]
    fn memory_create_replaces_previous() {
        let staging = InMemoryStaging::new();
        let key = StagingKey::outgoing("n1", 10);
        let first = staging.create(&key).unwrap();
        first.append(b"old").unwrap();
        let second = staging.create(&key).unwrap();
        assert!(!first.exists());
        assert_eq!(second.size(), 0);
    }

    proptest! {
        #[test]
        fn checksum_ignores_how_the_payload_was_chunked(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..10)
        ) {
            let staging = InMemoryStaging::new();
            let chunked = staging.create(&StagingKey::outgoing("n1", 1)).unwrap();
            for chunk in &chunks {
                chunked.append(chunk).unwrap();
            }
            chunked.set_state(ResourceState::Done).unwrap();

            let whole = staging.create(&StagingKey::outgoing("n1", 2)).unwrap();
            whole.append(&chunks.concat()).unwrap();
            whole.set_state(ResourceState::Done).unwrap();

            prop_assert_eq!(chunked.checksum(), whole.checksum());
            prop_assert!(chunked.verify().is_ok());
        }
    }
}
