//! Staging store traits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StagingResult;

/// Category for payloads extracted for outgoing batches.
pub const STAGING_CATEGORY_OUTGOING: &str = "outgoing";

/// Identity of a staged resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagingKey {
    /// Category, e.g. [`STAGING_CATEGORY_OUTGOING`].
    pub category: String,
    /// Location within the category, usually the target node id.
    pub location: String,
    /// Batch id.
    pub batch_id: u64,
}

impl StagingKey {
    /// Creates a key.
    pub fn new(category: impl Into<String>, location: impl Into<String>, batch_id: u64) -> Self {
        Self {
            category: category.into(),
            location: location.into(),
            batch_id,
        }
    }

    /// Key of an outgoing batch payload.
    pub fn outgoing(location: impl Into<String>, batch_id: u64) -> Self {
        Self::new(STAGING_CATEGORY_OUTGOING, location, batch_id)
    }

    /// Path relative to a staging root, without extension.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.category)
            .join(&self.location)
            .join(format!("{:020}", self.batch_id))
    }
}

impl fmt::Display for StagingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.location, self.batch_id)
    }
}

/// Lifecycle of a staged resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Being written.
    Building,
    /// Complete and read-only.
    Done,
}

/// Free and total bytes of the staging medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes still available.
    pub available: u64,
    /// Total bytes.
    pub total: u64,
}

impl DiskUsage {
    /// Fraction of the medium still free, in `[0, 1]`.
    pub fn free_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available as f64 / self.total as f64
    }
}

/// One staged payload.
///
/// # Invariants
///
/// - `append` only succeeds while the state is `Building`
/// - Setting the state to `Done` fixes the checksum returned by `checksum`
/// - `read_at` returns exactly the bytes previously appended
/// - The reference count never goes below zero
pub trait StagedResource: Send + Sync + fmt::Debug {
    /// The key this resource is stored under.
    fn key(&self) -> &StagingKey;

    /// Current lifecycle state.
    fn state(&self) -> ResourceState;

    /// Changes the lifecycle state.
    ///
    /// Moving to `Done` flushes pending writes and records the checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource was deleted or cannot be flushed.
    fn set_state(&self, state: ResourceState) -> StagingResult<()>;

    /// Appends bytes to a `Building` resource.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StagingError::ReadOnly`] once the resource is `Done`.
    fn append(&self, data: &[u8]) -> StagingResult<()>;

    /// Reads up to `len` bytes from `offset`. Returns fewer at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource was deleted or is unreadable.
    fn read_at(&self, offset: u64, len: usize) -> StagingResult<Vec<u8>>;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// SHA-256 recorded when the resource became `Done`.
    fn checksum(&self) -> Option<[u8; 32]>;

    /// Recomputes the checksum of a `Done` resource and compares.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StagingError::ChecksumMismatch`] if the content changed.
    fn verify(&self) -> StagingResult<()>;

    /// Registers a reader. Returns the new count.
    fn reference(&self) -> usize;

    /// Unregisters a reader. Returns the new count.
    fn dereference(&self) -> usize;

    /// Active readers.
    fn reference_count(&self) -> usize;

    /// Whether any reader holds the resource.
    fn is_in_use(&self) -> bool {
        self.reference_count() > 0
    }

    /// Whether the resource still exists in the store.
    fn exists(&self) -> bool;

    /// Releases any open handles.
    ///
    /// # Errors
    ///
    /// Returns an error if pending writes cannot be flushed.
    fn close(&self) -> StagingResult<()>;

    /// Removes the resource. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying files cannot be removed.
    fn delete(&self) -> StagingResult<bool>;
}

/// A cross-process lock on one staged resource.
///
/// Dropping a held lock releases it.
pub trait StagingLock: Send + fmt::Debug {
    /// Whether this handle holds the lock.
    fn is_acquired(&self) -> bool;

    /// Owner description recorded by the current holder.
    fn owner(&self) -> Option<String>;

    /// How long the current holder has held the lock.
    fn age(&self) -> Duration;

    /// Forcibly takes the lock from the current holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be replaced.
    fn break_lock(&mut self) -> StagingResult<bool>;

    /// Releases the lock if held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    fn release(&mut self) -> StagingResult<()>;
}

/// A store of staged resources.
pub trait StagingStore: Send + Sync {
    /// Creates (or truncates) a resource in state `Building`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be created.
    fn create(&self, key: &StagingKey) -> StagingResult<Arc<dyn StagedResource>>;

    /// Finds an existing resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find(&self, key: &StagingKey) -> StagingResult<Option<Arc<dyn StagedResource>>>;

    /// Lists every resource key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn keys(&self) -> StagingResult<Vec<StagingKey>>;

    /// Tries once to take the cross-process lock for `key`.
    ///
    /// The returned handle reports whether it was acquired. A handle that was
    /// not acquired can still report the holder's age and break the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened.
    fn acquire_file_lock(&self, owner: &str, key: &StagingKey) -> StagingResult<Box<dyn StagingLock>>;

    /// Free and total space of the staging medium.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be queried.
    fn usage(&self) -> StagingResult<DiskUsage>;
}

/// Lowercase hex of a checksum.
pub fn checksum_hex(sum: &[u8; 32]) -> String {
    sum.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_path() {
        let key = StagingKey::outgoing("store-1", 42);
        assert_eq!(key.to_string(), "outgoing/store-1/42");
        assert!(key
            .relative_path()
            .ends_with("outgoing/store-1/00000000000000000042"));
    }

    #[test]
    fn test_free_ratio() {
        let usage = DiskUsage {
            available: 25,
            total: 100,
        };
        assert!((usage.free_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            DiskUsage {
                available: 0,
                total: 0
            }
            .free_ratio(),
            0.0
        );
    }

    #[test]
    fn test_checksum_hex() {
        let sum = sha256(b"");
        assert_eq!(
            checksum_hex(&sum),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
