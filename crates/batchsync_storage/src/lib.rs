//! # batchsync storage
//!
//! Staging store for extracted batch payloads.
//!
//! A staged resource holds the fully rendered wire payload of one batch,
//! keyed by `(category, location, batch id)`. Resources are written once
//! while `Building`, flipped to `Done` (which fixes their checksum), and
//! then read any number of times, optionally resuming from a byte offset.
//!
//! ## Available stores
//!
//! - [`InMemoryStaging`] - For tests and single-process engines
//! - [`FileStaging`] - Durable `.create`/`.done` files with checksum sidecars
//!   and cross-process lock files
//!
//! ## Example
//!
//! ```rust
//! use batchsync_storage::{InMemoryStaging, ResourceState, StagingKey, StagingStore};
//!
//! let staging = InMemoryStaging::new();
//! let key = StagingKey::outgoing("store-1", 42);
//! let resource = staging.create(&key).unwrap();
//! resource.append(b"batch,42\ncommit,42\n").unwrap();
//! resource.set_state(ResourceState::Done).unwrap();
//! assert!(resource.verify().is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod io;
mod lock;
mod memory;
mod staging;

pub use error::{StagingError, StagingResult};
pub use file::FileStaging;
pub use io::{ResourceReader, ResourceWriter};
pub use lock::{FileStagingLock, MemoryStagingLock};
pub use memory::InMemoryStaging;
pub use staging::{
    checksum_hex, DiskUsage, ResourceState, StagedResource, StagingKey, StagingLock,
    StagingStore, STAGING_CATEGORY_OUTGOING,
};
