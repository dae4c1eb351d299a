//! # batchsync testkit
//!
//! Test utilities for batchsync.
//!
//! This crate provides:
//! - A corp/store topology with `orders` and `order_items` tables
//! - Engines over in-memory or temporary on-disk ledgers and staging
//! - A harness that plays the target node: it reads what the engine
//!   sends and acknowledges every batch
//! - Property-based generators for change records and CSV values
//! - Concurrent extraction stress runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use batchsync_testkit::prelude::*;
//!
//! #[test]
//! fn store_receives_the_initial_load() {
//!     let harness = Harness::memory(EngineConfig::new(CORP));
//!     let load_id = harness.run_load(STORE_1).unwrap();
//!     assert!(harness.load_status(load_id).unwrap().completed);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
    pub use batchsync_engine::EngineConfig;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
