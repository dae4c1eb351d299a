//! # batchsync engine
//!
//! Batch lifecycle, extraction and reload orchestration for batchsync.
//!
//! This crate provides:
//! - Routing of captured changes into outgoing batches
//! - The extraction round: batch filtering, staging under per-batch locks,
//!   a bounded worker pool and ordered transfer within a byte budget
//! - The initial load pipeline: reload requests, setup and data batches,
//!   extract requests and their restart
//! - Acknowledgement handling and load progress tracking
//!
//! ## Batch lifecycle
//!
//! ```text
//! RQ ──extract job──▶ NE ──▶ QY ──▶ SE ──▶ LD ──ack──▶ OK
//!                      ▲      │      │      │
//!                      └──────┴──────┴──────┴──▶ ER
//! ```
//!
//! IG and OK are terminal; a batch in either state is never extracted
//! again.
//!
//! ## Concurrency
//!
//! One lock per batch serializes extraction of that batch across every
//! worker and transport. Jobs that must run once per cluster take a named
//! cluster lock first and skip the round when another node holds it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod config;
mod context;
mod engine;
mod error;
mod extract;
mod filter;
mod listener;
mod locks;
mod policy;
mod process;
mod reload;
mod route;
mod transform;
mod transport;

#[cfg(test)]
mod test_support;

pub use ack::AckResult;
pub use config::{EngineConfig, RetryConfig};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult, GENERIC_ERROR_CODE, STAGE_ERROR_CODE};
pub use extract::NodeQueueStatus;
pub use listener::{ReloadListener, ReloadListeners};
pub use locks::{BatchLockGuard, BatchLockManager};
pub use policy::should_persist_status;
pub use process::{ProcessInfo, ProcessKind, ProcessSnapshot, ProcessStatus};
pub use reload::{batch_count, order_trigger_routers, sort_tables, ReloadOutcome, TableNode};
pub use transform::{NoTransforms, TableTransforms, TransformStage};
pub use transport::{MockTransport, OutgoingTransport, StreamTransport, TransportWriter};
