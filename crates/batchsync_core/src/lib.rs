//! # batchsync core
//!
//! Durable state and shared services beneath the batchsync engine.
//!
//! This crate provides:
//! - The ledger [`Database`] with serialized transactions and snapshot
//!   persistence
//! - Batch ledger, change log, extract request and reload status row sets
//!   on [`Tables`]
//! - Named [`SequenceGenerator`]s and cluster-wide locks ([`ClusterService`])
//! - The configuration model, a [`ConfigRegistry`] and the cached
//!   [`TriggerRouterService`]
//! - The [`SourceDatabase`] interface read by initial loads
//! - An injectable [`Clock`] and a [`TimedCache`] built on it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod change_log;
mod clock;
mod cluster;
mod config;
mod database;
mod dir;
mod error;
mod ledger;
mod model;
mod registry;
mod requests;
mod sequence;
mod snapshot;
mod source;
mod trigger_router;

pub use cache::{is_expired, TimedCache};
pub use change_log::ChangeLog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{
    ClusterLockGuard, ClusterService, LocalClusterService, LockInfo, INITIAL_LOAD_EXTRACT,
    INITIAL_LOAD_QUEUE, SYNC_TRIGGERS,
};
pub use config::DatabaseOptions;
pub use database::{Database, Tables, Transaction};
pub use dir::read_snapshot;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use ledger::is_extract_candidate;
pub use model::{
    Channel, ChannelControl, Node, NodeSecurity, Router, TransformTable, Trigger, TriggerHistory,
    TriggerRouter, CONFIG_CHANNEL, DEFAULT_QUEUE, RELOAD_CHANNEL,
};
pub use registry::ConfigRegistry;
pub use sequence::{
    MemorySequences, SequenceGenerator, SEQ_DATA, SEQ_EXTRACT_REQUEST, SEQ_LOAD_ID,
    SEQ_OUTGOING_BATCH,
};
pub use snapshot::Snapshot;
pub use source::{csv_row, ForeignKey, MemorySource, SourceDatabase, SourceRow, TableDef};
pub use trigger_router::TriggerRouterService;
