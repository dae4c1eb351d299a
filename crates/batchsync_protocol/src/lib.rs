//! # batchsync protocol
//!
//! Shared model and wire format for the batchsync workspace.
//!
//! This crate provides:
//! - [`ChangeRecord`] and [`DataEvent`] for captured row changes
//! - [`OutgoingBatch`] and its [`BatchStatus`] state machine
//! - [`ExtractRequest`], [`TableReloadRequest`] and [`TableReloadStatus`]
//!   for reload bookkeeping
//! - The line-oriented batch wire format ([`ProtocolWriter`], [`ProtocolReader`])
//!
//! This is a pure model crate. The only I/O it performs is through the
//! `Read`/`Write` handles handed to the wire codec.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod error;
mod event;
mod request;
mod wire;

pub use batch::{BatchStats, BatchStatus, OutgoingBatch};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{ChangeRecord, DataEvent, DataEventType};
pub use request::{
    ExtractRequest, ExtractStatus, TableReloadRequest, TableReloadStatus, ALL_TOKEN,
};
pub use wire::{rewrite_batch_id, ProtocolReader, ProtocolWriter, WireLine};
