//! Ledger database facade.

use crate::config::DatabaseOptions;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::model::NodeSecurity;
use crate::sequence::{
    MemorySequences, SEQ_DATA, SEQ_EXTRACT_REQUEST, SEQ_LOAD_ID, SEQ_OUTGOING_BATCH,
};
use crate::snapshot;
use batchsync_protocol::{
    ChangeRecord, DataEvent, ExtractRequest, OutgoingBatch, TableReloadRequest, TableReloadStatus,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

/// All durable row sets of the ledger.
///
/// Query and mutation methods are spread over the modules that own each
/// row set: batches in `ledger`, change records in `change_log`, extract
/// and reload requests in `requests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub(crate) data: BTreeMap<u64, ChangeRecord>,
    /// Keyed by (batch id, data id).
    pub(crate) data_events: BTreeMap<(u64, u64), DataEvent>,
    pub(crate) outgoing_batches: BTreeMap<u64, OutgoingBatch>,
    pub(crate) extract_requests: BTreeMap<u64, ExtractRequest>,
    pub(crate) reload_requests: Vec<TableReloadRequest>,
    pub(crate) reload_status: BTreeMap<u64, TableReloadStatus>,
    pub(crate) node_security: BTreeMap<String, NodeSecurity>,
    /// Batches received from a node, keyed by (source node, batch id).
    pub(crate) incoming_batches: BTreeSet<(String, u64)>,
    /// Batches the target reported as applied, keyed by (target node, batch id).
    pub(crate) applied_batches: BTreeSet<(String, u64)>,
    pub(crate) routed_up_to: u64,
}

/// A unit of work over a private copy of the tables.
///
/// Dereferences to [`Tables`]. Changes become visible when the closure
/// passed to [`Database::transaction`] returns `Ok`, or earlier at each
/// [`Transaction::commit_point`].
pub struct Transaction<'a> {
    db: &'a Database,
    tables: Tables,
}

impl Transaction<'_> {
    /// Publishes everything done so far and keeps going.
    ///
    /// A later failure only discards work after the last commit point.
    pub fn commit_point(&mut self) -> CoreResult<()> {
        self.db.publish(self.tables.clone())
    }
}

impl Deref for Transaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.tables
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }
}

/// The ledger database handle.
///
/// Holds the committed [`Tables`] in memory. Writers are serialized and
/// work on a copy, so readers always see the last committed state. When
/// opened on a directory, each commit writes a snapshot.
///
/// ```rust,ignore
/// let db = Database::open_in_memory()?;
/// db.transaction(|txn| {
///     txn.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", now))?;
///     Ok(())
/// })?;
/// let pending = db.read(|t| t.outgoing_batches_for_node("001"));
/// ```
pub struct Database {
    options: DatabaseOptions,
    dir: Option<DatabaseDir>,
    tables: RwLock<Tables>,
    tx_lock: Mutex<()>,
    sequences: Arc<MemorySequences>,
    is_open: RwLock<bool>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir.as_ref().map(DatabaseDir::path))
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens a ledger persisted in `path`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    /// Opens a ledger persisted in `path` with explicit options.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process owns the directory and
    /// `InvalidFormat` if the snapshot cannot be decoded.
    pub fn open_with_options(path: &Path, options: DatabaseOptions) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, options.create_if_missing)?;
        let (tables, sequences) = match dir.load_snapshot()? {
            Some(snapshot) => (snapshot.tables, snapshot.sequences),
            None => (Tables::default(), BTreeMap::new()),
        };
        tracing::info!(
            path = %path.display(),
            batches = tables.outgoing_batches.len(),
            requests = tables.extract_requests.len(),
            "opened ledger"
        );
        Ok(Self::assemble(options, Some(dir), tables, sequences))
    }

    /// Opens a fresh in-memory ledger.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_options(DatabaseOptions::default())
    }

    /// Opens a fresh in-memory ledger with explicit options.
    pub fn open_in_memory_with_options(options: DatabaseOptions) -> CoreResult<Self> {
        Ok(Self::assemble(
            options,
            None,
            Tables::default(),
            BTreeMap::new(),
        ))
    }

    fn assemble(
        options: DatabaseOptions,
        dir: Option<DatabaseDir>,
        tables: Tables,
        sequences: BTreeMap<String, u64>,
    ) -> Self {
        let sequences = MemorySequences::from_values(sequences);
        // ids already in use must never be handed out again
        let floors = [
            (SEQ_DATA, tables.data.keys().next_back().copied()),
            (
                SEQ_OUTGOING_BATCH,
                tables.outgoing_batches.keys().next_back().copied(),
            ),
            (
                SEQ_EXTRACT_REQUEST,
                tables.extract_requests.keys().next_back().copied(),
            ),
            (SEQ_LOAD_ID, tables.reload_status.keys().next_back().copied()),
        ];
        for (name, floor) in floors {
            if let Some(floor) = floor {
                sequences.advance_to(name, floor);
            }
        }
        Self {
            options,
            dir,
            tables: RwLock::new(tables),
            tx_lock: Mutex::new(()),
            sequences: Arc::new(sequences),
            is_open: RwLock::new(true),
        }
    }

    /// Options the ledger was opened with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Sequences persisted with this ledger.
    pub fn sequences(&self) -> Arc<MemorySequences> {
        Arc::clone(&self.sequences)
    }

    /// Runs `f` in a transaction.
    ///
    /// Commits when `f` returns `Ok`, discards its changes otherwise.
    /// Transactions are serialized.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        self.ensure_open()?;
        let _guard = self.tx_lock.lock();
        let mut txn = Transaction {
            db: self,
            tables: self.tables.read().clone(),
        };
        match f(&mut txn) {
            Ok(value) => {
                self.publish(txn.tables)?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Runs `f` against the committed tables.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.read())
    }

    /// Single-statement write; shorthand for a transaction over the tables.
    pub fn write<T>(&self, f: impl FnOnce(&mut Tables) -> CoreResult<T>) -> CoreResult<T> {
        self.transaction(|txn| f(&mut txn.tables))
    }

    /// Writes a snapshot now, regardless of `persist_on_commit`.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let _guard = self.tx_lock.lock();
        let tables = self.tables.read();
        self.save(&tables)
    }

    /// Checkpoints and closes the ledger. Later transactions fail.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        {
            let _guard = self.tx_lock.lock();
            let tables = self.tables.read();
            self.save(&tables)?;
        }
        *is_open = false;
        Ok(())
    }

    /// Checks if the ledger is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::transaction_aborted("ledger is closed"))
        }
    }

    fn publish(&self, tables: Tables) -> CoreResult<()> {
        if self.options.persist_on_commit {
            self.save(&tables)?;
        }
        *self.tables.write() = tables;
        Ok(())
    }

    fn save(&self, tables: &Tables) -> CoreResult<()> {
        if let Some(dir) = &self.dir {
            let data = snapshot::encode_parts(tables, &self.sequences.values())?;
            dir.save_snapshot_bytes(&data)?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to checkpoint ledger on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceGenerator;
    use batchsync_protocol::BatchStatus;
    use tempfile::tempdir;

    #[test]
    fn commit_and_rollback() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|txn| txn.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", 0)))
            .unwrap();

        let result: CoreResult<()> = db.transaction(|txn| {
            txn.insert_outgoing_batch(OutgoingBatch::new(2, "001", "default", 0))?;
            Err(CoreError::validation("boom"))
        });
        assert!(result.is_err());
        assert!(db.read(|t| t.outgoing_batch(1).is_some()));
        assert!(db.read(|t| t.outgoing_batch(2).is_none()));
    }

    #[test]
    fn commit_point_survives_later_failure() {
        let db = Database::open_in_memory().unwrap();
        let result: CoreResult<()> = db.transaction(|txn| {
            txn.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", 0))?;
            txn.commit_point()?;
            txn.insert_outgoing_batch(OutgoingBatch::new(2, "001", "default", 0))?;
            Err(CoreError::interrupted("stop"))
        });
        assert!(result.is_err());
        assert!(db.read(|t| t.outgoing_batch(1).is_some()));
        assert!(db.read(|t| t.outgoing_batch(2).is_none()));
    }

    #[test]
    fn reads_see_committed_state_only() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|txn| {
            txn.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", 0))?;
            assert!(db.read(|t| t.outgoing_batch(1).is_none()));
            Ok(())
        })
        .unwrap();
        assert!(db.read(|t| t.outgoing_batch(1).is_some()));
    }

    #[test]
    fn reopen_restores_tables_and_sequences() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let id = db.sequences().next_val(SEQ_OUTGOING_BATCH).unwrap();
            db.write(|t| {
                t.insert_outgoing_batch(
                    OutgoingBatch::new(id, "001", "default", 0).with_status(BatchStatus::Loading),
                )
            })
            .unwrap();
            db.close().unwrap();
            assert!(db.write(|_| Ok(())).is_err());
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(
            db.read(|t| t.outgoing_batch(1).map(|b| b.status)),
            Some(BatchStatus::Loading)
        );
        assert_eq!(db.sequences().next_val(SEQ_OUTGOING_BATCH).unwrap(), 2);
    }

    #[test]
    fn sequences_never_reuse_stored_ids() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open_with_options(
                dir.path(),
                DatabaseOptions::new().persist_on_commit(true),
            )
            .unwrap();
            // id 9 inserted without going through the sequence
            db.write(|t| t.insert_outgoing_batch(OutgoingBatch::new(9, "001", "default", 0)))
                .unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.sequences().next_val(SEQ_OUTGOING_BATCH).unwrap(), 10);
    }
}
