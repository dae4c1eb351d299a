//! Cross-crate integration test helpers.
//!
//! [`Harness`] drives an engine against simulated store nodes. Each store
//! reads what the engine sends over its own [`MockTransport`], applies
//! the statements to in-memory tables and acknowledges every batch.

use batchsync_core::DEFAULT_QUEUE;
use batchsync_engine::{AckResult, EngineConfig, MockTransport, SyncError, SyncResult};
use batchsync_protocol::{ChangeRecord, ProtocolReader, TableReloadStatus, WireLine};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::fixtures::{TestEngine, STORE_1, STORE_2};

/// Extract rounds [`Harness::run_load`] allows before giving up.
const MAX_LOAD_ROUNDS: usize = 16;

/// Rows of one target table, keyed by the first column.
pub type TargetTable = BTreeMap<String, String>;

/// A simulated target node.
#[derive(Debug, Default)]
pub struct TargetStore {
    transport: MockTransport,
    tables: Mutex<BTreeMap<String, TargetTable>>,
    statements: Mutex<Vec<String>>,
    ignored: Mutex<Vec<u64>>,
}

impl TargetStore {
    /// Transport the engine writes to for this store.
    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Applies everything received since the last call. Returns the
    /// committed batch ids in arrival order.
    pub fn receive(&self) -> SyncResult<Vec<u64>> {
        let received = self.transport.contents();
        self.transport.clear();

        let mut committed = Vec::new();
        let mut batch = 0;
        let mut table = String::new();
        let mut keys: Option<String> = None;
        let mut tables = self.tables.lock();
        for line in ProtocolReader::new(received.as_bytes()) {
            match line? {
                WireLine::Batch(id) => batch = id,
                WireLine::Table(name) => table = name,
                WireLine::Keys(pk) => keys = Some(pk),
                WireLine::Insert(row) => {
                    tables.entry(table.clone()).or_default().insert(first_field(&row), row);
                }
                WireLine::Update(row) => {
                    let rows = tables.entry(table.clone()).or_default();
                    if let Some(pk) = keys.take() {
                        rows.remove(&first_field(&pk));
                    }
                    rows.insert(first_field(&row), row);
                }
                WireLine::Delete(pk) => {
                    tables.entry(table.clone()).or_default().remove(&first_field(&pk));
                }
                WireLine::Sql(sql) | WireLine::Create(sql) | WireLine::Bsh(sql) => {
                    self.statements.lock().push(sql);
                }
                WireLine::Ignore => self.ignored.lock().push(batch),
                WireLine::Commit(id) => committed.push(id),
                WireLine::NodeId(_)
                | WireLine::Channel(_)
                | WireLine::Old(_)
                | WireLine::Retry(_)
                | WireLine::KeepAlive => {}
            }
        }
        Ok(committed)
    }

    /// Copy of one table.
    pub fn table(&self, name: &str) -> TargetTable {
        self.tables.lock().get(name).cloned().unwrap_or_default()
    }

    /// SQL, create and script statements received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Batches received as ignored.
    pub fn ignored(&self) -> Vec<u64> {
        self.ignored.lock().clone()
    }
}

/// Unquoted first field of a CSV payload.
fn first_field(payload: &str) -> String {
    let Some(rest) = payload.strip_prefix('"') else {
        return payload.split(',').next().unwrap_or_default().to_string();
    };
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                break;
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// An engine wired to both simulated stores.
pub struct Harness {
    /// The engine under test.
    pub engine: TestEngine,
    stores: BTreeMap<String, TargetStore>,
}

impl Harness {
    /// Creates a harness over an in-memory engine with 250 source orders.
    pub fn memory(config: EngineConfig) -> Self {
        Self::with_engine(TestEngine::memory(config, 250))
    }

    /// Creates a harness over an engine persisted in a temporary directory.
    pub fn file(config: EngineConfig) -> Self {
        Self::with_engine(TestEngine::file(config, 250))
    }

    /// Wraps an existing engine.
    pub fn with_engine(engine: TestEngine) -> Self {
        let stores = [STORE_1, STORE_2]
            .into_iter()
            .map(|id| (id.to_string(), TargetStore::default()))
            .collect();
        Self { engine, stores }
    }

    /// The simulated store `node_id`.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is not one of the harness stores.
    pub fn store(&self, node_id: &str) -> &TargetStore {
        self.stores
            .get(node_id)
            .unwrap_or_else(|| panic!("no simulated store {node_id}"))
    }

    /// Captures `records` and routes them. Returns the events routed.
    pub fn capture(&self, records: impl IntoIterator<Item = ChangeRecord>) -> SyncResult<usize> {
        for record in records {
            self.engine.capture_change(record)?;
        }
        self.engine.route()
    }

    /// One extract round for `node_id`: sends, applies at the store and
    /// acknowledges. Returns the acknowledged batch ids.
    pub fn sync(&self, node_id: &str) -> SyncResult<Vec<u64>> {
        let store = self.store(node_id);
        self.engine.extract(node_id, DEFAULT_QUEUE, store.transport())?;
        let committed = store.receive()?;
        for batch_id in &committed {
            self.engine.ack(node_id, *batch_id, AckResult::Ok)?;
        }
        Ok(committed)
    }

    /// Runs a full initial load of `node_id` to completion. Returns the
    /// load id.
    pub fn run_load(&self, node_id: &str) -> SyncResult<u64> {
        let load_id = self.engine.insert_reload(node_id, false, &[])?.load_id;
        for _ in 0..MAX_LOAD_ROUNDS {
            self.sync(node_id)?;
            if self.load_status(load_id).is_some_and(|s| s.completed) {
                return Ok(load_id);
            }
            self.engine.queue_work(true)?;
        }
        Err(SyncError::validation(format!(
            "load {load_id} of node {node_id} did not complete in {MAX_LOAD_ROUNDS} rounds"
        )))
    }

    /// Progress of a load.
    pub fn load_status(&self, load_id: u64) -> Option<TableReloadStatus> {
        self.engine
            .database()
            .read(|t| t.reload_status(load_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{CORP, DEFAULT_CHANNEL};
    use crate::generators::order_changes_strategy;
    use batchsync_core::csv_row;
    use batchsync_protocol::DataEventType;
    use proptest::prelude::*;

    fn insert(id: u32, customer: &str) -> ChangeRecord {
        ChangeRecord::new("orders", DataEventType::Insert, DEFAULT_CHANNEL)
            .with_row_data(csv_row(&[Some(id.to_string()), Some(customer.to_string())]))
    }

    #[test]
    fn first_field_unquotes() {
        assert_eq!(first_field("\"a\"\"b\",\"c\""), "a\"b");
        assert_eq!(first_field("7,x"), "7");
        assert_eq!(first_field(""), "");
    }

    #[test]
    fn captured_changes_reach_both_stores() {
        let harness = Harness::memory(EngineConfig::new(CORP));
        assert_eq!(harness.capture([insert(1, "a"), insert(2, "b")]).unwrap(), 4);

        for store in [STORE_1, STORE_2] {
            assert_eq!(harness.sync(store).unwrap().len(), 1);
            assert_eq!(harness.store(store).table("orders").len(), 2);
            assert!(harness.sync(store).unwrap().is_empty());
        }
    }

    #[test]
    fn initial_load_fills_the_store() {
        let harness = Harness::memory(EngineConfig::new(CORP));
        let load_id = harness.run_load(STORE_1).unwrap();

        let status = harness.load_status(load_id).unwrap();
        assert_eq!(status.rows_loaded, 500);
        let store = harness.store(STORE_1);
        assert_eq!(store.table("orders").len(), 250);
        assert_eq!(store.table("order_items").len(), 250);
        assert!(store.statements()[0].starts_with("update node_security"));
        assert!(harness.store(STORE_2).table("orders").is_empty());
    }

    #[test]
    fn file_backed_load_matches_memory() {
        let harness = Harness::file(EngineConfig::new(CORP));
        harness.run_load(STORE_2).unwrap();
        assert_eq!(harness.store(STORE_2).table("order_items").len(), 250);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn store_converges_to_the_captured_state(changes in order_changes_strategy(40)) {
            let mut expected = TargetTable::new();
            for change in &changes {
                match change.event_type {
                    DataEventType::Insert => {
                        let row = change.row_data.clone().unwrap();
                        expected.insert(first_field(&row), row);
                    }
                    DataEventType::Update => {
                        expected.remove(&first_field(change.pk_data.as_deref().unwrap()));
                        let row = change.row_data.clone().unwrap();
                        expected.insert(first_field(&row), row);
                    }
                    _ => {
                        expected.remove(&first_field(change.pk_data.as_deref().unwrap()));
                    }
                }
            }

            let harness = Harness::memory(EngineConfig::new(CORP));
            harness.capture(changes).unwrap();
            harness.sync(STORE_1).unwrap();
            prop_assert_eq!(harness.store(STORE_1).table("orders"), expected);
        }
    }
}
