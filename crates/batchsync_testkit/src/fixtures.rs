//! Test fixtures and engine helpers.
//!
//! A corp node routes `orders` and `order_items` to a group of store
//! nodes. Engines are built over an in-memory ledger and staging area, or
//! over both persisted in a temporary directory.

use batchsync_core::{
    Channel, ConfigRegistry, Database, ManualClock, MemorySource, Node, Router, TableDef, Trigger,
    TriggerHistory, TriggerRouter, CONFIG_CHANNEL, RELOAD_CHANNEL,
};
use batchsync_engine::{EngineConfig, SyncEngine};
use batchsync_storage::{FileStaging, InMemoryStaging, StagingStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Corp node id.
pub const CORP: &str = "00000";
/// Corp node group.
pub const CORP_GROUP: &str = "corp";
/// Store node group.
pub const STORE_GROUP: &str = "store";
/// First store node.
pub const STORE_1: &str = "001";
/// Second store node.
pub const STORE_2: &str = "002";
/// Channel the tables are captured on.
pub const DEFAULT_CHANNEL: &str = "default";
/// Router from corp to the stores.
pub const CORP_TO_STORE: &str = "corp_to_store";
/// Start of the manual clock, in milliseconds.
pub const START_TIME: u64 = 1_700_000_000_000;

/// Registry of the corp node with `stores` in the store group.
///
/// `order_items` has the lower load order but references `orders`, so a
/// correct load still sends `orders` first.
pub fn registry(stores: &[&str]) -> Arc<ConfigRegistry> {
    let registry = Arc::new(ConfigRegistry::new(Node::new(CORP, CORP_GROUP)));
    for store in stores {
        registry.add_node(Node::new(*store, STORE_GROUP));
    }
    registry.add_channel(Channel::new(DEFAULT_CHANNEL, 1000));
    registry.add_channel(Channel::new(RELOAD_CHANNEL, 100).reload());
    registry.add_channel(Channel::new(CONFIG_CHANNEL, 100));

    let router = Router::new(CORP_TO_STORE, CORP_GROUP, STORE_GROUP);
    let tables: [(&str, i32, u32, &[&str]); 2] = [
        ("orders", 10, 1, &["id", "customer"]),
        ("order_items", 5, 2, &["id", "order_id"]),
    ];
    for (table, load_order, hist_id, columns) in tables {
        registry.add_history(TriggerHistory {
            trigger_hist_id: hist_id,
            trigger_id: table.to_string(),
            source_table_name: table.to_string(),
            column_names: columns.iter().map(|c| c.to_string()).collect(),
            pk_column_names: vec!["id".to_string()],
        });
        registry.add_trigger_router(
            TriggerRouter::new(Trigger::new(table, table, DEFAULT_CHANNEL), router.clone())
                .with_load_order(load_order),
        );
    }
    registry
}

/// Source database with `orders` rows in each table.
pub fn source(orders: usize) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.add_table(TableDef::new("orders", &["id", "customer"]));
    source.add_table(
        TableDef::new("order_items", &["id", "order_id"]).with_foreign_key("orders", &["order_id"]),
    );
    for i in 0..orders {
        source
            .insert_row("orders", vec![Some(i.to_string()), Some(format!("customer-{i}"))])
            .expect("orders table exists");
        source
            .insert_row("order_items", vec![Some(i.to_string()), Some(i.to_string())])
            .expect("order_items table exists");
    }
    source
}

/// An engine with its clock, staging and source exposed.
pub struct TestEngine {
    /// The engine.
    pub engine: SyncEngine,
    /// Clock driving the engine.
    pub clock: Arc<ManualClock>,
    /// Staging area.
    pub staging: Arc<dyn StagingStore>,
    /// Source database.
    pub source: Arc<MemorySource>,
    /// Temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over an in-memory ledger and staging area, with
    /// both stores and `orders` source rows.
    pub fn memory(config: EngineConfig, orders: usize) -> Self {
        let staging: Arc<dyn StagingStore> = Arc::new(InMemoryStaging::new());
        let db = Arc::new(Database::open_in_memory().expect("in-memory ledger opens"));
        Self::assemble(config, db, staging, source(orders), None)
    }

    /// Creates an engine whose ledger and staging live in a temporary
    /// directory.
    pub fn file(config: EngineConfig, orders: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut engine = Self::open(config, temp_dir.path(), orders);
        engine.temp_dir = Some(temp_dir);
        engine
    }

    /// Opens an engine over the ledger and staging under `dir`, as left
    /// by an earlier engine. The directory is not cleaned up.
    pub fn open(config: EngineConfig, dir: &Path, orders: usize) -> Self {
        let db = Arc::new(Database::open(&dir.join("ledger")).expect("Failed to open ledger"));
        let staging: Arc<dyn StagingStore> =
            Arc::new(FileStaging::open(&dir.join("staging")).expect("Failed to open staging"));
        Self::assemble(config, db, staging, source(orders), None)
    }

    fn assemble(
        config: EngineConfig,
        db: Arc<Database>,
        staging: Arc<dyn StagingStore>,
        source: Arc<MemorySource>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(START_TIME));
        let engine = SyncEngine::builder(config, registry(&[STORE_1, STORE_2]))
            .with_database(db)
            .with_staging(Arc::clone(&staging))
            .with_source(source.clone())
            .with_clock(clock.clone())
            .build()
            .expect("Failed to build engine");
        Self {
            engine,
            clock,
            staging,
            source,
            temp_dir,
        }
    }

    /// Directory holding the ledger and staging, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }
}

impl std::ops::Deref for TestEngine {
    type Target = SyncEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs `f` with an in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use batchsync_testkit::{with_engine, CORP};
///
/// with_engine(EngineConfig::new(CORP), |t| {
///     assert!(t.is_extraction_enabled());
/// });
/// ```
pub fn with_engine<F, R>(config: EngineConfig, f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory(config, 10);
    f(&engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_core::SourceDatabase;

    #[test]
    fn registry_routes_corp_to_both_stores() {
        let registry = registry(&[STORE_1, STORE_2]);
        assert_eq!(registry.nodes_in_group(STORE_GROUP).len(), 2);
        assert_eq!(registry.trigger_routers().len(), 2);
        assert_eq!(registry.latest_history("orders").unwrap().trigger_hist_id, 1);
    }

    #[test]
    fn file_engine_keeps_its_directory() {
        let t = TestEngine::file(EngineConfig::new(CORP), 1);
        let path = t.path().unwrap();
        assert!(path.join("staging").exists());
    }

    #[test]
    fn with_engine_builds_a_ready_engine() {
        with_engine(EngineConfig::new(CORP), |t| {
            assert!(t.is_extraction_enabled());
            assert_eq!(t.source.count_rows("orders", None).unwrap(), 10);
        });
    }
}
