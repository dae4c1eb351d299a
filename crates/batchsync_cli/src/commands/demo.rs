//! Demo command: loads a generated `orders` table into simulated stores.

use batchsync_core::{
    Channel, ConfigRegistry, Database, MemorySource, Node, Router, TableDef, Trigger,
    TriggerHistory, TriggerRouter, CONFIG_CHANNEL, DEFAULT_QUEUE, RELOAD_CHANNEL,
};
use batchsync_engine::{AckResult, EngineConfig, StreamTransport, SyncEngine};
use batchsync_storage::{FileStaging, StagingStore};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::{CliError, CliResult, Format};

const CORP: &str = "00000";
/// Extract rounds allowed per store before the demo gives up.
const MAX_ROUNDS: usize = 64;

/// Demo settings.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Store nodes to load.
    pub stores: usize,
    /// Source rows per table.
    pub rows: usize,
    /// Maximum rows per reload batch.
    pub max_batch_size: u64,
    /// Extraction worker threads.
    pub threads: usize,
    /// Persist the ledger here instead of in memory.
    pub ledger: Option<PathBuf>,
    /// Stage on disk here instead of in memory.
    pub staging: Option<PathBuf>,
    /// Write the wire stream to stdout.
    pub wire: bool,
}

/// Result of loading one store.
#[derive(Debug, Serialize)]
pub struct StoreLoad {
    /// Store node id.
    pub node_id: String,
    /// Load id.
    pub load_id: u64,
    /// Batches acknowledged.
    pub batches: usize,
    /// Rows loaded.
    pub rows: u64,
    /// Extract rounds used.
    pub rounds: usize,
    /// Elapsed milliseconds.
    pub elapsed_ms: u64,
}

fn registry(stores: &[String], max_batch_size: u64) -> Arc<ConfigRegistry> {
    let registry = Arc::new(ConfigRegistry::new(Node::new(CORP, "corp")));
    for store in stores {
        registry.add_node(Node::new(store.as_str(), "store"));
    }
    registry.add_channel(Channel::new("default", 1000));
    registry.add_channel(Channel::new(RELOAD_CHANNEL, max_batch_size).reload());
    registry.add_channel(Channel::new(CONFIG_CHANNEL, 100));
    let router = Router::new("corp_to_store", "corp", "store");
    let tables = [
        ("orders", 1, ["id", "customer", "total"]),
        ("order_items", 2, ["id", "order_id", "sku"]),
    ];
    for (table, order, columns) in tables {
        registry.add_history(TriggerHistory {
            trigger_hist_id: order,
            trigger_id: table.to_string(),
            source_table_name: table.to_string(),
            column_names: columns.iter().map(|c| c.to_string()).collect(),
            pk_column_names: vec!["id".to_string()],
        });
        registry.add_trigger_router(
            TriggerRouter::new(Trigger::new(table, table, "default"), router.clone()).with_load_order(order as i32),
        );
    }
    registry
}

fn source(rows: usize) -> CliResult<Arc<MemorySource>> {
    let source = Arc::new(MemorySource::new());
    source.add_table(TableDef::new("orders", &["id", "customer", "total"]));
    source.add_table(
        TableDef::new("order_items", &["id", "order_id", "sku"]).with_foreign_key("orders", &["order_id"]),
    );
    for i in 0..rows {
        source.insert_row(
            "orders",
            vec![
                Some(i.to_string()),
                Some(format!("customer-{}", i % 97)),
                Some(format!("{}.{:02}", i % 500, i % 100)),
            ],
        )?;
        source.insert_row(
            "order_items",
            vec![Some(i.to_string()), Some(i.to_string()), Some(format!("sku-{}", i % 31))],
        )?;
    }
    Ok(source)
}

/// Builds the engine and loads every store. Returns one result per store.
pub fn demo(options: &DemoOptions, out: &mut (dyn Write + Send)) -> CliResult<Vec<StoreLoad>> {
    if options.stores == 0 {
        return Err(CliError::Usage("at least one store is required".into()));
    }
    if options.max_batch_size == 0 {
        return Err(CliError::Usage("--max-batch-size must be positive".into()));
    }
    let stores: Vec<String> = (1..=options.stores).map(|i| format!("{i:03}")).collect();
    let db = match &options.ledger {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    let config = EngineConfig::new(CORP).with_extract_thread_count(options.threads);
    let mut builder = SyncEngine::builder(config, registry(&stores, options.max_batch_size))
        .with_database(Arc::new(db))
        .with_source(source(options.rows)?);
    if let Some(path) = &options.staging {
        let staging: Arc<dyn StagingStore> = Arc::new(FileStaging::open(path)?);
        builder = builder.with_staging(staging);
    }
    let engine = builder.build()?;

    let transport = StreamTransport::new(out);
    let mut results = Vec::with_capacity(stores.len());
    for store in &stores {
        let started = Instant::now();
        let load_id = engine.insert_reload(store, false, &[])?.load_id;
        let mut batches = 0;
        let mut rounds = 0;
        loop {
            rounds += 1;
            for batch in engine.extract(store, DEFAULT_QUEUE, &transport)? {
                engine.ack(store, batch.batch_id, AckResult::Ok)?;
                batches += 1;
            }
            let status = engine.database().read(|t| t.reload_status(load_id).cloned());
            if let Some(status) = status.filter(|s| s.completed) {
                tracing::info!(node_id = %store, load_id, batches, rows = status.rows_loaded, "store loaded");
                results.push(StoreLoad {
                    node_id: store.clone(),
                    load_id,
                    batches,
                    rows: status.rows_loaded,
                    rounds,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                break;
            }
            if rounds >= MAX_ROUNDS {
                return Err(CliError::Usage(format!(
                    "load {load_id} of store {store} did not finish in {MAX_ROUNDS} rounds"
                )));
            }
            engine.queue_work(true)?;
        }
    }
    engine.database().checkpoint()?;
    Ok(results)
}

/// Runs the demo command.
pub fn run(options: &DemoOptions, format: Format) -> CliResult<()> {
    let results = if options.wire {
        let mut stdout = io::stdout();
        demo(options, &mut stdout)?
    } else {
        demo(options, &mut io::sink())?
    };
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        Format::Text => {
            for load in &results {
                println!(
                    "store {}  load {}  {} batches  {} rows  {} rounds  {} ms",
                    load.node_id, load.load_id, load.batches, load.rows, load.rounds, load.elapsed_ms
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::inspect::inspect;

    fn options() -> DemoOptions {
        DemoOptions {
            stores: 2,
            rows: 150,
            max_batch_size: 1000,
            threads: 2,
            ledger: None,
            staging: None,
            wire: true,
        }
    }

    #[test]
    fn every_store_gets_both_tables() {
        let mut wire = Vec::new();
        let loads = demo(&options(), &mut wire).unwrap();

        assert_eq!(loads.len(), 2);
        for load in &loads {
            assert_eq!(load.rows, 300);
            assert_eq!(load.batches, 3);
        }
        let text = String::from_utf8(wire).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("insert,")).count(), 600);
    }

    #[test]
    fn persisted_run_leaves_an_inspectable_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let options = DemoOptions {
            stores: 1,
            ledger: Some(dir.path().join("ledger")),
            staging: Some(dir.path().join("staging")),
            ..options()
        };
        demo(&options, &mut io::sink()).unwrap();

        let result = inspect(&dir.path().join("ledger"), true).unwrap();
        assert_eq!(result.batches.get("OK"), Some(&3));
        let loads = result.loads.unwrap();
        assert_eq!(loads[0].state, "completed");
    }

    #[test]
    fn small_batch_size_splits_the_load() {
        let options = DemoOptions {
            stores: 1,
            max_batch_size: 40,
            ..options()
        };
        let loads = demo(&options, &mut io::sink()).unwrap();

        // 150 rows per table in batches of 40, plus the setup batch.
        assert_eq!(loads[0].batches, 9);
        assert_eq!(loads[0].rows, 300);
    }

    #[test]
    fn zero_stores_is_rejected() {
        let options = DemoOptions { stores: 0, ..options() };
        assert!(matches!(demo(&options, &mut io::sink()), Err(CliError::Usage(_))));
    }
}
