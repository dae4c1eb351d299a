//! Fixtures shared by the unit tests of this crate.

use batchsync_core::{
    Channel, ConfigRegistry, Database, ManualClock, MemorySource, Node, Router, SequenceGenerator,
    TableDef, Trigger, TriggerHistory, TriggerRouter, CONFIG_CHANNEL, RELOAD_CHANNEL, SEQ_DATA,
    SEQ_OUTGOING_BATCH,
};
use batchsync_protocol::{ChangeRecord, DataEvent, DataEventType, OutgoingBatch};
use batchsync_storage::InMemoryStaging;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::engine::SyncEngine;
use crate::transform::TransformStage;

pub(crate) const CORP: &str = "00000";
pub(crate) const STORE: &str = "001";
pub(crate) const STORE_2: &str = "002";
pub(crate) const DEFAULT_CHANNEL: &str = "default";

/// corp -> store link with `orders` and `order_items` (which references
/// `orders`) on the default channel.
pub(crate) fn registry() -> Arc<ConfigRegistry> {
    let registry = Arc::new(ConfigRegistry::new(Node::new(CORP, "corp")));
    registry.add_node(Node::new(STORE, "store"));
    registry.add_node(Node::new(STORE_2, "store"));
    registry.add_channel(Channel::new(DEFAULT_CHANNEL, 1000));
    registry.add_channel(Channel::new(RELOAD_CHANNEL, 100).reload());
    registry.add_channel(Channel::new(CONFIG_CHANNEL, 100));
    let router = Router::new("corp_to_store", "corp", "store");
    let tables = [
        ("orders", "orders", 10, 1, ["id", "customer"]),
        ("order_items", "order_items", 5, 2, ["id", "order_id"]),
    ];
    for (trigger, table, order, hist_id, columns) in tables {
        registry.add_history(TriggerHistory {
            trigger_hist_id: hist_id,
            trigger_id: trigger.to_string(),
            source_table_name: table.to_string(),
            column_names: columns.iter().map(|c| c.to_string()).collect(),
            pk_column_names: vec!["id".to_string()],
        });
        registry.add_trigger_router(
            TriggerRouter::new(Trigger::new(trigger, table, DEFAULT_CHANNEL), router.clone())
                .with_load_order(order),
        );
    }
    registry
}

pub(crate) fn source(orders: usize) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.add_table(TableDef::new("orders", &["id", "customer"]));
    source.add_table(
        TableDef::new("order_items", &["id", "order_id"]).with_foreign_key("orders", &["order_id"]),
    );
    for i in 0..orders {
        source
            .insert_row("orders", vec![Some(i.to_string()), Some(format!("customer-{i}"))])
            .unwrap();
        source
            .insert_row("order_items", vec![Some(i.to_string()), Some(i.to_string())])
            .unwrap();
    }
    source
}

pub(crate) struct TestEngine {
    pub(crate) engine: SyncEngine,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) staging: Arc<InMemoryStaging>,
}

pub(crate) fn engine(config: EngineConfig) -> TestEngine {
    engine_with_source(config, source(3))
}

pub(crate) fn engine_with_source(config: EngineConfig, source: Arc<MemorySource>) -> TestEngine {
    build(config, source, None, None)
}

pub(crate) fn engine_with_database(config: EngineConfig, db: Arc<Database>) -> TestEngine {
    build(config, source(3), Some(db), None)
}

pub(crate) fn engine_with_transforms(config: EngineConfig, transforms: Arc<dyn TransformStage>) -> TestEngine {
    build(config, source(3), None, Some(transforms))
}

fn build(
    config: EngineConfig,
    source: Arc<MemorySource>,
    db: Option<Arc<Database>>,
    transforms: Option<Arc<dyn TransformStage>>,
) -> TestEngine {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let staging = Arc::new(InMemoryStaging::new());
    let mut builder = SyncEngine::builder(config, registry())
        .with_clock(clock.clone())
        .with_staging(staging.clone())
        .with_source(source);
    if let Some(db) = db {
        builder = builder.with_database(db);
    }
    if let Some(transforms) = transforms {
        builder = builder.with_transforms(transforms);
    }
    let engine = builder.build().unwrap();
    TestEngine {
        engine,
        clock,
        staging,
    }
}

pub(crate) fn config() -> EngineConfig {
    EngineConfig::new(CORP)
}

impl TestEngine {
    pub(crate) fn ctx(&self) -> &EngineContext {
        self.engine.context()
    }

    /// Inserts an NE batch for `node_id` holding `rows` inserts of
    /// `payload_len` bytes each.
    pub(crate) fn add_batch(&self, node_id: &str, channel_id: &str, rows: usize, payload_len: usize) -> OutgoingBatch {
        let ctx = self.ctx();
        let now = ctx.now();
        let batch_id = ctx.sequences.next_val(SEQ_OUTGOING_BATCH).unwrap();
        let mut batch = OutgoingBatch::new(batch_id, node_id, channel_id, now);
        let mut records = Vec::with_capacity(rows);
        for _ in 0..rows {
            let mut record = ChangeRecord::new("orders", DataEventType::Insert, channel_id)
                .with_row_data("x".repeat(payload_len))
                .with_node_list(vec![node_id.to_string()]);
            record.data_id = ctx.sequences.next_val(SEQ_DATA).unwrap();
            record.is_prerouted = true;
            batch.increment_event_count(DataEventType::Insert);
            records.push(record);
        }
        ctx.db
            .write(|t| {
                for record in records {
                    t.insert_data_event(DataEvent {
                        data_id: record.data_id,
                        batch_id,
                        router_id: "test".into(),
                    });
                    t.insert_data(record)?;
                }
                t.insert_outgoing_batch(batch.clone())
            })
            .unwrap();
        batch
    }

    pub(crate) fn batch(&self, batch_id: u64) -> OutgoingBatch {
        self.ctx()
            .db
            .read(|t| t.require_outgoing_batch(batch_id).cloned())
            .unwrap()
    }
}
