//! Change-to-batch assignment.

use batchsync_core::{Channel, SEQ_OUTGOING_BATCH};
use batchsync_protocol::{ChangeRecord, DataEvent, OutgoingBatch};
use std::collections::BTreeMap;

use crate::context::{in_transaction, EngineContext};
use crate::error::SyncResult;

const ROUTE_PAGE_SIZE: usize = 1000;

/// Assigns captured changes to outgoing batches.
pub struct Router<'a> {
    ctx: &'a EngineContext,
}

impl<'a> Router<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Routes every change captured since the last run.
    ///
    /// Returns the number of data events written.
    pub fn route(&self) -> SyncResult<usize> {
        let mut total = 0;
        loop {
            let records = self
                .ctx
                .db
                .read(|t| t.data_after(t.routed_up_to(), ROUTE_PAGE_SIZE));
            let Some(last) = records.last().map(|r| r.data_id) else {
                break;
            };
            let page = records.len();
            total += self.route_page(records, last)?;
            if page < ROUTE_PAGE_SIZE {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(events = total, "routed changes");
        }
        Ok(total)
    }

    /// Routes one page in one transaction.
    ///
    /// Batches are only filled within the page that opened them. Once
    /// committed they belong to extraction and are never appended to.
    fn route_page(&self, records: Vec<ChangeRecord>, last: u64) -> SyncResult<usize> {
        let now = self.ctx.now();
        in_transaction(&self.ctx.db, |txn| {
            let mut open: BTreeMap<(String, String), OutgoingBatch> = BTreeMap::new();
            let mut events = 0;
            for record in &records {
                if record.is_prerouted {
                    continue;
                }
                let Some(channel) = self.ctx.registry.channel(&record.channel_id) else {
                    tracing::warn!(data_id = record.data_id, channel = %record.channel_id, "change on unknown channel not routed");
                    continue;
                };
                for (node_id, router_id) in self.targets(record) {
                    let key = (node_id.clone(), channel.channel_id.clone());
                    let batch = match open.remove(&key) {
                        Some(batch) if batch.data_row_count < channel.max_batch_size => batch,
                        Some(full) => {
                            txn.update_outgoing_batch(&full)?;
                            self.new_batch(&node_id, &channel, now)?
                        }
                        None => self.new_batch(&node_id, &channel, now)?,
                    };
                    let mut batch = batch;
                    if txn.outgoing_batch(batch.batch_id).is_none() {
                        txn.insert_outgoing_batch(batch.clone())?;
                    }
                    txn.insert_data_event(DataEvent {
                        data_id: record.data_id,
                        batch_id: batch.batch_id,
                        router_id,
                    });
                    batch.increment_event_count(record.event_type);
                    batch.last_update_time = now;
                    open.insert(key, batch);
                    events += 1;
                }
            }
            for batch in open.values() {
                txn.update_outgoing_batch(batch)?;
            }
            txn.set_routed_up_to(last);
            Ok(events)
        })
    }

    fn new_batch(&self, node_id: &str, channel: &Channel, now: u64) -> SyncResult<OutgoingBatch> {
        let batch_id = self.ctx.sequences.next_val(SEQ_OUTGOING_BATCH)?;
        tracing::debug!(batch_id, node_id, channel = %channel.channel_id, "opened batch");
        Ok(OutgoingBatch::new(batch_id, node_id, &channel.channel_id, now))
    }

    /// (node, router) pairs a record goes to.
    fn targets(&self, record: &ChangeRecord) -> Vec<(String, String)> {
        let origin = record.source_node_id.as_deref();
        if let Some(nodes) = &record.node_list {
            return nodes
                .iter()
                .filter(|n| Some(n.as_str()) != origin)
                .map(|n| (n.clone(), "explicit".to_string()))
                .collect();
        }
        let mut targets = Vec::new();
        for tr in self
            .ctx
            .trigger_routers
            .trigger_routers_for_source_group(self.ctx.node_group_id())
            .iter()
            .filter(|tr| tr.table_name().eq_ignore_ascii_case(&record.table_name))
        {
            for node in self.ctx.registry.nodes_in_group(&tr.router.target_node_group_id) {
                let pair = (node.node_id, tr.router_id().to_string());
                if Some(pair.0.as_str()) != origin
                    && pair.0 != self.ctx.node_id()
                    && !targets.iter().any(|(n, _): &(String, String)| n == &pair.0)
                {
                    targets.push(pair);
                }
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{self, config, TestEngine, DEFAULT_CHANNEL, STORE, STORE_2};
    use crate::extract::DataExtractor;
    use crate::process::ProcessKind;
    use crate::transport::MockTransport;
    use batchsync_core::Channel;
    use batchsync_protocol::{ChangeRecord, DataEventType, OutgoingBatch, WireLine};
    use batchsync_storage::{StagingKey, StagingStore};

    fn capture(t: &TestEngine, channel: &str, count: usize) {
        for i in 0..count {
            let record = ChangeRecord::new("orders", DataEventType::Insert, channel).with_row_data(format!("{i},x"));
            t.engine.capture_change(record).unwrap();
        }
    }

    fn batches(t: &TestEngine, node: &str) -> Vec<OutgoingBatch> {
        t.ctx().db.read(|tables| tables.outgoing_batches_for_node(node))
    }

    #[test]
    fn changes_fan_out_to_every_node_of_the_group() {
        let t = test_support::engine(config());
        capture(&t, DEFAULT_CHANNEL, 3);

        assert_eq!(t.engine.route().unwrap(), 6);
        assert_eq!(t.engine.route().unwrap(), 0);

        for node in [STORE, STORE_2] {
            let batches = batches(&t, node);
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].data_row_count, 3);
            assert_eq!(batches[0].data_insert_row_count, 3);
            let data = t.ctx().db.read(|tables| tables.data_event_count(batches[0].batch_id));
            assert_eq!(data, 3);
        }
    }

    #[test]
    fn full_batches_roll_over() {
        let t = test_support::engine(config());
        t.ctx().registry.add_channel(Channel::new("small", 2));
        capture(&t, "small", 5);

        t.engine.route().unwrap();

        let rows: Vec<u64> = batches(&t, STORE).iter().map(|b| b.data_row_count).collect();
        assert_eq!(rows, vec![2, 2, 1]);
    }

    #[test]
    fn later_changes_open_a_new_batch() {
        let t = test_support::engine(config());
        capture(&t, DEFAULT_CHANNEL, 1);
        t.engine.route().unwrap();
        capture(&t, DEFAULT_CHANNEL, 1);
        t.engine.route().unwrap();

        let rows: Vec<u64> = batches(&t, STORE).iter().map(|b| b.data_row_count).collect();
        assert_eq!(rows, vec![1, 1]);
    }

    #[test]
    fn change_routed_during_extraction_is_not_lost() {
        let t = test_support::engine(config());
        capture(&t, DEFAULT_CHANNEL, 1);
        t.engine.route().unwrap();
        let first = batches(&t, STORE)[0].clone();
        let key = StagingKey::outgoing(&first.staged_location, first.batch_id);
        let handle = t.ctx().processes.register(ProcessKind::Extract, STORE, None, t.ctx().now());
        DataExtractor::new(t.ctx()).extract_to_staging(first.clone(), &handle).unwrap();

        capture(&t, DEFAULT_CHANNEL, 1);
        t.engine.route().unwrap();
        let transport = MockTransport::new();
        t.engine.extract(STORE, "default", &transport).unwrap();

        let after = batches(&t, STORE);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].data_row_count, 1);
        assert_eq!(t.ctx().db.read(|tables| tables.data_event_count(first.batch_id)), 1);
        assert!(t.staging.find(&key).unwrap().is_some());
        assert_eq!(transport.committed_batches(), vec![first.batch_id, after[1].batch_id]);
        let second = transport.batch_lines(after[1].batch_id).unwrap();
        assert!(second.contains(&WireLine::Insert("0,x".into())));
    }

    #[test]
    fn origin_node_does_not_get_its_own_change_back() {
        let t = test_support::engine(config());
        let record = ChangeRecord::new("orders", DataEventType::Update, DEFAULT_CHANNEL)
            .with_row_data("1,y")
            .with_source_node(STORE);
        t.engine.capture_change(record).unwrap();
        let explicit = ChangeRecord::new("orders", DataEventType::Delete, DEFAULT_CHANNEL)
            .with_pk_data("2")
            .with_node_list(vec![STORE.to_string(), STORE_2.to_string()])
            .with_source_node(STORE_2);
        t.engine.capture_change(explicit).unwrap();

        assert_eq!(t.engine.route().unwrap(), 2);
        assert_eq!(batches(&t, STORE)[0].data_delete_row_count, 1);
        assert_eq!(batches(&t, STORE_2)[0].data_update_row_count, 1);
    }
}
