//! Reload orchestration: turns reload requests into setup, data and
//! finalize batches plus the extract requests that fill the data batches.

mod ordering;
mod queue;

pub use ordering::{order_trigger_routers, sort_tables, TableNode};
pub(crate) use queue::InitialLoadQueue;

use batchsync_core::{
    Channel, ClusterLockGuard, Node, Transaction, TriggerRouter, SEQ_DATA, SEQ_EXTRACT_REQUEST,
    SEQ_LOAD_ID, SEQ_OUTGOING_BATCH, SYNC_TRIGGERS,
};
use batchsync_protocol::{
    BatchStatus, ChangeRecord, DataEvent, DataEventType, ExtractRequest, ExtractStatus,
    OutgoingBatch, TableReloadRequest, TableReloadStatus,
};
use std::collections::BTreeMap;

use crate::context::{in_transaction, EngineContext};
use crate::error::{SyncError, SyncResult, GENERIC_ERROR_CODE};
use crate::process::{ProcessInfo, ProcessKind, ProcessStatus};

/// Router id recorded on data events of reload batches.
const RELOAD_ROUTER_ID: &str = "reload";

/// What a successful reload insertion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    /// Load id of the reload.
    pub load_id: u64,
    /// Extract requests created, by trigger history id.
    pub extract_requests: BTreeMap<u32, ExtractRequest>,
}

/// One table of a reload with the request that asked for it.
struct ReloadTable {
    trigger_router: TriggerRouter,
    request: Option<TableReloadRequest>,
}

impl ReloadTable {
    fn create_table(&self) -> bool {
        self.request.as_ref().map_or(false, |r| r.create_table)
    }

    fn delete_first(&self) -> bool {
        self.request.as_ref().map_or(false, |r| r.delete_first)
    }

    fn before_custom_sql(&self) -> Option<&str> {
        self.request.as_ref().and_then(|r| r.before_custom_sql.as_deref())
    }

    /// Selection predicate: the request's own, else the trigger router's.
    fn predicate(&self) -> Option<&str> {
        self.request
            .as_ref()
            .and_then(|r| r.reload_select.as_deref())
            .or(self.trigger_router.initial_load_select.as_deref())
    }

    fn table_name(&self) -> &str {
        self.trigger_router.table_name()
    }
}

/// Running counters of one reload insertion.
#[derive(Default)]
struct ReloadCounts {
    setup: u64,
    data: u64,
    finalize: u64,
    rows: u64,
    first_data_batch_id: Option<u64>,
    last_data_batch_id: u64,
    last_setup_batch_id: u64,
}

/// Inserts reload events for one target node.
pub(crate) struct ReloadService<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ReloadService<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Creates the batches and extract requests of a reload of `target`.
    ///
    /// `requests` selects the scope: empty or a single wildcard request is a
    /// full load, a single request naming a channel loads that channel, and
    /// anything else loads the named trigger/router pairs. `parents` holds
    /// extract requests created for another target in the same round;
    /// tables found there become child requests sharing that extraction.
    ///
    /// Everything is inserted in one transaction, or one per table when
    /// reloads are not transactional. On failure the load is recorded as
    /// cancelled with the error and the requests keep the load id for a
    /// retry.
    pub(crate) fn insert_reload_events(
        &self,
        target: &Node,
        reverse: bool,
        requests: &[TableReloadRequest],
        parents: &BTreeMap<u32, ExtractRequest>,
    ) -> SyncResult<ReloadOutcome> {
        let _guard = ClusterLockGuard::try_acquire(self.ctx.cluster.as_ref(), SYNC_TRIGGERS)?
            .ok_or_else(|| SyncError::LockTimeout {
                key: SYNC_TRIGGERS.to_string(),
            })?;
        let process = self.ctx.processes.register(
            ProcessKind::InsertReloadEvents,
            &target.node_id,
            None,
            self.ctx.now(),
        );
        let info = process.info();

        let load_id = match requests.iter().map(|r| r.load_id).find(|id| *id != 0) {
            Some(existing) => existing,
            None => self.ctx.sequences.next_val(SEQ_LOAD_ID)?,
        };
        info.set_load_id(load_id);
        let create_time = requests.first().map_or(0, |r| r.create_time);
        let full = is_full_load(requests);

        let result = self
            .select_tables(target, requests)
            .and_then(|tables| self.insert_all(target, reverse, full, load_id, &tables, parents, &info));
        match result {
            Ok(extract_requests) => {
                let now = self.ctx.now();
                let (purged, released) = self.ctx.db.write(|t| {
                    if create_time != 0 {
                        t.mark_reload_requests_processed(
                            &target.node_id,
                            self.ctx.node_id(),
                            create_time,
                            load_id,
                            now,
                        );
                    }
                    Ok((
                        t.purge_incoming_for_node(&target.node_id),
                        t.release_missed_extract_requests(now),
                    ))
                })?;
                tracing::info!(
                    load_id,
                    node_id = %target.node_id,
                    reverse,
                    tables = extract_requests.len(),
                    purged,
                    released,
                    "reload events inserted"
                );
                Ok(ReloadOutcome {
                    load_id,
                    extract_requests,
                })
            }
            Err(e) => {
                info.set_status(ProcessStatus::Error);
                self.record_failure(target, load_id, create_time, &e);
                Err(e)
            }
        }
    }

    /// Resolves the trigger routers taking part, in load order.
    fn select_tables(&self, target: &Node, requests: &[TableReloadRequest]) -> SyncResult<Vec<ReloadTable>> {
        let source_group = self.ctx.node_group_id();
        let link: Vec<TriggerRouter> = self
            .ctx
            .trigger_routers
            .trigger_routers_for_link(source_group, &target.node_group_id)
            .into_iter()
            .filter(|tr| tr.enabled)
            .collect();

        let full = is_full_load(requests);
        let channel = match requests {
            [only] if only.is_channel_request() => only.channel_id.clone(),
            _ => None,
        };

        let mut selected: Vec<ReloadTable> = if full || channel.is_some() {
            link.into_iter()
                .filter(|tr| channel.as_deref().map_or(true, |c| tr.trigger.channel_id == c))
                .map(|trigger_router| ReloadTable {
                    trigger_router,
                    request: requests.first().cloned(),
                })
                .collect()
        } else {
            let mut tables = Vec::with_capacity(requests.len());
            for request in requests {
                let tr = self
                    .ctx
                    .trigger_routers
                    .find(source_group, &request.trigger_id, &request.router_id)?;
                if tr.router.target_node_group_id != target.node_group_id {
                    return Err(SyncError::validation(format!(
                        "router '{}' does not send to node group '{}'",
                        request.router_id, target.node_group_id
                    )));
                }
                tables.push(ReloadTable {
                    trigger_router: tr,
                    request: Some(request.clone()),
                });
            }
            tables
        };

        let order: Vec<TriggerRouter> = order_trigger_routers(
            selected.iter().map(|t| t.trigger_router.clone()).collect(),
            self.ctx.source.as_ref(),
        );
        let mut ordered = Vec::with_capacity(selected.len());
        for tr in order {
            if let Some(pos) = selected.iter().position(|t| {
                t.trigger_router.trigger_id() == tr.trigger_id() && t.trigger_router.router_id() == tr.router_id()
            }) {
                ordered.push(selected.swap_remove(pos));
            }
        }
        Ok(ordered)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_all(
        &self,
        target: &Node,
        reverse: bool,
        full: bool,
        load_id: u64,
        tables: &[ReloadTable],
        parents: &BTreeMap<u32, ExtractRequest>,
        process: &ProcessInfo,
    ) -> SyncResult<BTreeMap<u32, ExtractRequest>> {
        let transactional = self.ctx.config.transactional_reload;
        in_transaction(&self.ctx.db, |txn| {
            let mut counts = ReloadCounts::default();
            self.ctx.listeners.before_reload(txn, target, load_id)?;

            for table in tables {
                process.check_interrupted()?;
                self.insert_create_batch(txn, target, load_id, table, &mut counts)?;
            }
            // Children are emptied before their parents.
            for table in tables.iter().rev() {
                process.check_interrupted()?;
                self.insert_delete_batch(txn, target, load_id, table, &mut counts)?;
            }
            for table in tables.iter().rev() {
                self.insert_before_sql_batches(txn, target, load_id, table, &mut counts)?;
            }
            self.insert_node_security_marker(txn, target, reverse, load_id, &mut counts)?;
            if !transactional {
                txn.commit_point()?;
            }

            let mut created = BTreeMap::new();
            for table in tables {
                process.check_interrupted()?;
                process.set_current_table(Some(table.table_name()));
                if let Some(request) =
                    self.insert_data_batches(txn, target, load_id, table, parents, &mut counts)?
                {
                    created.insert(request.trigger_hist_id, request);
                }
                if !transactional {
                    txn.commit_point()?;
                }
            }
            process.set_current_table(None);

            if let Some(sql) = &self.ctx.config.after_reload_sql {
                let channel = self.reload_channel_for(tables.first())?;
                self.insert_event_batch(txn, target, load_id, &channel, event_record("", DataEventType::Sql, &channel, sql))?;
                counts.finalize += 1;
            }

            self.write_status(txn, target, reverse, full, load_id, tables.len() as u64, &counts)?;
            self.ctx.listeners.after_reload(txn, target, load_id)?;
            Ok(created)
        })
    }

    fn insert_create_batch(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        table: &ReloadTable,
        counts: &mut ReloadCounts,
    ) -> SyncResult<()> {
        if !(self.ctx.config.create_first || table.create_table()) {
            return Ok(());
        }
        let channel = self.reload_channel(&table.trigger_router)?;
        let name = table.table_name();
        let columns = self
            .ctx
            .source
            .table(name)
            .map(|def| def.columns.join(","))
            .unwrap_or_default();
        let record = event_record(name, DataEventType::Create, &channel, &columns);
        self.insert_setup_batch(txn, target, load_id, &channel, record, counts)
    }

    fn insert_delete_batch(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        table: &ReloadTable,
        counts: &mut ReloadCounts,
    ) -> SyncResult<()> {
        if !(self.ctx.config.delete_first || table.delete_first()) {
            return Ok(());
        }
        let channel = self.reload_channel(&table.trigger_router)?;
        let name = table.table_name();
        let stmt = table
            .trigger_router
            .initial_load_delete_stmt
            .clone()
            .unwrap_or_else(|| format!("delete from {name}"));
        let record = event_record(name, DataEventType::Sql, &channel, &stmt);
        self.insert_setup_batch(txn, target, load_id, &channel, record, counts)
    }

    /// Configured and per-request SQL run ahead of the data.
    fn insert_before_sql_batches(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        table: &ReloadTable,
        counts: &mut ReloadCounts,
    ) -> SyncResult<()> {
        let channel = self.reload_channel(&table.trigger_router)?;
        let name = table.table_name();
        let statements = self
            .ctx
            .config
            .before_reload_sql
            .as_deref()
            .into_iter()
            .chain(table.before_custom_sql());
        for sql in statements {
            let record = event_record(name, DataEventType::Sql, &channel, sql);
            self.insert_setup_batch(txn, target, load_id, &channel, record, counts)?;
        }
        Ok(())
    }

    fn insert_setup_batch(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        channel: &Channel,
        record: ChangeRecord,
        counts: &mut ReloadCounts,
    ) -> SyncResult<()> {
        let batch_id = self.insert_event_batch(txn, target, load_id, channel, record)?;
        counts.setup += 1;
        counts.last_setup_batch_id = batch_id;
        Ok(())
    }

    /// Tells the target a load is in progress, ahead of any data.
    fn insert_node_security_marker(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        reverse: bool,
        load_id: u64,
        counts: &mut ReloadCounts,
    ) -> SyncResult<()> {
        let channel = self.reload_channel_for(None)?;
        let columns = if reverse {
            ("rev_initial_load_enabled", "rev_initial_load_id")
        } else {
            ("initial_load_enabled", "initial_load_id")
        };
        let sql = format!(
            "update node_security set {}=1, {}={} where node_id='{}'",
            columns.0, columns.1, load_id, self.ctx.node_id()
        );
        let record = event_record("node_security", DataEventType::Sql, &channel, &sql);
        self.insert_setup_batch(txn, target, load_id, &channel, record, counts)
    }

    /// Reserves the data batches of one table.
    ///
    /// With the extract job the range is left RQ for an extract request;
    /// otherwise one NE batch carries a RELOAD event expanded at extraction.
    fn insert_data_batches(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        table: &ReloadTable,
        parents: &BTreeMap<u32, ExtractRequest>,
        counts: &mut ReloadCounts,
    ) -> SyncResult<Option<ExtractRequest>> {
        let tr = &table.trigger_router;
        let channel = self.reload_channel(tr)?;
        let name = table.table_name();
        let predicate = table.predicate();
        let rows = if self.ctx.config.use_estimated_counts && predicate.is_none() {
            self.ctx.source.estimated_row_count(name)?
        } else {
            self.ctx.source.count_rows(name, predicate)?
        };
        let hist_id = self
            .ctx
            .registry
            .latest_history(tr.trigger_id())
            .map_or(0, |h| h.trigger_hist_id);
        counts.rows += rows;

        if !self.ctx.config.use_extract_job {
            let mut record = ChangeRecord::new(name, DataEventType::Reload, &channel.channel_id)
                .with_trigger_hist_id(hist_id);
            if let Some(predicate) = predicate {
                record = record.with_row_data(predicate);
            }
            let batch_id = self.insert_event_batch(txn, target, load_id, &channel, record)?;
            counts.data += 1;
            counts.first_data_batch_id.get_or_insert(batch_id);
            counts.last_data_batch_id = batch_id;
            return Ok(None);
        }

        let multiplier = self
            .ctx
            .transforms
            .multiplier(self.ctx.node_group_id(), &target.node_group_id, name)
            .max(1);
        let batch_count = batch_count(rows, multiplier, channel.max_batch_size);
        let start = self.ctx.sequences.next_range(SEQ_OUTGOING_BATCH, batch_count)?;
        let end = start + batch_count - 1;
        let now = self.ctx.now();
        for batch_id in start..=end {
            let mut batch = OutgoingBatch::new(batch_id, &target.node_id, &channel.channel_id, now)
                .with_load(load_id)
                .with_status(BatchStatus::Requested);
            batch.extract_job_flag = true;
            txn.insert_outgoing_batch(batch)?;
        }
        counts.data += batch_count;
        counts.first_data_batch_id.get_or_insert(start);
        counts.last_data_batch_id = end;

        let parent_request_id = parents
            .get(&hist_id)
            .filter(|p| {
                p.batch_count() == batch_count
                    && p.status != ExtractStatus::Ok
                    && p.table_name.eq_ignore_ascii_case(name)
                    && self.ctx.group_of(&p.node_id) == target.node_group_id
            })
            .map_or(0, |p| p.request_id);
        let request = ExtractRequest {
            request_id: self.ctx.sequences.next_val(SEQ_EXTRACT_REQUEST)?,
            node_id: target.node_id.clone(),
            queue: channel.queue.clone(),
            status: ExtractStatus::New,
            start_batch_id: start,
            end_batch_id: end,
            trigger_id: tr.trigger_id().to_string(),
            router_id: tr.router_id().to_string(),
            trigger_hist_id: hist_id,
            load_id,
            table_name: name.to_string(),
            rows,
            parent_request_id,
            last_loaded_batch_id: 0,
            loaded_rows: 0,
            loaded_millis: 0,
            create_time: now,
            last_update_time: now,
        };
        txn.insert_extract_request(request.clone())?;
        tracing::debug!(
            load_id,
            node_id = %target.node_id,
            table = name,
            rows,
            start_batch_id = start,
            end_batch_id = end,
            parent = parent_request_id,
            "extract request queued"
        );
        Ok(Some(request))
    }

    /// Inserts `record` prerouted to `target` in a batch of its own.
    fn insert_event_batch(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        load_id: u64,
        channel: &Channel,
        record: ChangeRecord,
    ) -> SyncResult<u64> {
        let now = self.ctx.now();
        let data_id = self.ctx.sequences.next_val(SEQ_DATA)?;
        let mut record = record
            .with_node_list(vec![target.node_id.clone()])
            .with_source_node(self.ctx.node_id());
        record.data_id = data_id;
        record.is_prerouted = true;
        record.create_time = now;
        let event_type = record.event_type;

        let batch_id = self.ctx.sequences.next_val(SEQ_OUTGOING_BATCH)?;
        let mut batch = OutgoingBatch::new(batch_id, &target.node_id, &channel.channel_id, now).with_load(load_id);
        batch.increment_event_count(event_type);
        txn.insert_data(record)?;
        txn.insert_data_event(DataEvent {
            data_id,
            batch_id,
            router_id: RELOAD_ROUTER_ID.to_string(),
        });
        txn.insert_outgoing_batch(batch)?;
        Ok(batch_id)
    }

    fn write_status(
        &self,
        txn: &mut Transaction<'_>,
        target: &Node,
        reverse: bool,
        full: bool,
        load_id: u64,
        table_count: u64,
        counts: &ReloadCounts,
    ) -> SyncResult<()> {
        let now = self.ctx.now();
        let mut status = TableReloadStatus::new(load_id, self.ctx.node_id(), &target.node_id, now);
        status.full_load = full;
        status.setup_batch_count = counts.setup;
        status.data_batch_count = counts.data;
        status.finalize_batch_count = counts.finalize;
        status.table_count = table_count;
        status.rows_count = counts.rows;
        match counts.first_data_batch_id {
            Some(first) => {
                status.start_data_batch_id = first;
                status.end_data_batch_id = counts.last_data_batch_id;
            }
            None => {
                status.start_data_batch_id = counts.last_setup_batch_id + 1;
                status.end_data_batch_id = counts.last_setup_batch_id;
            }
        }
        txn.put_reload_status(status);

        let mut security = txn
            .node_security(&target.node_id)
            .cloned()
            .unwrap_or_else(|| batchsync_core::NodeSecurity::new(&target.node_id));
        if reverse {
            security.rev_initial_load_enabled = false;
            security.rev_initial_load_id = load_id;
        } else {
            security.initial_load_enabled = false;
            security.initial_load_id = load_id;
            security.initial_load_time = Some(now);
            security.initial_load_end_time = None;
        }
        txn.put_node_security(security);
        Ok(())
    }

    /// Records a failed insertion as a cancelled load and tags the requests
    /// with its id. Partial work of a non-transactional reload is cancelled.
    fn record_failure(&self, target: &Node, load_id: u64, create_time: u64, error: &SyncError) {
        tracing::error!(load_id, node_id = %target.node_id, error = %error, "failed to insert reload events");
        let now = self.ctx.now();
        let source = self.ctx.node_id().to_string();
        let written = self.ctx.db.write(|t| {
            let mut status = t
                .reload_status(load_id)
                .cloned()
                .unwrap_or_else(|| TableReloadStatus::new(load_id, &source, &target.node_id, now));
            status.cancelled = true;
            status.end_time = Some(now);
            status.last_update_time = now;
            status.record_error(GENERIC_ERROR_CODE, Some(format!("{:?}", error.kind())), error.to_string());
            t.put_reload_status(status);
            if create_time != 0 {
                t.assign_load_to_reload_requests(&target.node_id, &source, create_time, load_id, now);
            }
            let requests = t.cancel_extract_requests(load_id, now);
            let batches = t.cancel_load_batches(load_id, now);
            Ok((requests, batches))
        });
        match written {
            Ok((requests, batches)) if requests + batches > 0 => {
                tracing::info!(load_id, requests, batches, "cancelled partial reload");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(load_id, error = %e, "failed to record reload failure"),
        }
    }

    fn reload_channel(&self, tr: &TriggerRouter) -> SyncResult<Channel> {
        Ok(self.ctx.registry.require_channel(&tr.trigger.reload_channel_id)?)
    }

    fn reload_channel_for(&self, table: Option<&ReloadTable>) -> SyncResult<Channel> {
        match table {
            Some(table) => self.reload_channel(&table.trigger_router),
            None => Ok(self.ctx.registry.require_channel(batchsync_core::RELOAD_CHANNEL)?),
        }
    }
}

fn is_full_load(requests: &[TableReloadRequest]) -> bool {
    match requests {
        [] => true,
        [only] => only.is_full_load_request(),
        _ => false,
    }
}

/// Number of batches needed for `rows` source rows, at least one.
pub fn batch_count(rows: u64, multiplier: u64, max_batch_size: u64) -> u64 {
    let statements = rows.saturating_mul(multiplier.max(1));
    statements.div_ceil(max_batch_size.max(1)).max(1)
}

fn event_record(table: &str, event_type: DataEventType, channel: &Channel, payload: &str) -> ChangeRecord {
    ChangeRecord::new(table, event_type, &channel.channel_id).with_row_data(payload)
}
