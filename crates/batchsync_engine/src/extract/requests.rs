//! Background extraction of reload tables into their reserved batch ranges.

use batchsync_core::{ClusterLockGuard, INITIAL_LOAD_EXTRACT};
use batchsync_protocol::{
    BatchStatus, ChangeRecord, DataEventType, ExtractRequest, ExtractStatus, OutgoingBatch,
};
use batchsync_storage::StagingKey;
use std::time::Instant;

use super::staging_writer::MultiBatchStagingWriter;
use crate::context::{in_transaction, EngineContext};
use crate::error::{SyncError, SyncResult, GENERIC_ERROR_CODE};
use crate::policy::save_batch;
use crate::process::{ProcessInfo, ProcessKind, ProcessStatus};

/// Rows read from the source per page.
const SELECT_PAGE_SIZE: u64 = 1000;

/// Outcome of one (node, queue) pass of the extract job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQueueStatus {
    /// Target node.
    pub node_id: String,
    /// Channel queue.
    pub queue: String,
    /// Requests completed.
    pub requests: usize,
    /// Batches staged.
    pub batches: u64,
    /// Source rows read.
    pub rows: u64,
    /// Why the pass stopped early, if it did.
    pub error: Option<String>,
}

/// Works off pending extract requests.
pub(crate) struct ExtractRequestService<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ExtractRequestService<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Processes every pending root request, one (node, queue) at a time.
    ///
    /// Without `force`, nothing happens unless the cluster-wide extract lock
    /// is free.
    pub(crate) fn queue_work(&self, force: bool) -> SyncResult<Vec<NodeQueueStatus>> {
        let _guard = if force {
            None
        } else {
            match ClusterLockGuard::try_acquire(self.ctx.cluster.as_ref(), INITIAL_LOAD_EXTRACT)? {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!("extract job lock held elsewhere");
                    return Ok(Vec::new());
                }
            }
        };
        let now = self.ctx.now();
        let released = self.ctx.db.write(|t| Ok(t.release_missed_extract_requests(now)))?;
        if released > 0 {
            tracing::info!(released, "released extract requests left behind by their parents");
        }

        let queues = self.ctx.db.read(|t| t.extract_request_queues());
        let mut statuses = Vec::with_capacity(queues.len());
        for (node_id, queue) in queues {
            statuses.push(self.process_queue(&node_id, &queue));
        }
        Ok(statuses)
    }

    fn process_queue(&self, node_id: &str, queue: &str) -> NodeQueueStatus {
        let mut status = NodeQueueStatus {
            node_id: node_id.to_string(),
            queue: queue.to_string(),
            requests: 0,
            batches: 0,
            rows: 0,
            error: None,
        };
        let process = self.ctx.processes.register(
            ProcessKind::ExtractRequest,
            node_id,
            Some(queue),
            self.ctx.now(),
        );
        let info = process.info();
        let pending = self.ctx.db.read(|t| t.pending_extract_requests(node_id, queue));
        for request in pending {
            info.set_load_id(request.load_id);
            match self.process_request(request, &info) {
                Ok((batches, rows)) => {
                    status.requests += 1;
                    status.batches += batches;
                    status.rows += rows;
                }
                Err(e) => {
                    info.set_status(ProcessStatus::Error);
                    status.error = Some(e.to_string());
                    break;
                }
            }
        }
        status
    }

    /// Extracts one root request and its children. Returns (batches, rows).
    fn process_request(&self, request: ExtractRequest, process: &ProcessInfo) -> SyncResult<(u64, u64)> {
        let children = self.ctx.db.read(|t| t.child_extract_requests(request.request_id));
        let cancelled = self
            .ctx
            .db
            .read(|t| t.reload_status(request.load_id).map_or(false, |s| s.cancelled));
        if cancelled {
            tracing::info!(request_id = request.request_id, load_id = request.load_id, "load cancelled, dropping extract request");
            self.set_status(&request, &children, ExtractStatus::Ok)?;
            return Ok((0, 0));
        }

        self.set_status(&request, &children, ExtractStatus::Loading)?;
        let started = Instant::now();
        let resumed_at = request.resume_batch_id();
        let first_batch = self
            .ctx
            .db
            .read(|t| t.require_outgoing_batch(request.start_batch_id).cloned())?;
        let channel = self.ctx.registry.require_channel(&first_batch.channel_id)?;
        let trigger_router =
            self.ctx
                .trigger_routers
                .find(self.ctx.node_group_id(), &request.trigger_id, &request.router_id)?;
        let target_group = self.ctx.group_of(&request.node_id);
        process.set_current_table(Some(&request.table_name));

        let mut writer = MultiBatchStagingWriter::new(
            self.ctx,
            process,
            request.clone(),
            children.clone(),
            &channel.channel_id,
            channel.max_batch_size,
        );
        let outcome = self.stream_rows(
            &mut writer,
            &request,
            trigger_router.initial_load_select.as_deref(),
            &channel.channel_id,
            &target_group,
            process,
        );
        let result = outcome.and_then(|rows| writer.finish().map(|done| (done, rows)));
        let ((request, children), rows) = match result {
            Ok(done) => done,
            Err(e) => {
                self.fail_request(&request, &e);
                return Err(e);
            }
        };

        self.set_status(&request, &children, ExtractStatus::Ok)?;
        let batches = request.end_batch_id + 1 - resumed_at;
        tracing::info!(
            request_id = request.request_id,
            node_id = %request.node_id,
            table = %request.table_name,
            load_id = request.load_id,
            batches,
            rows,
            children = children.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extract request done"
        );
        Ok((batches, rows))
    }

    /// Pages the source table into the writer, resuming after the checkpoint.
    fn stream_rows(
        &self,
        writer: &mut MultiBatchStagingWriter<'_>,
        request: &ExtractRequest,
        predicate: Option<&str>,
        channel_id: &str,
        target_group: &str,
        process: &ProcessInfo,
    ) -> SyncResult<u64> {
        let source_group = self.ctx.node_group_id();
        let mut offset = request.loaded_rows;
        let mut rows = 0;
        loop {
            process.check_interrupted()?;
            let page = self.ctx.source.select_rows(
                &request.table_name,
                predicate,
                offset,
                Some(SELECT_PAGE_SIZE),
            )?;
            let fetched = page.len() as u64;
            for row in page {
                let record = ChangeRecord::new(&request.table_name, DataEventType::Reload, channel_id)
                    .with_row_data(row.row_data)
                    .with_pk_data(row.pk_data)
                    .with_trigger_hist_id(request.trigger_hist_id);
                let out = self.ctx.transforms.apply(source_group, target_group, record);
                writer.write_source_row(&out)?;
                rows += 1;
            }
            if fetched < SELECT_PAGE_SIZE {
                return Ok(rows);
            }
            offset += fetched;
        }
    }

    /// Puts the batch being written in error. The request stays LOADING so
    /// the next pass resumes it.
    fn fail_request(&self, request: &ExtractRequest, error: &SyncError) {
        tracing::error!(
            request_id = request.request_id,
            node_id = %request.node_id,
            table = %request.table_name,
            error = %error,
            "extract request failed"
        );
        let failed_id = self
            .ctx
            .db
            .read(|t| t.extract_request(request.request_id).map(|r| r.resume_batch_id()))
            .unwrap_or(request.start_batch_id);
        let batch = self.ctx.db.read(|t| t.outgoing_batch(failed_id).cloned());
        if let Some(mut batch) = batch {
            if matches!(batch.status, BatchStatus::Ok | BatchStatus::Ignored) {
                return;
            }
            batch.record_error(GENERIC_ERROR_CODE, Some(format!("{:?}", error.kind())), error.to_string());
            batch.status = BatchStatus::Error;
            if let Err(e) = save_batch(self.ctx, &mut batch) {
                tracing::warn!(batch_id = failed_id, error = %e, "failed to record extract error on batch");
            }
        }
    }

    fn set_status(&self, request: &ExtractRequest, children: &[ExtractRequest], status: ExtractStatus) -> SyncResult<()> {
        let now = self.ctx.now();
        in_transaction(&self.ctx.db, |txn| {
            for id in std::iter::once(request.request_id).chain(children.iter().map(|c| c.request_id)) {
                if let Some(mut stored) = txn.extract_request(id).cloned() {
                    stored.status = status;
                    stored.last_update_time = now;
                    txn.update_extract_request(&stored)?;
                }
            }
            Ok(())
        })
    }

    /// Starts a request (and its family) over from its first batch.
    ///
    /// A child request restarts its parent. Batches of the range go back to
    /// RQ, load progress is reverted by what those batches had delivered and
    /// their staged payloads are removed. Returns the number of batches reset.
    pub(crate) fn restart_extract_request(&self, request_id: u64) -> SyncResult<usize> {
        let request = self
            .ctx
            .db
            .read(|t| t.extract_request(request_id).cloned())
            .ok_or_else(|| SyncError::validation(format!("unknown extract request {request_id}")))?;
        let root_id = if request.is_child() {
            request.parent_request_id
        } else {
            request.request_id
        };
        let (root, children) = self.ctx.db.read(|t| {
            (
                t.extract_request(root_id).cloned(),
                t.child_extract_requests(root_id),
            )
        });
        let root = root.ok_or_else(|| SyncError::validation(format!("unknown extract request {root_id}")))?;
        let family: Vec<ExtractRequest> = std::iter::once(root).chain(children).collect();

        let now = self.ctx.now();
        let reset = in_transaction(&self.ctx.db, |txn| {
            let mut reset = Vec::new();
            for member in &family {
                let batches = txn.outgoing_batches_in_range(&member.node_id, member.start_batch_id, member.end_batch_id);
                let (done, rows) = batches
                    .iter()
                    .filter(|b| b.status == BatchStatus::Ok)
                    .fold((0u64, 0u64), |(n, r), b| (n + 1, r + b.data_row_count));
                if let Some(status) = txn.reload_status_mut(member.load_id) {
                    status.revert_loaded(done, rows);
                    status.last_update_time = now;
                }
                for batch in &batches {
                    txn.reset_outgoing_batch(batch.batch_id, BatchStatus::Requested, now)?;
                }
                txn.clear_applied(&member.node_id, member.start_batch_id, member.end_batch_id);
                let mut stored = member.clone();
                stored.reset_progress();
                stored.last_update_time = now;
                txn.update_extract_request(&stored)?;
                reset.extend(batches);
            }
            Ok(reset)
        })?;

        for batch in &reset {
            self.remove_staged(batch)?;
        }
        tracing::info!(request_id = root_id, batches = reset.len(), "extract request restarted");
        Ok(reset.len())
    }

    fn remove_staged(&self, batch: &OutgoingBatch) -> SyncResult<()> {
        let key = StagingKey::outgoing(&batch.staged_location, batch.batch_id);
        if let Some(resource) = self.ctx.staging.find(&key)? {
            resource.delete()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{self, config, STORE};
    use crate::{AckResult, MockTransport};
    use batchsync_core::DEFAULT_QUEUE;
    use batchsync_protocol::{BatchStatus, ExtractStatus};
    use batchsync_storage::StagingStore;

    /// Loads 250 orders and items to the store, sends everything and
    /// acknowledges the first two order batches. Returns the load id.
    fn half_delivered(t: &test_support::TestEngine) -> u64 {
        let load_id = t.engine.insert_reload(STORE, false, &[]).unwrap().load_id;
        t.engine.queue_work(true).unwrap();
        let transport = MockTransport::new();
        let sent = t.engine.extract(STORE, DEFAULT_QUEUE, &transport).unwrap();
        assert_eq!(sent.len(), 7);
        let orders = t.ctx().db.read(|tb| tb.extract_requests_for_load(load_id))[0].clone();
        for batch_id in orders.start_batch_id..orders.start_batch_id + 2 {
            t.engine.ack(STORE, batch_id, AckResult::Ok).unwrap();
        }
        load_id
    }

    #[test]
    fn restart_resets_the_range_and_reverts_progress() {
        let t = test_support::engine_with_source(config(), test_support::source(250));
        let load_id = half_delivered(&t);
        let status = t.ctx().db.read(|tb| tb.reload_status(load_id).cloned()).unwrap();
        assert_eq!(status.data_batch_loaded, 2);
        assert_eq!(status.rows_loaded, 200);

        let orders = t.ctx().db.read(|tb| tb.extract_requests_for_load(load_id))[0].clone();
        assert_eq!(t.engine.restart_extract_request(orders.request_id).unwrap(), 3);

        let batches = t
            .ctx()
            .db
            .read(|tb| tb.outgoing_batches_in_range(STORE, orders.start_batch_id, orders.end_batch_id));
        assert!(batches.iter().all(|b| b.status == BatchStatus::Requested));
        let status = t.ctx().db.read(|tb| tb.reload_status(load_id).cloned()).unwrap();
        assert_eq!(status.data_batch_loaded, 0);
        assert_eq!(status.rows_loaded, 0);
        assert!(!status.completed);

        let stored = t.ctx().db.read(|tb| tb.extract_request(orders.request_id).cloned()).unwrap();
        assert_eq!(stored.status, ExtractStatus::New);
        assert_eq!(stored.resume_batch_id(), orders.start_batch_id);
        let staged = t.staging.keys().unwrap();
        assert!(staged
            .iter()
            .all(|k| !(orders.start_batch_id..=orders.end_batch_id).contains(&k.batch_id)));

        let statuses = t.engine.queue_work(true).unwrap();
        assert_eq!(statuses[0].requests, 1);
        assert_eq!(statuses[0].batches, 3);
    }

    #[test]
    fn reset_finds_the_request_by_batch() {
        let t = test_support::engine_with_source(config(), test_support::source(250));
        let load_id = half_delivered(&t);
        let items = t.ctx().db.read(|tb| tb.extract_requests_for_load(load_id))[1].clone();

        assert!(t.engine.reset_extract_request(STORE, items.end_batch_id).unwrap());
        assert!(!t.engine.reset_extract_request(STORE, 99_999).unwrap());

        let batch = t.batch(items.start_batch_id);
        assert_eq!(batch.status, BatchStatus::Requested);
        // The acknowledged order batches are untouched.
        let status = t.ctx().db.read(|tb| tb.reload_status(load_id).cloned()).unwrap();
        assert_eq!(status.data_batch_loaded, 2);
    }

    #[test]
    fn unknown_request_is_rejected() {
        let t = test_support::engine(config());
        assert!(t.engine.restart_extract_request(42).is_err());
    }
}
