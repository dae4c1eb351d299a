//! Splits one table's reload rows across the batch range of an extract request.

use batchsync_protocol::{
    rewrite_batch_id, BatchStats, BatchStatus, ChangeRecord, ExtractRequest, OutgoingBatch,
    ProtocolReader, ProtocolWriter,
};
use batchsync_storage::{ResourceReader, ResourceState, ResourceWriter, StagedResource, StagingKey};
use std::io::{BufReader, BufWriter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{in_transaction, EngineContext};
use crate::error::{SyncError, SyncResult};
use crate::process::ProcessInfo;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

type StagedWriter = ProtocolWriter<BufWriter<ResourceWriter>>;

struct OpenBatch {
    batch_id: u64,
    resource: Arc<dyn StagedResource>,
    writer: StagedWriter,
    stats: BatchStats,
    started: Instant,
}

/// Writes reload rows into consecutive staged batches.
///
/// A batch is closed once it holds `max_batch_size` rows; rows produced
/// from one source row are never split. The last batch of the range takes
/// whatever is left over, and batches the rows did not reach are staged
/// empty. Each closed batch is copied to every child request at the same
/// offset and checkpointed on the request, so an interrupted request
/// resumes after the last closed batch.
pub(crate) struct MultiBatchStagingWriter<'a> {
    ctx: &'a EngineContext,
    process: &'a ProcessInfo,
    request: ExtractRequest,
    children: Vec<ExtractRequest>,
    channel_id: String,
    max_batch_size: u64,
    next_batch_id: u64,
    current: Option<OpenBatch>,
    source_rows: u64,
    last_progress: Instant,
}

impl<'a> MultiBatchStagingWriter<'a> {
    pub(crate) fn new(
        ctx: &'a EngineContext,
        process: &'a ProcessInfo,
        request: ExtractRequest,
        children: Vec<ExtractRequest>,
        channel_id: impl Into<String>,
        max_batch_size: u64,
    ) -> Self {
        let next_batch_id = request.resume_batch_id();
        let source_rows = request.loaded_rows;
        Self {
            ctx,
            process,
            request,
            children,
            channel_id: channel_id.into(),
            max_batch_size: max_batch_size.max(1),
            next_batch_id,
            current: None,
            source_rows,
            last_progress: Instant::now(),
        }
    }

    /// Writes the records produced from one source row.
    pub(crate) fn write_source_row(&mut self, records: &[ChangeRecord]) -> SyncResult<()> {
        if self.current.is_none() {
            self.open_next()?;
        }
        let last_id = self.request.end_batch_id;
        let Some(open) = self.current.as_mut() else {
            return Err(SyncError::validation("no batch left in the request range"));
        };
        for record in records {
            open.writer.write_record(record)?;
            open.stats.count_event(record.event_type);
        }
        self.source_rows += 1;
        if open.stats.row_count >= self.max_batch_size && open.batch_id < last_id {
            self.close_current()?;
        }
        Ok(())
    }

    /// Closes the open batch and stages every remaining id of the range empty.
    ///
    /// Returns the request as checkpointed.
    pub(crate) fn finish(mut self) -> SyncResult<(ExtractRequest, Vec<ExtractRequest>)> {
        if self.current.is_some() {
            self.close_current()?;
        }
        while self.next_batch_id <= self.request.end_batch_id {
            self.open_next()?;
            self.close_current()?;
        }
        Ok((self.request.clone(), std::mem::take(&mut self.children)))
    }

    fn open_next(&mut self) -> SyncResult<()> {
        let batch_id = self.next_batch_id;
        if batch_id > self.request.end_batch_id {
            return Err(SyncError::validation(format!(
                "batch {batch_id} is past the end of extract request {}",
                self.request.request_id
            )));
        }
        self.next_batch_id += 1;
        self.process.set_current_batch(batch_id);
        let location = self.staged_location(batch_id)?;
        let resource = self.fresh_resource(&StagingKey::outgoing(location, batch_id))?;
        let mut writer = ProtocolWriter::new(BufWriter::new(ResourceWriter::new(Arc::clone(&resource))));
        writer.start_batch(self.ctx.node_id(), &self.channel_id, batch_id)?;
        self.current = Some(OpenBatch {
            batch_id,
            resource,
            writer,
            stats: BatchStats::default(),
            started: Instant::now(),
        });
        Ok(())
    }

    fn staged_location(&self, batch_id: u64) -> SyncResult<String> {
        Ok(self
            .ctx
            .db
            .read(|t| t.require_outgoing_batch(batch_id).map(|b| b.staged_location.clone()))?)
    }

    /// Creates the resource for `key`, removing whatever an earlier attempt left.
    fn fresh_resource(&self, key: &StagingKey) -> SyncResult<Arc<dyn StagedResource>> {
        if let Some(stale) = self.ctx.staging.find(key)? {
            tracing::debug!(key = %key, "removing stale staged batch");
            stale.delete()?;
        }
        Ok(self.ctx.staging.create(key)?)
    }

    fn close_current(&mut self) -> SyncResult<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        let batch_id = open.batch_id;
        open.writer.end_batch(batch_id)?;
        open.writer.flush()?;
        open.stats.byte_count = open.writer.bytes_written();
        open.stats.table_count = open.writer.tables_seen();
        open.stats.elapsed_millis = open.started.elapsed().as_millis() as u64;
        drop(open.writer);
        open.resource.set_state(ResourceState::Done)?;

        let mut staged = vec![(batch_id, open.stats.clone())];
        let parent = self.request.clone();
        for child in &self.children {
            let child_id = child.offset_batch_id(&parent, batch_id);
            let bytes = self.copy_to_child(&open.resource, batch_id, child_id)?;
            let mut stats = open.stats.clone();
            stats.byte_count = bytes;
            staged.push((child_id, stats));
        }

        let now = self.ctx.now();
        let source_rows = self.source_rows;
        let elapsed = open.stats.elapsed_millis;
        self.request.last_loaded_batch_id = batch_id;
        self.request.loaded_rows = source_rows;
        self.request.loaded_millis += elapsed;
        self.request.last_update_time = now;
        for child in &mut self.children {
            child.last_loaded_batch_id = child.offset_batch_id(&parent, batch_id);
            child.loaded_rows = source_rows;
            child.loaded_millis += elapsed;
            child.last_update_time = now;
        }

        let request = &self.request;
        let children = &self.children;
        in_transaction(&self.ctx.db, |txn| {
            for (id, stats) in &staged {
                let mut batch: OutgoingBatch = txn.require_outgoing_batch(*id)?.clone();
                if matches!(batch.status, BatchStatus::Ok | BatchStatus::Ignored) {
                    continue;
                }
                batch.extract_count += 1;
                batch.data_row_count = stats.row_count;
                batch.data_insert_row_count = stats.insert_count;
                batch.extract_stats = stats.clone();
                batch.status = BatchStatus::New;
                batch.last_update_time = now;
                txn.update_outgoing_batch(&batch)?;
            }
            txn.update_extract_request(request)?;
            for child in children {
                txn.update_extract_request(child)?;
            }
            Ok(())
        })?;

        self.process.batch_done();
        self.process.add_rows(open.stats.row_count);
        if self.last_progress.elapsed() >= PROGRESS_LOG_INTERVAL {
            self.last_progress = Instant::now();
            tracing::info!(
                request_id = self.request.request_id,
                node_id = %self.request.node_id,
                table = %self.request.table_name,
                batch_id,
                remaining = self.request.end_batch_id - batch_id,
                rows = source_rows,
                "extract request progress"
            );
        }
        Ok(())
    }

    /// Copies a staged batch under a child's batch id; returns bytes written.
    fn copy_to_child(&self, parent: &Arc<dyn StagedResource>, parent_id: u64, child_id: u64) -> SyncResult<u64> {
        let location = self.staged_location(child_id)?;
        let resource = self.fresh_resource(&StagingKey::outgoing(location, child_id))?;
        let mut writer = ProtocolWriter::new(BufWriter::new(ResourceWriter::new(Arc::clone(&resource))));
        let reader = ProtocolReader::new(BufReader::new(ResourceReader::new(Arc::clone(parent))));
        for line in reader {
            writer.write_line(&rewrite_batch_id(line?, parent_id, child_id))?;
        }
        writer.flush()?;
        let bytes = writer.bytes_written();
        drop(writer);
        resource.set_state(ResourceState::Done)?;
        Ok(bytes)
    }
}

impl Drop for MultiBatchStagingWriter<'_> {
    fn drop(&mut self) {
        // A batch still open here was abandoned mid-write.
        if let Some(open) = self.current.take() {
            drop(open.writer);
            if let Err(e) = open.resource.delete() {
                tracing::warn!(batch_id = open.batch_id, error = %e, "failed to remove partial staged batch");
            }
        }
    }
}

