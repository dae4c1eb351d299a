//! Extraction orchestrator: change records to staged payloads to the transport.
//!
//! A round takes the candidate batches of one (node, queue), filters them,
//! extracts each one under its batch lock into staging (or straight into
//! the transport on the synchronous path), and transfers the staged
//! payloads in batch order until the byte budget is used up.

mod requests;
mod staging_writer;

pub use requests::NodeQueueStatus;
pub(crate) use requests::ExtractRequestService;

use batchsync_core::{ErrorKind, DEFAULT_QUEUE};
use batchsync_protocol::{
    BatchStats, BatchStatus, ChangeRecord, DataEventType, OutgoingBatch, ProtocolWriter,
};
use batchsync_storage::{
    ResourceReader, ResourceState, ResourceWriter, StagedResource, StagingKey,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{BufWriter, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::EngineContext;
use crate::error::{SyncError, SyncResult, GENERIC_ERROR_CODE, STAGE_ERROR_CODE};
use crate::filter::BatchFilter;
use crate::locks::acquire_staging_lock;
use crate::policy::{change_status, save_batch};
use crate::process::{ProcessInfo, ProcessKind, ProcessStatus};
use crate::transport::{OutgoingTransport, TransportWriter};

const TRANSFER_CHUNK: usize = 64 * 1024;

/// Rows selected from the source per page when expanding reload events.
const RELOAD_PAGE_SIZE: u64 = 1000;

/// Extracts and transfers batches.
pub struct DataExtractor<'a> {
    ctx: &'a EngineContext,
}

impl<'a> DataExtractor<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Runs one extraction round for `node_id` on `queue`.
    ///
    /// Returns the batches that were transferred, in order.
    pub fn extract(
        &self,
        node_id: &str,
        queue: &str,
        transport: &dyn OutgoingTransport,
    ) -> SyncResult<Vec<OutgoingBatch>> {
        self.check_staging_space()?;

        let candidates: Vec<OutgoingBatch> = self
            .ctx
            .db
            .read(|t| t.outgoing_batches_for_node(node_id))
            .into_iter()
            .filter(|b| self.queue_of(&b.channel_id) == queue)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let batches = BatchFilter::new(self.ctx).filter(node_id, candidates)?;
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let process = self
            .ctx
            .processes
            .register(ProcessKind::Extract, node_id, Some(queue), self.ctx.now());
        let result = self.extract_batches(node_id, batches, transport, &process.info());
        if result.is_err() {
            process.set_status(ProcessStatus::Error);
        }
        result
    }

    fn queue_of(&self, channel_id: &str) -> String {
        self.ctx
            .registry
            .channel(channel_id)
            .map_or_else(|| DEFAULT_QUEUE.to_string(), |c| c.queue)
    }

    /// Disables extraction engine-wide when the staging medium is nearly full.
    fn check_staging_space(&self) -> SyncResult<()> {
        if !self.ctx.config.stream_to_file {
            return Ok(());
        }
        let usage = self.ctx.staging.usage()?;
        let low = usage.free_ratio() < self.ctx.config.min_free_staging_ratio;
        if low && self.ctx.is_extraction_enabled() {
            tracing::error!(
                available = usage.available,
                total = usage.total,
                min_ratio = self.ctx.config.min_free_staging_ratio,
                "staging space is low, extraction disabled"
            );
            self.ctx.set_extraction_enabled(false);
        }
        if !self.ctx.is_extraction_enabled() {
            return Err(SyncError::DiskFull {
                available: usage.available,
                total: usage.total,
            });
        }
        Ok(())
    }

    /// Extracts and transfers an already filtered batch list.
    ///
    /// Batches queued for the extract job (RQ) end the round: nothing after
    /// them is sent until they are ready. The byte budget is checked after
    /// each transfer, so a round may exceed it by up to one batch. The pool
    /// is only fed while the bytes extracted so far, plus an estimate for the
    /// batches still in flight, stay under the budget.
    pub(crate) fn extract_batches(
        &self,
        node_id: &str,
        mut batches: Vec<OutgoingBatch>,
        transport: &dyn OutgoingTransport,
        process: &Arc<ProcessInfo>,
    ) -> SyncResult<Vec<OutgoingBatch>> {
        if let Some(cut) = batches.iter().position(|b| b.status == BatchStatus::Requested) {
            tracing::debug!(node_id, batch_id = batches[cut].batch_id, "waiting on extract job");
            batches.truncate(cut);
        }
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        if self.ctx.config.stream_to_file {
            self.extract_staged(node_id, batches, transport, process)
        } else {
            self.extract_inline(node_id, batches, transport, process)
        }
    }

    /// Synchronous path: each batch is written straight to the transport.
    fn extract_inline(
        &self,
        node_id: &str,
        batches: Vec<OutgoingBatch>,
        transport: &dyn OutgoingTransport,
        process: &Arc<ProcessInfo>,
    ) -> SyncResult<Vec<OutgoingBatch>> {
        let total = batches.len();
        let mut sent = Vec::new();
        let mut bytes = 0u64;
        for (i, batch) in batches.into_iter().enumerate() {
            process.set_current_batch(batch.batch_id);
            let _guard = self.ctx.locks.acquire(&batch.node_batch_id());
            let Some(mut batch) = self.refresh(batch)? else {
                continue;
            };
            if batch.status == BatchStatus::Ignored {
                self.send_ignored(&batch, transport)?;
                sent.push(batch);
                continue;
            }

            batch.extract_count += 1;
            batch.sent_count += 1;
            batch.extract_start_time = Some(self.ctx.now());
            batch.transfer_start_time = batch.extract_start_time;
            change_status(self.ctx, &mut batch, BatchStatus::Querying)?;
            change_status(self.ctx, &mut batch, BatchStatus::Sending)?;
            let written = {
                let mut writer = ProtocolWriter::new(TransportWriter::new(transport));
                let result = self
                    .write_with_lob_retry(&mut writer, &mut batch, process)
                    .and_then(|()| Ok(writer.flush()?));
                result.map_err(|e| writer.into_inner().take_failure().unwrap_or(e))
            };
            match written {
                Ok(()) => {
                    batch.sent_stats = batch.extract_stats.clone();
                    batch.load_count += 1;
                    change_status(self.ctx, &mut batch, BatchStatus::Loading)?;
                    bytes += batch.extract_stats.byte_count;
                    process.batch_done();
                    process.add_rows(batch.extract_stats.row_count);
                    sent.push(batch);
                }
                Err(e @ SyncError::Transport { .. }) => return Err(e),
                Err(e) => {
                    self.handle_extract_error(&mut batch, None, &e)?;
                    if e.kind() == ErrorKind::Interrupted {
                        return Err(e);
                    }
                    continue;
                }
            }
            if bytes >= self.ctx.config.max_bytes_to_sync && i < total - 1 {
                tracing::debug!(node_id, bytes, budget = self.ctx.config.max_bytes_to_sync, "byte budget reached");
                break;
            }
        }
        Ok(sent)
    }

    /// Staged path: a worker pool extracts into staging while this thread
    /// transfers finished batches in order and keeps the transport alive.
    fn extract_staged(
        &self,
        node_id: &str,
        batches: Vec<OutgoingBatch>,
        transport: &dyn OutgoingTransport,
        process: &Arc<ProcessInfo>,
    ) -> SyncResult<Vec<OutgoingBatch>> {
        let total = batches.len();
        let threads = self.ctx.config.effective_thread_count().min(total).max(1);
        let sync_all = self.ctx.config.synchronize_all_jobs;
        let window = if sync_all { total } else { threads };
        let budget = self.ctx.config.max_bytes_to_sync;
        let keep_alive = self.ctx.config.keep_alive_interval;
        let selected_at = self.ctx.now();

        let (job_tx, job_rx) = mpsc::channel::<(usize, OutgoingBatch)>();
        let (result_tx, result_rx) = mpsc::channel::<(usize, SyncResult<OutgoingBatch>)>();
        let job_rx = Mutex::new(job_rx);

        std::thread::scope(|scope| {
            // Owned here so workers see a closed queue on any early return.
            let job_tx = job_tx;
            for _ in 0..threads {
                let job_rx = &job_rx;
                let result_tx = result_tx.clone();
                scope.spawn(move || loop {
                    let job = job_rx.lock().recv();
                    let Ok((index, batch)) = job else {
                        break;
                    };
                    let outcome = self.extract_to_staging(batch, process);
                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(result_tx);

            let mut feed = PoolFeed::new(batches, window, budget);
            feed.top_up(&job_tx)?;

            let mut results: BTreeMap<usize, SyncResult<OutgoingBatch>> = BTreeMap::new();
            let receive = |feed: &mut PoolFeed,
                           results: &mut BTreeMap<usize, SyncResult<OutgoingBatch>>|
             -> SyncResult<()> {
                loop {
                    match result_rx.recv_timeout(keep_alive) {
                        Ok((index, outcome)) => {
                            feed.record_finished(outcome.as_ref().map_or(0, |b| b.extract_stats.byte_count));
                            feed.top_up(&job_tx)?;
                            results.insert(index, outcome);
                            return Ok(());
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::debug!(node_id, in_flight = feed.in_flight, "extraction still running, sending keep-alive");
                            transport.keep_alive()?;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(SyncError::Interrupted("extraction workers stopped".into()));
                        }
                    }
                }
            };

            if sync_all {
                while feed.in_flight > 0 {
                    receive(&mut feed, &mut results)?;
                }
            }

            let mut sent = Vec::new();
            let mut bytes = 0u64;
            for index in 0..total {
                if index >= feed.submitted {
                    tracing::debug!(node_id, extracted = feed.extracted, budget, "extraction stopped at byte budget");
                    break;
                }
                let outcome = loop {
                    if let Some(outcome) = results.remove(&index) {
                        break outcome;
                    }
                    receive(&mut feed, &mut results)?;
                };
                let batch = match outcome {
                    Ok(batch) => batch,
                    Err(e) if e.kind() == ErrorKind::Interrupted => return Err(e),
                    Err(_) => continue,
                };
                let Some(batch) = self.requery_if_stale(batch, selected_at)? else {
                    continue;
                };
                match batch.status {
                    BatchStatus::Ok => {}
                    BatchStatus::Ignored => {
                        self.send_ignored(&batch, transport)?;
                        sent.push(batch);
                    }
                    _ => match self.send_outgoing_batch(batch, transport) {
                        Ok(batch) => {
                            bytes += batch.sent_stats.byte_count;
                            process.batch_done();
                            process.add_rows(batch.sent_stats.row_count);
                            sent.push(batch);
                        }
                        Err(SendFailure::Corrupt(batch, e)) => {
                            self.recover_stage_corruption(batch, &e)?;
                        }
                        Err(SendFailure::Fatal(e)) => return Err(e),
                    },
                }
                if bytes >= budget && index < total - 1 {
                    tracing::debug!(node_id, bytes, budget, "byte budget reached");
                    break;
                }
            }
            drop(job_tx);
            Ok(sent)
        })
    }

    /// Re-reads the batch as stored in the ledger; `None` if it finished elsewhere.
    fn refresh(&self, batch: OutgoingBatch) -> SyncResult<Option<OutgoingBatch>> {
        let stored = self
            .ctx
            .db
            .read(|t| t.require_outgoing_batch(batch.batch_id).cloned())?;
        if stored.status == BatchStatus::Ok {
            return Ok(None);
        }
        Ok(Some(stored))
    }

    fn requery_if_stale(&self, batch: OutgoingBatch, selected_at: u64) -> SyncResult<Option<OutgoingBatch>> {
        let age = Duration::from_millis(self.ctx.now().saturating_sub(selected_at));
        if age < self.ctx.config.requery_interval {
            return Ok(Some(batch));
        }
        self.refresh(batch)
    }

    /// Extracts one batch into staging under its batch lock.
    ///
    /// A payload already staged as DONE is reused and referenced once.
    /// Failures are recorded on the batch before being returned.
    pub(crate) fn extract_to_staging(
        &self,
        batch: OutgoingBatch,
        process: &ProcessInfo,
    ) -> SyncResult<OutgoingBatch> {
        let shared = batch.common_flag && self.ctx.config.share_common_batches;
        let lock_key = if shared {
            batch.batch_id.to_string()
        } else {
            batch.node_batch_id()
        };
        let _guard = self.ctx.locks.acquire(&lock_key);
        let key = StagingKey::outgoing(&batch.staged_location, batch.batch_id);
        let _file_lock = if shared {
            Some(acquire_staging_lock(
                self.ctx.staging.as_ref(),
                self.ctx.clock.as_ref(),
                self.ctx.node_id(),
                &key,
                &self.ctx.config,
            )?)
        } else {
            None
        };
        process.set_current_batch(batch.batch_id);

        let Some(mut batch) = self.refresh(batch)? else {
            let stored = self.ctx.db.read(|t| t.require_outgoing_batch(key.batch_id).cloned())?;
            return Ok(stored);
        };
        if batch.status == BatchStatus::Ignored {
            return Ok(batch);
        }

        if let Some(resource) = self.ctx.staging.find(&key)? {
            if resource.state() == ResourceState::Done {
                let refs = resource.reference();
                tracing::debug!(batch_id = batch.batch_id, node_id = %batch.node_id, refs, "reusing staged batch");
                return Ok(batch);
            }
            resource.delete()?;
        }

        batch.extract_count += 1;
        batch.extract_start_time = Some(self.ctx.now());
        change_status(self.ctx, &mut batch, BatchStatus::Querying)?;

        let staged = self.stage_batch(&mut batch, &key, process);
        match staged {
            Ok(()) => {
                tracing::debug!(
                    batch_id = batch.batch_id,
                    node_id = %batch.node_id,
                    rows = batch.extract_stats.row_count,
                    bytes = batch.extract_stats.byte_count,
                    "batch staged"
                );
                save_batch(self.ctx, &mut batch)?;
                Ok(batch)
            }
            Err(e) => {
                self.handle_extract_error(&mut batch, Some(&key), &e)?;
                Err(e)
            }
        }
    }

    fn stage_batch(&self, batch: &mut OutgoingBatch, key: &StagingKey, process: &ProcessInfo) -> SyncResult<()> {
        let mut big_lob = false;
        loop {
            let resource = self.ctx.staging.create(key)?;
            let mut writer = ProtocolWriter::new(BufWriter::new(ResourceWriter::new(Arc::clone(&resource))));
            let written = self
                .write_batch(&mut writer, batch, big_lob, process)
                .and_then(|()| Ok(writer.flush()?));
            drop(writer);
            match written {
                Ok(()) => {
                    resource.set_state(ResourceState::Done)?;
                    resource.reference();
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Truncation && !big_lob => {
                    tracing::warn!(batch_id = batch.batch_id, node_id = %batch.node_id, error = %e, "value truncated, retrying with big lob handling");
                    resource.delete()?;
                    big_lob = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_with_lob_retry<W: Write>(
        &self,
        writer: &mut ProtocolWriter<W>,
        batch: &mut OutgoingBatch,
        process: &ProcessInfo,
    ) -> SyncResult<()> {
        // Truncation is detected before anything is written, so the retry
        // can reuse the same writer.
        match self.write_batch(writer, batch, false, process) {
            Err(e) if e.kind() == ErrorKind::Truncation && writer.bytes_written() == 0 => {
                tracing::warn!(batch_id = batch.batch_id, node_id = %batch.node_id, error = %e, "value truncated, retrying with big lob handling");
                self.write_batch(writer, batch, true, process)
            }
            other => other,
        }
    }

    /// Renders one batch: header, transformed records, commit.
    fn write_batch<W: Write>(
        &self,
        writer: &mut ProtocolWriter<W>,
        batch: &mut OutgoingBatch,
        big_lob: bool,
        process: &ProcessInfo,
    ) -> SyncResult<()> {
        let started = Instant::now();
        let records = self.ctx.change_log.select_data_for_batch(batch.batch_id, big_lob)?;
        let source_group = self.ctx.node_group_id().to_string();
        let target_group = self.ctx.group_of(&batch.node_id);
        let bytes_before = writer.bytes_written();
        let tables_before = writer.tables_seen();

        let mut stats = BatchStats::default();
        let mut transform_time = Duration::ZERO;
        writer.start_batch(self.ctx.node_id(), &batch.channel_id, batch.batch_id)?;
        for record in records {
            process.check_interrupted()?;
            for row in self.expand(record)? {
                let transform_start = Instant::now();
                let outputs = self.ctx.transforms.apply(&source_group, &target_group, row);
                transform_time += transform_start.elapsed();
                for out in &outputs {
                    writer.write_record(out)?;
                    stats.count_event(out.event_type);
                }
            }
        }
        writer.end_batch(batch.batch_id)?;

        stats.byte_count = writer.bytes_written() - bytes_before;
        stats.table_count = writer.tables_seen() - tables_before;
        stats.transform_millis = transform_time.as_millis() as u64;
        stats.elapsed_millis = started.elapsed().as_millis() as u64;
        batch.extract_stats = stats;
        Ok(())
    }

    /// Turns a RELOAD event into the rows it stands for.
    ///
    /// The event's row data carries the selection predicate.
    fn expand(&self, record: ChangeRecord) -> SyncResult<Vec<ChangeRecord>> {
        if record.event_type != DataEventType::Reload {
            return Ok(vec![record]);
        }
        let predicate = record.row_data.as_deref();
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.ctx.source.select_rows(
                &record.table_name,
                predicate,
                offset,
                Some(RELOAD_PAGE_SIZE),
            )?;
            let fetched = page.len() as u64;
            rows.extend(page.into_iter().map(|row| {
                ChangeRecord::new(&record.table_name, DataEventType::Reload, &record.channel_id)
                    .with_row_data(row.row_data)
                    .with_pk_data(row.pk_data)
                    .with_trigger_hist_id(record.trigger_hist_id)
            }));
            if fetched < RELOAD_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    /// Records an extraction failure on the batch.
    ///
    /// The partial resource is removed. A batch that became OK or IG
    /// meanwhile keeps that status; an interrupted batch goes back to NE.
    fn handle_extract_error(
        &self,
        batch: &mut OutgoingBatch,
        key: Option<&StagingKey>,
        error: &SyncError,
    ) -> SyncResult<()> {
        if let Some(key) = key {
            if let Some(resource) = self.ctx.staging.find(key)? {
                resource.close()?;
                resource.delete()?;
            }
        }
        let stored = self
            .ctx
            .db
            .read(|t| t.outgoing_batch(batch.batch_id).map(|b| b.status));
        if let Some(status @ (BatchStatus::Ok | BatchStatus::Ignored)) = stored {
            batch.status = status;
            return Ok(());
        }
        if error.kind() == ErrorKind::Interrupted {
            tracing::info!(batch_id = batch.batch_id, node_id = %batch.node_id, "extraction interrupted");
            batch.revert_stats_on_error();
            return change_status(self.ctx, batch, BatchStatus::New);
        }
        tracing::error!(
            batch_id = batch.batch_id,
            node_id = %batch.node_id,
            load_id = batch.load_id,
            error = %error,
            "failed to extract batch"
        );
        batch.record_error(
            GENERIC_ERROR_CODE,
            Some(format!("{:?}", error.kind())),
            error.to_string(),
        );
        batch.revert_stats_on_error();
        change_status(self.ctx, batch, BatchStatus::Error)
    }

    fn send_ignored(&self, batch: &OutgoingBatch, transport: &dyn OutgoingTransport) -> SyncResult<()> {
        let mut writer = ProtocolWriter::new(TransportWriter::new(transport));
        let result = writer
            .write_ignored_batch(self.ctx.node_id(), &batch.channel_id, batch.batch_id)
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            return Err(writer.into_inner().take_failure().unwrap_or(e.into()));
        }
        tracing::debug!(batch_id = batch.batch_id, node_id = %batch.node_id, "sent ignored batch");
        Ok(())
    }

    /// Streams a staged batch to the transport and moves it to LD.
    fn send_outgoing_batch(
        &self,
        mut batch: OutgoingBatch,
        transport: &dyn OutgoingTransport,
    ) -> Result<OutgoingBatch, SendFailure> {
        batch.sent_count += 1;
        batch.transfer_start_time = Some(self.ctx.now());
        if let Err(e) = change_status(self.ctx, &mut batch, BatchStatus::Sending) {
            return Err(SendFailure::Fatal(e));
        }
        let key = StagingKey::outgoing(&batch.staged_location, batch.batch_id);
        let resource = match self.staged_resource(&key) {
            Ok(resource) => resource,
            Err(e) => return Err(SendFailure::Corrupt(batch, e)),
        };
        if let Err(e) = self.stream_resource(&resource, transport) {
            return Err(match e {
                SyncError::Transport { .. } => SendFailure::Fatal(e),
                e => SendFailure::Corrupt(batch, e),
            });
        }
        resource.dereference();
        batch.sent_stats = batch.extract_stats.clone();
        batch.load_count += 1;
        change_status(self.ctx, &mut batch, BatchStatus::Loading).map_err(SendFailure::Fatal)?;
        tracing::debug!(batch_id = batch.batch_id, node_id = %batch.node_id, bytes = batch.sent_stats.byte_count, "batch sent");
        Ok(batch)
    }

    fn staged_resource(&self, key: &StagingKey) -> SyncResult<Arc<dyn StagedResource>> {
        let resource = self
            .ctx
            .staging
            .find(key)?
            .filter(|r| r.state() == ResourceState::Done)
            .ok_or_else(|| SyncError::stage_corruption(key.batch_id, "staged payload is missing"))?;
        resource
            .verify()
            .map_err(|e| SyncError::stage_corruption(key.batch_id, e.to_string()))?;
        Ok(resource)
    }

    fn stream_resource(&self, resource: &Arc<dyn StagedResource>, transport: &dyn OutgoingTransport) -> SyncResult<()> {
        let batch_id = resource.key().batch_id;
        let mut reader = ResourceReader::new(Arc::clone(resource));
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| SyncError::stage_corruption(batch_id, e.to_string()))?;
            if n == 0 {
                break;
            }
            transport.write(&buf[..n])?;
        }
        transport.flush()
    }

    /// Drops a corrupt staged payload and queues the batch for re-extraction.
    ///
    /// A batch already marked with [`STAGE_ERROR_CODE`] goes to ER instead.
    fn recover_stage_corruption(&self, mut batch: OutgoingBatch, error: &SyncError) -> SyncResult<()> {
        let key = StagingKey::outgoing(&batch.staged_location, batch.batch_id);
        if let Some(resource) = self.ctx.staging.find(&key)? {
            resource.delete()?;
        }
        if batch.sql_code == STAGE_ERROR_CODE {
            tracing::error!(batch_id = batch.batch_id, node_id = %batch.node_id, error = %error, "staged payload corrupt again, batch in error");
            batch.record_error(STAGE_ERROR_CODE, Some(format!("{:?}", ErrorKind::StageCorruption)), error.to_string());
            batch.revert_stats_on_error();
            return change_status(self.ctx, &mut batch, BatchStatus::Error);
        }
        tracing::warn!(batch_id = batch.batch_id, node_id = %batch.node_id, error = %error, "staged payload corrupt, batch will be extracted again");
        batch.sql_code = STAGE_ERROR_CODE;
        batch.revert_stats_on_error();
        change_status(self.ctx, &mut batch, BatchStatus::New)
    }
}

enum SendFailure {
    Corrupt(OutgoingBatch, SyncError),
    Fatal(SyncError),
}

/// Hands batches to the extraction pool in order while the byte budget allows.
///
/// Batches in flight are counted at the size of the largest one extracted so
/// far. Until a first batch has finished only one is handed out.
struct PoolFeed {
    pending: std::iter::Enumerate<std::vec::IntoIter<OutgoingBatch>>,
    window: usize,
    budget: u64,
    submitted: usize,
    in_flight: usize,
    finished: usize,
    extracted: u64,
    largest: u64,
}

impl PoolFeed {
    fn new(batches: Vec<OutgoingBatch>, window: usize, budget: u64) -> Self {
        Self {
            pending: batches.into_iter().enumerate(),
            window,
            budget,
            submitted: 0,
            in_flight: 0,
            finished: 0,
            extracted: 0,
            largest: 0,
        }
    }

    fn has_room(&self) -> bool {
        if self.finished == 0 {
            return self.in_flight == 0;
        }
        let projected = self.extracted + self.in_flight as u64 * self.largest;
        projected < self.budget
    }

    fn top_up(&mut self, jobs: &mpsc::Sender<(usize, OutgoingBatch)>) -> SyncResult<()> {
        while self.in_flight < self.window && self.has_room() {
            let Some((index, batch)) = self.pending.next() else {
                break;
            };
            jobs.send((index, batch))
                .map_err(|_| SyncError::Interrupted("extraction workers stopped".into()))?;
            self.submitted = index + 1;
            self.in_flight += 1;
        }
        Ok(())
    }

    fn record_finished(&mut self, byte_count: u64) {
        self.in_flight -= 1;
        self.finished += 1;
        self.extracted += byte_count;
        self.largest = self.largest.max(byte_count);
    }
}
