//! Queueing of initial loads from reload requests and node security flags.

use batchsync_core::{ClusterLockGuard, INITIAL_LOAD_QUEUE};
use batchsync_protocol::{ExtractRequest, TableReloadRequest};
use std::collections::BTreeMap;

use super::ReloadService;
use crate::context::EngineContext;
use crate::error::SyncResult;
use crate::process::{ProcessKind, ProcessStatus};

/// A reload waiting to be inserted.
struct PendingLoad {
    target_node_id: String,
    reverse: bool,
    requests: Vec<TableReloadRequest>,
}

/// Starts queued loads and cancels running ones.
pub(crate) struct InitialLoadQueue<'a> {
    ctx: &'a EngineContext,
}

impl<'a> InitialLoadQueue<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Turns pending reload requests into loads. Returns the new load ids.
    ///
    /// Requests are grouped by (create time, target, source); each group is
    /// one load. Nodes flagged for a full or reverse initial load get one
    /// too. No more than `max_load_count` loads run at once.
    pub(crate) fn process_reload_requests(&self, force: bool) -> SyncResult<Vec<u64>> {
        let _guard = if force {
            None
        } else {
            match ClusterLockGuard::try_acquire(self.ctx.cluster.as_ref(), INITIAL_LOAD_QUEUE)? {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!("initial load queue lock held elsewhere");
                    return Ok(Vec::new());
                }
            }
        };

        let local = self.ctx.node_id().to_string();
        let active = self.ctx.db.read(|t| t.active_loads(&local).len());
        let slots = self.ctx.config.max_load_count.saturating_sub(active);
        if slots == 0 {
            tracing::debug!(active, max = self.ctx.config.max_load_count, "load limit reached");
            return Ok(Vec::new());
        }

        let pending = self.pending_loads(&local);
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let process = self
            .ctx
            .processes
            .register(ProcessKind::InitialLoadQueue, &local, None, self.ctx.now());

        let reload = ReloadService::new(self.ctx);
        let mut parents: BTreeMap<u32, ExtractRequest> = BTreeMap::new();
        let mut started = Vec::new();
        for load in pending.into_iter().take(slots) {
            let Some(target) = self.ctx.registry.node(&load.target_node_id) else {
                tracing::warn!(node_id = %load.target_node_id, "reload requested for unknown node");
                continue;
            };
            match reload.insert_reload_events(&target, load.reverse, &load.requests, &parents) {
                Ok(outcome) => {
                    for (hist_id, request) in outcome.extract_requests {
                        if !request.is_child() {
                            parents.entry(hist_id).or_insert(request);
                        }
                    }
                    started.push(outcome.load_id);
                }
                Err(e) => {
                    process.set_status(ProcessStatus::Error);
                    tracing::warn!(node_id = %target.node_id, error = %e, "load not started");
                }
            }
        }
        Ok(started)
    }

    fn pending_loads(&self, local: &str) -> Vec<PendingLoad> {
        let (requests, initial, reverse) = self.ctx.db.read(|t| {
            (
                t.unprocessed_reload_requests(),
                t.nodes_needing_initial_load(),
                t.nodes_needing_reverse_load(),
            )
        });

        let mut groups: BTreeMap<(u64, String), Vec<TableReloadRequest>> = BTreeMap::new();
        for request in requests.into_iter().filter(|r| r.source_node_id == local) {
            groups
                .entry((request.create_time, request.target_node_id.clone()))
                .or_default()
                .push(request);
        }
        let mut loads: Vec<PendingLoad> = groups
            .into_iter()
            .map(|((_, target_node_id), requests)| PendingLoad {
                target_node_id,
                reverse: false,
                requests,
            })
            .collect();

        for security in initial {
            if loads.iter().any(|l| l.target_node_id == security.node_id && !l.reverse) {
                continue;
            }
            loads.push(PendingLoad {
                target_node_id: security.node_id,
                reverse: false,
                requests: Vec::new(),
            });
        }
        for security in reverse {
            loads.push(PendingLoad {
                target_node_id: security.node_id,
                reverse: true,
                requests: Vec::new(),
            });
        }
        loads
    }

    /// Cancels a load: interrupts its processes, closes its requests and
    /// marks its unfinished batches OK. Returns the number of batches
    /// cancelled.
    pub(crate) fn cancel_load(&self, load_id: u64) -> SyncResult<usize> {
        let interrupted = self.ctx.processes.interrupt_load(load_id);
        let now = self.ctx.now();
        let (requests, batches, released) = self.ctx.db.write(|t| {
            if let Some(status) = t.reload_status_mut(load_id) {
                status.cancelled = true;
                status.end_time = Some(now);
                status.last_update_time = now;
            }
            Ok((
                t.cancel_extract_requests(load_id, now),
                t.cancel_load_batches(load_id, now),
                t.release_missed_extract_requests(now),
            ))
        })?;
        tracing::info!(load_id, interrupted, requests, batches, released, "load cancelled");
        Ok(batches)
    }
}
