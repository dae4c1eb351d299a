//! Shared state handed to every engine component.

use batchsync_core::{
    ChangeLog, Clock, ClusterService, ConfigRegistry, CoreError, Database, SequenceGenerator,
    SourceDatabase, Transaction, TriggerRouterService,
};
use batchsync_storage::StagingStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::listener::ReloadListeners;
use crate::locks::BatchLockManager;
use crate::process::ProcessRegistry;
use crate::transform::TransformStage;

/// Collaborators and process-wide state of one engine instance.
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) db: Arc<Database>,
    pub(crate) registry: Arc<ConfigRegistry>,
    pub(crate) trigger_routers: TriggerRouterService,
    pub(crate) staging: Arc<dyn StagingStore>,
    pub(crate) source: Arc<dyn SourceDatabase>,
    pub(crate) sequences: Arc<dyn SequenceGenerator>,
    pub(crate) cluster: Arc<dyn ClusterService>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) transforms: Arc<dyn TransformStage>,
    pub(crate) change_log: ChangeLog,
    pub(crate) processes: ProcessRegistry,
    pub(crate) listeners: ReloadListeners,
    pub(crate) locks: BatchLockManager,
    pub(crate) extraction_enabled: AtomicBool,
}

impl EngineContext {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub(crate) fn node_group_id(&self) -> &str {
        &self.registry.identity().node_group_id
    }

    pub(crate) fn is_extraction_enabled(&self) -> bool {
        self.extraction_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_extraction_enabled(&self, enabled: bool) {
        self.extraction_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether `channel_id` is a reload channel.
    pub(crate) fn is_reload_channel(&self, channel_id: &str) -> bool {
        self.registry
            .channel(channel_id)
            .map_or(false, |c| c.reload_flag)
    }

    /// Target node group of `node_id`, falling back to the local group.
    pub(crate) fn group_of(&self, node_id: &str) -> String {
        self.registry
            .node(node_id)
            .map(|n| n.node_group_id)
            .unwrap_or_else(|| self.node_group_id().to_string())
    }
}

/// Runs `f` in a ledger transaction, keeping the engine error that aborted it.
pub(crate) fn in_transaction<T>(
    db: &Database,
    f: impl FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
) -> SyncResult<T> {
    let mut failure = None;
    let result = db.transaction(|txn| {
        f(txn).map_err(|e| {
            let reason = e.to_string();
            failure = Some(e);
            CoreError::transaction_aborted(reason)
        })
    });
    match result {
        Ok(value) => Ok(value),
        Err(e) => Err(failure.take().unwrap_or(SyncError::Database(e))),
    }
}
