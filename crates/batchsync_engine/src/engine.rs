//! The engine facade.

use batchsync_core::{
    ChangeLog, Clock, ClusterService, ConfigRegistry, Database, LocalClusterService, MemorySource,
    SequenceGenerator, SourceDatabase, SystemClock, TriggerRouterService,
};
use batchsync_protocol::{ChangeRecord, ExtractRequest, OutgoingBatch, TableReloadRequest};
use batchsync_storage::{InMemoryStaging, StagingStore};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ack::{AckResult, Acknowledger};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::{SyncError, SyncResult};
use crate::extract::{DataExtractor, ExtractRequestService, NodeQueueStatus};
use crate::listener::{ReloadListener, ReloadListeners};
use crate::locks::BatchLockManager;
use crate::process::{ProcessRegistry, ProcessSnapshot};
use crate::reload::{InitialLoadQueue, ReloadOutcome, ReloadService};
use crate::route::Router;
use crate::transform::{TableTransforms, TransformStage};
use crate::transport::OutgoingTransport;

/// Default time a trigger router lookup stays cached.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default lease of cluster locks held by a local engine.
const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Routes, extracts and reloads batches for one source node.
///
/// # Example
///
/// ```rust
/// use batchsync_core::{ConfigRegistry, Node};
/// use batchsync_engine::{EngineConfig, SyncEngine};
/// use std::sync::Arc;
///
/// let registry = Arc::new(ConfigRegistry::new(Node::new("00000", "corp")));
/// let engine = SyncEngine::builder(EngineConfig::new("00000"), registry)
///     .build()
///     .unwrap();
/// assert!(engine.is_extraction_enabled());
/// ```
pub struct SyncEngine {
    ctx: Arc<EngineContext>,
}

impl SyncEngine {
    /// Starts building an engine for the local node described by `registry`.
    pub fn builder(config: EngineConfig, registry: Arc<ConfigRegistry>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config, registry)
    }

    /// Stores a captured change. Returns its data id.
    pub fn capture_change(&self, record: ChangeRecord) -> SyncResult<u64> {
        Ok(self.ctx.change_log.capture_change(record)?)
    }

    /// Assigns captured changes to outgoing batches.
    pub fn route(&self) -> SyncResult<usize> {
        Router::new(&self.ctx).route()
    }

    /// Extracts and sends the pending batches of `node_id` on `queue`.
    pub fn extract(
        &self,
        node_id: &str,
        queue: &str,
        transport: &dyn OutgoingTransport,
    ) -> SyncResult<Vec<OutgoingBatch>> {
        DataExtractor::new(&self.ctx).extract(node_id, queue, transport)
    }

    /// Runs the extract job over pending extract requests.
    pub fn queue_work(&self, force: bool) -> SyncResult<Vec<NodeQueueStatus>> {
        ExtractRequestService::new(&self.ctx).queue_work(force)
    }

    /// Inserts the reload events of one target node right away.
    ///
    /// Returns the extract requests created, by trigger history id.
    pub fn insert_reload_events(
        &self,
        target_node_id: &str,
        reverse: bool,
        requests: &[TableReloadRequest],
    ) -> SyncResult<BTreeMap<u32, ExtractRequest>> {
        self.insert_reload(target_node_id, reverse, requests)
            .map(|outcome| outcome.extract_requests)
    }

    /// Like [`insert_reload_events`](Self::insert_reload_events), also
    /// returning the load id.
    pub fn insert_reload(
        &self,
        target_node_id: &str,
        reverse: bool,
        requests: &[TableReloadRequest],
    ) -> SyncResult<ReloadOutcome> {
        let target = self
            .ctx
            .registry
            .node(target_node_id)
            .ok_or_else(|| SyncError::validation(format!("unknown node {target_node_id}")))?;
        ReloadService::new(&self.ctx).insert_reload_events(&target, reverse, requests, &BTreeMap::new())
    }

    /// Queues a reload request for [`process_reload_requests`](Self::process_reload_requests).
    pub fn request_reload(&self, request: TableReloadRequest) -> SyncResult<()> {
        tracing::info!(
            node_id = %request.target_node_id,
            trigger = %request.trigger_id,
            router = %request.router_id,
            "reload requested"
        );
        self.ctx.db.write(|t| {
            t.insert_reload_request(request);
            Ok(())
        })?;
        Ok(())
    }

    /// Starts loads for queued reload requests. Returns the new load ids.
    pub fn process_reload_requests(&self, force: bool) -> SyncResult<Vec<u64>> {
        InitialLoadQueue::new(&self.ctx).process_reload_requests(force)
    }

    /// Restarts the extract request whose range holds `batch_id` for `node_id`.
    ///
    /// Returns false when no request covers the batch.
    pub fn reset_extract_request(&self, node_id: &str, batch_id: u64) -> SyncResult<bool> {
        let request_id = self
            .ctx
            .db
            .read(|t| t.extract_request_for_batch(node_id, batch_id).map(|r| r.request_id));
        match request_id {
            Some(id) => {
                ExtractRequestService::new(&self.ctx).restart_extract_request(id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Starts an extract request and its family over. Returns the batches reset.
    pub fn restart_extract_request(&self, request_id: u64) -> SyncResult<usize> {
        ExtractRequestService::new(&self.ctx).restart_extract_request(request_id)
    }

    /// Marks every extract request of a load OK. Returns how many changed.
    pub fn cancel_extract_requests(&self, load_id: u64) -> SyncResult<usize> {
        let now = self.ctx.now();
        Ok(self.ctx.db.write(|t| Ok(t.cancel_extract_requests(load_id, now)))?)
    }

    /// Cancels a load. Returns the number of batches cancelled.
    pub fn cancel_load(&self, load_id: u64) -> SyncResult<usize> {
        InitialLoadQueue::new(&self.ctx).cancel_load(load_id)
    }

    /// Records a target's acknowledgement of a sent batch.
    pub fn ack(&self, node_id: &str, batch_id: u64, result: AckResult) -> SyncResult<OutgoingBatch> {
        Acknowledger::new(&self.ctx).ack(node_id, batch_id, result)
    }

    /// Re-enables extraction after the staging medium was found full.
    pub fn enable_extraction(&self) {
        tracing::info!("extraction enabled");
        self.ctx.set_extraction_enabled(true);
    }

    /// Whether extraction runs.
    pub fn is_extraction_enabled(&self) -> bool {
        self.ctx.is_extraction_enabled()
    }

    /// Snapshot of registered processes.
    pub fn processes(&self) -> Vec<ProcessSnapshot> {
        self.ctx.processes.snapshot()
    }

    /// Asks a running process to stop at its next checkpoint.
    ///
    /// Returns `false` if no process with `id` is registered.
    pub fn interrupt_process(&self, id: Uuid) -> bool {
        let found = self.ctx.processes.interrupt(id);
        if found {
            tracing::info!(process_id = %id, "process interrupt requested");
        }
        found
    }

    /// Registers a reload listener.
    pub fn add_reload_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.ctx.listeners.add(listener);
    }

    /// Missing data id ranges in `[start, end]`.
    pub fn find_gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.ctx.change_log.find_gaps(start, end)
    }

    /// Drops cached configuration lookups.
    pub fn invalidate_caches(&self) {
        self.ctx.trigger_routers.invalidate();
    }

    /// The ledger database.
    pub fn database(&self) -> &Arc<Database> {
        &self.ctx.db
    }

    /// The configuration registry.
    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.ctx.registry
    }

    /// The staging store.
    pub fn staging(&self) -> &Arc<dyn StagingStore> {
        &self.ctx.staging
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &EngineContext {
        &self.ctx
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("node_id", &self.ctx.node_id())
            .field("extraction_enabled", &self.ctx.is_extraction_enabled())
            .finish()
    }
}

/// Wires a [`SyncEngine`] over its collaborators.
///
/// Anything not supplied gets an in-memory or local default.
pub struct SyncEngineBuilder {
    config: EngineConfig,
    registry: Arc<ConfigRegistry>,
    db: Option<Arc<Database>>,
    staging: Option<Arc<dyn StagingStore>>,
    source: Option<Arc<dyn SourceDatabase>>,
    cluster: Option<Arc<dyn ClusterService>>,
    clock: Option<Arc<dyn Clock>>,
    transforms: Option<Arc<dyn TransformStage>>,
    cache_ttl: Duration,
}

impl SyncEngineBuilder {
    fn new(config: EngineConfig, registry: Arc<ConfigRegistry>) -> Self {
        Self {
            config,
            registry,
            db: None,
            staging: None,
            source: None,
            cluster: None,
            clock: None,
            transforms: None,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Uses an existing ledger database.
    #[must_use]
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Uses a staging store.
    #[must_use]
    pub fn with_staging(mut self, staging: Arc<dyn StagingStore>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Uses a source database for reloads.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceDatabase>) -> Self {
        self.source = Some(source);
        self
    }

    /// Uses a cluster lock service.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterService>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Uses a clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses a transform stage.
    #[must_use]
    pub fn with_transforms(mut self, transforms: Arc<dyn TransformStage>) -> Self {
        self.transforms = Some(transforms);
        self
    }

    /// Sets how long trigger router lookups stay cached.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        let identity = &self.registry.identity().node_id;
        if *identity != self.config.node_id {
            return Err(SyncError::Config(format!(
                "engine node id {} does not match registry identity {identity}",
                self.config.node_id
            )));
        }

        let db = match self.db {
            Some(db) => db,
            None => Arc::new(Database::open_in_memory()?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sequences: Arc<dyn SequenceGenerator> = db.sequences();
        let staging = self
            .staging
            .unwrap_or_else(|| Arc::new(InMemoryStaging::new()));
        let source = self.source.unwrap_or_else(|| Arc::new(MemorySource::new()));
        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(LocalClusterService::new(Arc::clone(&clock), DEFAULT_LOCK_LEASE)));
        let transforms = self
            .transforms
            .unwrap_or_else(|| Arc::new(TableTransforms::new(Arc::clone(&self.registry))));
        let trigger_routers =
            TriggerRouterService::new(Arc::clone(&self.registry), Arc::clone(&clock), self.cache_ttl);
        let change_log = ChangeLog::new(Arc::clone(&db), Arc::clone(&sequences), Arc::clone(&clock));

        tracing::info!(
            node_id = %self.config.node_id,
            stream_to_file = self.config.stream_to_file,
            threads = self.config.effective_thread_count(),
            "sync engine ready"
        );
        Ok(SyncEngine {
            ctx: Arc::new(EngineContext {
                config: self.config,
                db,
                registry: self.registry,
                trigger_routers,
                staging,
                source,
                sequences,
                cluster,
                clock,
                transforms,
                change_log,
                processes: ProcessRegistry::new(),
                listeners: ReloadListeners::new(),
                locks: BatchLockManager::new(),
                extraction_enabled: AtomicBool::new(true),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::process::ProcessKind;
    use crate::test_support::{self, config, STORE};
    use crate::SyncError;
    use uuid::Uuid;

    #[test]
    fn running_process_can_be_interrupted_by_id() {
        let t = test_support::engine(config());
        let handle = t
            .ctx()
            .processes
            .register(ProcessKind::Extract, STORE, Some("default"), t.ctx().now());
        let id = t.engine.processes()[0].id;

        assert!(!t.engine.interrupt_process(Uuid::new_v4()));
        assert!(t.engine.interrupt_process(id));
        assert!(matches!(handle.check_interrupted(), Err(SyncError::Interrupted(_))));
    }
}
