//! Registry of running engine work, with cooperative interruption.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// What a registered process is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// Extracting batches for a transport.
    Extract,
    /// Working through extract requests.
    ExtractRequest,
    /// Inserting reload events for a load.
    InsertReloadEvents,
    /// Turning reload requests into loads.
    InitialLoadQueue,
}

/// Lifecycle of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    /// Still working.
    Running,
    /// Finished normally.
    Ok,
    /// Failed.
    Error,
    /// Stopped by an operator.
    Interrupted,
}

/// Progress record of one running unit of work.
#[derive(Debug)]
pub struct ProcessInfo {
    id: Uuid,
    kind: ProcessKind,
    node_id: String,
    queue: Option<String>,
    start_time: u64,
    load_id: AtomicU64,
    current_batch_id: AtomicU64,
    batch_count: AtomicU64,
    row_count: AtomicU64,
    current_table: Mutex<Option<String>>,
    status: Mutex<ProcessStatus>,
    interrupted: AtomicBool,
}

/// Point-in-time copy of a [`ProcessInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    /// Process id.
    pub id: Uuid,
    /// Kind of work.
    pub kind: ProcessKind,
    /// Node the work is for.
    pub node_id: String,
    /// Queue, for extraction work.
    pub queue: Option<String>,
    /// Load, or 0.
    pub load_id: u64,
    /// Batch being worked on, or 0.
    pub current_batch_id: u64,
    /// Table being worked on.
    pub current_table: Option<String>,
    /// Batches finished.
    pub batch_count: u64,
    /// Rows processed.
    pub row_count: u64,
    /// Current status.
    pub status: ProcessStatus,
    /// Registration time in epoch millis.
    pub start_time: u64,
}

impl ProcessInfo {
    /// Process id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kind of work.
    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    /// Node the work is for.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Load the work belongs to, 0 if none.
    pub fn load_id(&self) -> u64 {
        self.load_id.load(Ordering::SeqCst)
    }

    /// Attaches the work to a load.
    pub fn set_load_id(&self, load_id: u64) {
        self.load_id.store(load_id, Ordering::SeqCst);
    }

    /// Records the batch being worked on.
    pub fn set_current_batch(&self, batch_id: u64) {
        self.current_batch_id.store(batch_id, Ordering::SeqCst);
    }

    /// Records the table being worked on.
    pub fn set_current_table(&self, table: Option<&str>) {
        *self.current_table.lock() = table.map(str::to_string);
    }

    /// Counts a finished batch.
    pub fn batch_done(&self) {
        self.batch_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts processed rows.
    pub fn add_rows(&self, rows: u64) {
        self.row_count.fetch_add(rows, Ordering::SeqCst);
    }

    /// Sets the status.
    pub fn set_status(&self, status: ProcessStatus) {
        *self.status.lock() = status;
    }

    /// Current status.
    pub fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    /// Asks the work to stop at its next check.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Whether an interrupt was requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Fails with [`SyncError::Interrupted`] if an interrupt was requested.
    pub fn check_interrupted(&self) -> SyncResult<()> {
        if self.is_interrupted() {
            self.set_status(ProcessStatus::Interrupted);
            return Err(SyncError::Interrupted(format!(
                "{:?} for node {} was interrupted",
                self.kind, self.node_id
            )));
        }
        Ok(())
    }

    /// Copies the current values out.
    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id,
            kind: self.kind,
            node_id: self.node_id.clone(),
            queue: self.queue.clone(),
            load_id: self.load_id(),
            current_batch_id: self.current_batch_id.load(Ordering::SeqCst),
            current_table: self.current_table.lock().clone(),
            batch_count: self.batch_count.load(Ordering::SeqCst),
            row_count: self.row_count.load(Ordering::SeqCst),
            status: self.status(),
            start_time: self.start_time,
        }
    }
}

/// Live processes of this engine.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<Uuid, Arc<ProcessInfo>>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process; it is removed when the handle drops.
    pub fn register(
        &self,
        kind: ProcessKind,
        node_id: &str,
        queue: Option<&str>,
        now: u64,
    ) -> ProcessHandle<'_> {
        let info = Arc::new(ProcessInfo {
            id: Uuid::new_v4(),
            kind,
            node_id: node_id.to_string(),
            queue: queue.map(str::to_string),
            start_time: now,
            load_id: AtomicU64::new(0),
            current_batch_id: AtomicU64::new(0),
            batch_count: AtomicU64::new(0),
            row_count: AtomicU64::new(0),
            current_table: Mutex::new(None),
            status: Mutex::new(ProcessStatus::Running),
            interrupted: AtomicBool::new(false),
        });
        self.processes.write().insert(info.id, Arc::clone(&info));
        ProcessHandle {
            registry: self,
            info,
        }
    }

    /// Interrupts every process working on `load_id`. Returns how many.
    pub fn interrupt_load(&self, load_id: u64) -> usize {
        let processes = self.processes.read();
        let mut count = 0;
        for info in processes.values().filter(|p| p.load_id() == load_id) {
            info.interrupt();
            count += 1;
        }
        count
    }

    /// Interrupts one process by id.
    pub fn interrupt(&self, id: Uuid) -> bool {
        match self.processes.read().get(&id) {
            Some(info) => {
                info.interrupt();
                true
            }
            None => false,
        }
    }

    /// Live processes, oldest first.
    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let mut all: Vec<_> = self
            .processes
            .read()
            .values()
            .map(|p| p.snapshot())
            .collect();
        all.sort_by_key(|p| p.start_time);
        all
    }
}

/// Registration of a running process. Unregisters on drop.
#[derive(Debug)]
pub struct ProcessHandle<'a> {
    registry: &'a ProcessRegistry,
    info: Arc<ProcessInfo>,
}

impl ProcessHandle<'_> {
    /// Shared progress record, for handing to worker threads.
    pub fn info(&self) -> Arc<ProcessInfo> {
        Arc::clone(&self.info)
    }
}

impl Deref for ProcessHandle<'_> {
    type Target = ProcessInfo;

    fn deref(&self) -> &ProcessInfo {
        &self.info
    }
}

impl Drop for ProcessHandle<'_> {
    fn drop(&mut self) {
        if self.info.status() == ProcessStatus::Running {
            self.info.set_status(ProcessStatus::Ok);
        }
        self.registry.processes.write().remove(&self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_unregisters_on_drop() {
        let registry = ProcessRegistry::new();
        {
            let handle = registry.register(ProcessKind::Extract, "001", Some("default"), 5);
            handle.set_current_batch(12);
            handle.add_rows(3);
            let snap = registry.snapshot();
            assert_eq!(snap.len(), 1);
            assert_eq!(snap[0].current_batch_id, 12);
            assert_eq!(snap[0].row_count, 3);
        }
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn interrupt_by_load() {
        let registry = ProcessRegistry::new();
        let a = registry.register(ProcessKind::ExtractRequest, "001", None, 1);
        let b = registry.register(ProcessKind::ExtractRequest, "002", None, 2);
        a.set_load_id(7);
        b.set_load_id(8);

        assert_eq!(registry.interrupt_load(7), 1);
        assert!(matches!(a.check_interrupted(), Err(SyncError::Interrupted(_))));
        assert_eq!(a.status(), ProcessStatus::Interrupted);
        assert!(b.check_interrupted().is_ok());
        assert!(registry.interrupt(b.id()));
        assert!(b.is_interrupted());
    }
}
