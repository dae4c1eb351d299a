//! Reload extension points.

use batchsync_core::{Node, Transaction};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::SyncResult;

/// Callbacks run inside the reload insertion transaction.
///
/// An error aborts the reload and rolls the transaction back.
pub trait ReloadListener: Send + Sync {
    /// Called before any batch of the load is inserted.
    fn before_reload(&self, _txn: &mut Transaction<'_>, _target: &Node, _load_id: u64) -> SyncResult<()> {
        Ok(())
    }

    /// Called after every batch of the load is inserted.
    fn after_reload(&self, _txn: &mut Transaction<'_>, _target: &Node, _load_id: u64) -> SyncResult<()> {
        Ok(())
    }
}

/// Registered reload listeners, called in registration order.
#[derive(Default)]
pub struct ReloadListeners {
    listeners: RwLock<Vec<Arc<dyn ReloadListener>>>,
}

impl ReloadListeners {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener.
    pub fn add(&self, listener: Arc<dyn ReloadListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn before_reload(&self, txn: &mut Transaction<'_>, target: &Node, load_id: u64) -> SyncResult<()> {
        for listener in self.snapshot() {
            listener.before_reload(txn, target, load_id)?;
        }
        Ok(())
    }

    pub(crate) fn after_reload(&self, txn: &mut Transaction<'_>, target: &Node, load_id: u64) -> SyncResult<()> {
        for listener in self.snapshot() {
            listener.after_reload(txn, target, load_id)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn ReloadListener>> {
        self.listeners.read().clone()
    }
}

impl std::fmt::Debug for ReloadListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadListeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_core::Database;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ReloadListener for Recorder {
        fn before_reload(&self, _txn: &mut Transaction<'_>, target: &Node, load_id: u64) -> SyncResult<()> {
            self.calls
                .lock()
                .push(format!("{}:before:{}:{load_id}", self.name, target.node_id));
            Ok(())
        }

        fn after_reload(&self, _txn: &mut Transaction<'_>, _target: &Node, _load_id: u64) -> SyncResult<()> {
            self.calls.lock().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    #[test]
    fn listeners_run_in_insertion_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let listeners = ReloadListeners::new();
        for name in ["first", "second"] {
            listeners.add(Arc::new(Recorder {
                name,
                calls: calls.clone(),
            }));
        }
        let db = Database::open_in_memory().unwrap();
        let target = Node::new("001", "store");
        db.transaction(|txn| {
            listeners.before_reload(txn, &target, 3).map_err(|e| {
                batchsync_core::CoreError::transaction_aborted(e.to_string())
            })?;
            listeners.after_reload(txn, &target, 3).map_err(|e| {
                batchsync_core::CoreError::transaction_aborted(e.to_string())
            })?;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            *calls.lock(),
            vec![
                "first:before:001:3",
                "second:before:001:3",
                "first:after",
                "second:after"
            ]
        );
    }
}
