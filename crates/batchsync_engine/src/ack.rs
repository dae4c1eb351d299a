//! Acknowledgements from target nodes.

use batchsync_protocol::{BatchStatus, OutgoingBatch};
use batchsync_storage::StagingKey;

use crate::context::{in_transaction, EngineContext};
use crate::error::{SyncError, SyncResult};

/// What the target reported for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    /// Applied.
    Ok,
    /// Failed to apply.
    Error {
        /// Error code reported by the target.
        sql_code: i32,
        /// SQL state reported by the target.
        sql_state: Option<String>,
        /// Error message.
        message: String,
    },
}

/// Applies acknowledgements to the ledger and load progress.
pub(crate) struct Acknowledger<'a> {
    ctx: &'a EngineContext,
}

impl<'a> Acknowledger<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Records the target's verdict on a sent batch.
    ///
    /// OK and IG batches are returned unchanged. A successful load batch
    /// counts toward its load's progress, and the staged payload is removed
    /// once no reader holds it.
    pub(crate) fn ack(&self, node_id: &str, batch_id: u64, result: AckResult) -> SyncResult<OutgoingBatch> {
        let now = self.ctx.now();
        let batch = in_transaction(&self.ctx.db, |txn| {
            let mut batch = txn.require_outgoing_batch(batch_id)?.clone();
            if batch.node_id != node_id {
                return Err(SyncError::validation(format!(
                    "batch {batch_id} belongs to node {}, not {node_id}",
                    batch.node_id
                )));
            }
            if matches!(batch.status, BatchStatus::Ok | BatchStatus::Ignored) {
                return Ok(batch);
            }
            match &result {
                AckResult::Ok => {
                    batch.status = BatchStatus::Ok;
                    batch.clear_error();
                    txn.mark_applied(node_id, batch_id);
                    if batch.load_flag {
                        let completed = txn.reload_status_mut(batch.load_id).and_then(|status| {
                            status
                                .record_loaded(batch_id, batch.data_row_count, now)
                                .then(|| (status.target_node_id.clone(), status.rows_loaded))
                        });
                        if let Some((target, rows)) = completed {
                            tracing::info!(load_id = batch.load_id, node_id = %target, rows, "load completed");
                            if let Some(mut security) = txn.node_security(&target).cloned() {
                                security.initial_load_end_time = Some(now);
                                txn.put_node_security(security);
                            }
                        }
                    }
                }
                AckResult::Error {
                    sql_code,
                    sql_state,
                    message,
                } => {
                    tracing::error!(batch_id, node_id, load_id = batch.load_id, sql_code, message = %message, "batch failed at target");
                    batch.record_error(*sql_code, sql_state.clone(), message.clone());
                    batch.status = BatchStatus::Error;
                }
            }
            batch.last_update_time = now;
            txn.update_outgoing_batch(&batch)?;
            Ok(batch)
        })?;

        if batch.status == BatchStatus::Ok {
            let key = StagingKey::outgoing(&batch.staged_location, batch.batch_id);
            if let Some(resource) = self.ctx.staging.find(&key)? {
                if !resource.is_in_use() {
                    resource.delete()?;
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, config, DEFAULT_CHANNEL, STORE, STORE_2};
    use crate::MockTransport;
    use batchsync_core::DEFAULT_QUEUE;
    use batchsync_storage::StagingStore;

    fn sent_batch(t: &test_support::TestEngine) -> OutgoingBatch {
        let batch = t.add_batch(STORE, DEFAULT_CHANNEL, 2, 10);
        let transport = MockTransport::new();
        t.engine.extract(STORE, DEFAULT_QUEUE, &transport).unwrap();
        assert_eq!(t.batch(batch.batch_id).status, BatchStatus::Loading);
        batch
    }

    #[test]
    fn ok_completes_the_batch_and_drops_its_payload() {
        let t = test_support::engine(config());
        let batch = sent_batch(&t);

        let acked = t.engine.ack(STORE, batch.batch_id, AckResult::Ok).unwrap();
        assert_eq!(acked.status, BatchStatus::Ok);
        assert!(t.staging.keys().unwrap().is_empty());
        assert!(t.ctx().db.read(|tb| tb.is_applied(STORE, batch.batch_id)));
    }

    #[test]
    fn error_records_what_the_target_reported() {
        let t = test_support::engine(config());
        let batch = sent_batch(&t);

        let acked = t
            .engine
            .ack(
                STORE,
                batch.batch_id,
                AckResult::Error {
                    sql_code: 1062,
                    sql_state: Some("23000".into()),
                    message: "duplicate key".into(),
                },
            )
            .unwrap();
        assert_eq!(acked.status, BatchStatus::Error);
        assert!(acked.error_flag);
        assert_eq!(acked.sql_code, 1062);
        assert_eq!(acked.sql_message.as_deref(), Some("duplicate key"));
        // Kept for the next attempt.
        assert_eq!(t.staging.keys().unwrap().len(), 1);

        let acked = t.engine.ack(STORE, batch.batch_id, AckResult::Ok).unwrap();
        assert_eq!(acked.status, BatchStatus::Ok);
        assert!(!acked.error_flag);
    }

    #[test]
    fn ack_from_another_node_is_rejected() {
        let t = test_support::engine(config());
        let batch = sent_batch(&t);

        let err = t.engine.ack(STORE_2, batch.batch_id, AckResult::Ok).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(t.batch(batch.batch_id).status, BatchStatus::Loading);
    }

    #[test]
    fn completed_batch_is_left_alone() {
        let t = test_support::engine(config());
        let batch = sent_batch(&t);
        t.engine.ack(STORE, batch.batch_id, AckResult::Ok).unwrap();

        let again = t
            .engine
            .ack(
                STORE,
                batch.batch_id,
                AckResult::Error {
                    sql_code: 1,
                    sql_state: None,
                    message: "late".into(),
                },
            )
            .unwrap();
        assert_eq!(again.status, BatchStatus::Ok);
        assert!(!again.error_flag);
    }
}
