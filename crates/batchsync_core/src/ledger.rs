//! Batch ledger: outgoing batch rows and their status transitions.

use batchsync_protocol::{BatchStatus, OutgoingBatch};
use std::collections::BTreeMap;

use crate::database::Tables;
use crate::error::{CoreError, CoreResult};

/// Whether a batch in `status` is offered to extraction.
///
/// LD batches wait for an acknowledgement, ER batches wait for an operator,
/// OK and LS batches are done.
pub fn is_extract_candidate(status: BatchStatus) -> bool {
    matches!(
        status,
        BatchStatus::New
            | BatchStatus::Requested
            | BatchStatus::Querying
            | BatchStatus::Sending
            | BatchStatus::Resend
            | BatchStatus::Ignored
    )
}

impl Tables {
    /// Inserts a new batch.
    pub fn insert_outgoing_batch(&mut self, batch: OutgoingBatch) -> CoreResult<()> {
        if self.outgoing_batches.contains_key(&batch.batch_id) {
            return Err(CoreError::duplicate(format!("batch {}", batch.batch_id)));
        }
        self.outgoing_batches.insert(batch.batch_id, batch);
        Ok(())
    }

    /// Looks a batch up.
    pub fn outgoing_batch(&self, batch_id: u64) -> Option<&OutgoingBatch> {
        self.outgoing_batches.get(&batch_id)
    }

    /// Looks a batch up or fails with `NotFound`.
    pub fn require_outgoing_batch(&self, batch_id: u64) -> CoreResult<&OutgoingBatch> {
        self.outgoing_batch(batch_id)
            .ok_or_else(|| CoreError::not_found(format!("batch {batch_id}")))
    }

    /// Writes a batch row back.
    ///
    /// A stored IG row is sticky: updates that would move it anywhere
    /// else are dropped and `false` is returned.
    pub fn update_outgoing_batch(&mut self, batch: &OutgoingBatch) -> CoreResult<bool> {
        let stored = self
            .outgoing_batches
            .get_mut(&batch.batch_id)
            .ok_or_else(|| CoreError::not_found(format!("batch {}", batch.batch_id)))?;
        if stored.status == BatchStatus::Ignored && batch.status != BatchStatus::Ignored {
            tracing::debug!(batch_id = batch.batch_id, status = %batch.status, "batch is ignored, update dropped");
            return Ok(false);
        }
        *stored = batch.clone();
        Ok(true)
    }

    /// Operator reset: puts a batch back to `status` with cleared stats and errors.
    ///
    /// This is the one path allowed to move a batch out of OK or IG.
    pub fn reset_outgoing_batch(
        &mut self,
        batch_id: u64,
        status: BatchStatus,
        now: u64,
    ) -> CoreResult<()> {
        let batch = self
            .outgoing_batches
            .get_mut(&batch_id)
            .ok_or_else(|| CoreError::not_found(format!("batch {batch_id}")))?;
        batch.reset(status);
        batch.last_update_time = now;
        Ok(())
    }

    /// All batches in id order.
    pub fn outgoing_batches(&self) -> impl Iterator<Item = &OutgoingBatch> {
        self.outgoing_batches.values()
    }

    /// Batches of `node_id` offered to extraction, in id order.
    pub fn outgoing_batches_for_node(&self, node_id: &str) -> Vec<OutgoingBatch> {
        self.outgoing_batches
            .values()
            .filter(|b| b.node_id == node_id && is_extract_candidate(b.status))
            .cloned()
            .collect()
    }

    /// Batches of `node_id` with ids in `[start, end]`.
    pub fn outgoing_batches_in_range(&self, node_id: &str, start: u64, end: u64) -> Vec<OutgoingBatch> {
        self.outgoing_batches
            .range(start..=end)
            .map(|(_, b)| b)
            .filter(|b| b.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Batches carrying `load_id`.
    pub fn outgoing_batches_for_load(&self, load_id: u64) -> Vec<OutgoingBatch> {
        self.outgoing_batches
            .values()
            .filter(|b| b.load_id == load_id)
            .cloned()
            .collect()
    }

    /// Whether `node_id` still has load batches in flight.
    pub fn has_unfinished_load_batches(&self, node_id: &str) -> bool {
        self.outgoing_batches
            .values()
            .any(|b| b.node_id == node_id && b.load_flag && !b.status.is_complete())
    }

    /// Whether a load batch of `node_id` is in error.
    pub fn has_load_batch_in_error(&self, node_id: &str) -> bool {
        self.outgoing_batches
            .values()
            .any(|b| b.node_id == node_id && b.load_flag && b.status == BatchStatus::Error)
    }

    /// Marks every unfinished batch of `node_id` OK with `ignore_count`
    /// incremented, except on `keep_channels`. Returns the number changed.
    pub fn mark_all_as_sent_for_node(&mut self, node_id: &str, keep_channels: &[&str], now: u64) -> usize {
        let mut changed = 0;
        for batch in self.outgoing_batches.values_mut() {
            if batch.node_id == node_id
                && !batch.status.is_complete()
                && !keep_channels.contains(&batch.channel_id.as_str())
            {
                batch.status = BatchStatus::Ok;
                batch.ignore_count += 1;
                batch.last_update_time = now;
                changed += 1;
            }
        }
        changed
    }

    /// Marks every unfinished batch of a load OK with `ignore_count`
    /// incremented. Returns the number changed.
    pub fn cancel_load_batches(&mut self, load_id: u64, now: u64) -> usize {
        let mut changed = 0;
        for batch in self.outgoing_batches.values_mut() {
            if batch.load_id == load_id && !batch.status.is_complete() {
                batch.status = BatchStatus::Ok;
                batch.ignore_count += 1;
                batch.last_update_time = now;
                changed += 1;
            }
        }
        changed
    }

    /// Batch counts per status code.
    pub fn count_batches_by_status(&self) -> BTreeMap<BatchStatus, usize> {
        let mut counts = BTreeMap::new();
        for batch in self.outgoing_batches.values() {
            *counts.entry(batch.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Tables {
        let mut t = Tables::default();
        for id in 1..=5 {
            t.insert_outgoing_batch(OutgoingBatch::new(id, "001", "default", 0))
                .unwrap();
        }
        t.insert_outgoing_batch(OutgoingBatch::new(6, "002", "default", 0))
            .unwrap();
        t
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut t = tables();
        assert!(matches!(
            t.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", 0)),
            Err(CoreError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn ignored_is_sticky_until_reset() {
        let mut t = tables();
        let mut batch = t.outgoing_batch(1).cloned().unwrap();
        batch.status = BatchStatus::Ignored;
        assert!(t.update_outgoing_batch(&batch).unwrap());

        batch.status = BatchStatus::Querying;
        assert!(!t.update_outgoing_batch(&batch).unwrap());
        assert_eq!(t.outgoing_batch(1).unwrap().status, BatchStatus::Ignored);

        t.reset_outgoing_batch(1, BatchStatus::New, 5).unwrap();
        assert_eq!(t.outgoing_batch(1).unwrap().status, BatchStatus::New);
    }

    #[test]
    fn candidates_skip_done_and_waiting() {
        let mut t = tables();
        for (id, status) in [
            (2, BatchStatus::Ok),
            (3, BatchStatus::Loading),
            (4, BatchStatus::Error),
        ] {
            let mut b = t.outgoing_batch(id).cloned().unwrap();
            b.status = status;
            t.update_outgoing_batch(&b).unwrap();
        }
        let ids: Vec<u64> = t
            .outgoing_batches_for_node("001")
            .iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 5]);
        assert_eq!(t.outgoing_batches_in_range("001", 2, 6).len(), 4);
        assert_eq!(t.count_batches_by_status()[&BatchStatus::New], 3);
    }

    #[test]
    fn cancel_load_marks_ok_with_ignore() {
        let mut t = Tables::default();
        t.insert_outgoing_batch(OutgoingBatch::new(1, "001", "reload", 0).with_load(7))
            .unwrap();
        t.insert_outgoing_batch(
            OutgoingBatch::new(2, "001", "reload", 0)
                .with_load(7)
                .with_status(BatchStatus::Ok),
        )
        .unwrap();
        assert!(t.has_unfinished_load_batches("001"));
        assert_eq!(t.cancel_load_batches(7, 9), 1);
        let b = t.outgoing_batch(1).unwrap();
        assert_eq!((b.status, b.ignore_count), (BatchStatus::Ok, 1));
        assert_eq!(t.outgoing_batch(2).unwrap().ignore_count, 0);
        assert!(!t.has_unfinished_load_batches("001"));
    }

    #[test]
    fn mark_all_as_sent_keeps_listed_channels() {
        let mut t = tables();
        t.insert_outgoing_batch(OutgoingBatch::new(7, "001", "config", 0))
            .unwrap();
        assert_eq!(t.mark_all_as_sent_for_node("001", &["config"], 1), 5);
        assert_eq!(t.outgoing_batch(7).unwrap().status, BatchStatus::New);
        assert_eq!(t.outgoing_batch(6).unwrap().status, BatchStatus::New);
    }
}
