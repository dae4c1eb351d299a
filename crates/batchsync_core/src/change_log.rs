//! Change record store: captured rows, data events and gap tracking.

use batchsync_protocol::{ChangeRecord, DataEvent};
use std::sync::Arc;

use crate::clock::Clock;
use crate::database::{Database, Tables};
use crate::error::{CoreError, CoreResult};
use crate::sequence::{SequenceGenerator, SEQ_DATA};

impl Tables {
    /// Stores a captured record. Its id must be assigned and unused.
    pub fn insert_data(&mut self, record: ChangeRecord) -> CoreResult<()> {
        if record.data_id == 0 {
            return Err(CoreError::validation("change record has no id"));
        }
        if self.data.contains_key(&record.data_id) {
            return Err(CoreError::duplicate(format!("data {}", record.data_id)));
        }
        self.data.insert(record.data_id, record);
        Ok(())
    }

    /// Looks a record up.
    pub fn data(&self, data_id: u64) -> Option<&ChangeRecord> {
        self.data.get(&data_id)
    }

    /// Records with ids above `data_id`, ascending, at most `limit`.
    pub fn data_after(&self, data_id: u64, limit: usize) -> Vec<ChangeRecord> {
        self.data
            .range(data_id + 1..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Assigns a record to a batch.
    pub fn insert_data_event(&mut self, event: DataEvent) {
        self.data_events
            .insert((event.batch_id, event.data_id), event);
    }

    /// Records of a batch in ascending id order.
    pub fn data_for_batch(&self, batch_id: u64) -> Vec<&ChangeRecord> {
        self.data_events
            .range((batch_id, 0)..=(batch_id, u64::MAX))
            .filter_map(|((_, data_id), _)| self.data.get(data_id))
            .collect()
    }

    /// Number of records assigned to a batch.
    pub fn data_event_count(&self, batch_id: u64) -> usize {
        self.data_events
            .range((batch_id, 0)..=(batch_id, u64::MAX))
            .count()
    }

    /// Highest record id already routed.
    pub fn routed_up_to(&self) -> u64 {
        self.routed_up_to
    }

    /// Moves the routing watermark forward.
    pub fn set_routed_up_to(&mut self, data_id: u64) {
        self.routed_up_to = self.routed_up_to.max(data_id);
    }

    /// Missing id ranges within `[start, end]`, inclusive on both ends.
    pub fn find_gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        if start > end {
            return gaps;
        }
        let mut expected = start;
        for &id in self.data.range(start..=end).map(|(id, _)| id) {
            if id > expected {
                gaps.push((expected, id - 1));
            }
            expected = id + 1;
        }
        if expected <= end {
            gaps.push((expected, end));
        }
        gaps
    }

    /// Records that a batch from `node_id` was received here.
    pub fn mark_incoming(&mut self, node_id: &str, batch_id: u64) {
        self.incoming_batches.insert((node_id.to_string(), batch_id));
    }

    /// Forgets every batch received from `node_id`. Returns how many.
    pub fn purge_incoming_for_node(&mut self, node_id: &str) -> usize {
        let before = self.incoming_batches.len();
        self.incoming_batches.retain(|(node, _)| node != node_id);
        before - self.incoming_batches.len()
    }

    /// Records that `node_id` applied a batch sent from here.
    pub fn mark_applied(&mut self, node_id: &str, batch_id: u64) {
        self.applied_batches.insert((node_id.to_string(), batch_id));
    }

    /// Whether `node_id` reported the batch as applied.
    pub fn is_applied(&self, node_id: &str, batch_id: u64) -> bool {
        self.applied_batches.contains(&(node_id.to_string(), batch_id))
    }

    /// Forgets applied markers of `node_id` in `[start, end]`. Returns how many.
    pub fn clear_applied(&mut self, node_id: &str, start: u64, end: u64) -> usize {
        let before = self.applied_batches.len();
        self.applied_batches
            .retain(|(node, id)| node != node_id || !(start..=end).contains(id));
        before - self.applied_batches.len()
    }
}

/// Capture-facing view of the change record store.
pub struct ChangeLog {
    db: Arc<Database>,
    sequences: Arc<dyn SequenceGenerator>,
    clock: Arc<dyn Clock>,
}

impl ChangeLog {
    /// Creates a change log over `db`.
    pub fn new(db: Arc<Database>, sequences: Arc<dyn SequenceGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { db, sequences, clock }
    }

    /// Appends a captured change and returns its id.
    pub fn capture_change(&self, mut record: ChangeRecord) -> CoreResult<u64> {
        let data_id = self.sequences.next_val(SEQ_DATA)?;
        record.data_id = data_id;
        if record.create_time == 0 {
            record.create_time = self.clock.now_millis();
        }
        self.db.write(|t| t.insert_data(record))?;
        tracing::trace!(data_id, "captured change");
        Ok(data_id)
    }

    /// Records of a batch in delivery order.
    ///
    /// Without `big_lob`, a payload longer than the configured capture
    /// limit fails with [`CoreError::Truncation`].
    pub fn select_data_for_batch(&self, batch_id: u64, big_lob: bool) -> CoreResult<Vec<ChangeRecord>> {
        let limit = if big_lob {
            None
        } else {
            self.db.options().lob_capture_limit
        };
        self.db.read(|t| {
            t.data_for_batch(batch_id)
                .into_iter()
                .map(|record| match limit {
                    Some(limit) if record.max_payload_len() > limit => Err(CoreError::Truncation {
                        table: record.table_name.clone(),
                        data_id: record.data_id,
                        length: record.max_payload_len(),
                        limit,
                    }),
                    _ => Ok(record.clone()),
                })
                .collect()
        })
    }

    /// Missing id ranges within `[start, end]`.
    pub fn find_gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.db.read(|t| t.find_gaps(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DatabaseOptions;
    use crate::error::ErrorKind;
    use batchsync_protocol::DataEventType;

    fn change_log(limit: Option<usize>) -> (Arc<Database>, ChangeLog) {
        let db = Arc::new(
            Database::open_in_memory_with_options(DatabaseOptions::new().lob_capture_limit(limit))
                .unwrap(),
        );
        let log = ChangeLog::new(db.clone(), db.sequences(), Arc::new(ManualClock::new(100)));
        (db, log)
    }

    #[test]
    fn capture_assigns_ids_and_time() {
        let (db, log) = change_log(None);
        let first = log
            .capture_change(ChangeRecord::new("orders", DataEventType::Insert, "default"))
            .unwrap();
        let second = log
            .capture_change(ChangeRecord::new("orders", DataEventType::Update, "default"))
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(db.read(|t| t.data(1).map(|r| r.create_time)), Some(100));
    }

    #[test]
    fn batch_data_is_in_id_order() {
        let (db, log) = change_log(None);
        for _ in 0..3 {
            log.capture_change(ChangeRecord::new("orders", DataEventType::Insert, "default"))
                .unwrap();
        }
        db.write(|t| {
            for data_id in [3, 1, 2] {
                t.insert_data_event(DataEvent {
                    data_id,
                    batch_id: 10,
                    router_id: "r".into(),
                });
            }
            Ok(())
        })
        .unwrap();
        let ids: Vec<u64> = log
            .select_data_for_batch(10, false)
            .unwrap()
            .iter()
            .map(|r| r.data_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(db.read(|t| t.data_event_count(10)), 3);
        assert!(log.select_data_for_batch(11, false).unwrap().is_empty());
    }

    #[test]
    fn oversized_value_needs_big_lob() {
        let (db, log) = change_log(Some(8));
        log.capture_change(
            ChangeRecord::new("docs", DataEventType::Insert, "default").with_row_data("x".repeat(20)),
        )
        .unwrap();
        db.write(|t| {
            t.insert_data_event(DataEvent {
                data_id: 1,
                batch_id: 1,
                router_id: "r".into(),
            });
            Ok(())
        })
        .unwrap();
        let err = log.select_data_for_batch(1, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncation);
        assert_eq!(log.select_data_for_batch(1, true).unwrap().len(), 1);
    }

    #[test]
    fn gaps_are_reported_as_ranges() {
        let mut t = Tables::default();
        for id in [2, 3, 7] {
            let mut r = ChangeRecord::new("orders", DataEventType::Insert, "default");
            r.data_id = id;
            t.insert_data(r).unwrap();
        }
        assert_eq!(t.find_gaps(1, 9), vec![(1, 1), (4, 6), (8, 9)]);
        assert_eq!(t.find_gaps(2, 3), vec![]);
        assert!(t.find_gaps(5, 4).is_empty());
    }

    #[test]
    fn markers() {
        let mut t = Tables::default();
        t.mark_incoming("001", 5);
        t.mark_incoming("002", 5);
        assert_eq!(t.purge_incoming_for_node("001"), 1);

        for id in 100..=106 {
            t.mark_applied("001", id);
        }
        assert_eq!(t.clear_applied("001", 100, 105), 6);
        assert!(t.is_applied("001", 106));
    }
}
