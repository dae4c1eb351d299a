//! Named id sequences.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// Sequence for outgoing batch ids.
pub const SEQ_OUTGOING_BATCH: &str = "outgoing_batch";
/// Sequence for captured change ids.
pub const SEQ_DATA: &str = "data";
/// Sequence for extract request ids.
pub const SEQ_EXTRACT_REQUEST: &str = "extract_request";
/// Sequence for initial load ids.
pub const SEQ_LOAD_ID: &str = "load_id";

/// Source of monotonically increasing ids.
pub trait SequenceGenerator: Send + Sync {
    /// Returns the next id of `name`. The first id handed out is 1.
    fn next_val(&self, name: &str) -> CoreResult<u64>;

    /// Reserves `count` contiguous ids and returns the first.
    fn next_range(&self, name: &str, count: u64) -> CoreResult<u64>;

    /// Last id handed out, 0 if none.
    fn current_val(&self, name: &str) -> u64;
}

/// In-process sequences, persisted with the database snapshot.
#[derive(Debug, Default)]
pub struct MemorySequences {
    values: Mutex<BTreeMap<String, u64>>,
}

impl MemorySequences {
    /// Creates empty sequences.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores sequences from persisted values.
    pub fn from_values(values: BTreeMap<String, u64>) -> Self {
        Self {
            values: Mutex::new(values),
        }
    }

    /// Copy of all current values.
    pub fn values(&self) -> BTreeMap<String, u64> {
        self.values.lock().clone()
    }

    /// Moves `name` forward so the next id is above `floor`. Never moves backwards.
    pub fn advance_to(&self, name: &str, floor: u64) {
        let mut values = self.values.lock();
        let current = values.entry(name.to_string()).or_insert(0);
        *current = (*current).max(floor);
    }
}

impl SequenceGenerator for MemorySequences {
    fn next_val(&self, name: &str) -> CoreResult<u64> {
        self.next_range(name, 1)
    }

    fn next_range(&self, name: &str, count: u64) -> CoreResult<u64> {
        if count == 0 {
            return Err(CoreError::validation(format!(
                "cannot reserve an empty range of {name}"
            )));
        }
        let mut values = self.values.lock();
        let current = values.entry(name.to_string()).or_insert(0);
        let first = *current + 1;
        *current += count;
        Ok(first)
    }

    fn current_val(&self, name: &str) -> u64 {
        self.values.lock().get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ranges_are_contiguous_and_disjoint() {
        let seq = MemorySequences::new();
        assert_eq!(seq.next_val(SEQ_OUTGOING_BATCH).unwrap(), 1);
        assert_eq!(seq.next_range(SEQ_OUTGOING_BATCH, 3).unwrap(), 2);
        assert_eq!(seq.next_val(SEQ_OUTGOING_BATCH).unwrap(), 5);
        assert_eq!(seq.current_val(SEQ_OUTGOING_BATCH), 5);
        assert_eq!(seq.current_val(SEQ_DATA), 0);
        assert!(seq.next_range(SEQ_DATA, 0).is_err());
    }

    #[test]
    fn advance_never_rewinds() {
        let seq = MemorySequences::new();
        seq.advance_to(SEQ_LOAD_ID, 10);
        seq.advance_to(SEQ_LOAD_ID, 4);
        assert_eq!(seq.next_val(SEQ_LOAD_ID).unwrap(), 11);
    }

    proptest! {
        #[test]
        fn reserved_ranges_never_overlap(counts in prop::collection::vec(1u64..50, 1..20)) {
            let seq = MemorySequences::new();
            let mut next = 1;
            for count in counts {
                prop_assert_eq!(seq.next_range(SEQ_EXTRACT_REQUEST, count).unwrap(), next);
                next += count;
            }
            prop_assert_eq!(seq.current_val(SEQ_EXTRACT_REQUEST), next - 1);
        }
    }
}
