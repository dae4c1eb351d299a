//! Stress runs for batchsync.
//!
//! Capture and routing run in rounds on the calling thread; every store
//! is then synced from its own thread, so extraction, staging and
//! acknowledgement of different nodes overlap.

use batchsync_core::csv_row;
use batchsync_engine::SyncResult;
use batchsync_protocol::{ChangeRecord, DataEventType};
use std::thread;
use std::time::{Duration, Instant};

use crate::fixtures::{DEFAULT_CHANNEL, STORE_1, STORE_2};
use crate::integration::Harness;

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Rows captured.
    pub rows_captured: usize,
    /// Batches acknowledged across all stores.
    pub batches_acked: usize,
    /// Total duration.
    pub duration: Duration,
    /// Captured rows delivered per second, counted once per store.
    pub rows_per_second: f64,
}

impl StressResult {
    fn new(rows_captured: usize, batches_acked: usize, stores: usize, duration: Duration) -> Self {
        let secs = duration.as_secs_f64();
        let rows_per_second = if secs > 0.0 {
            (rows_captured * stores) as f64 / secs
        } else {
            0.0
        };
        Self {
            rows_captured,
            batches_acked,
            duration,
            rows_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Rows captured: {}", self.rows_captured);
        println!("Batches acknowledged: {}", self.batches_acked);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} rows/sec", self.rows_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Capture/sync rounds.
    pub rounds: usize,
    /// Rows captured per round.
    pub rows_per_round: usize,
    /// Size of the customer value in bytes.
    pub value_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rounds: 20,
            rows_per_round: 200,
            value_size: 64,
        }
    }
}

/// Captures unique `orders` inserts in rounds and syncs both stores in
/// parallel after each round.
pub fn stress_parallel_stores(harness: &Harness, config: &StressConfig) -> SyncResult<StressResult> {
    let value = "x".repeat(config.value_size);
    let start = Instant::now();
    let mut captured = 0usize;
    let mut acked = 0usize;

    for round in 0..config.rounds {
        let records = (0..config.rows_per_round).map(|i| {
            let id = round * config.rows_per_round + i;
            ChangeRecord::new("orders", DataEventType::Insert, DEFAULT_CHANNEL)
                .with_row_data(csv_row(&[Some(id.to_string()), Some(value.clone())]))
        });
        harness.capture(records)?;
        captured += config.rows_per_round;

        let synced: Vec<SyncResult<Vec<u64>>> = thread::scope(|scope| {
            let handles: Vec<_> = [STORE_1, STORE_2]
                .into_iter()
                .map(|store| scope.spawn(move || harness.sync(store)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("sync thread panicked"))
                .collect()
        });
        for batches in synced {
            acked += batches?.len();
        }
    }

    Ok(StressResult::new(captured, acked, 2, start.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::CORP;
    use batchsync_engine::EngineConfig;

    #[test]
    fn parallel_stores_receive_every_row() {
        let harness = Harness::memory(EngineConfig::new(CORP).with_extract_thread_count(2));
        let config = StressConfig {
            rounds: 5,
            rows_per_round: 50,
            value_size: 16,
        };
        let result = stress_parallel_stores(&harness, &config).unwrap();

        assert_eq!(result.rows_captured, 250);
        assert_eq!(result.batches_acked, 10);
        for store in [STORE_1, STORE_2] {
            assert_eq!(harness.store(store).table("orders").len(), 250);
        }
    }
}
