//! Benchmark utilities.

use batchsync_core::csv_row;
use batchsync_protocol::{ChangeRecord, DataEventType};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric text of `len` characters.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// `count` captured inserts into `orders` with a customer value of
/// `value_size` characters.
pub fn order_inserts(count: usize, value_size: usize) -> Vec<ChangeRecord> {
    (0..count)
        .map(|id| {
            ChangeRecord::new("orders", DataEventType::Insert, "default")
                .with_row_data(csv_row(&[Some(id.to_string()), Some(random_text(value_size))]))
                .with_trigger_hist_id(1)
        })
        .collect()
}
