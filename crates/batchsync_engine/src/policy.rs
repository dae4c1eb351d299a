//! When batch status changes are written to the ledger.
//!
//! Intermediate statuses of small, fast batches are kept in memory only.
//! RQ, LD and the terminal statuses are always written, as is anything on
//! a reload channel or on a batch that is old or large enough for its
//! progress to matter to an operator.

use batchsync_protocol::{BatchStatus, OutgoingBatch};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::SyncResult;

/// Whether moving `batch` to `status` must be persisted now.
pub fn should_persist_status(
    batch: &OutgoingBatch,
    status: BatchStatus,
    reload_channel: bool,
    now: u64,
    config: &EngineConfig,
) -> bool {
    if matches!(
        status,
        BatchStatus::New
            | BatchStatus::Requested
            | BatchStatus::Loading
            | BatchStatus::Ok
            | BatchStatus::Error
            | BatchStatus::Ignored
    ) {
        return true;
    }
    let elapsed = Duration::from_millis(now.saturating_sub(batch.last_update_time));
    reload_channel
        || elapsed >= config.status_flush_interval
        || batch.data_row_count >= config.status_flush_row_threshold
}

/// Moves `batch` to `status`, writing it through when the policy says so.
///
/// If the stored row turned out to be IG, `batch` is updated to IG and the
/// change is dropped.
pub(crate) fn change_status(
    ctx: &EngineContext,
    batch: &mut OutgoingBatch,
    status: BatchStatus,
) -> SyncResult<()> {
    let now = ctx.now();
    let persist = should_persist_status(
        batch,
        status,
        ctx.is_reload_channel(&batch.channel_id),
        now,
        &ctx.config,
    );
    if !batch.set_status(status) {
        return Ok(());
    }
    if persist {
        save_batch(ctx, batch)?;
    }
    Ok(())
}

/// Writes `batch` through unconditionally.
pub(crate) fn save_batch(ctx: &EngineContext, batch: &mut OutgoingBatch) -> SyncResult<()> {
    batch.last_update_time = ctx.now();
    let written = ctx.db.write(|t| t.update_outgoing_batch(batch))?;
    if !written {
        batch.status = BatchStatus::Ignored;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: u64, updated: u64) -> OutgoingBatch {
        let mut b = OutgoingBatch::new(1, "001", "default", updated);
        b.data_row_count = rows;
        b
    }

    #[test]
    fn milestone_statuses_always_persist() {
        let config = EngineConfig::default();
        for status in [BatchStatus::Requested, BatchStatus::Loading, BatchStatus::Error] {
            assert!(should_persist_status(&batch(1, 0), status, false, 0, &config));
        }
    }

    #[test]
    fn intermediate_status_waits_for_age_or_size() {
        let config = EngineConfig::default().with_status_flush(Duration::from_secs(10), 1000);
        let small = batch(1, 1_000);
        assert!(!should_persist_status(&small, BatchStatus::Querying, false, 5_000, &config));
        assert!(should_persist_status(&small, BatchStatus::Querying, false, 11_000, &config));
        assert!(should_persist_status(&small, BatchStatus::Sending, true, 5_000, &config));
        assert!(should_persist_status(&batch(5_000, 1_000), BatchStatus::Querying, false, 1_000, &config));
    }
}
