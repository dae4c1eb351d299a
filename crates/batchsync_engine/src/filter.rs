//! Pre-extraction filtering of a node's batch list.

use batchsync_core::CONFIG_CHANNEL;
use batchsync_protocol::{BatchStatus, OutgoingBatch};

use crate::context::EngineContext;
use crate::error::SyncResult;

/// Applies channel controls and load blocking to candidate batches.
pub(crate) struct BatchFilter<'a> {
    ctx: &'a EngineContext,
}

impl<'a> BatchFilter<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Filters `batches` bound for `node_id`.
    ///
    /// Ignored channels are handled first: their batches are marked OK with
    /// `ignore_count` incremented and written immediately. Suspended channels
    /// are then dropped from the list and stay pending. Last, while the node
    /// has load batches in flight, only load and config batches remain,
    /// unless unblocking on error applies.
    pub(crate) fn filter(&self, node_id: &str, batches: Vec<OutgoingBatch>) -> SyncResult<Vec<OutgoingBatch>> {
        let controls = self.ctx.registry.channel_controls(node_id);
        let now = self.ctx.now();

        let (ignored, mut remaining): (Vec<_>, Vec<_>) = batches
            .into_iter()
            .partition(|b| controls.get(&b.channel_id).map_or(false, |c| c.ignore));
        if !ignored.is_empty() {
            self.ctx.db.write(|t| {
                for mut batch in ignored {
                    batch.status = BatchStatus::Ok;
                    batch.ignore_count += 1;
                    batch.last_update_time = now;
                    tracing::debug!(batch_id = batch.batch_id, node_id, channel = %batch.channel_id, "channel ignored, batch marked OK");
                    t.update_outgoing_batch(&batch)?;
                }
                Ok(())
            })?;
        }

        remaining.retain(|b| !controls.get(&b.channel_id).map_or(false, |c| c.suspend));

        if self.ctx.config.block_channels_on_load {
            let (loading, load_error) = self
                .ctx
                .db
                .read(|t| (t.has_unfinished_load_batches(node_id), t.has_load_batch_in_error(node_id)));
            let unblocked = load_error && self.ctx.config.unblock_channels_on_error;
            if loading && !unblocked {
                let before = remaining.len();
                remaining.retain(|b| b.load_flag || b.channel_id == CONFIG_CHANNEL);
                if remaining.len() < before {
                    tracing::debug!(node_id, held = before - remaining.len(), "load in progress, holding other channels");
                }
            }
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, config, TestEngine, DEFAULT_CHANNEL, STORE};
    use crate::transport::MockTransport;
    use batchsync_core::{ChannelControl, RELOAD_CHANNEL};

    fn control(t: &TestEngine, channel: &str, suspend: bool, ignore: bool) {
        t.ctx().registry.set_channel_control(ChannelControl {
            node_id: STORE.into(),
            channel_id: channel.into(),
            suspend,
            ignore,
        });
    }

    fn load_batch(t: &TestEngine, status: BatchStatus) -> OutgoingBatch {
        let mut batch = t.add_batch(STORE, RELOAD_CHANNEL, 1, 10);
        batch.load_flag = true;
        batch.load_id = 1;
        batch.status = status;
        t.ctx().db.write(|tables| tables.update_outgoing_batch(&batch)).unwrap();
        batch
    }

    fn ids(batches: &[OutgoingBatch]) -> Vec<u64> {
        batches.iter().map(|b| b.batch_id).collect()
    }

    #[test]
    fn ignored_channel_batches_are_completed() {
        let t = test_support::engine(config());
        let batch = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        control(&t, DEFAULT_CHANNEL, false, true);

        let kept = BatchFilter::new(t.ctx()).filter(STORE, vec![batch.clone()]).unwrap();

        assert!(kept.is_empty());
        let stored = t.batch(batch.batch_id);
        assert_eq!(stored.status, BatchStatus::Ok);
        assert_eq!(stored.ignore_count, 1);
    }

    #[test]
    fn suspended_channel_batches_stay_pending() {
        let t = test_support::engine(config());
        let batch = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        control(&t, DEFAULT_CHANNEL, true, false);

        let kept = BatchFilter::new(t.ctx()).filter(STORE, vec![batch.clone()]).unwrap();

        assert!(kept.is_empty());
        assert_eq!(t.batch(batch.batch_id).status, BatchStatus::New);
    }

    #[test]
    fn ignore_wins_over_suspend() {
        let t = test_support::engine(config());
        let batch = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        control(&t, DEFAULT_CHANNEL, true, true);
        let transport = MockTransport::new();

        let sent = t.engine.extract(STORE, "default", &transport).unwrap();

        assert!(sent.is_empty());
        assert!(transport.committed_batches().is_empty());
        let stored = t.batch(batch.batch_id);
        assert_eq!(stored.status, BatchStatus::Ok);
        assert_eq!(stored.ignore_count, 1);
        assert_eq!(stored.extract_count, 0);
    }

    #[test]
    fn load_in_flight_holds_other_channels() {
        let t = test_support::engine(config());
        let regular = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        let config_batch = t.add_batch(STORE, CONFIG_CHANNEL, 1, 10);
        let load = load_batch(&t, BatchStatus::New);

        let kept = BatchFilter::new(t.ctx())
            .filter(STORE, vec![regular, config_batch.clone(), load.clone()])
            .unwrap();

        assert_eq!(ids(&kept), vec![config_batch.batch_id, load.batch_id]);
    }

    #[test]
    fn load_error_releases_the_hold_when_configured() {
        let t = test_support::engine(config());
        let regular = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        load_batch(&t, BatchStatus::Error);
        let kept = BatchFilter::new(t.ctx()).filter(STORE, vec![regular.clone()]).unwrap();
        assert_eq!(ids(&kept), vec![regular.batch_id]);

        let t = test_support::engine(config().with_channel_blocking(true, false));
        let regular = t.add_batch(STORE, DEFAULT_CHANNEL, 1, 10);
        load_batch(&t, BatchStatus::Error);
        let kept = BatchFilter::new(t.ctx()).filter(STORE, vec![regular]).unwrap();
        assert!(kept.is_empty());
    }
}
