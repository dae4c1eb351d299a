//! Configuration for the sync engine.

use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Configuration for extraction and reload orchestration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Id of the local (source) node.
    pub node_id: String,
    /// Byte budget of one extraction round.
    pub max_bytes_to_sync: u64,
    /// Stage extracted batches before sending them.
    pub stream_to_file: bool,
    /// Extraction worker pool size when staging.
    pub extract_thread_count: usize,
    /// Extract every batch of the round before sending any.
    pub synchronize_all_jobs: bool,
    /// How long to wait for a cross-process staging lock.
    pub file_lock_timeout: Duration,
    /// Age after which a staging lock is considered abandoned and broken.
    pub stale_lock_age: Duration,
    /// Interval of keep-alive signals while waiting on extraction.
    pub keep_alive_interval: Duration,
    /// Insert all reload events in one transaction instead of one per table.
    pub transactional_reload: bool,
    /// Use approximate row counts for unconditional reload selects.
    pub use_estimated_counts: bool,
    /// Split reloads into extract requests served by the extract job.
    pub use_extract_job: bool,
    /// Send table creation ahead of a reload.
    pub create_first: bool,
    /// Delete target rows ahead of a reload.
    pub delete_first: bool,
    /// SQL sent to the target ahead of a reload.
    pub before_reload_sql: Option<String>,
    /// SQL sent to the target after a reload.
    pub after_reload_sql: Option<String>,
    /// Hold back other channels while a node's load is in flight.
    pub block_channels_on_load: bool,
    /// Release the hold when a load batch is in error.
    pub unblock_channels_on_error: bool,
    /// Minimum age of a status row before an intermediate status is flushed.
    pub status_flush_interval: Duration,
    /// Row count above which intermediate statuses are always flushed.
    pub status_flush_row_threshold: u64,
    /// Age of a selected batch list after which batches are re-read before sending.
    pub requery_interval: Duration,
    /// Loads that may be in flight at once.
    pub max_load_count: usize,
    /// Free-space ratio of the staging medium below which extraction stops.
    pub min_free_staging_ratio: f64,
    /// Stage common batches once for all nodes, guarded by a file lock.
    pub share_common_batches: bool,
    /// Retry policy for staging lock acquisition.
    pub lock_retry: RetryConfig,
}

impl EngineConfig {
    /// Creates a configuration for the local node.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            max_bytes_to_sync: 1024 * 1024,
            stream_to_file: true,
            extract_thread_count: 4,
            synchronize_all_jobs: false,
            file_lock_timeout: Duration::from_secs(30),
            stale_lock_age: Duration::from_secs(2 * 60 * 60),
            keep_alive_interval: Duration::from_secs(30),
            transactional_reload: true,
            use_estimated_counts: false,
            use_extract_job: true,
            create_first: false,
            delete_first: false,
            before_reload_sql: None,
            after_reload_sql: None,
            block_channels_on_load: true,
            unblock_channels_on_error: true,
            status_flush_interval: Duration::from_secs(10),
            status_flush_row_threshold: 1000,
            requery_interval: Duration::from_secs(5),
            max_load_count: 1,
            min_free_staging_ratio: 0.02,
            share_common_batches: false,
            lock_retry: RetryConfig::default(),
        }
    }

    /// Sets the byte budget of one extraction round.
    pub fn with_max_bytes_to_sync(mut self, bytes: u64) -> Self {
        self.max_bytes_to_sync = bytes;
        self
    }

    /// Sets whether batches are staged before sending.
    pub fn with_stream_to_file(mut self, stream_to_file: bool) -> Self {
        self.stream_to_file = stream_to_file;
        self
    }

    /// Sets the extraction worker pool size.
    pub fn with_extract_thread_count(mut self, count: usize) -> Self {
        self.extract_thread_count = count;
        self
    }

    /// Sets whether all batches are extracted before any is sent.
    pub fn with_synchronize_all_jobs(mut self, value: bool) -> Self {
        self.synchronize_all_jobs = value;
        self
    }

    /// Sets the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Sets transactional vs. per-table reload insertion.
    pub fn with_transactional_reload(mut self, value: bool) -> Self {
        self.transactional_reload = value;
        self
    }

    /// Sets whether approximate counts are used.
    pub fn with_estimated_counts(mut self, value: bool) -> Self {
        self.use_estimated_counts = value;
        self
    }

    /// Sets whether reloads go through extract requests.
    pub fn with_extract_job(mut self, value: bool) -> Self {
        self.use_extract_job = value;
        self
    }

    /// Sets create-first and delete-first for reloads.
    pub fn with_reload_setup(mut self, create_first: bool, delete_first: bool) -> Self {
        self.create_first = create_first;
        self.delete_first = delete_first;
        self
    }

    /// Sets SQL sent around a reload.
    pub fn with_reload_sql(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before_reload_sql = before;
        self.after_reload_sql = after;
        self
    }

    /// Sets the channel blocking policy during loads.
    pub fn with_channel_blocking(mut self, block_on_load: bool, unblock_on_error: bool) -> Self {
        self.block_channels_on_load = block_on_load;
        self.unblock_channels_on_error = unblock_on_error;
        self
    }

    /// Sets the number of loads that may run at once.
    pub fn with_max_load_count(mut self, count: usize) -> Self {
        self.max_load_count = count;
        self
    }

    /// Sets the minimum free ratio of the staging medium.
    pub fn with_min_free_staging_ratio(mut self, ratio: f64) -> Self {
        self.min_free_staging_ratio = ratio;
        self
    }

    /// Sets whether common batches are staged once for all nodes.
    pub fn with_share_common_batches(mut self, value: bool) -> Self {
        self.share_common_batches = value;
        self
    }

    /// Sets staging lock timing.
    pub fn with_file_lock(mut self, timeout: Duration, stale_age: Duration) -> Self {
        self.file_lock_timeout = timeout;
        self.stale_lock_age = stale_age;
        self
    }

    /// Sets the requery interval.
    pub fn with_requery_interval(mut self, interval: Duration) -> Self {
        self.requery_interval = interval;
        self
    }

    /// Sets the status flush policy.
    pub fn with_status_flush(mut self, interval: Duration, row_threshold: u64) -> Self {
        self.status_flush_interval = interval;
        self.status_flush_row_threshold = row_threshold;
        self
    }

    /// Effective extraction pool size.
    ///
    /// The synchronous path always runs on one thread.
    pub fn effective_thread_count(&self) -> usize {
        if self.stream_to_file {
            self.extract_thread_count
        } else {
            1
        }
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.extract_thread_count == 0 {
            return Err(SyncError::Config(
                "extract_thread_count must be at least 1".into(),
            ));
        }
        if self.max_bytes_to_sync == 0 {
            return Err(SyncError::Config(
                "max_bytes_to_sync must be greater than 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.min_free_staging_ratio) {
            return Err(SyncError::Config(format!(
                "min_free_staging_ratio must be in [0, 1), got {}",
                self.min_free_staging_ratio
            )));
        }
        if self.node_id.is_empty() {
            return Err(SyncError::Config("node_id must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("00000")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.node_id, "00000");
        assert_eq!(config.max_bytes_to_sync, 1024 * 1024);
        assert_eq!(config.extract_thread_count, 4);
        assert_eq!(config.requery_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn synchronous_path_uses_one_thread() {
        let config = EngineConfig::default()
            .with_extract_thread_count(8)
            .with_stream_to_file(false);
        assert_eq!(config.effective_thread_count(), 1);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(EngineConfig::default()
            .with_extract_thread_count(0)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_max_bytes_to_sync(0)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_min_free_staging_ratio(1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
