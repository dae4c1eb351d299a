//! Outgoing batches and their status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;
use crate::event::DataEventType;

/// Lifecycle status of an outgoing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BatchStatus {
    /// New, not yet extracted.
    New,
    /// Requested, waiting for the extract job.
    Requested,
    /// Querying (extraction in progress or staged, not sent).
    Querying,
    /// Sending to the transport.
    Sending,
    /// Loaded at the target, waiting for acknowledgement.
    Loading,
    /// Acknowledged complete.
    Ok,
    /// Failed.
    Error,
    /// Ignored, permanently skipped.
    Ignored,
    /// Resend requested.
    Resend,
    /// Reload setup bookkeeping row.
    LoadSetup,
}

impl BatchStatus {
    /// Two-letter code as stored in the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Requested => "RQ",
            BatchStatus::Querying => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
            BatchStatus::Resend => "RS",
            BatchStatus::LoadSetup => "LS",
        }
    }

    /// Parses a two-letter code.
    pub fn from_code(code: &str) -> Result<Self, ProtocolError> {
        Ok(match code {
            "NE" => BatchStatus::New,
            "RQ" => BatchStatus::Requested,
            "QY" => BatchStatus::Querying,
            "SE" => BatchStatus::Sending,
            "LD" => BatchStatus::Loading,
            "OK" => BatchStatus::Ok,
            "ER" => BatchStatus::Error,
            "IG" => BatchStatus::Ignored,
            "RS" => BatchStatus::Resend,
            "LS" => BatchStatus::LoadSetup,
            other => return Err(ProtocolError::InvalidCode(other.to_string())),
        })
    }

    /// OK and IG never move again without an explicit reset.
    pub fn is_complete(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }

    /// Statuses that still need work from the extraction side.
    pub fn is_pending(&self) -> bool {
        !matches!(
            self,
            BatchStatus::Ok | BatchStatus::Ignored | BatchStatus::LoadSetup
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Row, byte and timing counters for one phase of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Rows written.
    pub row_count: u64,
    /// Insert statements.
    pub insert_count: u64,
    /// Update statements.
    pub update_count: u64,
    /// Delete statements.
    pub delete_count: u64,
    /// Other statements (sql, create, script).
    pub other_count: u64,
    /// Bytes produced.
    pub byte_count: u64,
    /// Distinct tables touched.
    pub table_count: u64,
    /// Time spent reading and writing, in millis.
    pub elapsed_millis: u64,
    /// Time spent in the transform stage, in millis.
    pub transform_millis: u64,
}

impl BatchStats {
    /// Counts one statement of the given kind.
    pub fn count_event(&mut self, event_type: DataEventType) {
        self.row_count += 1;
        match event_type {
            DataEventType::Insert | DataEventType::Reload => self.insert_count += 1,
            DataEventType::Update => self.update_count += 1,
            DataEventType::Delete => self.delete_count += 1,
            _ => self.other_count += 1,
        }
    }
}

/// The unit of transfer to one target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Globally unique, immutable once assigned.
    pub batch_id: u64,
    /// Target node.
    pub node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Current status.
    pub status: BatchStatus,
    /// Load id, 0 when not part of a reload.
    pub load_id: u64,
    /// Part of a reload.
    pub load_flag: bool,
    /// Extracted by the extract job rather than inline.
    pub extract_job_flag: bool,
    /// Shared across nodes of a cluster.
    pub common_flag: bool,
    /// Target should load with a bulk loader.
    pub bulk_loader_flag: bool,
    /// Times the batch was ignored.
    pub ignore_count: u64,
    /// Batch is in error.
    pub error_flag: bool,
    /// Extraction attempts.
    pub extract_count: u64,
    /// Transfer attempts.
    pub sent_count: u64,
    /// Load attempts reported by the transfer step.
    pub load_count: u64,
    /// Rows assigned by routing.
    pub data_row_count: u64,
    /// Insert rows assigned by routing.
    pub data_insert_row_count: u64,
    /// Update rows assigned by routing.
    pub data_update_row_count: u64,
    /// Delete rows assigned by routing.
    pub data_delete_row_count: u64,
    /// Counters recorded by extraction.
    pub extract_stats: BatchStats,
    /// Counters recorded by the transfer step.
    pub sent_stats: BatchStats,
    /// SQL state of the last failure.
    pub sql_state: Option<String>,
    /// Error code of the last failure, 0 when none.
    pub sql_code: i32,
    /// Message of the last failure.
    pub sql_message: Option<String>,
    /// Change record that caused the failure.
    pub failed_data_id: u64,
    /// Comma separated list of tables in the batch.
    pub summary: Option<String>,
    /// Staging location for this batch.
    pub staged_location: String,
    /// Creation time, epoch millis.
    pub create_time: u64,
    /// When extraction last started.
    pub extract_start_time: Option<u64>,
    /// When transfer last started.
    pub transfer_start_time: Option<u64>,
    /// Last time the ledger row was written.
    pub last_update_time: u64,
}

impl OutgoingBatch {
    /// Creates a new batch in status NE.
    pub fn new(
        batch_id: u64,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        create_time: u64,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            batch_id,
            staged_location: node_id.clone(),
            node_id,
            channel_id: channel_id.into(),
            status: BatchStatus::New,
            load_id: 0,
            load_flag: false,
            extract_job_flag: false,
            common_flag: false,
            bulk_loader_flag: false,
            ignore_count: 0,
            error_flag: false,
            extract_count: 0,
            sent_count: 0,
            load_count: 0,
            data_row_count: 0,
            data_insert_row_count: 0,
            data_update_row_count: 0,
            data_delete_row_count: 0,
            extract_stats: BatchStats::default(),
            sent_stats: BatchStats::default(),
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            failed_data_id: 0,
            summary: None,
            create_time,
            extract_start_time: None,
            transfer_start_time: None,
            last_update_time: create_time,
        }
    }

    /// Marks the batch as part of a load.
    pub fn with_load(mut self, load_id: u64) -> Self {
        self.load_id = load_id;
        self.load_flag = true;
        self
    }

    /// Sets the initial status.
    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks the batch as shared across nodes.
    pub fn with_common(mut self, common: bool) -> Self {
        self.common_flag = common;
        if common {
            self.staged_location = "common".to_string();
        }
        self
    }

    /// `node-batch` identifier used in log lines.
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }

    /// Changes status unless the batch is IG, which is sticky.
    ///
    /// Returns whether the status actually changed.
    pub fn set_status(&mut self, status: BatchStatus) -> bool {
        if self.status == BatchStatus::Ignored || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    /// Counts one routed row.
    pub fn increment_event_count(&mut self, event_type: DataEventType) {
        self.data_row_count += 1;
        match event_type {
            DataEventType::Insert | DataEventType::Reload => self.data_insert_row_count += 1,
            DataEventType::Update => self.data_update_row_count += 1,
            DataEventType::Delete => self.data_delete_row_count += 1,
            _ => {}
        }
    }

    /// Drops counters gathered by the failed extraction attempt.
    ///
    /// Routing counters and error fields stay, so the ledger still shows
    /// what the batch was meant to carry and why it failed.
    pub fn revert_stats_on_error(&mut self) {
        self.extract_stats = BatchStats::default();
        self.sent_stats = BatchStats::default();
    }

    /// Records failure detail and flags the batch.
    pub fn record_error(&mut self, sql_code: i32, sql_state: Option<String>, message: String) {
        self.error_flag = true;
        self.sql_code = sql_code;
        self.sql_state = sql_state;
        self.sql_message = Some(message);
    }

    /// Clears failure detail.
    pub fn clear_error(&mut self) {
        self.error_flag = false;
        self.sql_code = 0;
        self.sql_state = None;
        self.sql_message = None;
        self.failed_data_id = 0;
    }

    /// Puts the batch back to a fresh state for re-extraction.
    pub fn reset(&mut self, status: BatchStatus) {
        self.status = status;
        self.clear_error();
        self.extract_stats = BatchStats::default();
        self.sent_stats = BatchStats::default();
        self.extract_start_time = None;
        self.transfer_start_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            BatchStatus::New,
            BatchStatus::Requested,
            BatchStatus::Querying,
            BatchStatus::Sending,
            BatchStatus::Loading,
            BatchStatus::Ok,
            BatchStatus::Error,
            BatchStatus::Ignored,
            BatchStatus::Resend,
            BatchStatus::LoadSetup,
        ] {
            assert_eq!(BatchStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(BatchStatus::from_code("ZZ").is_err());
    }

    #[test]
    fn test_ignored_is_sticky() {
        let mut batch = OutgoingBatch::new(1, "store-1", "default", 0);
        assert!(batch.set_status(BatchStatus::Ignored));
        assert!(!batch.set_status(BatchStatus::Querying));
        assert!(!batch.set_status(BatchStatus::Ok));
        assert_eq!(batch.status, BatchStatus::Ignored);
    }

    #[test]
    fn test_revert_stats_keeps_routing_counters() {
        let mut batch = OutgoingBatch::new(7, "store-1", "default", 0);
        batch.increment_event_count(DataEventType::Insert);
        batch.extract_stats.byte_count = 512;
        batch.record_error(-1, None, "boom".into());
        batch.revert_stats_on_error();

        assert_eq!(batch.data_row_count, 1);
        assert_eq!(batch.extract_stats.byte_count, 0);
        assert_eq!(batch.sql_message.as_deref(), Some("boom"));
    }
}
