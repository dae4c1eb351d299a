//! Reload bookkeeping: extract requests and table reload requests/status.

use serde::{Deserialize, Serialize};

/// Wildcard trigger/router id meaning "every configured table".
pub const ALL_TOKEN: &str = "ALL";

/// Progress of an [`ExtractRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractStatus {
    /// Not extracted.
    New,
    /// Loading and staging is in progress.
    Loading,
    /// Done (or cancelled).
    Ok,
}

impl ExtractStatus {
    /// Two-letter code.
    pub fn code(&self) -> &'static str {
        match self {
            ExtractStatus::New => "NE",
            ExtractStatus::Loading => "LS",
            ExtractStatus::Ok => "OK",
        }
    }
}

/// Deferred extraction of batch ids `[start_batch_id, end_batch_id]` of one
/// table for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
    /// Request id.
    pub request_id: u64,
    /// Target node.
    pub node_id: String,
    /// Channel queue that processes the request.
    pub queue: String,
    /// Status.
    pub status: ExtractStatus,
    /// First batch id of the range.
    pub start_batch_id: u64,
    /// Last batch id of the range, inclusive.
    pub end_batch_id: u64,
    /// Trigger id.
    pub trigger_id: String,
    /// Router id.
    pub router_id: String,
    /// Trigger history id of the table.
    pub trigger_hist_id: u32,
    /// Load this request belongs to.
    pub load_id: u64,
    /// Source table.
    pub table_name: String,
    /// Estimated rows.
    pub rows: u64,
    /// Parent request, 0 for a root.
    pub parent_request_id: u64,
    /// Last batch fully staged, 0 when none.
    pub last_loaded_batch_id: u64,
    /// Rows staged so far.
    pub loaded_rows: u64,
    /// Time spent extracting so far, in millis.
    pub loaded_millis: u64,
    /// Creation time, epoch millis.
    pub create_time: u64,
    /// Last update time, epoch millis.
    pub last_update_time: u64,
}

impl ExtractRequest {
    /// Number of batch ids covered.
    pub fn batch_count(&self) -> u64 {
        self.end_batch_id - self.start_batch_id + 1
    }

    /// Whether the batch id falls inside the range.
    pub fn contains_batch(&self, batch_id: u64) -> bool {
        (self.start_batch_id..=self.end_batch_id).contains(&batch_id)
    }

    /// Whether this request piggybacks on a parent's extraction.
    pub fn is_child(&self) -> bool {
        self.parent_request_id != 0
    }

    /// Maps a parent batch id onto this request's range by offset.
    pub fn offset_batch_id(&self, parent: &ExtractRequest, parent_batch_id: u64) -> u64 {
        self.start_batch_id + (parent_batch_id - parent.start_batch_id)
    }

    /// Batch id where a resumed extraction starts.
    pub fn resume_batch_id(&self) -> u64 {
        if self.last_loaded_batch_id >= self.start_batch_id {
            self.last_loaded_batch_id + 1
        } else {
            self.start_batch_id
        }
    }

    /// Clears progress so the request starts from zero.
    pub fn reset_progress(&mut self) {
        self.status = ExtractStatus::New;
        self.last_loaded_batch_id = 0;
        self.loaded_rows = 0;
        self.loaded_millis = 0;
    }
}

/// Operator intent to reload a table (or everything) from a source to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReloadRequest {
    /// Node receiving the reload.
    pub target_node_id: String,
    /// Node providing the data.
    pub source_node_id: String,
    /// Trigger id, or [`ALL_TOKEN`].
    pub trigger_id: String,
    /// Router id, or [`ALL_TOKEN`].
    pub router_id: String,
    /// Reload a whole channel instead of a table.
    pub channel_id: Option<String>,
    /// Recreate the table at the target first.
    pub create_table: bool,
    /// Delete target rows first.
    pub delete_first: bool,
    /// Custom selection predicate.
    pub reload_select: Option<String>,
    /// Custom SQL run before the load.
    pub before_custom_sql: Option<String>,
    /// Load id, 0 until assigned.
    pub load_id: u64,
    /// Whether the request has been turned into reload events.
    pub processed: bool,
    /// Creation time, epoch millis.
    pub create_time: u64,
    /// Last update time, epoch millis.
    pub last_update_time: u64,
}

impl TableReloadRequest {
    /// Request for one trigger/router pair.
    pub fn new(
        target_node_id: impl Into<String>,
        source_node_id: impl Into<String>,
        trigger_id: impl Into<String>,
        router_id: impl Into<String>,
        create_time: u64,
    ) -> Self {
        Self {
            target_node_id: target_node_id.into(),
            source_node_id: source_node_id.into(),
            trigger_id: trigger_id.into(),
            router_id: router_id.into(),
            channel_id: None,
            create_table: false,
            delete_first: false,
            reload_select: None,
            before_custom_sql: None,
            load_id: 0,
            processed: false,
            create_time,
            last_update_time: create_time,
        }
    }

    /// Request for every configured table.
    pub fn full_load(
        target_node_id: impl Into<String>,
        source_node_id: impl Into<String>,
        create_time: u64,
    ) -> Self {
        Self::new(target_node_id, source_node_id, ALL_TOKEN, ALL_TOKEN, create_time)
    }

    /// Request for every table on one channel.
    pub fn channel_load(
        target_node_id: impl Into<String>,
        source_node_id: impl Into<String>,
        channel_id: impl Into<String>,
        create_time: u64,
    ) -> Self {
        let mut request = Self::full_load(target_node_id, source_node_id, create_time);
        request.channel_id = Some(channel_id.into());
        request
    }

    /// Wildcard trigger and router with no channel restriction.
    pub fn is_full_load_request(&self) -> bool {
        self.trigger_id == ALL_TOKEN && self.router_id == ALL_TOKEN && self.channel_id.is_none()
    }

    /// Restricted to one channel.
    pub fn is_channel_request(&self) -> bool {
        self.channel_id.is_some()
    }
}

/// Aggregate progress of one load id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReloadStatus {
    /// Load id.
    pub load_id: u64,
    /// Source node.
    pub source_node_id: String,
    /// Target node.
    pub target_node_id: String,
    /// Full node reload.
    pub full_load: bool,
    /// First data-carrying batch id.
    pub start_data_batch_id: u64,
    /// Last data-carrying batch id.
    pub end_data_batch_id: u64,
    /// Setup batches created.
    pub setup_batch_count: u64,
    /// Data batches created.
    pub data_batch_count: u64,
    /// Finalize batches created.
    pub finalize_batch_count: u64,
    /// Setup batches acknowledged.
    pub setup_batch_loaded: u64,
    /// Data batches acknowledged.
    pub data_batch_loaded: u64,
    /// Finalize batches acknowledged.
    pub finalize_batch_loaded: u64,
    /// Tables in the load.
    pub table_count: u64,
    /// Estimated rows.
    pub rows_count: u64,
    /// Rows acknowledged.
    pub rows_loaded: u64,
    /// Every batch acknowledged.
    pub completed: bool,
    /// Load was cancelled.
    pub cancelled: bool,
    /// A batch of the load failed.
    pub error_flag: bool,
    /// SQL state of the failure.
    pub sql_state: Option<String>,
    /// Error code of the failure.
    pub sql_code: i32,
    /// Message of the failure.
    pub sql_message: Option<String>,
    /// Start time, epoch millis.
    pub start_time: u64,
    /// Completion or cancel time.
    pub end_time: Option<u64>,
    /// Last update time.
    pub last_update_time: u64,
}

impl TableReloadStatus {
    /// Creates a status row for a new load.
    pub fn new(
        load_id: u64,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            load_id,
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            start_time: now,
            last_update_time: now,
            ..Self::default()
        }
    }

    /// Batches of every kind.
    pub fn batch_count(&self) -> u64 {
        self.setup_batch_count + self.data_batch_count + self.finalize_batch_count
    }

    /// Batches of every kind acknowledged.
    pub fn batch_loaded(&self) -> u64 {
        self.setup_batch_loaded + self.data_batch_loaded + self.finalize_batch_loaded
    }

    /// Neither completed nor cancelled.
    pub fn is_active(&self) -> bool {
        !self.completed && !self.cancelled
    }

    /// Counts an acknowledged batch against the right bucket.
    ///
    /// Batches below `start_data_batch_id` are setup, batches above
    /// `end_data_batch_id` are finalize. A load without data batches has
    /// `end_data_batch_id < start_data_batch_id`.
    ///
    /// Returns true when the acknowledgement completed the load.
    pub fn record_loaded(&mut self, batch_id: u64, rows: u64, now: u64) -> bool {
        if batch_id < self.start_data_batch_id {
            self.setup_batch_loaded += 1;
        } else if batch_id <= self.end_data_batch_id {
            self.data_batch_loaded += 1;
            self.rows_loaded += rows;
        } else {
            self.finalize_batch_loaded += 1;
        }
        self.last_update_time = now;
        if !self.completed && self.batch_count() > 0 && self.batch_loaded() >= self.batch_count() {
            self.completed = true;
            self.end_time = Some(now);
            return true;
        }
        false
    }

    /// Rolls back data counters for batches that will be sent again.
    pub fn revert_loaded(&mut self, batches: u64, rows: u64) {
        self.data_batch_loaded = self.data_batch_loaded.saturating_sub(batches);
        self.rows_loaded = self.rows_loaded.saturating_sub(rows);
        self.completed = false;
        self.end_time = None;
    }

    /// Records a failure on the load.
    pub fn record_error(&mut self, sql_code: i32, sql_state: Option<String>, message: String) {
        self.error_flag = true;
        self.sql_code = sql_code;
        self.sql_state = sql_state;
        self.sql_message = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: u64, end: u64) -> ExtractRequest {
        ExtractRequest {
            request_id: 1,
            node_id: "store-1".into(),
            queue: "reload".into(),
            status: ExtractStatus::New,
            start_batch_id: start,
            end_batch_id: end,
            trigger_id: "orders".into(),
            router_id: "corp_to_store".into(),
            trigger_hist_id: 1,
            load_id: 1,
            table_name: "orders".into(),
            rows: 0,
            parent_request_id: 0,
            last_loaded_batch_id: 0,
            loaded_rows: 0,
            loaded_millis: 0,
            create_time: 0,
            last_update_time: 0,
        }
    }

    #[test]
    fn test_child_offset() {
        let parent = request(100, 105);
        let child = request(200, 205);
        assert_eq!(child.offset_batch_id(&parent, 100), 200);
        assert_eq!(child.offset_batch_id(&parent, 103), 203);
        assert_eq!(parent.batch_count(), 6);
    }

    #[test]
    fn test_resume_batch_id() {
        let mut req = request(100, 105);
        assert_eq!(req.resume_batch_id(), 100);
        req.last_loaded_batch_id = 102;
        assert_eq!(req.resume_batch_id(), 103);
        req.reset_progress();
        assert_eq!(req.resume_batch_id(), 100);
    }

    #[test]
    fn test_reload_status_buckets() {
        let mut status = TableReloadStatus::new(9, "corp", "store-1", 0);
        status.setup_batch_count = 1;
        status.data_batch_count = 2;
        status.finalize_batch_count = 1;
        status.start_data_batch_id = 11;
        status.end_data_batch_id = 12;

        assert!(!status.record_loaded(10, 0, 1));
        assert!(!status.record_loaded(11, 100, 2));
        assert!(!status.record_loaded(12, 50, 3));
        assert!(status.record_loaded(13, 0, 4));

        assert_eq!(status.setup_batch_loaded, 1);
        assert_eq!(status.data_batch_loaded, 2);
        assert_eq!(status.finalize_batch_loaded, 1);
        assert_eq!(status.rows_loaded, 150);
        assert!(status.completed);
        assert_eq!(status.end_time, Some(4));
    }

    #[test]
    fn test_request_kinds() {
        assert!(TableReloadRequest::full_load("a", "b", 0).is_full_load_request());
        let channel = TableReloadRequest::channel_load("a", "b", "sales", 0);
        assert!(channel.is_channel_request());
        assert!(!channel.is_full_load_request());
    }
}
