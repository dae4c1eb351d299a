//! Captured change records and their batch assignments.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Kind of captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventType {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Full-table reload marker, expanded to inserts during extraction.
    Reload,
    /// Arbitrary SQL to run at the target.
    Sql,
    /// Create-table marker.
    Create,
    /// Script to run at the target.
    Bsh,
}

impl DataEventType {
    /// Single-letter code used in persisted rows.
    pub fn code(&self) -> char {
        match self {
            DataEventType::Insert => 'I',
            DataEventType::Update => 'U',
            DataEventType::Delete => 'D',
            DataEventType::Reload => 'R',
            DataEventType::Sql => 'S',
            DataEventType::Create => 'C',
            DataEventType::Bsh => 'B',
        }
    }

    /// Parses a single-letter code.
    pub fn from_code(code: char) -> Result<Self, ProtocolError> {
        match code {
            'I' => Ok(DataEventType::Insert),
            'U' => Ok(DataEventType::Update),
            'D' => Ok(DataEventType::Delete),
            'R' => Ok(DataEventType::Reload),
            'S' => Ok(DataEventType::Sql),
            'C' => Ok(DataEventType::Create),
            'B' => Ok(DataEventType::Bsh),
            other => Err(ProtocolError::InvalidCode(other.to_string())),
        }
    }

    /// Whether the event carries row data (as opposed to a control action).
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete
        )
    }
}

/// One captured row mutation.
///
/// Change records are immutable once created. Row, primary-key and old-row
/// payloads use the CSV-like encoding produced by the capture layer and are
/// carried opaquely by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic identifier assigned at capture.
    pub data_id: u64,
    /// Source table name.
    pub table_name: String,
    /// Kind of change.
    pub event_type: DataEventType,
    /// New row values.
    pub row_data: Option<String>,
    /// Primary-key values.
    pub pk_data: Option<String>,
    /// Previous row values.
    pub old_data: Option<String>,
    /// Channel the change travels on.
    pub channel_id: String,
    /// Node the change originated from, if captured from a sync.
    pub source_node_id: Option<String>,
    /// Trigger history the record was captured under.
    pub trigger_hist_id: u32,
    /// Explicit fan-out target nodes.
    pub node_list: Option<Vec<String>>,
    /// Whether routing already happened at capture time.
    pub is_prerouted: bool,
    /// Capture time in epoch millis.
    pub create_time: u64,
}

impl ChangeRecord {
    /// Creates a record with the required fields and no payloads.
    pub fn new(
        table_name: impl Into<String>,
        event_type: DataEventType,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            data_id: 0,
            table_name: table_name.into(),
            event_type,
            row_data: None,
            pk_data: None,
            old_data: None,
            channel_id: channel_id.into(),
            source_node_id: None,
            trigger_hist_id: 0,
            node_list: None,
            is_prerouted: false,
            create_time: 0,
        }
    }

    /// Sets the row payload.
    pub fn with_row_data(mut self, row_data: impl Into<String>) -> Self {
        self.row_data = Some(row_data.into());
        self
    }

    /// Sets the primary-key payload.
    pub fn with_pk_data(mut self, pk_data: impl Into<String>) -> Self {
        self.pk_data = Some(pk_data.into());
        self
    }

    /// Sets the old-row payload.
    pub fn with_old_data(mut self, old_data: impl Into<String>) -> Self {
        self.old_data = Some(old_data.into());
        self
    }

    /// Sets the trigger history id.
    pub fn with_trigger_hist_id(mut self, trigger_hist_id: u32) -> Self {
        self.trigger_hist_id = trigger_hist_id;
        self
    }

    /// Restricts routing to an explicit node list.
    pub fn with_node_list(mut self, nodes: Vec<String>) -> Self {
        self.node_list = Some(nodes);
        self
    }

    /// Sets the originating node.
    pub fn with_source_node(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = Some(node_id.into());
        self
    }

    /// Largest payload length among row, pk and old data.
    pub fn max_payload_len(&self) -> usize {
        [&self.row_data, &self.pk_data, &self.old_data]
            .iter()
            .filter_map(|p| p.as_ref().map(String::len))
            .max()
            .unwrap_or(0)
    }
}

/// Assignment of a change record to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Change record id.
    pub data_id: u64,
    /// Batch the record was assigned to.
    pub batch_id: u64,
    /// Router that made the assignment.
    pub router_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes() {
        for ty in [
            DataEventType::Insert,
            DataEventType::Update,
            DataEventType::Delete,
            DataEventType::Reload,
            DataEventType::Sql,
            DataEventType::Create,
            DataEventType::Bsh,
        ] {
            assert_eq!(DataEventType::from_code(ty.code()).unwrap(), ty);
        }
        assert!(DataEventType::from_code('X').is_err());
    }

    #[test]
    fn test_max_payload_len() {
        let record = ChangeRecord::new("orders", DataEventType::Update, "default")
            .with_row_data("\"1\",\"abc\"")
            .with_old_data("\"1\",\"a\"");
        assert_eq!(record.max_payload_len(), 9);
        assert!(DataEventType::Update.is_dml());
        assert!(!DataEventType::Reload.is_dml());
    }
}
