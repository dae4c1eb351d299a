//! Inspect command implementation.

use batchsync_core::read_snapshot;
use batchsync_protocol::{ExtractStatus, TableReloadStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::{CliError, CliResult, Format};

/// Ledger inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Ledger path.
    pub path: String,
    /// Outgoing batches by status code.
    pub batches: BTreeMap<String, usize>,
    /// Extract requests by status.
    pub extract_requests: BTreeMap<String, usize>,
    /// Reload requests not yet turned into a load.
    pub pending_reload_requests: usize,
    /// Sequence values.
    pub sequences: BTreeMap<String, u64>,
    /// Loads (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loads: Option<Vec<LoadSummary>>,
}

/// Progress of one load.
#[derive(Debug, Serialize)]
pub struct LoadSummary {
    /// Load id.
    pub load_id: u64,
    /// Target node.
    pub target_node_id: String,
    /// Batches loaded out of the total.
    pub batches_loaded: u64,
    /// Total batches.
    pub batch_count: u64,
    /// Rows loaded out of the estimate.
    pub rows_loaded: u64,
    /// Estimated rows.
    pub rows_count: u64,
    /// One of `running`, `completed`, `cancelled`, `error`.
    pub state: &'static str,
}

impl From<&TableReloadStatus> for LoadSummary {
    fn from(status: &TableReloadStatus) -> Self {
        let state = if status.error_flag {
            "error"
        } else if status.cancelled {
            "cancelled"
        } else if status.completed {
            "completed"
        } else {
            "running"
        };
        Self {
            load_id: status.load_id,
            target_node_id: status.target_node_id.clone(),
            batches_loaded: status.batch_loaded(),
            batch_count: status.batch_count(),
            rows_loaded: status.rows_loaded,
            rows_count: status.rows_count,
            state,
        }
    }
}

/// Reads the ledger snapshot under `path` without locking it.
pub fn inspect(path: &Path, show_loads: bool) -> CliResult<InspectResult> {
    let snapshot = read_snapshot(&path.join("SNAPSHOT"))?
        .ok_or_else(|| CliError::Usage(format!("No ledger found at {}", path.display())))?;
    let tables = &snapshot.tables;

    let batches = tables
        .count_batches_by_status()
        .into_iter()
        .map(|(status, count)| (status.code().to_string(), count))
        .collect();
    let mut extract_requests = BTreeMap::new();
    for request in tables.extract_requests() {
        *extract_requests
            .entry(extract_status_name(request.status).to_string())
            .or_insert(0) += 1;
    }
    let loads = show_loads.then(|| tables.reload_statuses().map(LoadSummary::from).collect());

    Ok(InspectResult {
        path: path.display().to_string(),
        batches,
        extract_requests,
        pending_reload_requests: tables.unprocessed_reload_requests().len(),
        sequences: snapshot.sequences.clone(),
        loads,
    })
}

fn extract_status_name(status: ExtractStatus) -> &'static str {
    match status {
        ExtractStatus::New => "new",
        ExtractStatus::Loading => "loading",
        ExtractStatus::Ok => "ok",
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_loads: bool, format: Format) -> CliResult<()> {
    let result = inspect(path, show_loads)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Ledger: {}", result.path);
    println!();
    println!("Outgoing batches:");
    if result.batches.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &result.batches {
        println!("  {status}: {count}");
    }
    println!();
    println!("Extract requests:");
    if result.extract_requests.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &result.extract_requests {
        println!("  {status}: {count}");
    }
    println!("Pending reload requests: {}", result.pending_reload_requests);

    if let Some(loads) = &result.loads {
        println!();
        println!("Loads:");
        for load in loads {
            println!(
                "  {:>6}  node {:<10} {:>5}/{:<5} batches  {:>9}/{:<9} rows  {}",
                load.load_id,
                load.target_node_id,
                load.batches_loaded,
                load.batch_count,
                load.rows_loaded,
                load.rows_count,
                load.state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_core::Database;
    use batchsync_protocol::{BatchStatus, OutgoingBatch};

    #[test]
    fn counts_batches_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger");
        {
            let db = Database::open(&ledger).unwrap();
            db.write(|t| {
                t.insert_outgoing_batch(OutgoingBatch::new(1, "001", "default", 0))?;
                t.insert_outgoing_batch(
                    OutgoingBatch::new(2, "001", "default", 0).with_status(BatchStatus::Ok),
                )
            })
            .unwrap();
            db.close().unwrap();
        }

        let result = inspect(&ledger, true).unwrap();
        assert_eq!(result.batches.get("NE"), Some(&1));
        assert_eq!(result.batches.get("OK"), Some(&1));
        assert_eq!(result.loads.as_ref().map(Vec::len), Some(0));
    }

    #[test]
    fn missing_ledger_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(&dir.path().join("nothing"), false).unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
    }
}
