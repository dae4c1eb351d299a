//! Snapshot encoding for the ledger database.
//!
//! ```text
//! +--------+---------+----------------------+
//! | "BSNP" | version | CBOR body            |
//! | 4 B    | u16 LE  | tables + sequences   |
//! +--------+---------+----------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::database::Tables;
use crate::error::{CoreError, CoreResult};

/// Magic bytes for snapshot files.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"BSNP";

/// Current snapshot version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Everything persisted for a ledger database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Committed tables.
    pub tables: Tables,
    /// Sequence values.
    pub sequences: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    tables: &'a Tables,
    sequences: &'a BTreeMap<String, u64>,
}

/// Encodes borrowed parts without cloning the tables.
pub(crate) fn encode_parts(
    tables: &Tables,
    sequences: &BTreeMap<String, u64>,
) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    ciborium::into_writer(&SnapshotRef { tables, sequences }, &mut buf)
        .map_err(|e| CoreError::invalid_format(format!("snapshot encode: {e}")))?;
    Ok(buf)
}

impl Snapshot {
    /// Encodes the snapshot to bytes.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        encode_parts(&self.tables, &self.sequences)
    }

    /// Decodes a snapshot from bytes.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 6 || data[0..4] != SNAPSHOT_MAGIC {
            return Err(CoreError::invalid_format("invalid snapshot magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported snapshot version {version}"
            )));
        }
        ciborium::from_reader(&data[6..])
            .map_err(|e| CoreError::invalid_format(format!("snapshot decode: {e}")))
    }
}
