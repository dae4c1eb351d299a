//! Line-oriented batch wire format.
//!
//! Every line is `keyword[,payload]`. The payload is the rest of the line,
//! with `\`, newline and carriage return escaped so one record always fits
//! on one line. A batch is bracketed by `batch,<id>` and `commit,<id>`.
//!
//! ```text
//! nodeid,corp-000
//! channel,default
//! batch,42
//! table,orders
//! insert,"1","widget"
//! commit,42
//! ```

use std::io::{BufRead, Write};

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{ChangeRecord, DataEventType};

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLine {
    /// Source node of the following batches.
    NodeId(String),
    /// Channel of the following batch.
    Channel(String),
    /// Batch begin.
    Batch(u64),
    /// Table for the following statements.
    Table(String),
    /// Primary-key values for the next update/delete.
    Keys(String),
    /// Insert row.
    Insert(String),
    /// Update row.
    Update(String),
    /// Old row values for the next update/delete.
    Old(String),
    /// Delete by primary key.
    Delete(String),
    /// SQL statement.
    Sql(String),
    /// Create table definition.
    Create(String),
    /// Script.
    Bsh(String),
    /// The current batch is ignored and carries no data.
    Ignore,
    /// Batch end.
    Commit(u64),
    /// Target should re-request the batch later.
    Retry(u64),
    /// No-op sent while the producer is busy.
    KeepAlive,
}

impl WireLine {
    fn keyword(&self) -> &'static str {
        match self {
            WireLine::NodeId(_) => "nodeid",
            WireLine::Channel(_) => "channel",
            WireLine::Batch(_) => "batch",
            WireLine::Table(_) => "table",
            WireLine::Keys(_) => "keys",
            WireLine::Insert(_) => "insert",
            WireLine::Update(_) => "update",
            WireLine::Old(_) => "old",
            WireLine::Delete(_) => "delete",
            WireLine::Sql(_) => "sql",
            WireLine::Create(_) => "create",
            WireLine::Bsh(_) => "bsh",
            WireLine::Ignore => "ignore",
            WireLine::Commit(_) => "commit",
            WireLine::Retry(_) => "retry",
            WireLine::KeepAlive => "keepalive",
        }
    }

    /// Encodes the line including the trailing newline.
    pub fn encode(&self) -> String {
        let payload = match self {
            WireLine::NodeId(s)
            | WireLine::Channel(s)
            | WireLine::Table(s)
            | WireLine::Keys(s)
            | WireLine::Insert(s)
            | WireLine::Update(s)
            | WireLine::Old(s)
            | WireLine::Delete(s)
            | WireLine::Sql(s)
            | WireLine::Create(s)
            | WireLine::Bsh(s) => Some(escape(s)),
            WireLine::Batch(id) | WireLine::Commit(id) | WireLine::Retry(id) => {
                Some(id.to_string())
            }
            WireLine::Ignore | WireLine::KeepAlive => None,
        };
        match payload {
            Some(p) => format!("{},{}\n", self.keyword(), p),
            None => format!("{}\n", self.keyword()),
        }
    }

    /// Decodes one line (without its newline).
    pub fn parse(line: &str, line_no: usize) -> ProtocolResult<Self> {
        let (keyword, payload) = match line.split_once(',') {
            Some((k, p)) => (k, Some(p)),
            None => (line, None),
        };
        let text = |p: Option<&str>| -> ProtocolResult<String> {
            p.map(unescape)
                .ok_or_else(|| ProtocolError::malformed(line_no, format!("'{keyword}' needs a payload")))
        };
        let id = |p: Option<&str>| -> ProtocolResult<u64> {
            p.and_then(|v| v.parse().ok())
                .ok_or_else(|| ProtocolError::malformed(line_no, format!("'{keyword}' needs a batch id")))
        };
        Ok(match keyword {
            "nodeid" => WireLine::NodeId(text(payload)?),
            "channel" => WireLine::Channel(text(payload)?),
            "batch" => WireLine::Batch(id(payload)?),
            "table" => WireLine::Table(text(payload)?),
            "keys" => WireLine::Keys(text(payload)?),
            "insert" => WireLine::Insert(text(payload)?),
            "update" => WireLine::Update(text(payload)?),
            "old" => WireLine::Old(text(payload)?),
            "delete" => WireLine::Delete(text(payload)?),
            "sql" => WireLine::Sql(text(payload)?),
            "create" => WireLine::Create(text(payload)?),
            "bsh" => WireLine::Bsh(text(payload)?),
            "ignore" => WireLine::Ignore,
            "commit" => WireLine::Commit(id(payload)?),
            "retry" => WireLine::Retry(id(payload)?),
            "keepalive" => WireLine::KeepAlive,
            other => {
                return Err(ProtocolError::UnknownKeyword {
                    keyword: other.to_string(),
                    line: line_no,
                })
            }
        })
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Replaces the batch id on batch/commit/retry lines.
///
/// Used when copying a staged batch to a child node's batch id.
pub fn rewrite_batch_id(line: WireLine, from: u64, to: u64) -> WireLine {
    match line {
        WireLine::Batch(id) if id == from => WireLine::Batch(to),
        WireLine::Commit(id) if id == from => WireLine::Commit(to),
        WireLine::Retry(id) if id == from => WireLine::Retry(to),
        other => other,
    }
}

/// Writes protocol lines and counts bytes.
pub struct ProtocolWriter<W: Write> {
    inner: W,
    bytes_written: u64,
    current_table: Option<String>,
    tables_seen: u64,
}

impl<W: Write> ProtocolWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
            current_table: None,
            tables_seen: 0,
        }
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of table switches written so far.
    pub fn tables_seen(&self) -> u64 {
        self.tables_seen
    }

    /// Writes one line.
    pub fn write_line(&mut self, line: &WireLine) -> ProtocolResult<()> {
        let encoded = line.encode();
        self.inner.write_all(encoded.as_bytes())?;
        self.bytes_written += encoded.len() as u64;
        Ok(())
    }

    /// Writes the node, channel and batch header.
    pub fn start_batch(&mut self, source_node: &str, channel: &str, batch_id: u64) -> ProtocolResult<()> {
        self.current_table = None;
        self.write_line(&WireLine::NodeId(source_node.to_string()))?;
        self.write_line(&WireLine::Channel(channel.to_string()))?;
        self.write_line(&WireLine::Batch(batch_id))
    }

    /// Writes the statement lines for one change record.
    pub fn write_record(&mut self, record: &ChangeRecord) -> ProtocolResult<()> {
        if self.current_table.as_deref() != Some(record.table_name.as_str()) {
            self.write_line(&WireLine::Table(record.table_name.clone()))?;
            self.current_table = Some(record.table_name.clone());
            self.tables_seen += 1;
        }
        let row = record.row_data.clone().unwrap_or_default();
        match record.event_type {
            DataEventType::Insert | DataEventType::Reload => {
                self.write_line(&WireLine::Insert(row))?;
            }
            DataEventType::Update => {
                if let Some(old) = &record.old_data {
                    self.write_line(&WireLine::Old(old.clone()))?;
                }
                if let Some(pk) = &record.pk_data {
                    self.write_line(&WireLine::Keys(pk.clone()))?;
                }
                self.write_line(&WireLine::Update(row))?;
            }
            DataEventType::Delete => {
                if let Some(old) = &record.old_data {
                    self.write_line(&WireLine::Old(old.clone()))?;
                }
                let pk = record.pk_data.clone().unwrap_or(row);
                self.write_line(&WireLine::Delete(pk))?;
            }
            DataEventType::Sql => self.write_line(&WireLine::Sql(row))?,
            DataEventType::Create => self.write_line(&WireLine::Create(row))?,
            DataEventType::Bsh => self.write_line(&WireLine::Bsh(row))?,
        }
        Ok(())
    }

    /// Writes the commit line.
    pub fn end_batch(&mut self, batch_id: u64) -> ProtocolResult<()> {
        self.write_line(&WireLine::Commit(batch_id))
    }

    /// Writes a complete ignored batch: header, ignore marker, commit.
    pub fn write_ignored_batch(&mut self, source_node: &str, channel: &str, batch_id: u64) -> ProtocolResult<()> {
        self.start_batch(source_node, channel, batch_id)?;
        self.write_line(&WireLine::Ignore)?;
        self.end_batch(batch_id)
    }

    /// Writes a keep-alive line and flushes.
    pub fn keep_alive(&mut self) -> ProtocolResult<()> {
        self.write_line(&WireLine::KeepAlive)?;
        self.flush()
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> ProtocolResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads protocol lines.
pub struct ProtocolReader<R: BufRead> {
    inner: R,
    line_no: usize,
    buf: String,
}

impl<R: BufRead> ProtocolReader<R> {
    /// Wraps a buffered reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line_no: 0,
            buf: String::new(),
        }
    }

    /// Reads until the commit of `batch_id`, failing if the stream ends first.
    pub fn read_batch(&mut self, batch_id: u64) -> ProtocolResult<Vec<WireLine>> {
        let mut lines = Vec::new();
        let mut started = false;
        for line in self.by_ref() {
            let line = line?;
            match &line {
                WireLine::Batch(id) if *id == batch_id => started = true,
                WireLine::Commit(id) if *id == batch_id && started => {
                    lines.push(line);
                    return Ok(lines);
                }
                _ => {}
            }
            lines.push(line);
        }
        Err(ProtocolError::malformed(
            self.line_no,
            format!("stream ended before commit of batch {batch_id}"),
        ))
    }
}

impl<R: BufRead> Iterator for ProtocolReader<R> {
    type Item = ProtocolResult<WireLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.inner.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    let line = self.buf.trim_end_matches(['\n', '\r']);
                    if line.is_empty() {
                        continue;
                    }
                    return Some(WireLine::parse(line, self.line_no));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_sample(batch_id: u64) -> Vec<u8> {
        let mut writer = ProtocolWriter::new(Vec::new());
        writer.start_batch("corp", "default", batch_id).unwrap();
        let insert = ChangeRecord::new("orders", DataEventType::Insert, "default")
            .with_row_data("\"1\",\"multi\nline\"");
        let delete = ChangeRecord::new("orders", DataEventType::Delete, "default").with_pk_data("\"2\"");
        writer.write_record(&insert).unwrap();
        writer.write_record(&delete).unwrap();
        writer.end_batch(batch_id).unwrap();
        assert_eq!(writer.tables_seen(), 1);
        writer.into_inner()
    }

    #[test]
    fn test_batch_is_bracketed() {
        let bytes = write_sample(42);
        let mut reader = ProtocolReader::new(Cursor::new(bytes));
        let lines = reader.read_batch(42).unwrap();
        assert_eq!(lines[2], WireLine::Batch(42));
        assert_eq!(lines[4], WireLine::Insert("\"1\",\"multi\nline\"".into()));
        assert_eq!(lines.last(), Some(&WireLine::Commit(42)));
    }

    #[test]
    fn test_truncated_stream_is_malformed() {
        let mut bytes = write_sample(42);
        bytes.truncate(bytes.len() - "commit,42\n".len());
        let mut reader = ProtocolReader::new(Cursor::new(bytes));
        assert!(matches!(reader.read_batch(42), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_keyword() {
        let mut reader = ProtocolReader::new(Cursor::new(b"bogus,1\n".to_vec()));
        assert!(matches!(
            reader.next(),
            Some(Err(ProtocolError::UnknownKeyword { line: 1, .. }))
        ));
    }

    #[test]
    fn test_rewrite_batch_id() {
        assert_eq!(rewrite_batch_id(WireLine::Batch(5), 5, 9), WireLine::Batch(9));
        assert_eq!(rewrite_batch_id(WireLine::Commit(5), 5, 9), WireLine::Commit(9));
        assert_eq!(rewrite_batch_id(WireLine::Commit(6), 5, 9), WireLine::Commit(6));
        assert_eq!(
            rewrite_batch_id(WireLine::Insert("5".into()), 5, 9),
            WireLine::Insert("5".into())
        );
    }

    #[test]
    fn test_bytes_written_matches_output() {
        let mut writer = ProtocolWriter::new(Vec::new());
        writer.write_ignored_batch("corp", "config", 3).unwrap();
        let count = writer.bytes_written();
        assert_eq!(count as usize, writer.into_inner().len());
    }

    proptest::proptest! {
        #[test]
        fn prop_escaped_payload_survives(payload in ".*") {
            let line = WireLine::Sql(payload.clone());
            let encoded = line.encode();
            let decoded = WireLine::parse(encoded.trim_end_matches('\n'), 1).unwrap();
            proptest::prop_assert_eq!(decoded, WireLine::Sql(payload));
        }
    }
}
