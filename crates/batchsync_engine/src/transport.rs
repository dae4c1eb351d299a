//! Transport abstraction for outgoing batch payloads.

use batchsync_protocol::{ProtocolReader, WireLine};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{SyncError, SyncResult};

/// Streaming sink for wire-format batches bound for one node.
///
/// The engine writes whole batches (`batch` ... `commit`) and, while it is
/// waiting on slow extraction, `keepalive` lines.
pub trait OutgoingTransport: Send + Sync {
    /// Writes raw payload bytes.
    fn write(&self, data: &[u8]) -> SyncResult<()>;

    /// Sends a keep-alive marker so an idle connection is not timed out.
    fn keep_alive(&self) -> SyncResult<()>;

    /// Flushes buffered bytes.
    fn flush(&self) -> SyncResult<()>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// `io::Write` adapter over a transport.
///
/// The transport error behind a failed write is kept and can be taken back
/// with [`take_failure`](Self::take_failure).
pub struct TransportWriter<'a> {
    transport: &'a dyn OutgoingTransport,
    failure: Option<SyncError>,
}

impl<'a> TransportWriter<'a> {
    /// Wraps a transport.
    pub fn new(transport: &'a dyn OutgoingTransport) -> Self {
        Self {
            transport,
            failure: None,
        }
    }

    /// The transport error of the last failed write or flush.
    pub fn take_failure(&mut self) -> Option<SyncError> {
        self.failure.take()
    }

    fn record(&mut self, result: SyncResult<()>) -> io::Result<()> {
        result.map_err(|e| {
            let err = io::Error::new(io::ErrorKind::Other, e.to_string());
            self.failure = Some(e);
            err
        })
    }
}

impl Write for TransportWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.transport.write(buf);
        self.record(result)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.transport.flush();
        self.record(result)
    }
}

/// Transport over any `Write`, such as a socket or a file.
pub struct StreamTransport<W: Write + Send> {
    inner: Mutex<W>,
}

impl<W: Write + Send> StreamTransport<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write + Send> OutgoingTransport for StreamTransport<W> {
    fn write(&self, data: &[u8]) -> SyncResult<()> {
        self.inner
            .lock()
            .write_all(data)
            .map_err(|e| SyncError::transport_retryable(e.to_string()))
    }

    fn keep_alive(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner
            .write_all(WireLine::KeepAlive.encode().as_bytes())
            .and_then(|()| inner.flush())
            .map_err(|e| SyncError::transport_retryable(e.to_string()))
    }

    fn flush(&self) -> SyncResult<()> {
        self.inner
            .lock()
            .flush()
            .map_err(|e| SyncError::transport_retryable(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// A mock transport for testing.
///
/// Buffers everything written and counts keep-alives.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    buffer: Mutex<Vec<u8>>,
    keep_alives: AtomicUsize,
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            buffer: Mutex::new(Vec::new()),
            keep_alives: AtomicUsize::new(0),
        }
    }

    /// Sets the connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Number of keep-alives sent.
    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    /// Batch ids of every complete batch in the buffer, in write order.
    pub fn committed_batches(&self) -> Vec<u64> {
        let buffer = self.buffer.lock().clone();
        ProtocolReader::new(buffer.as_slice())
            .filter_map(Result::ok)
            .filter_map(|line| match line {
                WireLine::Commit(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Parsed lines of one batch.
    pub fn batch_lines(&self, batch_id: u64) -> SyncResult<Vec<WireLine>> {
        let buffer = self.buffer.lock().clone();
        Ok(ProtocolReader::new(buffer.as_slice()).read_batch(batch_id)?)
    }

    /// Drops the buffered output.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("not connected"))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingTransport for MockTransport {
    fn write(&self, data: &[u8]) -> SyncResult<()> {
        self.check_connected()?;
        self.buffer.lock().extend_from_slice(data);
        Ok(())
    }

    fn keep_alive(&self) -> SyncResult<()> {
        self.check_connected()?;
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        self.buffer
            .lock()
            .extend_from_slice(WireLine::KeepAlive.encode().as_bytes());
        Ok(())
    }

    fn flush(&self) -> SyncResult<()> {
        self.check_connected()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_protocol::ProtocolWriter;

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());
        transport.set_connected(false);
        assert!(!transport.is_connected());
        let err = transport.write(b"x").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn mock_transport_collects_batches() {
        let transport = MockTransport::new();
        {
            let mut writer = ProtocolWriter::new(TransportWriter::new(&transport));
            writer.start_batch("00000", "default", 7).unwrap();
            writer.end_batch(7).unwrap();
        }
        transport.keep_alive().unwrap();
        {
            let mut writer = ProtocolWriter::new(TransportWriter::new(&transport));
            writer.write_ignored_batch("00000", "default", 8).unwrap();
        }
        assert_eq!(transport.committed_batches(), vec![7, 8]);
        assert_eq!(transport.keep_alives(), 1);
        assert!(transport.batch_lines(8).unwrap().contains(&WireLine::Ignore));
    }

    #[test]
    fn stream_transport_writes_through() {
        let transport = StreamTransport::new(Vec::new());
        transport.write(b"batch,1\n").unwrap();
        transport.keep_alive().unwrap();
        let out = String::from_utf8(transport.into_inner()).unwrap();
        assert_eq!(out, "batch,1\nkeepalive\n");
    }
}
