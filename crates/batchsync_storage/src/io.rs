//! `std::io` adapters over staged resources.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::staging::StagedResource;

/// `Write` adapter that appends to a staged resource.
///
/// Wrap it in a `BufWriter` for line-at-a-time producers.
#[derive(Debug)]
pub struct ResourceWriter {
    resource: Arc<dyn StagedResource>,
}

impl ResourceWriter {
    /// Creates a writer appending to `resource`.
    pub fn new(resource: Arc<dyn StagedResource>) -> Self {
        Self { resource }
    }
}

impl Write for ResourceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.resource
            .append(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `Read` adapter over a staged resource, resumable from a byte offset.
#[derive(Debug)]
pub struct ResourceReader {
    resource: Arc<dyn StagedResource>,
    offset: u64,
}

impl ResourceReader {
    /// Reads from the start.
    pub fn new(resource: Arc<dyn StagedResource>) -> Self {
        Self::from_offset(resource, 0)
    }

    /// Reads from `offset`, e.g. to resume an interrupted transfer.
    pub fn from_offset(resource: Arc<dyn StagedResource>, offset: u64) -> Self {
        Self { resource, offset }
    }

    /// Bytes consumed so far, including the starting offset.
    pub fn position(&self) -> u64 {
        self.offset
    }
}

impl Read for ResourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self
            .resource
            .read_at(self.offset, buf.len())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.offset += chunk.len() as u64;
        Ok(chunk.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStaging, StagingKey, StagingStore};
    use std::io::BufWriter;

    #[test]
    fn test_write_then_resume_read() {
        let staging = InMemoryStaging::new();
        let resource = staging.create(&StagingKey::outgoing("n1", 1)).unwrap();
        {
            let mut writer = BufWriter::new(ResourceWriter::new(resource.clone()));
            writer.write_all(b"hello world").unwrap();
        }

        let mut reader = ResourceReader::from_offset(resource, 6);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
        assert_eq!(reader.position(), 11);
    }
}
