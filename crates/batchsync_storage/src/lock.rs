//! Cross-process staging locks.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::error::StagingResult;
use crate::staging::{StagingKey, StagingLock};

/// Lock shared by handles of one [`crate::InMemoryStaging`].
#[derive(Debug)]
pub struct MemoryStagingLock {
    table: Arc<Mutex<HashMap<StagingKey, (String, Instant)>>>,
    key: StagingKey,
    owner: String,
    acquired: bool,
}

impl MemoryStagingLock {
    pub(crate) fn acquire(
        table: Arc<Mutex<HashMap<StagingKey, (String, Instant)>>>,
        key: StagingKey,
        owner: &str,
    ) -> Self {
        let acquired = {
            let mut locks = table.lock();
            if locks.contains_key(&key) {
                false
            } else {
                locks.insert(key.clone(), (owner.to_string(), Instant::now()));
                true
            }
        };
        Self {
            table,
            key,
            owner: owner.to_string(),
            acquired,
        }
    }
}

impl StagingLock for MemoryStagingLock {
    fn is_acquired(&self) -> bool {
        self.acquired
    }

    fn owner(&self) -> Option<String> {
        self.table.lock().get(&self.key).map(|(o, _)| o.clone())
    }

    fn age(&self) -> Duration {
        self.table
            .lock()
            .get(&self.key)
            .map(|(_, at)| at.elapsed())
            .unwrap_or_default()
    }

    fn break_lock(&mut self) -> StagingResult<bool> {
        self.table
            .lock()
            .insert(self.key.clone(), (self.owner.clone(), Instant::now()));
        self.acquired = true;
        Ok(true)
    }

    fn release(&mut self) -> StagingResult<()> {
        if self.acquired {
            let mut locks = self.table.lock();
            if locks.get(&self.key).map(|(o, _)| o == &self.owner) == Some(true) {
                locks.remove(&self.key);
            }
            self.acquired = false;
        }
        Ok(())
    }
}

impl Drop for MemoryStagingLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Lock file next to a staged resource, held with an OS advisory lock.
#[derive(Debug)]
pub struct FileStagingLock {
    path: PathBuf,
    owner: String,
    file: Option<File>,
}

impl FileStagingLock {
    pub(crate) fn acquire(path: PathBuf, owner: &str) -> StagingResult<Self> {
        let mut lock = Self {
            path,
            owner: owner.to_string(),
            file: None,
        };
        lock.try_take()?;
        Ok(lock)
    }

    fn try_take(&mut self) -> StagingResult<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        file.set_len(0)?;
        file.write_all(self.owner.as_bytes())?;
        file.sync_all()?;
        self.file = Some(file);
        Ok(true)
    }
}

impl StagingLock for FileStagingLock {
    fn is_acquired(&self) -> bool {
        self.file.is_some()
    }

    fn owner(&self) -> Option<String> {
        let mut contents = String::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .ok()?;
        Some(contents)
    }

    fn age(&self) -> Duration {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default()
    }

    fn break_lock(&mut self) -> StagingResult<bool> {
        tracing::warn!(path = %self.path.display(), owner = ?self.owner(), "breaking staging lock");
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.try_take()
    }

    fn release(&mut self) -> StagingResult<()> {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
            drop(file);
            // a breaker may have replaced the file with its own
            if self.owner().as_deref() != Some(self.owner.as_str()) {
                return Ok(());
            }
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for FileStagingLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_lock_is_exclusive() {
        let table = Arc::new(Mutex::new(HashMap::new()));
        let key = StagingKey::outgoing("n1", 1);
        let mut first = MemoryStagingLock::acquire(table.clone(), key.clone(), "a");
        let mut second = MemoryStagingLock::acquire(table.clone(), key.clone(), "b");
        assert!(first.is_acquired());
        assert!(!second.is_acquired());
        assert_eq!(second.owner().as_deref(), Some("a"));

        assert!(second.break_lock().unwrap());
        assert_eq!(second.owner().as_deref(), Some("b"));
        // the broken holder must not remove the new owner's entry
        first.release().unwrap();
        assert_eq!(second.owner().as_deref(), Some("b"));
        second.release().unwrap();
        assert!(table.lock().is_empty());
    }

    #[test]
    fn file_lock_is_exclusive_and_breakable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outgoing/n1/1.lock");
        let first = FileStagingLock::acquire(path.clone(), "engine-a").unwrap();
        let mut second = FileStagingLock::acquire(path.clone(), "engine-b").unwrap();
        assert!(first.is_acquired());
        assert!(!second.is_acquired());
        assert_eq!(second.owner().as_deref(), Some("engine-a"));

        assert!(second.break_lock().unwrap());
        assert!(second.is_acquired());
        assert_eq!(second.owner().as_deref(), Some("engine-b"));
        drop(second);
        assert!(!path.exists());
    }
}
