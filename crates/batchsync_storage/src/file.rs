//! File-based staging store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{StagingError, StagingResult};
use crate::lock::FileStagingLock;
use crate::staging::{
    checksum_hex, sha256, DiskUsage, ResourceState, StagedResource, StagingKey, StagingLock,
    StagingStore,
};

const CREATE_EXT: &str = "create";
const DONE_EXT: &str = "done";
const META_EXT: &str = "meta";
const LOCK_EXT: &str = "lock";

/// Sidecar written when a resource becomes DONE.
#[derive(Debug, Serialize, Deserialize)]
struct ResourceMeta {
    size: u64,
    checksum: [u8; 32],
}

/// A file-based staging store.
///
/// Each resource lives at `<root>/<category>/<location>/<batch_id>.create`
/// while being written and is renamed to `.done` when finished. A CBOR
/// `.meta` sidecar records the size and SHA-256 of the finished payload.
///
/// # Durability
///
/// - `set_state(Done)` syncs the payload before renaming it
/// - A `.done` file without a readable sidecar is reported as corrupt
///
/// # Thread Safety
///
/// Resources are cached per key so every caller of `find` shares one
/// reference count.
#[derive(Debug)]
pub struct FileStaging {
    root: PathBuf,
    open: Mutex<HashMap<StagingKey, Arc<FileResource>>>,
}

impl FileStaging {
    /// Opens (creating if needed) a staging root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StagingResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base_path(&self, key: &StagingKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

impl StagingStore for FileStaging {
    fn create(&self, key: &StagingKey) -> StagingResult<Arc<dyn StagedResource>> {
        let base = self.base_path(key);
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(previous) = self.open.lock().remove(key) {
            previous.delete()?;
        }
        for ext in [DONE_EXT, META_EXT] {
            remove_if_exists(&base.with_extension(ext))?;
        }
        File::create(base.with_extension(CREATE_EXT))?;

        let resource = Arc::new(FileResource::new(key.clone(), base, ResourceState::Building, None));
        self.open.lock().insert(key.clone(), resource.clone());
        Ok(resource)
    }

    fn find(&self, key: &StagingKey) -> StagingResult<Option<Arc<dyn StagedResource>>> {
        let mut open = self.open.lock();
        if let Some(resource) = open.get(key) {
            if resource.exists() {
                return Ok(Some(resource.clone()));
            }
            open.remove(key);
        }

        let base = self.base_path(key);
        let resource = if base.with_extension(DONE_EXT).exists() {
            let checksum = read_meta(&base.with_extension(META_EXT))
                .ok()
                .map(|meta| meta.checksum);
            FileResource::new(key.clone(), base, ResourceState::Done, checksum)
        } else if base.with_extension(CREATE_EXT).exists() {
            FileResource::new(key.clone(), base, ResourceState::Building, None)
        } else {
            return Ok(None);
        };
        let resource = Arc::new(resource);
        open.insert(key.clone(), resource.clone());
        Ok(Some(resource))
    }

    fn keys(&self) -> StagingResult<Vec<StagingKey>> {
        let mut keys = Vec::new();
        for category in read_dirs(&self.root)? {
            for location in read_dirs(&category)? {
                for entry in fs::read_dir(&location)? {
                    let path = entry?.path();
                    let ext = path.extension().and_then(|e| e.to_str());
                    if !matches!(ext, Some(DONE_EXT) | Some(CREATE_EXT)) {
                        continue;
                    }
                    let batch_id = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse::<u64>().ok());
                    if let Some(batch_id) = batch_id {
                        keys.push(StagingKey::new(
                            file_name(&category),
                            file_name(&location),
                            batch_id,
                        ));
                    }
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn acquire_file_lock(&self, owner: &str, key: &StagingKey) -> StagingResult<Box<dyn StagingLock>> {
        let path = self.base_path(key).with_extension(LOCK_EXT);
        Ok(Box::new(FileStagingLock::acquire(path, owner)?))
    }

    fn usage(&self) -> StagingResult<DiskUsage> {
        Ok(DiskUsage {
            available: fs2::available_space(&self.root)?,
            total: fs2::total_space(&self.root)?,
        })
    }
}

#[derive(Debug)]
struct FileInner {
    state: ResourceState,
    writer: Option<BufWriter<File>>,
    checksum: Option<[u8; 32]>,
    deleted: bool,
}

/// A resource backed by a file.
#[derive(Debug)]
struct FileResource {
    key: StagingKey,
    base: PathBuf,
    inner: Mutex<FileInner>,
    references: AtomicUsize,
}

impl FileResource {
    fn new(key: StagingKey, base: PathBuf, state: ResourceState, checksum: Option<[u8; 32]>) -> Self {
        Self {
            key,
            base,
            inner: Mutex::new(FileInner {
                state,
                writer: None,
                checksum,
                deleted: false,
            }),
            references: AtomicUsize::new(0),
        }
    }

    fn path_for(&self, state: ResourceState) -> PathBuf {
        match state {
            ResourceState::Building => self.base.with_extension(CREATE_EXT),
            ResourceState::Done => self.base.with_extension(DONE_EXT),
        }
    }

    fn flush_writer(inner: &mut FileInner) -> StagingResult<()> {
        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl StagedResource for FileResource {
    fn key(&self) -> &StagingKey {
        &self.key
    }

    fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    fn set_state(&self, state: ResourceState) -> StagingResult<()> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        Self::flush_writer(&mut inner)?;
        if inner.state == state {
            return Ok(());
        }
        let from = self.path_for(inner.state);
        let to = self.path_for(state);
        fs::rename(&from, &to)?;

        let meta_path = self.base.with_extension(META_EXT);
        match state {
            ResourceState::Done => {
                let data = fs::read(&to)?;
                let meta = ResourceMeta {
                    size: data.len() as u64,
                    checksum: sha256(&data),
                };
                write_meta(&meta_path, &meta)?;
                inner.checksum = Some(meta.checksum);
            }
            ResourceState::Building => {
                remove_if_exists(&meta_path)?;
                inner.checksum = None;
            }
        }
        inner.state = state;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> StagingResult<()> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        if inner.state == ResourceState::Done {
            return Err(StagingError::ReadOnly(self.key.to_string()));
        }
        if inner.writer.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.path_for(ResourceState::Building))?;
            inner.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = inner.writer.as_mut() {
            writer.write_all(data)?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> StagingResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
        }
        let mut file = File::open(self.path_for(inner.state)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StagingError::NotFound(self.key.to_string())
            } else {
                e.into()
            }
        })?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            let _ = writer.flush();
        }
        fs::metadata(self.path_for(inner.state))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn checksum(&self) -> Option<[u8; 32]> {
        self.inner.lock().checksum
    }

    fn verify(&self) -> StagingResult<()> {
        let inner = self.inner.lock();
        if inner.deleted {
            return Err(StagingError::Deleted(self.key.to_string()));
        }
        if inner.state != ResourceState::Done {
            return Ok(());
        }
        let meta = read_meta(&self.base.with_extension(META_EXT))?;
        let data = fs::read(self.path_for(ResourceState::Done))?;
        let actual = sha256(&data);
        if actual != meta.checksum || data.len() as u64 != meta.size {
            return Err(StagingError::ChecksumMismatch {
                key: self.key.to_string(),
                expected: checksum_hex(&meta.checksum),
                actual: checksum_hex(&actual),
            });
        }
        Ok(())
    }

    fn reference(&self) -> usize {
        self.references.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn dereference(&self) -> usize {
        let previous = self
            .references
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn reference_count(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    fn exists(&self) -> bool {
        let inner = self.inner.lock();
        !inner.deleted && self.path_for(inner.state).exists()
    }

    fn close(&self) -> StagingResult<()> {
        let mut inner = self.inner.lock();
        Self::flush_writer(&mut inner)
    }

    fn delete(&self) -> StagingResult<bool> {
        let mut inner = self.inner.lock();
        inner.writer = None;
        let mut removed = false;
        for ext in [CREATE_EXT, DONE_EXT, META_EXT] {
            removed |= remove_if_exists(&self.base.with_extension(ext))?;
        }
        inner.deleted = true;
        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> StagingResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_meta(path: &Path) -> StagingResult<ResourceMeta> {
    let file = File::open(path)
        .map_err(|e| StagingError::Corrupt(format!("missing metadata {}: {e}", path.display())))?;
    ciborium::from_reader(file)
        .map_err(|e| StagingError::Corrupt(format!("unreadable metadata {}: {e}", path.display())))
}

fn write_meta(path: &Path, meta: &ResourceMeta) -> StagingResult<()> {
    let tmp = path.with_extension("meta.tmp");
    {
        let mut file = File::create(&tmp)?;
        ciborium::into_writer(meta, &mut file)
            .map_err(|e| StagingError::Corrupt(format!("cannot encode metadata: {e}")))?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_dirs(path: &Path) -> StagingResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn staged(staging: &FileStaging, key: &StagingKey, payload: &[u8]) -> Arc<dyn StagedResource> {
        let resource = staging.create(key).unwrap();
        resource.append(payload).unwrap();
        resource.set_state(ResourceState::Done).unwrap();
        resource
    }

    #[test]
    fn file_create_to_done_renames() {
        let dir = tempdir().unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let key = StagingKey::outgoing("store-1", 12);
        let resource = staging.create(&key).unwrap();
        let base = dir.path().join(key.relative_path());
        assert!(base.with_extension("create").exists());

        resource.append(b"batch,12\n").unwrap();
        resource.append(b"commit,12\n").unwrap();
        resource.set_state(ResourceState::Done).unwrap();

        assert!(!base.with_extension("create").exists());
        assert!(base.with_extension("done").exists());
        assert!(base.with_extension("meta").exists());
        assert_eq!(resource.size(), 19);
        resource.verify().unwrap();
    }

    #[test]
    fn file_find_after_reopen() {
        let dir = tempdir().unwrap();
        let key = StagingKey::outgoing("store-1", 3);
        {
            let staging = FileStaging::open(dir.path()).unwrap();
            staged(&staging, &key, b"payload");
        }
        let staging = FileStaging::open(dir.path()).unwrap();
        let found = staging.find(&key).unwrap().unwrap();
        assert_eq!(found.state(), ResourceState::Done);
        assert_eq!(found.read_at(3, 4).unwrap(), b"load");
        assert!(found.checksum().is_some());
        found.verify().unwrap();
        assert_eq!(staging.keys().unwrap(), vec![key]);
    }

    #[test]
    fn file_find_shares_reference_count() {
        let dir = tempdir().unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let key = StagingKey::outgoing("store-1", 4);
        staged(&staging, &key, b"x");
        staging.find(&key).unwrap().unwrap().reference();
        assert_eq!(staging.find(&key).unwrap().unwrap().reference_count(), 1);
    }

    #[test]
    fn file_tampered_payload_fails_verify() {
        let dir = tempdir().unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let key = StagingKey::outgoing("store-1", 5);
        let resource = staged(&staging, &key, b"batch,5\ncommit,5\n");
        fs::write(dir.path().join(key.relative_path()).with_extension("done"), b"junk").unwrap();
        assert!(matches!(
            resource.verify(),
            Err(StagingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn file_missing_meta_is_corrupt() {
        let dir = tempdir().unwrap();
        let key = StagingKey::outgoing("store-1", 6);
        {
            let staging = FileStaging::open(dir.path()).unwrap();
            staged(&staging, &key, b"data");
        }
        fs::remove_file(dir.path().join(key.relative_path()).with_extension("meta")).unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let found = staging.find(&key).unwrap().unwrap();
        assert!(matches!(found.verify(), Err(StagingError::Corrupt(_))));
    }

    #[test]
    fn file_delete_removes_everything() {
        let dir = tempdir().unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let key = StagingKey::outgoing("store-1", 7);
        let resource = staged(&staging, &key, b"data");
        assert!(resource.delete().unwrap());
        assert!(!resource.exists());
        assert!(staging.find(&key).unwrap().is_none());
        assert!(staging.keys().unwrap().is_empty());
    }

    #[test]
    fn file_usage_reports_space() {
        let dir = tempdir().unwrap();
        let staging = FileStaging::open(dir.path()).unwrap();
        let usage = staging.usage().unwrap();
        assert!(usage.total >= usage.available);
    }
}
