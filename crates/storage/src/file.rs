//! On-disk store file
//!
//! The store is a single JSON envelope. Writes are crash-safe:
//! 1. Write the full envelope to a journal file and sync it
//! 2. Write a temp file and rename it over the store
//! 3. Delete the journal
//!
//! A journal found on open means a write was interrupted; replaying it
//! completes that write. A journal that does not parse was torn before step 2
//! started, so the store file is still intact and the journal is discarded.

use crate::error::{StoreError, StoreResult};
use crate::record::{EntityId, EntityRecord};
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Envelope layout version, independent of the entity model
pub const FORMAT_VERSION: u32 = 1;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub format_version: u32,
    pub model_fingerprint: String,
    pub store_id: Uuid,
}

impl StoreMetadata {
    pub fn new(model_fingerprint: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model_fingerprint: model_fingerprint.into(),
            store_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoreEnvelope {
    pub metadata: StoreMetadata,
    #[serde(default)]
    pub records: BTreeMap<EntityId, EntityRecord>,
}

impl StoreEnvelope {
    pub fn empty(model_fingerprint: &str) -> Self {
        Self { metadata: StoreMetadata::new(model_fingerprint), records: BTreeMap::new() }
    }
}

/// Result of reading the store file
#[derive(Debug)]
pub(crate) enum StoreContents {
    Missing,
    Parsed(StoreEnvelope),
    /// Present but not a valid envelope
    Unreadable(serde_json::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.sibling(".journal")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    pub fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    pub fn read(&self) -> io::Result<StoreContents> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StoreContents::Missing),
            Err(err) => return Err(err),
        };
        Ok(match serde_json::from_slice(&bytes) {
            Ok(envelope) => StoreContents::Parsed(envelope),
            Err(err) => StoreContents::Unreadable(err),
        })
    }

    /// Replace the store contents through the journal
    pub fn write(&self, envelope: &StoreEnvelope) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(envelope)?;
        let journal = self.journal_path();

        write_and_sync(&journal, &bytes)?;
        self.install(&bytes)?;
        fs::remove_file(&journal)?;
        Ok(())
    }

    fn install(&self, bytes: &[u8]) -> io::Result<()> {
        let temp = self.temp_path();
        write_and_sync(&temp, bytes)?;
        fs::rename(&temp, &self.path)
    }

    /// Complete a write interrupted by a crash
    ///
    /// Returns whether a journal was replayed.
    pub fn replay_journal(&self) -> io::Result<bool> {
        let journal = self.journal_path();
        let bytes = match fs::read(&journal) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };

        if serde_json::from_slice::<StoreEnvelope>(&bytes).is_err() {
            tracing::warn!(
                target: "raidbook.storage",
                journal = %journal.display(),
                "discarding torn store journal"
            );
            fs::remove_file(&journal)?;
            return Ok(false);
        }

        tracing::warn!(
            target: "raidbook.storage",
            path = %self.path.display(),
            "replaying store journal after unclean shutdown"
        );
        self.install(&bytes)?;
        fs::remove_file(&journal)?;
        Ok(true)
    }

    /// Move the store file aside; returns the backup path
    pub fn back_up(&self) -> io::Result<PathBuf> {
        let backup = self.sibling(&format!(".corrupt-{}.bak", Uuid::new_v4().simple()));
        fs::rename(&self.path, &backup)?;
        Ok(backup)
    }
}

fn write_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Exclusive ownership of a store, held for the life of a coordinator
///
/// An OS advisory lock on an open lock file. The kernel drops it when the
/// process exits, so a crashed owner never leaves the store locked; the file
/// itself stays behind and is reused. An in-process registry excludes a second
/// owner in the same process where the advisory lock is per process.
#[derive(Debug)]
pub(crate) struct StoreLock {
    file: fs::File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(path: PathBuf, timeout: Duration) -> StoreResult<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(&path)? {
                return Ok(lock);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                tracing::warn!(
                    target: "raidbook.storage",
                    lock = %path.display(),
                    ?waited,
                    "store lock still held, giving up"
                );
                return Err(StoreError::Timeout { waited });
            }
            thread::sleep(LOCK_RETRY_INTERVAL.min(timeout - waited));
        }
    }

    fn try_acquire(path: &Path) -> StoreResult<Option<Self>> {
        if !held_in_process().lock().unwrap().insert(path.to_path_buf()) {
            return Ok(None);
        }

        let locked = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .and_then(|file| match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(file)),
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
                Err(err) => Err(err),
            });

        match locked {
            Ok(Some(mut file)) => {
                // Owner pid, for humans inspecting a stuck lock
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self { file, path: path.to_path_buf() }))
            }
            Ok(None) => {
                held_in_process().lock().unwrap().remove(path);
                Ok(None)
            }
            Err(err) => {
                held_in_process().lock().unwrap().remove(path);
                Err(err.into())
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        held_in_process().lock().unwrap().remove(&self.path);
    }
}

fn held_in_process() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_with(id: &str, health: i64) -> StoreEnvelope {
        let mut envelope = StoreEnvelope::empty("model-v1");
        let record = EntityRecord::new(id, "boss").with_property("health", health);
        envelope.records.insert(record.id.clone(), record);
        envelope
    }

    #[test]
    fn write_leaves_no_journal() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let file = StoreFile::new(temp.path().join("store.json"));

        file.write(&envelope_with("b1", 100)).expect("write should succeed");
        assert!(!file.journal_path().exists());

        match file.read().expect("read should succeed") {
            StoreContents::Parsed(envelope) => {
                assert_eq!(envelope.metadata.model_fingerprint, "model-v1");
                assert_eq!(envelope.records.len(), 1);
            }
            other => panic!("unexpected contents: {other:?}"),
        }
    }

    #[test]
    fn missing_and_unreadable_files() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let file = StoreFile::new(temp.path().join("store.json"));
        assert!(matches!(file.read().expect("read should succeed"), StoreContents::Missing));

        fs::write(file.path(), b"{ not json").expect("write should succeed");
        assert!(matches!(file.read().expect("read should succeed"), StoreContents::Unreadable(_)));
    }

    #[test]
    fn journal_replay_completes_interrupted_write() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let file = StoreFile::new(temp.path().join("store.json"));
        file.write(&envelope_with("b1", 100)).expect("write should succeed");

        // Crash after the journal was synced but before the rename
        let newer = serde_json::to_vec(&envelope_with("b1", 250)).expect("serialize");
        fs::write(file.journal_path(), newer).expect("journal write should succeed");

        assert!(file.replay_journal().expect("replay should succeed"));
        assert!(!file.journal_path().exists());
        let StoreContents::Parsed(envelope) = file.read().expect("read should succeed") else {
            panic!("store should parse after replay");
        };
        assert_eq!(envelope.records[&EntityId::from("b1")].property("health"), Some(&json!(250)));
    }

    #[test]
    fn torn_journal_is_discarded() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let file = StoreFile::new(temp.path().join("store.json"));
        file.write(&envelope_with("b1", 100)).expect("write should succeed");
        fs::write(file.journal_path(), b"{\"metadata\": {\"format_ver").expect("journal write");

        assert!(!file.replay_journal().expect("replay should succeed"));
        assert!(!file.journal_path().exists());
        assert!(matches!(file.read().expect("read should succeed"), StoreContents::Parsed(_)));
    }

    #[test]
    fn backup_moves_store_aside() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let file = StoreFile::new(temp.path().join("store.json"));
        fs::write(file.path(), b"garbage").expect("write should succeed");

        let backup = file.back_up().expect("backup should succeed");
        assert!(!file.path().exists());
        assert_eq!(fs::read(&backup).expect("backup readable"), b"garbage");
        assert!(backup.to_string_lossy().ends_with(".bak"));
    }

    #[test]
    fn second_lock_times_out() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let path = temp.path().join("store.json.lock");

        let held = StoreLock::acquire(path.clone(), Duration::from_millis(50))
            .expect("first lock should succeed");
        let err = StoreLock::acquire(path.clone(), Duration::from_millis(50))
            .expect_err("second lock should time out");
        assert!(err.is_retryable());

        drop(held);
        StoreLock::acquire(path, Duration::from_millis(50)).expect("lock should be free again");
    }

    #[test]
    fn leftover_lock_file_does_not_block() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let path = temp.path().join("store.json.lock");
        // Left behind by an owner that was killed
        fs::write(&path, b"4194303\n").expect("write should succeed");

        let lock = StoreLock::acquire(path.clone(), Duration::from_millis(50))
            .expect("stale lock file should not block");
        let owner = fs::read_to_string(&path).expect("lock file readable");
        assert_eq!(owner.trim(), std::process::id().to_string());
        drop(lock);
    }
}
