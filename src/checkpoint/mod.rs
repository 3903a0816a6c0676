//! Per-source checkpoint store: persisted cursors and dedup windows.
//!
//! One JSON file per source under the store directory:
//!
//! ```json
//! { "cursor": "opaque", "updated_at": "...", "dedup": [{"fp": "...", "expires_at": "..."}] }
//! ```
//!
//! Files are written atomically (write-temp-then-rename with file and
//! directory fsyncs), so readers always see either the old or the new
//! checkpoint, never a partial write. Writes are serialized per source;
//! reads return cloned snapshots.
//!
//! `updated_at` is monotonically non-decreasing per source: a put with an
//! older wall clock (NTP step, clock skew) is clamped to the previous value.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fsync::{fsync_dir, fsync_file};
use crate::types::{Fingerprint, SourceId};

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// A persisted per-source checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Opaque cursor owned by the source connector.
    #[serde(default)]
    pub cursor: Option<String>,

    /// Last advancement time; monotonically non-decreasing per source.
    pub updated_at: DateTime<Utc>,

    /// Active dedup window: fingerprint → expiry.
    #[serde(default, with = "dedup_entries")]
    pub dedup: HashMap<Fingerprint, DateTime<Utc>>,
}

impl Checkpoint {
    /// An empty checkpoint stamped now.
    pub fn new() -> Self {
        Checkpoint {
            cursor: None,
            updated_at: Utc::now(),
            dedup: HashMap::new(),
        }
    }

    /// Drops expired dedup entries; returns how many were removed.
    pub fn expire_dedup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.dedup.len();
        self.dedup.retain(|_, expires_at| *expires_at > now);
        before - self.dedup.len()
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Checkpoint::new()
    }
}

/// On-disk shape of one dedup entry.
#[derive(Serialize, Deserialize)]
struct DedupEntry {
    fp: Fingerprint,
    expires_at: DateTime<Utc>,
}

/// Serializes the dedup map as a list of `{fp, expires_at}` objects.
mod dedup_entries {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<Fingerprint, DateTime<Utc>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let mut entries: Vec<DedupEntry> = map
            .iter()
            .map(|(fp, expires_at)| DedupEntry {
                fp: fp.clone(),
                expires_at: *expires_at,
            })
            .collect();
        // Stable output ordering keeps the files diffable.
        entries.sort_by(|a, b| a.fp.as_str().cmp(b.fp.as_str()));
        serde::Serialize::serialize(&entries, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<HashMap<Fingerprint, DateTime<Utc>>, D::Error> {
        let entries: Vec<DedupEntry> = serde::Deserialize::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.fp, e.expires_at))
            .collect())
    }
}

struct StoreInner {
    dir: PathBuf,
    /// In-memory view of all checkpoints; reads clone from here.
    state: RwLock<HashMap<SourceId, Checkpoint>>,
    /// Per-source write serialization.
    write_locks: Mutex<HashMap<SourceId, Arc<Mutex<()>>>>,
}

/// The checkpoint store. Cheap to clone; all clones share one directory.
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<StoreInner>,
}

impl CheckpointStore {
    /// Opens the store, loading every `<source>.json` found in `dir`.
    ///
    /// Unparseable files are skipped with a warning: a lost checkpoint means
    /// re-polling from scratch, which the dedup window absorbs.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut state = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = checkpoint_stem(&path) else {
                continue;
            };

            match std::fs::read(&path).map_err(CheckpointError::from).and_then(
                |bytes| Ok(serde_json::from_slice::<Checkpoint>(&bytes)?),
            ) {
                Ok(checkpoint) => {
                    state.insert(SourceId::new(stem), checkpoint);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable checkpoint file"
                    );
                }
            }
        }

        debug!(dir = %dir.display(), sources = state.len(), "opened checkpoint store");
        Ok(CheckpointStore {
            inner: Arc::new(StoreInner {
                dir,
                state: RwLock::new(state),
                write_locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Returns a snapshot of the source's checkpoint, if any.
    pub fn get(&self, source: &SourceId) -> Option<Checkpoint> {
        self.read_state().get(source).cloned()
    }

    /// Persists `checkpoint` for `source`.
    ///
    /// `updated_at` is clamped to never move backwards relative to the stored
    /// value. The file write is atomic; the in-memory view is updated only
    /// after the rename succeeds.
    pub fn put(&self, source: &SourceId, mut checkpoint: Checkpoint) -> Result<()> {
        let guard = self.write_lock(source);
        let _held = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(previous) = self.read_state().get(source)
            && checkpoint.updated_at < previous.updated_at
        {
            checkpoint.updated_at = previous.updated_at;
        }

        self.persist(source, &checkpoint)?;
        self.write_state().insert(source.clone(), checkpoint);
        Ok(())
    }

    /// Records a fingerprint in the source's dedup window with the given TTL.
    pub fn observe_fingerprint(
        &self,
        source: &SourceId,
        fp: &Fingerprint,
        ttl: Duration,
    ) -> Result<()> {
        let guard = self.write_lock(source);
        let _held = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut checkpoint = self.read_state().get(source).cloned().unwrap_or_default();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        checkpoint.dedup.insert(fp.clone(), expires_at);

        self.persist(source, &checkpoint)?;
        self.write_state().insert(source.clone(), checkpoint);
        Ok(())
    }

    /// Whether `fp` is live in the source's dedup window.
    pub fn seen(&self, source: &SourceId, fp: &Fingerprint) -> bool {
        self.read_state()
            .get(source)
            .and_then(|c| c.dedup.get(fp))
            .is_some_and(|expires_at| *expires_at > Utc::now())
    }

    /// Sweeps expired fingerprints across all sources, persisting any file
    /// that changed. Returns the number of entries removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let sources: Vec<SourceId> = self.read_state().keys().cloned().collect();
        let now = Utc::now();

        let mut removed = 0;
        for source in sources {
            let guard = self.write_lock(&source);
            let _held = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            let Some(mut checkpoint) = self.read_state().get(&source).cloned() else {
                continue;
            };
            let expired = checkpoint.expire_dedup(now);
            if expired == 0 {
                continue;
            }

            self.persist(&source, &checkpoint)?;
            self.write_state().insert(source.clone(), checkpoint);
            removed += expired;
        }

        if removed > 0 {
            debug!(removed, "swept expired dedup fingerprints");
        }
        Ok(removed)
    }

    /// Atomic write: temp file, fsync, rename, directory fsync.
    fn persist(&self, source: &SourceId, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.inner.dir.join(format!("{}.json", source.as_str()));
        let tmp = self.inner.dir.join(format!("{}.json.tmp", source.as_str()));

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            use std::io::Write;
            file.write_all(&bytes)?;
            fsync_file(&file)?;
        }
        std::fs::rename(&tmp, &path)?;
        fsync_dir(&self.inner.dir)?;
        Ok(())
    }

    fn write_lock(&self, source: &SourceId) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(source.clone()).or_default())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SourceId, Checkpoint>> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SourceId, Checkpoint>> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the source-id stem for `<stem>.json` paths, ignoring temp files.
fn checkpoint_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".json")
}
