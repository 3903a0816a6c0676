//! The durable event bus: an append-only write-ahead log with tailing.
//!
//! # Layout
//!
//! The log is a directory of segment files (`wal-{base:016x}.log`). Offsets
//! are record indexes, monotonically increasing across segments; a segment's
//! name is the offset of its first record. The tail segment receives appends
//! and is rotated once it crosses the configured size threshold.
//!
//! # Recovery
//!
//! On open, only the tail segment is scanned: CRCs are validated record by
//! record and the scan stops at the first invalid or zero-filled frame.
//! Trailing garbage (torn write from a crash) is truncated; the next append
//! position resumes after the last valid record. Sealed segments are
//! validated lazily by tailers; a CRC mismatch there is [`BusError::Corruption`]
//! and fatal.
//!
//! # Ordering
//!
//! Appenders are serialized by the writer lock, so a single appender observes
//! FIFO offsets. Tailers observe records strictly in offset order: a record
//! becomes visible to tailers only after its bytes are fully written.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::Event;

use super::frame::{FrameRead, read_frame};
use super::segment::{
    DEFAULT_SEGMENT_MAX_BYTES, SegmentWriter, list_segments, scan_segment, segment_file_name,
};
use crate::fsync::fsync_dir;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// IO error during segment operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error for a record body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record inside a segment failed validation. Mid-segment corruption
    /// is not recoverable; the engine refuses to run on a corrupt log.
    #[error("corrupt WAL record in {segment:?} at offset {offset}: {detail}")]
    Corruption {
        segment: PathBuf,
        offset: u64,
        detail: String,
    },

    /// A tailer asked for an offset that truncation has already removed.
    #[error("offset {requested} precedes earliest retained offset {earliest}")]
    OffsetTruncated { requested: u64, earliest: u64 },
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// When appends are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record. Slowest, zero loss window.
    PerRecord,

    /// fsync at most once per interval; [`EventBus::sync`] forces the rest.
    /// Callers that need durability before acting (checkpoint advancement)
    /// call `sync` explicitly.
    Batched(Duration),
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::PerRecord
    }
}

impl std::fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsyncPolicy::PerRecord => write!(f, "per-record"),
            FsyncPolicy::Batched(interval) => write!(f, "batched:{}ms", interval.as_millis()),
        }
    }
}

impl std::str::FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "per-record" {
            return Ok(FsyncPolicy::PerRecord);
        }
        if let Some(ms) = s.strip_prefix("batched:").and_then(|v| {
            v.strip_suffix("ms")
                .unwrap_or(v)
                .trim()
                .parse::<u64>()
                .ok()
        }) {
            return Ok(FsyncPolicy::Batched(Duration::from_millis(ms)));
        }
        Err(format!(
            "invalid fsync policy {s:?}: expected \"per-record\" or \"batched:<N>ms\""
        ))
    }
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,

    /// fsync policy for appends.
    pub fsync: FsyncPolicy,

    /// Rotation threshold per segment.
    pub segment_max_bytes: u64,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WalConfig {
            dir: dir.into(),
            fsync: FsyncPolicy::default(),
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
        }
    }

    pub fn with_fsync(mut self, policy: FsyncPolicy) -> Self {
        self.fsync = policy;
        self
    }

    pub fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }
}

/// Size/age thresholds for background compaction.
///
/// A sealed segment is removed only when it is older than `max_age` AND the
/// log as a whole still exceeds `max_total_bytes`. Defaults: 7 days, 1 GiB.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    pub max_age: Duration,
    pub max_total_bytes: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_total_bytes: 1024 * 1024 * 1024,
        }
    }
}

struct WriterState {
    seg: SegmentWriter,
    next_offset: u64,
    last_sync: Instant,
    dirty: bool,
}

struct BusInner {
    config: WalConfig,
    writer: Mutex<WriterState>,
    /// Sorted base offsets of all live segments (the last entry is the tail).
    segments: RwLock<Vec<u64>>,
    /// Next offset visible to tailers; bumped after the record's bytes are
    /// fully written.
    published: watch::Sender<u64>,
}

/// The durable event bus. Cheap to clone; all clones share one log.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Opens (or creates) the log in `config.dir`, running tail recovery.
    pub fn open(config: WalConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let found = list_segments(&config.dir)?;

        let (seg, next_offset, bases) = if found.is_empty() {
            let seg = SegmentWriter::create(&config.dir, 0)?;
            (seg, 0u64, vec![0u64])
        } else {
            let bases: Vec<u64> = found.iter().map(|(base, _)| *base).collect();
            let (tail_base, tail_path) = found.last().expect("non-empty segment list").clone();

            let scan = scan_segment(&tail_path)?;
            if scan.trailing_corruption {
                warn!(
                    segment = %tail_path.display(),
                    valid_records = scan.records,
                    "truncating torn tail of WAL segment"
                );
            }
            let seg = SegmentWriter::open(&tail_path, tail_base, scan.valid_len)?;
            (seg, tail_base + scan.records, bases)
        };

        info!(
            dir = %config.dir.display(),
            next_offset,
            segments = bases.len(),
            fsync = %config.fsync,
            "opened event bus"
        );

        let (published, _) = watch::channel(next_offset);
        Ok(EventBus {
            inner: Arc::new(BusInner {
                config,
                writer: Mutex::new(WriterState {
                    seg,
                    next_offset,
                    last_sync: Instant::now(),
                    dirty: false,
                }),
                segments: RwLock::new(bases),
                published,
            }),
        })
    }

    /// Appends an event, returning its offset.
    ///
    /// Concurrent appenders are serialized; offsets are assigned in lock
    /// order. Durability follows the configured fsync policy.
    pub fn append(&self, event: &Event) -> Result<u64> {
        let body = serde_json::to_vec(event)?;

        let mut writer = self.lock_writer();

        // Rotate before the write so a record never straddles the threshold
        // by more than one frame.
        if writer.seg.len_bytes() >= self.inner.config.segment_max_bytes {
            self.rotate(&mut writer)?;
        }

        let offset = writer.next_offset;
        writer.seg.append(&body)?;
        writer.next_offset += 1;
        writer.dirty = true;

        match self.inner.config.fsync {
            FsyncPolicy::PerRecord => {
                writer.seg.sync()?;
                writer.dirty = false;
                writer.last_sync = Instant::now();
            }
            FsyncPolicy::Batched(interval) => {
                if writer.last_sync.elapsed() >= interval {
                    writer.seg.sync()?;
                    writer.dirty = false;
                    writer.last_sync = Instant::now();
                }
            }
        }

        let published = writer.next_offset;
        drop(writer);
        self.inner.published.send_replace(published);
        Ok(offset)
    }

    /// Forces any batched writes to disk.
    ///
    /// A no-op under `per-record`. Checkpoint advancement calls this so that
    /// cursors never run ahead of durable events.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.lock_writer();
        if writer.dirty {
            writer.seg.sync()?;
            writer.dirty = false;
            writer.last_sync = Instant::now();
        }
        Ok(())
    }

    /// The offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        *self.inner.published.borrow()
    }

    /// The earliest offset still retained (start of the oldest segment).
    pub fn earliest_offset(&self) -> u64 {
        self.read_segments().first().copied().unwrap_or(0)
    }

    /// Subscribes a tailer starting at `from`.
    ///
    /// If `from` predates the earliest retained offset (truncated away), the
    /// tailer is clamped forward with a warning; compacted history cannot be
    /// replayed.
    pub fn tail(&self, from: u64) -> Tailer {
        let earliest = self.earliest_offset();
        let start = if from < earliest {
            warn!(
                requested = from,
                earliest, "tail position predates retained history, clamping"
            );
            earliest
        } else {
            from
        };

        Tailer {
            inner: Arc::clone(&self.inner),
            published: self.inner.published.subscribe(),
            next: start,
            cursor: None,
        }
    }

    /// Removes whole segments whose highest offset is below `before`.
    ///
    /// Never rewrites within a segment and never removes the tail segment.
    /// Returns the number of segments removed.
    pub fn truncate(&self, before: u64) -> Result<usize> {
        let mut segments = self.write_segments();

        let mut removed = 0;
        // A segment covers [base, next_base); removable when next_base <= before.
        while segments.len() > 1 && segments[1] <= before {
            let base = segments.remove(0);
            let path = self.inner.config.dir.join(segment_file_name(base));
            std::fs::remove_file(&path)?;
            debug!(segment = %path.display(), "truncated WAL segment");
            removed += 1;
        }

        if removed > 0 {
            fsync_dir(&self.inner.config.dir)?;
        }
        Ok(removed)
    }

    /// Removes sealed segments that are both older than `cfg.max_age` and in
    /// excess of `cfg.max_total_bytes` of total log size, oldest first.
    pub fn compact(&self, cfg: &CompactionConfig) -> Result<usize> {
        let mut segments = self.write_segments();

        let mut sizes = Vec::with_capacity(segments.len());
        let mut total: u64 = 0;
        for base in segments.iter() {
            let path = self.inner.config.dir.join(segment_file_name(*base));
            let meta = std::fs::metadata(&path)?;
            total += meta.len();
            sizes.push((meta.len(), meta.modified()?));
        }

        let now = SystemTime::now();
        let mut removed = 0;
        // Oldest first; the tail segment (last) is never eligible.
        while segments.len() > 1 && total > cfg.max_total_bytes {
            let (len, mtime) = sizes[removed];
            let old_enough = now
                .duration_since(mtime)
                .map(|age| age >= cfg.max_age)
                .unwrap_or(false);
            if !old_enough {
                break;
            }

            let base = segments.remove(0);
            let path = self.inner.config.dir.join(segment_file_name(base));
            std::fs::remove_file(&path)?;
            info!(segment = %path.display(), "compacted WAL segment");
            total -= len;
            removed += 1;
        }

        if removed > 0 {
            fsync_dir(&self.inner.config.dir)?;
        }
        Ok(removed)
    }

    fn rotate(&self, writer: &mut WriterState) -> Result<()> {
        writer.seg.sync()?;
        let base = writer.next_offset;
        debug!(base, "rotating WAL segment");
        writer.seg = SegmentWriter::create(&self.inner.config.dir, base)?;
        writer.dirty = false;
        self.write_segments().push(base);
        Ok(())
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_segments(&self) -> std::sync::RwLockReadGuard<'_, Vec<u64>> {
        self.inner
            .segments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_segments(&self) -> std::sync::RwLockWriteGuard<'_, Vec<u64>> {
        self.inner
            .segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A record handed to a tailer.
#[derive(Debug, Clone)]
pub struct TailedEvent {
    pub offset: u64,
    pub event: Event,
}

/// Cursor into a single segment file.
struct SegmentCursor {
    base: u64,
    /// Offset of the next record this cursor will read.
    position: u64,
    reader: BufReader<File>,
    path: PathBuf,
}

/// A subscriber that replays existing records and then streams new appends.
///
/// Multiple tailers are independent; each holds its own file cursors.
pub struct Tailer {
    inner: Arc<BusInner>,
    published: watch::Receiver<u64>,
    next: u64,
    cursor: Option<SegmentCursor>,
}

impl Tailer {
    /// Returns the next record in offset order, waiting for new appends when
    /// caught up. Returns `Ok(None)` once the bus has been dropped and all
    /// records consumed.
    pub async fn next(&mut self) -> Result<Option<TailedEvent>> {
        loop {
            let published = *self.published.borrow_and_update();
            if self.next < published {
                let event = self.read_record(self.next)?;
                let offset = self.next;
                self.next += 1;
                return Ok(Some(TailedEvent { offset, event }));
            }

            if self.published.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    /// The offset this tailer will read next.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Reads the record at `offset`, which is known to be published.
    fn read_record(&mut self, offset: u64) -> Result<Event> {
        let (base, limit) = self.segment_for(offset)?;

        let reposition = match &self.cursor {
            Some(cursor) => cursor.base != base || cursor.position > offset,
            None => true,
        };
        if reposition {
            let path = self.inner.config.dir.join(segment_file_name(base));
            let file = File::open(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    // Truncated out from under us between segment_for and open.
                    BusError::OffsetTruncated {
                        requested: offset,
                        earliest: base,
                    }
                } else {
                    e.into()
                }
            })?;
            self.cursor = Some(SegmentCursor {
                base,
                position: base,
                reader: BufReader::new(file),
                path,
            });
        }

        let cursor = self.cursor.as_mut().expect("cursor set above");
        debug_assert!(offset < limit.unwrap_or(u64::MAX));

        // Skip forward to the requested offset, then decode it. Every record
        // below `published` is fully written, so anything other than a clean
        // record here is real corruption.
        loop {
            let body = match read_frame(&mut cursor.reader)? {
                FrameRead::Record(body) => body,
                FrameRead::Eof => {
                    return Err(BusError::Corruption {
                        segment: cursor.path.clone(),
                        offset: cursor.position,
                        detail: "unexpected end of segment before published offset".to_string(),
                    });
                }
                FrameRead::Corrupt(corruption) => {
                    return Err(BusError::Corruption {
                        segment: cursor.path.clone(),
                        offset: cursor.position,
                        detail: corruption.to_string(),
                    });
                }
            };

            cursor.position += 1;
            if cursor.position == offset + 1 {
                return Ok(serde_json::from_slice(&body)?);
            }
        }
    }

    /// Finds the segment containing `offset`: its base, and the base of the
    /// following segment if one exists.
    fn segment_for(&self, offset: u64) -> Result<(u64, Option<u64>)> {
        let segments = self
            .inner
            .segments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let idx = match segments.binary_search(&offset) {
            Ok(idx) => idx,
            Err(0) => {
                return Err(BusError::OffsetTruncated {
                    requested: offset,
                    earliest: segments.first().copied().unwrap_or(0),
                });
            }
            Err(idx) => idx - 1,
        };
        Ok((segments[idx], segments.get(idx + 1).copied()))
    }
}
