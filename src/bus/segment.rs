//! WAL segment files: naming, listing, append and rotation bookkeeping.
//!
//! A segment is named `wal-{base_offset:016x}.log` where `base_offset` is the
//! offset of its first record. Segments are append-only and never rewritten;
//! rotation seals the current file and opens a new one named after the next
//! offset.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::fsync::{fsync_dir, fsync_file};

use super::frame::{FrameRead, read_frame, write_frame};

/// Default rotation threshold (64 MiB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Returns the file name for a segment starting at `base_offset`.
pub fn segment_file_name(base_offset: u64) -> String {
    format!("{SEGMENT_PREFIX}{base_offset:016x}{SEGMENT_SUFFIX}")
}

/// Parses a segment file name back into its base offset.
pub fn parse_segment_base(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Lists segment files in `dir`, sorted ascending by base offset.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(base) = parse_segment_base(name) {
            segments.push((base, entry.path()));
        }
    }
    segments.sort_by_key(|(base, _)| *base);
    Ok(segments)
}

/// Append handle for the tail segment.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    base_offset: u64,
    len_bytes: u64,
}

impl SegmentWriter {
    /// Creates a new empty segment in `dir` starting at `base_offset`.
    ///
    /// The parent directory is fsynced so the file survives a crash.
    pub fn create(dir: &Path, base_offset: u64) -> io::Result<Self> {
        let path = dir.join(segment_file_name(base_offset));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        fsync_dir(dir)?;

        Ok(SegmentWriter {
            file,
            path,
            base_offset,
            len_bytes: 0,
        })
    }

    /// Opens an existing segment for appending at `valid_len` bytes.
    ///
    /// Anything past `valid_len` is trailing garbage from a crash and is
    /// truncated away before the handle is returned.
    pub fn open(path: impl Into<PathBuf>, base_offset: u64, valid_len: u64) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let actual_len = file.metadata()?.len();
        if actual_len > valid_len {
            file.set_len(valid_len)?;
            fsync_file(&file)?;
        }

        let mut file = file;
        file.seek(SeekFrom::End(0))?;

        Ok(SegmentWriter {
            file,
            path,
            base_offset,
            len_bytes: valid_len,
        })
    }

    /// Appends one record body, returning the new segment length.
    pub fn append(&mut self, body: &[u8]) -> io::Result<u64> {
        let written = write_frame(&mut self.file, body)?;
        self.len_bytes += written as u64;
        Ok(self.len_bytes)
    }

    /// Forces the segment's bytes to disk.
    pub fn sync(&self) -> io::Result<()> {
        fsync_file(&self.file)
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of scanning a segment on recovery.
#[derive(Debug)]
pub struct SegmentScan {
    /// Number of valid records from the start of the file.
    pub records: u64,

    /// Byte length of the valid prefix.
    pub valid_len: u64,

    /// Whether bytes past the valid prefix were present (torn write,
    /// zero-fill, or garbage).
    pub trailing_corruption: bool,
}

/// Scans a segment from the start, validating CRCs, stopping at the first
/// invalid frame.
pub fn scan_segment(path: &Path) -> io::Result<SegmentScan> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut records = 0u64;
    let mut valid_len = 0u64;
    loop {
        match read_frame(&mut reader)? {
            FrameRead::Record(body) => {
                records += 1;
                valid_len += super::frame::frame_len(body.len());
            }
            FrameRead::Eof => break,
            FrameRead::Corrupt(_) => break,
        }
    }

    Ok(SegmentScan {
        records,
        valid_len,
        trailing_corruption: valid_len < file_len,
    })
}
