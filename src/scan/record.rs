//! Append-only scan ledger.
//!
//! One CSV row per visited position, written in plan order. Every append is a
//! single `write_all` of a complete line followed by `sync_data`, so after a
//! crash the file holds every acknowledged row and at most one torn trailing
//! line. Readers (including a review of a scan still in progress) drop a
//! trailing line that has no newline yet and therefore only ever see complete
//! rows.
//!
//! Columns: `index,x_pos,y_pos,flake_flag,score,peak_x,peak_y`

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::detection::Classification;
use crate::error::StorageError;
use crate::hardware::Frame;
use crate::scan::plan::Position;

/// File name of the ledger inside a session directory.
pub const RECORD_FILE_NAME: &str = "image_data.csv";

const HEADER: [&str; 7] = [
    "index",
    "x_pos",
    "y_pos",
    "flake_flag",
    "score",
    "peak_x",
    "peak_y",
];

/// Everything known about one visited position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub index: u64,
    pub frame: Frame,
    pub position: Position,
    pub classification: Classification,
}

impl CaptureResult {
    /// The persisted part of the capture; the frame goes to the image sink.
    pub fn entry(&self) -> RecordEntry {
        RecordEntry {
            index: self.index,
            x_pos: self.position.x,
            y_pos: self.position.y,
            flake_flag: self.classification.is_flake,
            score: self.classification.score,
            peak_x: self.classification.peak.0,
            peak_y: self.classification.peak.1,
        }
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub index: u64,
    pub x_pos: i64,
    pub y_pos: i64,
    pub flake_flag: bool,
    pub score: u64,
    pub peak_x: u32,
    pub peak_y: u32,
}

impl RecordEntry {
    pub fn position(&self) -> Position {
        Position::new(self.x_pos, self.y_pos)
    }

    pub fn peak(&self) -> (u32, u32) {
        (self.peak_x, self.peak_y)
    }
}

/// Writer side of the ledger. Owns the next index to be written.
#[derive(Debug)]
pub struct ScanRecord {
    path: PathBuf,
    file: File,
    next_index: u64,
}

impl ScanRecord {
    /// Create a new, empty ledger. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER)?;
        let header = writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))?;
        file.write_all(&header)?;
        file.sync_all()?;

        debug!(path = %path.display(), "Created scan record");
        Ok(Self {
            path,
            file,
            next_index: 0,
        })
    }

    /// Reopen an existing ledger for further appends.
    ///
    /// A torn trailing line left by a crash is cut off first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read(&path)?;
        let complete = complete_prefix(&content).len();
        if complete < content.len() {
            warn!(
                path = %path.display(),
                dropped = content.len() - complete,
                "Truncating torn trailing record"
            );
            OpenOptions::new().write(true).open(&path)?.set_len(complete as u64)?;
        }

        let next_index = parse_entries(&content[..complete])?.len() as u64;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            next_index,
        })
    }

    /// Durably append one row. `entry.index` must be the next index.
    pub fn append(&mut self, entry: &RecordEntry) -> Result<(), StorageError> {
        if entry.index != self.next_index {
            return Err(StorageError::OutOfOrder {
                expected: self.next_index,
                got: entry.index,
            });
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(entry)?;
        let line = writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))?;

        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.next_index += 1;
        Ok(())
    }

    /// Number of rows written so far, which is also the next index.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read everything written so far.
    pub fn entries(&self) -> Result<Vec<RecordEntry>, StorageError> {
        Self::load(&self.path)
    }

    /// Read the complete rows of a ledger, which may still be growing.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<RecordEntry>, StorageError> {
        let content = fs::read(path.as_ref())?;
        parse_entries(complete_prefix(&content))
    }
}

fn complete_prefix(content: &[u8]) -> &[u8] {
    match content.iter().rposition(|&b| b == b'\n') {
        Some(last) => &content[..=last],
        None => &[],
    }
}

fn parse_entries(content: &[u8]) -> Result<Vec<RecordEntry>, StorageError> {
    let mut reader = csv::Reader::from_reader(content);
    let mut entries = Vec::new();
    for row in reader.deserialize::<RecordEntry>() {
        let entry = row?;
        let expected = entries.len() as u64;
        if entry.index != expected {
            return Err(StorageError::OutOfOrder {
                expected,
                got: entry.index,
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}
