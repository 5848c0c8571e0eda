//! Scan sessions: directory layout, metadata and image artifacts.
//!
//! Each scan writes into its own directory under the storage root, named
//! after the local start time (`%y%m%d_%H_%M`). A second scan started within
//! the same minute gets a `_2`, `_3`, ... suffix.
//!
//! ```text
//! Grid_Scans/241019_14_05/
//! ├── image_data.csv          ledger, one row per capture
//! ├── session.json            metadata (config snapshot, grid, threshold)
//! ├── all_images/mono_10x_{i}.png
//! └── flakes/
//!     ├── uncropped/mono_10x_{i}.png
//!     ├── zoomed/mono_10x_{i}.png
//!     └── highlighted/bi_10x_{i}.png
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Local};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::detection::{FlakeRenderings, ThresholdModel};
use crate::error::StorageError;
use crate::hardware::Frame;
use crate::scan::events::ScanState;
use crate::scan::record::RECORD_FILE_NAME;

/// Metadata file name inside a session directory.
pub const METADATA_FILE_NAME: &str = "session.json";

const ALL_IMAGES: &str = "all_images";
const UNCROPPED: &str = "flakes/uncropped";
const ZOOMED: &str = "flakes/zoomed";
const HIGHLIGHTED: &str = "flakes/highlighted";

/// A session directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    dir: PathBuf,
}

impl Session {
    /// Create a new session under `root`, named after the current local time.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let id = Local::now().format("%y%m%d_%H_%M").to_string();
        Self::create_named(root, &id)
    }

    /// Create a new session with a given base name, suffixing it if taken.
    pub fn create_named(root: impl AsRef<Path>, base: &str) -> Result<Self, StorageError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let mut id = base.to_string();
        let mut n = 1;
        let dir = loop {
            let candidate = root.join(&id);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    id = format!("{base}_{n}");
                }
                Err(e) => return Err(e.into()),
            }
        };

        for sub in [ALL_IMAGES, UNCROPPED, ZOOMED, HIGHLIGHTED] {
            fs::create_dir_all(dir.join(sub))?;
        }
        info!(session = %id, dir = %dir.display(), "Created scan session");
        Ok(Self { id, dir })
    }

    /// Open an existing session directory for review.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.join(RECORD_FILE_NAME).is_file() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no {RECORD_FILE_NAME}", dir.display()),
            )));
        }
        let id = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE_NAME)
    }

    pub fn raw_image_path(&self, index: u64) -> PathBuf {
        self.dir.join(ALL_IMAGES).join(format!("mono_10x_{index}.png"))
    }

    pub fn uncropped_path(&self, index: u64) -> PathBuf {
        self.dir.join(UNCROPPED).join(format!("mono_10x_{index}.png"))
    }

    pub fn zoomed_path(&self, index: u64) -> PathBuf {
        self.dir.join(ZOOMED).join(format!("mono_10x_{index}.png"))
    }

    pub fn highlighted_path(&self, index: u64) -> PathBuf {
        self.dir.join(HIGHLIGHTED).join(format!("bi_10x_{index}.png"))
    }

    /// Write (or overwrite) `session.json`.
    pub fn save_metadata(&self, metadata: &SessionMetadata) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.metadata_path(), json)?;
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<SessionMetadata, StorageError> {
        let json = fs::read_to_string(self.metadata_path())?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Grid shape recorded with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSummary {
    pub columns: u64,
    pub rows: u64,
    pub total: usize,
}

/// Contents of `session.json`.
///
/// Written when the session starts and rewritten after calibration and at the
/// end of the scan, so it always reflects what is known so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at: DateTime<Local>,
    /// Version of the scanning software.
    pub software_version: String,
    pub grid: GridSummary,
    pub threshold: Option<ThresholdModel>,
    pub final_state: Option<ScanState>,
    pub captured: u64,
    pub flakes: u64,
    /// Configuration the scan ran with.
    pub config: ScanConfig,
}

impl SessionMetadata {
    pub fn new(session_id: &str, grid: GridSummary, config: &ScanConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: Local::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            grid,
            threshold: None,
            final_state: None,
            captured: 0,
            flakes: 0,
            config: config.clone(),
        }
    }
}

// =============================================================================
// Image sinks
// =============================================================================

/// Destination of per-capture image artifacts, keyed by capture index.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Store the raw frame of every visited position.
    async fn store_raw(&self, index: u64, frame: &Frame) -> Result<(), StorageError>;

    /// Store the derived views of a flake-positive capture.
    async fn store_flake(&self, index: u64, views: &FlakeRenderings) -> Result<(), StorageError>;
}

/// Writes PNG files into a [`Session`] directory.
#[derive(Debug, Clone)]
pub struct DirectoryImageSink {
    session: Session,
}

impl DirectoryImageSink {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

/// Encode `frame` as PNG on the blocking pool.
async fn save_png(frame: Frame, path: PathBuf) -> Result<(), StorageError> {
    tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
        let (width, height) = (frame.width(), frame.height());
        let image = GrayImage::from_raw(width, height, frame.into_pixels()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame buffer does not match {width}x{height}"),
            )
        })?;
        image.save(&path)?;
        debug!(path = %path.display(), "Saved image");
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Io(io::Error::other(e)))?
}

#[async_trait]
impl ImageSink for DirectoryImageSink {
    async fn store_raw(&self, index: u64, frame: &Frame) -> Result<(), StorageError> {
        save_png(frame.clone(), self.session.raw_image_path(index)).await
    }

    async fn store_flake(&self, index: u64, views: &FlakeRenderings) -> Result<(), StorageError> {
        save_png(views.uncropped.clone(), self.session.uncropped_path(index)).await?;
        save_png(views.zoomed.clone(), self.session.zoomed_path(index)).await?;
        save_png(views.highlighted.clone(), self.session.highlighted_path(index)).await
    }
}

/// Keeps only the indices it was handed. For tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryImageSink {
    raw: Mutex<Vec<u64>>,
    flakes: Mutex<Vec<u64>>,
}

impl MemoryImageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw_indices(&self) -> Vec<u64> {
        self.raw.lock().await.clone()
    }

    pub async fn flake_indices(&self) -> Vec<u64> {
        self.flakes.lock().await.clone()
    }
}

#[async_trait]
impl ImageSink for MemoryImageSink {
    async fn store_raw(&self, index: u64, _frame: &Frame) -> Result<(), StorageError> {
        self.raw.lock().await.push(index);
        Ok(())
    }

    async fn store_flake(&self, index: u64, _views: &FlakeRenderings) -> Result<(), StorageError> {
        self.flakes.lock().await.push(index);
        Ok(())
    }
}
