//! Core data types shared across mediaspan
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Configuration**: [`ArchiveConfig`], [`MediaKind`], [`UnitTemplate`] - what to
//!   archive and what the destination media look like
//! - **Run state**: [`ScanStats`] - counters produced by one scan → size → allocate run
//! - **Observation**: [`ProgressInfo`], [`ProgressCallback`], [`Stage`] - periodic
//!   progress snapshots handed to an observer
//! - **Control**: [`CancellationToken`] - cooperative cancellation polled at file
//!   and directory granularity
//!
//! ## Examples
//!
//! ```rust
//! use mediaspan::types::{ArchiveConfig, MediaKind};
//! use std::path::PathBuf;
//!
//! let config = ArchiveConfig {
//!     source_paths: vec![PathBuf::from("/srv/photos")],
//!     exclude_files: vec![".tmp".to_string()],
//!     ..ArchiveConfig::for_media(MediaKind::Csd, 4 * 1024u64.pow(4), 4096)
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{MediaspanError, Result};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default headroom kept free on CSD drives for the on-media index (1 GiB)
pub const DEFAULT_CSD_RESERVED_BYTES: u64 = 1024 * 1024 * 1024;

/// Size of a tar record; tape footprints are counted in these
pub const TAR_RECORD_SIZE: u64 = 512;

/// Kind of removable media a unit represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Optical disc: flat capacity limit, write-once once finalized
    Disc,
    /// Cold storage drive: block-aligned capacity with reserved headroom
    Csd,
    /// Magnetic tape: tar-framed, block-aligned capacity
    Tape,
}

impl MediaKind {
    /// Whether capacity is checked against block-rounded usage
    pub fn is_block_aligned(&self) -> bool {
        !matches!(self, MediaKind::Disc)
    }

    /// Prefix used for unit labels
    pub fn label_prefix(&self) -> &'static str {
        match self {
            MediaKind::Disc => "DISC",
            MediaKind::Csd => "CSD",
            MediaKind::Tape => "TAPE",
        }
    }

    /// Digits used when zero-padding unit numbers in labels and file names
    pub fn label_width(&self) -> usize {
        match self {
            MediaKind::Disc => 4,
            MediaKind::Csd | MediaKind::Tape => 3,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Disc => write!(f, "disc"),
            MediaKind::Csd => write!(f, "csd"),
            MediaKind::Tape => write!(f, "tape"),
        }
    }
}

/// Configuration for an archive set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Source roots to scan
    pub source_paths: Vec<PathBuf>,
    /// Excluded path prefixes (case-insensitive)
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Excluded filename suffixes (case-insensitive)
    #[serde(default)]
    pub exclude_files: Vec<String>,
    /// Kind of media in this archive set
    pub media: MediaKind,
    /// Capacity of a freshly minted unit in bytes
    pub unit_capacity: u64,
    /// Allocation granularity on the media
    pub block_size: u64,
    /// Headroom below which a unit is considered full
    #[serde(default)]
    pub reserved_capacity_bytes: u64,
    /// Tar blocking factor for tape units (block = factor * 512 bytes)
    #[serde(default = "default_blocking_factor")]
    pub tape_blocking_factor: u32,
    /// Minimum wall time between progress snapshots
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Seconds between index saves while writing (-1 disables, 0 saves after every file)
    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: i64,
    /// Worker threads for sizing and verification
    #[serde(default = "num_cpus::get")]
    pub parallel_workers: usize,
    /// mediaspan version that wrote this config
    #[serde(default)]
    pub version: String,
}

fn default_blocking_factor() -> u32 {
    512
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_auto_save_interval_secs() -> i64 {
    300
}

impl ArchiveConfig {
    /// Configuration with per-media defaults and no sources
    pub fn for_media(media: MediaKind, unit_capacity: u64, block_size: u64) -> Self {
        let (block_size, reserved_capacity_bytes) = match media {
            MediaKind::Csd => (block_size, DEFAULT_CSD_RESERVED_BYTES.min(unit_capacity / 2)),
            MediaKind::Tape => (TAR_RECORD_SIZE, 0),
            MediaKind::Disc => (block_size, 0),
        };

        Self {
            source_paths: Vec::new(),
            exclude_paths: Vec::new(),
            exclude_files: Vec::new(),
            media,
            unit_capacity,
            block_size,
            reserved_capacity_bytes,
            tape_blocking_factor: default_blocking_factor(),
            progress_interval_ms: default_progress_interval_ms(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
            parallel_workers: num_cpus::get(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Check the configuration for values the allocator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.source_paths.is_empty() {
            return Err(MediaspanError::config("at least one source path is required"));
        }
        if self.unit_capacity == 0 {
            return Err(MediaspanError::config("unit capacity must be greater than zero"));
        }
        if self.block_size == 0 {
            return Err(MediaspanError::config("block size must be greater than zero"));
        }
        if self.reserved_capacity_bytes >= self.unit_capacity {
            return Err(MediaspanError::config(format!(
                "reserved capacity ({}) must be smaller than unit capacity ({})",
                self.reserved_capacity_bytes, self.unit_capacity
            )));
        }
        if self.media == MediaKind::Tape && self.tape_blocking_factor == 0 {
            return Err(MediaspanError::config("tape blocking factor must be greater than zero"));
        }
        Ok(())
    }

    /// Excluded path prefixes in canonical, case-folded form
    pub fn normalized_exclude_paths(&self) -> Vec<String> {
        self.exclude_paths
            .iter()
            .map(|p| utils::clean_path(p).to_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Excluded filename suffixes in case-folded form
    pub fn normalized_exclude_files(&self) -> Vec<String> {
        self.exclude_files
            .iter()
            .map(|s| s.to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Template used when the allocator mints a new unit
    pub fn unit_template(&self) -> UnitTemplate {
        UnitTemplate {
            kind: self.media,
            total_space: self.unit_capacity,
            block_size: self.block_size,
            reserved_capacity_bytes: self.reserved_capacity_bytes,
            blocking_factor: self.tape_blocking_factor,
        }
    }
}

/// Shape of a freshly minted destination unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTemplate {
    /// Media kind of new units
    pub kind: MediaKind,
    /// Raw capacity in bytes
    pub total_space: u64,
    /// Allocation granularity
    pub block_size: u64,
    /// Headroom kept free
    pub reserved_capacity_bytes: u64,
    /// Tape blocking factor
    pub blocking_factor: u32,
}

/// Counters produced by one scan → size → allocate run
///
/// Partial results after cancellation or a per-file error are still valid:
/// the next run resumes from whatever was persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Files discovered that were not in the index
    pub new_file_count: u64,
    /// Files already present in the index (presumed archived)
    pub existing_file_count: u64,
    /// Files skipped by an exclusion rule
    pub excluded_file_count: u64,
    /// Archived files no longer present under a scanned root
    pub deleted_file_count: u64,
    /// New files matched to an archived file as a rename
    pub renamed_file_count: u64,
    /// Files skipped because they vanished or could not be read
    pub error_file_count: u64,
    /// Files whose size and attributes were read
    pub sized_file_count: u64,
    /// Sum of sizes of newly sized files
    pub total_size_pending: u64,
    /// Files assigned to a unit by the allocator
    pub allocated_file_count: u64,
    /// Units minted during allocation
    pub new_unit_count: u64,
    /// Whether the run stopped early on a cancellation request
    pub cancelled: bool,
}

impl ScanStats {
    /// Total files seen on disk, whatever their classification
    pub fn total_seen(&self) -> u64 {
        self.new_file_count + self.existing_file_count + self.excluded_file_count
    }
}

/// Pipeline stage a progress snapshot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Walking source trees
    Scanning,
    /// Reading sizes and attributes
    Sizing,
    /// Assigning files to units
    Allocating,
    /// Copying pending files to a unit
    Writing,
    /// Re-hashing a unit
    Verifying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scanning => "Scanning",
            Stage::Sizing => "Sizing",
            Stage::Allocating => "Allocating",
            Stage::Writing => "Writing",
            Stage::Verifying => "Verifying",
        };
        f.write_str(name)
    }
}

/// Progress callback for long-running stages
///
/// Fire-and-forget: the callback runs on the producing thread and must not
/// block for long.
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Stage being performed
    pub stage: Stage,
    /// Items processed so far in this stage
    pub processed: u64,
    /// Total items in this stage, if known
    pub total: Option<u64>,
    /// Bytes processed so far in this stage
    pub bytes_processed: u64,
    /// Throughput since the previous snapshot
    pub files_per_second: f64,
    /// Run counters at the time of the snapshot
    pub stats: ScanStats,
}

impl ProgressInfo {
    /// Progress as a percentage (0-100), when the total is known
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Time-based sampler that throttles progress callbacks
///
/// A snapshot is emitted at most once per interval, plus once when the stage
/// finishes.
pub(crate) struct ProgressSampler {
    callback: Option<ProgressCallback>,
    stage: Stage,
    interval: Duration,
    started: Instant,
    last_emit: Instant,
    last_processed: u64,
}

impl ProgressSampler {
    pub(crate) fn new(callback: Option<ProgressCallback>, stage: Stage, interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            callback,
            stage,
            interval: Duration::from_millis(interval_ms),
            started: now,
            last_emit: now,
            last_processed: 0,
        }
    }

    /// Emit a snapshot if the interval has elapsed
    pub(crate) fn sample(&mut self, processed: u64, total: Option<u64>, bytes: u64, stats: &ScanStats) {
        if self.callback.is_some() && self.last_emit.elapsed() >= self.interval {
            self.emit(processed, total, bytes, stats);
        }
    }

    /// Emit a final snapshot unconditionally
    pub(crate) fn finish(&mut self, processed: u64, total: Option<u64>, bytes: u64, stats: &ScanStats) {
        if self.callback.is_some() {
            self.emit(processed, total, bytes, stats);
        }
    }

    /// Wall time since the sampler was created
    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn emit(&mut self, processed: u64, total: Option<u64>, bytes: u64, stats: &ScanStats) {
        let now = Instant::now();
        let window = now.duration_since(self.last_emit).as_secs_f64();
        let files_per_second = if window > 0.0 {
            processed.saturating_sub(self.last_processed) as f64 / window
        } else {
            0.0
        };

        if let Some(callback) = &self.callback {
            callback(ProgressInfo {
                stage: self.stage,
                processed,
                total,
                bytes_processed: bytes,
                files_per_second,
                stats: stats.clone(),
            });
        }

        self.last_emit = now;
        self.last_processed = processed;
    }
}

/// Cooperative cancellation flag shared between a caller and a running stage
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// New token in the "running" state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
