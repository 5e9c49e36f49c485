//! Archive set façade
//!
//! [`Archiver`] owns an index directory for the lifetime of a session and
//! runs the pipeline stages against it:
//!
//! ```text
//! scan → size → allocate → write → verify
//! ```
//!
//! Planning (scan, size, allocate) never persists anything. Pending
//! assignments live only in memory; the index records what has actually been
//! written. A later run re-discovers anything that was planned but not
//! written and allocates it again.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mediaspan::{ArchiverBuilder, MediaKind};
//! use std::path::PathBuf;
//!
//! # fn main() -> mediaspan::Result<()> {
//! let archiver = ArchiverBuilder::new()
//!     .media(MediaKind::Csd)
//!     .unit_capacity(4 * 1024u64.pow(4))
//!     .source_paths(vec![PathBuf::from("/srv/photos")])
//!     .exclude_files(vec![".tmp".to_string()])
//!     .build(PathBuf::from("/var/lib/mediaspan"))?;
//!
//! let plan = archiver.plan()?;
//! println!("{} new files, {} new units", plan.stats().new_file_count, plan.allocation.new_units.len());
//!
//! let report = archiver.write_unit(1, "/mnt/csd")?;
//! println!("wrote {} files", report.files_written);
//! # Ok(())
//! # }
//! ```

use crate::allocator::{AllocationReport, Allocator};
use crate::error::{MediaspanError, Result};
use crate::index::{IndexLock, IndexMetadata, UnitIndex};
use crate::renames::{self, RenameCandidate};
use crate::scanner::SourceScanner;
use crate::search::{self, SearchHit};
use crate::session::{FreeSpaceCheck, ScanSession};
use crate::sizer::Sizer;
use crate::summary::ArchiveSummary;
use crate::types::{ArchiveConfig, CancellationToken, MediaKind, ProgressCallback, ScanStats};
use crate::unit::DestinationUnit;
use crate::verification::{UnitVerificationReport, UnitVerifier};
use crate::writer::{UnitWriter, WriteReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Result of a scan → size → allocate run
#[derive(Debug)]
pub struct ArchivePlan {
    /// Session holding the planned assignments
    pub session: ScanSession,
    /// What the allocator did
    pub allocation: AllocationReport,
    /// Room on existing units measured before allocation
    pub free_space: FreeSpaceCheck,
    /// Why allocation failed, if it did
    ///
    /// Scan counters in [`ArchivePlan::stats`] are still valid. Every new
    /// file is left staged and no unit holds an assignment from this run.
    pub allocation_error: Option<MediaspanError>,
    /// Wall time of the whole run in milliseconds
    pub elapsed_ms: u64,
}

impl ArchivePlan {
    /// Whether every sized new file found a unit
    pub fn is_complete(&self) -> bool {
        self.allocation_error.is_none()
    }

    /// The plan itself, or its allocation error
    pub fn into_result(self) -> Result<Self> {
        match self.allocation_error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Run counters
    pub fn stats(&self) -> &ScanStats {
        &self.session.stats
    }

    /// Summary including planned (pending) assignments
    pub fn summary(&self) -> ArchiveSummary {
        ArchiveSummary::from_units(self.session.units())
    }
}

/// Point-in-time overview of an index
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStatus {
    /// Index root directory
    pub index_root: PathBuf,
    /// Media kind of the set
    pub media: MediaKind,
    /// Source roots being archived
    pub source_paths: Vec<PathBuf>,
    /// When the index was created
    pub created_at: DateTime<Utc>,
    /// Number of persisted units
    pub unit_count: usize,
    /// Committed files across all units
    pub total_files: u64,
    /// Committed bytes across all units
    pub total_data_size: u64,
    /// Committed files flagged as deleted at the source
    pub deleted_files: u64,
    /// Units never verified, or whose latest verification failed
    pub units_needing_verification: Vec<u32>,
    /// Units whose usable capacity is in doubt
    pub capacity_suspect_units: Vec<u32>,
    /// Days since the least recently verified unit was checked
    pub oldest_verification_days: Option<i64>,
}

/// Session on one archive set index
///
/// Holds the index lock for as long as it lives.
pub struct Archiver {
    index: UnitIndex,
    config: ArchiveConfig,
    progress_callback: Option<ProgressCallback>,
    cancellation: CancellationToken,
    lock: IndexLock,
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("index", &self.index)
            .field("config", &self.config)
            .field("progress_callback", &self.progress_callback.is_some())
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("lock", &self.lock)
            .finish()
    }
}

impl Archiver {
    /// Create a new index at `index_root` and open a session on it
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexAlreadyExists`] if `index_root` already holds an index
    /// - [`MediaspanError::IndexLocked`] if another session holds the lock
    /// - [`MediaspanError::InvalidConfiguration`] if `config` fails validation
    #[instrument(skip(config))]
    pub fn init(index_root: PathBuf, config: ArchiveConfig) -> Result<Self> {
        std::fs::create_dir_all(&index_root)?;
        let lock = IndexLock::acquire(&index_root)?;
        let index = UnitIndex::init(index_root, config)?;

        info!("Created archive set at {:?}", index.root());
        Ok(Self::with_index(index, lock))
    }

    /// Open a session on an existing index
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexNotInitialized`] if there is no index at `index_root`
    /// - [`MediaspanError::IndexLocked`] if another session holds the lock
    /// - [`MediaspanError::IndexCorrupt`] if the metadata cannot be read
    #[instrument]
    pub fn open(index_root: PathBuf) -> Result<Self> {
        if !index_root.is_dir() {
            return Err(MediaspanError::IndexNotInitialized(index_root));
        }
        let lock = IndexLock::acquire(&index_root)?;
        let index = UnitIndex::open(index_root)?;

        Ok(Self::with_index(index, lock))
    }

    fn with_index(index: UnitIndex, lock: IndexLock) -> Self {
        let config = index.config();
        Self {
            index,
            config,
            progress_callback: None,
            cancellation: CancellationToken::new(),
            lock,
        }
    }

    /// Index root directory
    pub fn root(&self) -> &Path {
        self.index.root()
    }

    /// Archive set configuration
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Underlying index
    pub fn index(&self) -> &UnitIndex {
        &self.index
    }

    /// Replace the progress observer for subsequent stages
    pub fn set_progress_callback(&mut self, callback: Option<ProgressCallback>) {
        self.progress_callback = callback;
    }

    /// Token that cancels the running stage when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Replace the source roots and exclusions
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::InvalidConfiguration`] if the new configuration is invalid
    pub fn update_sources(
        &mut self,
        source_paths: Vec<PathBuf>,
        exclude_paths: Vec<String>,
        exclude_files: Vec<String>,
    ) -> Result<()> {
        let mut config = self.config.clone();
        config.source_paths = source_paths;
        config.exclude_paths = exclude_paths;
        config.exclude_files = exclude_files;
        config.validate()?;

        self.index.update_metadata(|m| m.config = config.clone())?;
        self.config = config;
        Ok(())
    }

    /// Persisted units in unit-number order
    pub fn units(&self) -> Result<Vec<DestinationUnit>> {
        self.index.load_units()
    }

    /// Session seeded from the persisted units
    pub fn load_session(&self) -> Result<ScanSession> {
        Ok(ScanSession::new(self.index.load_units()?))
    }

    fn scanner(&self) -> SourceScanner {
        SourceScanner::new(self.config.source_paths.clone())
            .with_exclude_paths(self.config.normalized_exclude_paths())
            .with_exclude_files(self.config.normalized_exclude_files())
            .with_progress_interval(self.config.progress_interval_ms)
            .with_progress_callback(self.progress_callback.clone())
            .with_cancellation(self.cancellation.clone())
            .with_deleted_detection(true)
    }

    fn sizer(&self) -> Sizer {
        Sizer::new()
            .with_parallel_workers(self.config.parallel_workers)
            .with_progress_interval(self.config.progress_interval_ms)
            .with_progress_callback(self.progress_callback.clone())
            .with_cancellation(self.cancellation.clone())
    }

    /// Scan the sources and size every new file
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::InvalidConfiguration`] if a source root is missing
    /// - [`MediaspanError::IndexCorrupt`] if the index cannot be loaded
    #[instrument(skip(self))]
    pub fn scan(&self) -> Result<ScanSession> {
        let mut session = self.load_session()?;
        self.scanner().scan(&mut session)?;
        if !session.stats.cancelled {
            self.sizer().size(&mut session)?;
        }
        Ok(session)
    }

    /// Scan, size and allocate without persisting anything
    ///
    /// A failed allocation does not fail the run: the plan comes back with
    /// its scan counters and [`ArchivePlan::allocation_error`] set, e.g. to
    /// [`MediaspanError::CapacityExhausted`] when a new file is larger than
    /// any unit. Use [`ArchivePlan::into_result`] to treat that as an error.
    ///
    /// # Errors
    ///
    /// - any error from [`Archiver::scan`]
    #[instrument(skip(self))]
    pub fn plan(&self) -> Result<ArchivePlan> {
        let start = Instant::now();
        let mut session = self.scan()?;
        let free_space = session.verify_free_space();
        if !free_space.is_sufficient() {
            info!(
                "{} pending bytes exceed {} free on existing units; about {} more needed",
                free_space.pending_bytes, free_space.usable_free_space, free_space.additional_units
            );
        }

        let (allocation, allocation_error) = match Allocator::new(self.config.unit_template())
            .with_progress_interval(self.config.progress_interval_ms)
            .with_progress_callback(self.progress_callback.clone())
            .allocate(&mut session)
        {
            Ok(allocation) => (allocation, None),
            Err(err) => {
                warn!("Allocation failed: {}", err);
                (AllocationReport::default(), Some(err))
            }
        };
        session.stats.new_unit_count = allocation.new_units.len() as u64;

        let plan = ArchivePlan {
            session,
            allocation,
            free_space,
            allocation_error,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Planned {} files onto units ({} new) in {}ms",
            plan.allocation.assigned_files,
            plan.allocation.new_units.len(),
            plan.elapsed_ms
        );
        Ok(plan)
    }

    /// Plan, then copy the files assigned to `unit_number` onto `mount`
    ///
    /// Other units' deleted-file flags found by the scan are saved as well.
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::UnitNotFound`] if the plan has no such unit
    /// - the plan's allocation error, if any
    /// - any error from [`Archiver::plan`]
    #[instrument(skip(self, mount))]
    pub fn write_unit(&self, unit_number: u32, mount: impl AsRef<Path>) -> Result<WriteReport> {
        let mut plan = self.plan()?.into_result()?;
        if plan.stats().cancelled {
            return Err(MediaspanError::Cancelled);
        }

        let writer = UnitWriter::new(mount.as_ref())
            .with_index(&self.index)
            .with_auto_save_interval(self.config.auto_save_interval_secs)
            .with_progress_interval(self.config.progress_interval_ms)
            .with_progress_callback(self.progress_callback.clone())
            .with_cancellation(self.cancellation.clone());
        let report = writer.write_unit(plan.session.unit_mut(unit_number)?)?;

        let mut units = plan.session.into_units();
        self.index.save_units(&mut units)?;

        if let Some(err) = &report.capacity_mismatch {
            warn!("{}", err);
        }
        Ok(report)
    }

    fn with_persisted_unit<T, F>(&self, unit_number: u32, f: F) -> Result<T>
    where
        F: FnOnce(&mut DestinationUnit) -> Result<T>,
    {
        let mut units = self.index.load_units()?;
        let unit = units
            .iter_mut()
            .find(|u| u.unit_number == unit_number)
            .ok_or(MediaspanError::UnitNotFound(unit_number))?;
        let result = f(unit)?;
        self.index.save_unit(unit)?;
        Ok(result)
    }

    /// Re-hash a written unit mounted at `mount` and record the outcome
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::UnitNotFound`] if the index has no such unit
    /// - [`MediaspanError::Cancelled`] if cancelled
    #[instrument(skip(self, mount))]
    pub fn verify_unit(&self, unit_number: u32, mount: impl AsRef<Path>) -> Result<UnitVerificationReport> {
        let verifier = UnitVerifier::new(mount.as_ref())
            .with_parallel_workers(self.config.parallel_workers)
            .with_progress_interval(self.config.progress_interval_ms)
            .with_progress_callback(self.progress_callback.clone())
            .with_cancellation(self.cancellation.clone());

        self.with_persisted_unit(unit_number, |unit| verifier.verify_unit(unit))
    }

    /// Mark a disc as burned so it never receives more files
    pub fn finalize_unit(&self, unit_number: u32) -> Result<()> {
        self.with_persisted_unit(unit_number, |unit| {
            unit.finalized = true;
            info!("Finalized {}", unit.name());
            Ok(())
        })
    }

    /// Record bytes physically written to a tape
    pub fn record_media_usage(&self, unit_number: u32, bytes_on_media: u64) -> Result<()> {
        self.with_persisted_unit(unit_number, |unit| {
            unit.record_media_usage(bytes_on_media);
            Ok(())
        })
    }

    /// Summary of the persisted units
    pub fn summary(&self) -> Result<ArchiveSummary> {
        Ok(ArchiveSummary::from_units(&self.index.load_units()?))
    }

    /// Committed files whose relative path contains `term`, ignoring case
    pub fn search(&self, term: &str) -> Result<Vec<SearchHit>> {
        let hits = search::search_units(&self.index.load_units()?, term);
        info!("Search for {:?} matched {} files", term, hits.len());
        Ok(hits)
    }

    /// Scan and size, then report archived files that look moved
    pub fn find_renames(&self) -> Result<Vec<RenameCandidate>> {
        let session = self.scan()?;
        Ok(renames::find_rename_candidates(&session))
    }

    /// Scan and size, re-point every rename candidate and save the index
    ///
    /// Returns the candidates that were applied.
    #[instrument(skip(self))]
    pub fn apply_renames(&self) -> Result<Vec<RenameCandidate>> {
        let mut session = self.scan()?;
        if session.stats.cancelled {
            return Err(MediaspanError::Cancelled);
        }

        let candidates = renames::find_rename_candidates(&session);
        for candidate in &candidates {
            renames::apply_rename(&mut session, candidate)?;
        }

        let mut units = session.into_units();
        self.index.save_units(&mut units)?;
        info!("Applied {} renames", candidates.len());
        Ok(candidates)
    }

    /// Overview of the persisted index
    pub fn status(&self) -> Result<ArchiveStatus> {
        let metadata: IndexMetadata = self.index.metadata();
        let units = self.index.load_units()?;
        let now = Utc::now();

        Ok(ArchiveStatus {
            index_root: self.index.root().to_path_buf(),
            media: self.config.media,
            source_paths: self.config.source_paths.clone(),
            created_at: metadata.created_at,
            unit_count: units.len(),
            total_files: units.iter().map(|u| u.total_files()).sum(),
            total_data_size: units.iter().map(|u| u.data_size()).sum(),
            deleted_files: units
                .iter()
                .flat_map(|u| u.committed_files())
                .filter(|f| f.file_deleted == Some(true))
                .count() as u64,
            units_needing_verification: units
                .iter()
                .filter(|u| !u.last_verify_success())
                .map(|u| u.unit_number)
                .collect(),
            capacity_suspect_units: units
                .iter()
                .filter(|u| u.is_capacity_suspect())
                .map(|u| u.unit_number)
                .collect(),
            oldest_verification_days: units.iter().filter_map(|u| u.days_since_last_verify_at(now)).max(),
        })
    }
}

/// Builder for [`Archiver`]
///
/// `build` opens the index when one already exists at the given root and
/// creates it otherwise; the configuration setters only apply to creation.
pub struct ArchiverBuilder {
    media: MediaKind,
    unit_capacity: u64,
    block_size: u64,
    reserved_capacity_bytes: Option<u64>,
    tape_blocking_factor: Option<u32>,
    source_paths: Vec<PathBuf>,
    exclude_paths: Vec<String>,
    exclude_files: Vec<String>,
    progress_interval_ms: Option<u64>,
    auto_save_interval_secs: Option<i64>,
    parallel_workers: usize,
    progress_callback: Option<ProgressCallback>,
}

impl ArchiverBuilder {
    /// Builder for a CSD set with 4 KiB blocks and no capacity set
    pub fn new() -> Self {
        Self {
            media: MediaKind::Csd,
            unit_capacity: 0,
            block_size: 4096,
            reserved_capacity_bytes: None,
            tape_blocking_factor: None,
            source_paths: Vec::new(),
            exclude_paths: Vec::new(),
            exclude_files: Vec::new(),
            progress_interval_ms: None,
            auto_save_interval_secs: None,
            parallel_workers: num_cpus::get(),
            progress_callback: None,
        }
    }

    /// Media kind of the set
    pub fn media(mut self, media: MediaKind) -> Self {
        self.media = media;
        self
    }

    /// Capacity of each unit in bytes
    pub fn unit_capacity(mut self, bytes: u64) -> Self {
        self.unit_capacity = bytes;
        self
    }

    /// Allocation granularity; ignored for tape, which uses tar records
    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    /// Headroom kept free on every unit
    ///
    /// Defaults to 1 GiB (capped at half the capacity) for CSD and 0 otherwise.
    pub fn reserved_capacity_bytes(mut self, bytes: u64) -> Self {
        self.reserved_capacity_bytes = Some(bytes);
        self
    }

    /// Tar blocking factor for tape sets
    pub fn tape_blocking_factor(mut self, factor: u32) -> Self {
        self.tape_blocking_factor = Some(factor);
        self
    }

    /// Source roots to archive
    pub fn source_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.source_paths = paths;
        self
    }

    /// Excluded path prefixes, matched case-insensitively
    pub fn exclude_paths(mut self, prefixes: Vec<String>) -> Self {
        self.exclude_paths = prefixes;
        self
    }

    /// Excluded filename suffixes, matched case-insensitively
    pub fn exclude_files(mut self, suffixes: Vec<String>) -> Self {
        self.exclude_files = suffixes;
        self
    }

    /// Minimum wall time between progress snapshots
    pub fn progress_interval_ms(mut self, interval_ms: u64) -> Self {
        self.progress_interval_ms = Some(interval_ms);
        self
    }

    /// Seconds between index saves while writing
    pub fn auto_save_interval_secs(mut self, seconds: i64) -> Self {
        self.auto_save_interval_secs = Some(seconds);
        self
    }

    /// Worker threads for sizing and verification
    pub fn parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
        self
    }

    /// Progress observer installed on the built session
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Configuration the builder would create an index with
    pub fn config(&self) -> ArchiveConfig {
        let mut config = ArchiveConfig::for_media(self.media, self.unit_capacity, self.block_size);
        config.source_paths = self.source_paths.clone();
        config.exclude_paths = self.exclude_paths.clone();
        config.exclude_files = self.exclude_files.clone();
        config.parallel_workers = self.parallel_workers;
        if let Some(reserved) = self.reserved_capacity_bytes {
            config.reserved_capacity_bytes = reserved;
        }
        if let Some(factor) = self.tape_blocking_factor {
            config.tape_blocking_factor = factor;
        }
        if let Some(interval) = self.progress_interval_ms {
            config.progress_interval_ms = interval;
        }
        if let Some(seconds) = self.auto_save_interval_secs {
            config.auto_save_interval_secs = seconds;
        }
        config
    }

    /// Open the index at `index_root`, creating it if needed
    pub fn build(self, index_root: PathBuf) -> Result<Archiver> {
        let mut archiver = if crate::index::index_exists(&index_root) {
            Archiver::open(index_root)?
        } else {
            Archiver::init(index_root, self.config())?
        };
        archiver.set_progress_callback(self.progress_callback);
        Ok(archiver)
    }
}

impl Default for ArchiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}
