//! Source tree scanning and index diffing
//!
//! The [`SourceScanner`] walks each configured source root depth-first and
//! classifies every file it finds against the session's index:
//!
//! - **excluded**: the cleaned full path starts with an excluded path prefix,
//!   or the file name ends with an excluded suffix (both case-insensitive).
//!   Excluded directories are pruned without descending into them. A file
//!   matching both rules is counted once.
//! - **existing**: the relative path is already indexed. No content
//!   comparison is made, so a file whose content changed in place is still
//!   treated as archived.
//! - **new**: anything else. A [`SourceFileRecord`] is staged in the session.
//!
//! ## Cancellation
//!
//! The [`CancellationToken`] is polled before every directory entry. A
//! cancelled scan returns normally with `stats.cancelled` set; whatever was
//! staged so far is valid and can be sized and allocated.
//!
//! ## Deleted files
//!
//! After a complete scan, archived files that live under a scanned root, are
//! not excluded, and were not seen are flagged `file_deleted`. They stay in
//! their unit's committed list.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mediaspan::scanner::SourceScanner;
//! use mediaspan::session::ScanSession;
//! use std::path::PathBuf;
//!
//! # fn example() -> mediaspan::Result<()> {
//! let mut session = ScanSession::new(Vec::new());
//! SourceScanner::new(vec![PathBuf::from("/srv/photos")])
//!     .with_exclude_files(vec![".tmp".to_string()])
//!     .scan(&mut session)?;
//!
//! println!("{} new files", session.stats.new_file_count);
//! # Ok(())
//! # }
//! ```

use crate::collections::{HashSet, HashSetExt, PathKey};
use crate::error::{MediaspanError, Result};
use crate::session::{IndexEntry, ScanSession};
use crate::source_file::SourceFileRecord;
use crate::types::{CancellationToken, ProgressCallback, ProgressSampler, Stage};
use crate::utils;
use std::path::PathBuf;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Walks source roots and stages unseen files in a [`ScanSession`]
#[derive(Clone)]
pub struct SourceScanner {
    source_paths: Vec<PathBuf>,
    exclude_paths: Vec<String>,
    exclude_files: Vec<String>,
    progress_interval_ms: u64,
    progress_callback: Option<ProgressCallback>,
    cancellation: CancellationToken,
    detect_deleted: bool,
}

impl std::fmt::Debug for SourceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceScanner")
            .field("source_paths", &self.source_paths)
            .field("exclude_paths", &self.exclude_paths)
            .field("exclude_files", &self.exclude_files)
            .field("progress_interval_ms", &self.progress_interval_ms)
            .field("detect_deleted", &self.detect_deleted)
            .finish()
    }
}

impl SourceScanner {
    /// Create a scanner over the given roots with no exclusions
    pub fn new(source_paths: Vec<PathBuf>) -> Self {
        Self {
            source_paths,
            exclude_paths: Vec::new(),
            exclude_files: Vec::new(),
            progress_interval_ms: 250,
            progress_callback: None,
            cancellation: CancellationToken::new(),
            detect_deleted: true,
        }
    }

    /// Excluded path prefixes, matched case-insensitively against cleaned full paths
    pub fn with_exclude_paths(mut self, prefixes: Vec<String>) -> Self {
        self.exclude_paths = prefixes
            .iter()
            .map(|p| utils::clean_path(p).to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Excluded file name suffixes, matched case-insensitively
    pub fn with_exclude_files(mut self, suffixes: Vec<String>) -> Self {
        self.exclude_files = suffixes
            .into_iter()
            .map(|s| s.to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    /// Minimum wall time between progress snapshots
    pub fn with_progress_interval(mut self, interval_ms: u64) -> Self {
        self.progress_interval_ms = interval_ms;
        self
    }

    /// Observer for progress snapshots
    pub fn with_progress_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.progress_callback = callback;
        self
    }

    /// Token polled at every directory entry
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Whether to flag archived files that were not seen
    pub fn with_deleted_detection(mut self, enabled: bool) -> Self {
        self.detect_deleted = enabled;
        self
    }

    fn is_excluded_path(&self, clean_lower: &str) -> bool {
        self.exclude_paths.iter().any(|p| clean_lower.starts_with(p.as_str()))
    }

    fn is_excluded_file(&self, name_lower: &str) -> bool {
        self.exclude_files.iter().any(|s| name_lower.ends_with(s.as_str()))
    }

    /// Walk every source root and diff it against the session's index
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::InvalidConfiguration`] if a source root does not exist
    ///
    /// Unreadable entries are logged, counted in `error_file_count` and skipped.
    #[instrument(skip(self, session), fields(roots = self.source_paths.len()))]
    pub fn scan(&self, session: &mut ScanSession) -> Result<()> {
        for root in &self.source_paths {
            if !root.is_dir() {
                return Err(MediaspanError::config(format!(
                    "source directory does not exist: {}",
                    root.display()
                )));
            }
        }

        let mut sampler = ProgressSampler::new(
            self.progress_callback.clone(),
            Stage::Scanning,
            self.progress_interval_ms,
        );
        let mut seen: HashSet<PathKey> = HashSet::with_capacity(session.indexed_path_count());
        let mut scanned_roots = Vec::with_capacity(self.source_paths.len());

        'roots: for root in &self.source_paths {
            let clean_root = utils::clean_os_path(root);
            debug!("Scanning source root {}", clean_root);
            scanned_roots.push(PathKey::new(&utils::relative_path(&clean_root)));

            let walker = WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    if entry.depth() == 0 || !entry.file_type().is_dir() {
                        return true;
                    }
                    let clean = utils::clean_os_path(entry.path()).to_lowercase();
                    if self.is_excluded_path(&clean) {
                        trace!("Pruned excluded directory {}", clean);
                        false
                    } else {
                        true
                    }
                });

            for entry in walker {
                if self.cancellation.is_cancelled() {
                    info!("Scan cancelled");
                    session.stats.cancelled = true;
                    break 'roots;
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Walk error: {}", e);
                        session.stats.error_file_count += 1;
                        continue;
                    }
                };

                if entry.file_type().is_dir() {
                    continue;
                }

                self.classify(entry.path(), session, &mut seen);

                let processed = session.stats.total_seen();
                sampler.sample(processed, None, 0, &session.stats);
            }
        }

        if self.detect_deleted && !session.stats.cancelled {
            self.flag_deleted(session, &seen, &scanned_roots);
        }

        let stats = &session.stats;
        sampler.finish(stats.total_seen(), Some(stats.total_seen()), 0, stats);

        info!(
            "Scan finished in {:?}: {} new, {} existing, {} excluded, {} deleted, {} errors",
            sampler.elapsed(),
            stats.new_file_count,
            stats.existing_file_count,
            stats.excluded_file_count,
            stats.deleted_file_count,
            stats.error_file_count
        );

        Ok(())
    }

    fn classify(&self, path: &std::path::Path, session: &mut ScanSession, seen: &mut HashSet<PathKey>) {
        let clean = utils::clean_os_path(path);
        let clean_lower = clean.to_lowercase();

        if self.is_excluded_path(&clean_lower)
            || self.is_excluded_file(utils::file_name(&clean_lower))
        {
            trace!("Excluded {}", clean);
            session.stats.excluded_file_count += 1;
            return;
        }

        let key = PathKey::new(&utils::relative_path(&clean));
        if !seen.insert(key.clone()) {
            // overlapping roots
            return;
        }

        match session.lookup_key(&key) {
            Some(IndexEntry::Archived { .. }) | Some(IndexEntry::Pending { .. }) => {
                session.stats.existing_file_count += 1;
            }
            Some(IndexEntry::New(_)) => {}
            None => {
                let record = SourceFileRecord::from_clean_path(&clean);
                trace!("New file {}", record.relative_path);
                if session.register_new_file(record) {
                    session.stats.new_file_count += 1;
                }
            }
        }
    }

    fn flag_deleted(&self, session: &mut ScanSession, seen: &HashSet<PathKey>, roots: &[PathKey]) {
        let mut deleted = 0u64;

        for unit in session.units_mut() {
            for file in unit.committed_files_mut() {
                let key = file.key();
                if !roots.iter().any(|root| key.is_under(root)) {
                    continue;
                }

                if seen.contains(&key) {
                    file.file_deleted = None;
                    continue;
                }

                let full_lower = file.full_path.to_lowercase();
                if self.is_excluded_path(&full_lower) || self.is_excluded_file(&file.name.to_lowercase()) {
                    continue;
                }

                if file.file_deleted != Some(true) {
                    debug!("Archived file no longer present: {}", file.relative_path);
                }
                file.file_deleted = Some(true);
                deleted += 1;
            }
        }

        session.stats.deleted_file_count += deleted;
    }
}
