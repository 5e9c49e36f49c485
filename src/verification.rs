//! Unit verification
//!
//! Verification re-reads every committed file of a unit from its mounted
//! media, recomputes the SHA-256 digest and compares it with the digest
//! recorded when the file was written. The outcome is appended to the unit's
//! verification history, which drives
//! [`last_verify_success`](crate::unit::DestinationUnit::last_verify_success)
//! and [`days_since_last_verify`](crate::unit::DestinationUnit::days_since_last_verify).
//! A fully valid pass also clears a unit's capacity-suspect flag.
//!
//! Files are hashed in parallel on a rayon pool.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mediaspan::verification::UnitVerifier;
//! # use mediaspan::unit::DestinationUnit;
//!
//! # fn example(unit: &mut DestinationUnit) -> mediaspan::Result<()> {
//! let report = UnitVerifier::new("/mnt/csd").verify_unit(unit)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::error::{MediaspanError, Result};
use crate::types::{CancellationToken, ProgressCallback, ProgressSampler, ScanStats, Stage};
use crate::unit::DestinationUnit;
use crate::utils;
use crate::writer::payload_path;
use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Verification result for a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVerification {
    /// Relative path of the file
    pub relative_path: String,
    /// Whether the payload exists on the media
    pub exists: bool,
    /// Whether the recomputed digest matches the recorded one
    pub hash_matches: bool,
    /// Error message if the file could not be read
    pub error: Option<String>,
}

impl FileVerification {
    /// Check if the file verification passed
    pub fn is_valid(&self) -> bool {
        self.exists && self.hash_matches && self.error.is_none()
    }
}

/// Outcome of verifying one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitVerificationReport {
    /// Unit that was verified
    pub unit_number: u32,
    /// Unit label
    pub unit_name: String,
    /// Files checked
    pub total_files_checked: usize,
    /// Files that passed
    pub files_valid: usize,
    /// Failed files only
    pub failures: Vec<FileVerification>,
    /// Bytes hashed
    pub bytes_verified: u64,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl UnitVerificationReport {
    /// Check if every file passed
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty() && self.files_valid == self.total_files_checked
    }

    /// One-line description of the outcome
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "{} is valid ({} files verified in {}ms)",
                self.unit_name, self.total_files_checked, self.verification_time_ms
            )
        } else {
            let missing = self.failures.iter().filter(|f| !f.exists).count();
            let mismatched = self.failures.iter().filter(|f| f.exists && !f.hash_matches).count();
            format!(
                "{} is invalid: {} missing, {} mismatched ({}/{} files valid)",
                self.unit_name, missing, mismatched, self.files_valid, self.total_files_checked
            )
        }
    }
}

/// Re-hashes a unit's committed files on mounted media
pub struct UnitVerifier {
    mount: PathBuf,
    parallel_workers: usize,
    progress_interval_ms: u64,
    progress_callback: Option<ProgressCallback>,
    cancellation: CancellationToken,
}

impl UnitVerifier {
    /// Verifier reading from the media mounted at `mount`
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            parallel_workers: num_cpus::get(),
            progress_interval_ms: 250,
            progress_callback: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Number of hashing workers
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
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

    /// Token polled before every file
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Verify every committed file and record the result on the unit
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::Cancelled`] if cancelled; nothing is recorded
    #[instrument(skip(self, unit), fields(unit = unit.unit_number))]
    pub fn verify_unit(&self, unit: &mut DestinationUnit) -> Result<UnitVerificationReport> {
        let start = Instant::now();
        let pool = utils::worker_pool(self.parallel_workers, "verify")?;
        let total = unit.committed_files().len() as u64;
        let checked = AtomicU64::new(0);
        let bytes = AtomicU64::new(0);
        let stats = ScanStats::default();
        let sampler = Mutex::new(ProgressSampler::new(
            self.progress_callback.clone(),
            Stage::Verifying,
            self.progress_interval_ms,
        ));

        let results: Vec<Option<FileVerification>> = pool.install(|| {
            unit.committed_files()
                .par_iter()
                .map(|file| {
                    if self.cancellation.is_cancelled() {
                        return None;
                    }

                    let path = payload_path(&self.mount, &file.relative_path);
                    let mut check = FileVerification {
                        relative_path: file.relative_path.clone(),
                        exists: path.is_file(),
                        hash_matches: false,
                        error: None,
                    };

                    if check.exists {
                        match utils::hash_file_content(&path) {
                            Ok(actual) => {
                                check.hash_matches = file.hash.as_deref() == Some(actual.as_str());
                                bytes.fetch_add(file.size_or_zero(), Ordering::Relaxed);
                            }
                            Err(e) => check.error = Some(e.to_string()),
                        }
                    }

                    let done = checked.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(mut sampler) = sampler.try_lock() {
                        sampler.sample(done, Some(total), bytes.load(Ordering::Relaxed), &stats);
                    }

                    Some(check)
                })
                .collect()
        });

        if self.cancellation.is_cancelled() {
            info!("Verification of {} cancelled", unit.name());
            return Err(MediaspanError::Cancelled);
        }

        let checks: Vec<FileVerification> = results.into_iter().flatten().collect();
        let files_valid = checks.iter().filter(|c| c.is_valid()).count();
        let failures: Vec<FileVerification> = checks.iter().filter(|c| !c.is_valid()).cloned().collect();
        for failure in &failures {
            warn!(
                "{} failed verification on {}: exists={} hash_matches={}",
                failure.relative_path,
                unit.name(),
                failure.exists,
                failure.hash_matches
            );
        }

        let report = UnitVerificationReport {
            unit_number: unit.unit_number,
            unit_name: unit.name(),
            total_files_checked: checks.len(),
            files_valid,
            failures,
            bytes_verified: bytes.into_inner(),
            verification_time_ms: start.elapsed().as_millis() as u64,
        };

        unit.record_verification(Utc::now(), report.is_valid());
        sampler
            .into_inner()
            .finish(checked.into_inner(), Some(total), report.bytes_verified, &stats);

        info!("{}", report.summary());
        Ok(report)
    }
}
