//! Sizing stage
//!
//! Reads size, timestamps and attributes for every staged record that has not
//! been sized yet. Each record is stat'ed at most once: a record that already
//! carries a size is skipped, so re-running the stage never double counts
//! `total_size_pending`.
//!
//! Records are processed on a rayon pool. Counters are kept in atomics and
//! folded into the session's [`ScanStats`](crate::types::ScanStats) when the
//! pool finishes. Files that vanished or could not be read are dropped from
//! staging and counted in `error_file_count`.

use crate::collections::PathKey;
use crate::error::{MediaspanError, Result};
use crate::session::ScanSession;
use crate::types::{CancellationToken, ProgressCallback, ProgressSampler, ScanStats, Stage};
use crate::utils;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

/// Parallel stat of staged records
#[derive(Clone)]
pub struct Sizer {
    parallel_workers: usize,
    progress_interval_ms: u64,
    progress_callback: Option<ProgressCallback>,
    cancellation: CancellationToken,
}

impl Default for Sizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sizer {
    /// Sizer with one worker per CPU
    pub fn new() -> Self {
        Self {
            parallel_workers: num_cpus::get(),
            progress_interval_ms: 250,
            progress_callback: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Number of stat workers
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

    /// Token polled before every record
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Size every unsized staged record
    ///
    /// Returns the number of records sized by this call.
    #[instrument(skip(self, session))]
    pub fn size(&self, session: &mut ScanSession) -> Result<u64> {
        let total = session.new_files().iter().filter(|f| !f.is_sized()).count() as u64;
        if total == 0 {
            debug!("Nothing to size");
            return Ok(0);
        }

        let pool = utils::worker_pool(self.parallel_workers, "sizer")?;
        let base_stats = session.stats.clone();
        let sized = AtomicU64::new(0);
        let bytes = AtomicU64::new(0);
        let interrupted = AtomicBool::new(false);
        let sampler = Mutex::new(ProgressSampler::new(
            self.progress_callback.clone(),
            Stage::Sizing,
            self.progress_interval_ms,
        ));

        let snapshot = |sized: u64, bytes: u64| ScanStats {
            sized_file_count: base_stats.sized_file_count + sized,
            total_size_pending: base_stats.total_size_pending + bytes,
            ..base_stats.clone()
        };

        let failed: Vec<PathKey> = pool.install(|| {
            session
                .new_files_mut()
                .par_iter_mut()
                .filter(|record| !record.is_sized())
                .filter_map(|record| {
                    if self.cancellation.is_cancelled() {
                        interrupted.store(true, Ordering::Relaxed);
                        return None;
                    }

                    let outcome = match record.read_size_and_attributes() {
                        Ok(Some(size)) => {
                            sized.fetch_add(1, Ordering::Relaxed);
                            bytes.fetch_add(size, Ordering::Relaxed);
                            None
                        }
                        Ok(None) => None,
                        Err(MediaspanError::SourceNotFound { path }) => {
                            warn!("Source vanished before sizing: {:?}", path);
                            Some(record.key())
                        }
                        Err(e) => {
                            warn!("Failed to size {}: {}", record.full_path, e);
                            Some(record.key())
                        }
                    };

                    if let Some(mut sampler) = sampler.try_lock() {
                        let (s, b) = (sized.load(Ordering::Relaxed), bytes.load(Ordering::Relaxed));
                        sampler.sample(s, Some(total), b, &snapshot(s, b));
                    }

                    outcome
                })
                .collect()
        });

        let sized = sized.into_inner();
        let bytes = bytes.into_inner();

        session.stats.sized_file_count += sized;
        session.stats.total_size_pending += bytes;
        session.stats.error_file_count += failed.len() as u64;
        if interrupted.into_inner() {
            info!("Sizing cancelled after {} of {} files", sized, total);
            session.stats.cancelled = true;
        }

        let discarded = session.discard_new_files(&failed);
        if !discarded.is_empty() {
            debug!("Dropped {} unreadable files from staging", discarded.len());
        }

        let mut sampler = sampler.into_inner();
        sampler.finish(sized, Some(total), bytes, &session.stats);

        info!(
            "Sized {} files ({}) in {:?}",
            sized,
            utils::format_bytes(bytes),
            sampler.elapsed()
        );
        Ok(sized)
    }
}
