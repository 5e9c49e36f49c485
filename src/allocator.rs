//! First-fit allocation of staged files onto destination units
//!
//! Files are taken in discovery order (never re-sorted by size) and each one
//! goes to the first unit, in ascending unit-number order, that
//! [accepts](crate::unit::DestinationUnit::can_accept) it. When no unit has
//! room, a new unit is minted from the configured [`UnitTemplate`] with the
//! next unit number (highest existing + 1, or 1 for an empty set).
//!
//! Decisions are never revisited. Units already written are append-only
//! physical media, so gaps left by first-fit stay where they are.
//!
//! ## Oversized files
//!
//! Before anything is assigned, every sized file is checked against the
//! largest file an empty unit could hold and the room left on existing units.
//! A file that fits nowhere aborts the pass with
//! [`MediaspanError::CapacityExhausted`] before anything is assigned.
//!
//! A file can still run out of room mid-pass when the only unit large enough
//! for it (an existing unit bigger than the template) is filled by earlier
//! files. Any failure inside the pass rolls it back: minted units are
//! dropped, this pass's assignments are removed from existing units and every
//! record is restaged in discovery order. Staged records are never dropped.

use crate::error::{MediaspanError, Result};
use crate::session::ScanSession;
use crate::source_file::SourceFileRecord;
use crate::types::{ProgressCallback, ProgressSampler, Stage, UnitTemplate};
use crate::unit::DestinationUnit;
use std::path::PathBuf;
use tracing::{debug, info, instrument, trace, warn};

/// Outcome of one allocation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    /// Files assigned to a unit in this pass
    pub assigned_files: u64,
    /// Bytes assigned in this pass
    pub assigned_bytes: u64,
    /// Unit numbers minted in this pass
    pub new_units: Vec<u32>,
    /// Staged records left alone because they were never sized
    pub unsized_files: u64,
}

/// First-fit allocator
#[derive(Clone)]
pub struct Allocator {
    template: UnitTemplate,
    progress_interval_ms: u64,
    progress_callback: Option<ProgressCallback>,
}

impl Allocator {
    /// Allocator that mints new units from `template`
    pub fn new(template: UnitTemplate) -> Self {
        Self {
            template,
            progress_interval_ms: 250,
            progress_callback: None,
        }
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

    /// Template new units are minted from
    pub fn template(&self) -> &UnitTemplate {
        &self.template
    }

    fn oversized(&self, units: &[DestinationUnit], record: &SourceFileRecord) -> Option<MediaspanError> {
        let size = record.size_or_zero();
        if self.template.can_hold(size) || units.iter().any(|u| u.can_accept(size)) {
            return None;
        }

        let max_capacity = units
            .iter()
            .map(|u| u.max_file_size())
            .chain(std::iter::once(self.template.max_file_size()))
            .max()
            .unwrap_or(0);

        Some(MediaspanError::CapacityExhausted {
            path: PathBuf::from(&record.full_path),
            size,
            max_capacity,
        })
    }

    /// Assign every sized staged record to a unit
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::CapacityExhausted`] if a file cannot fit on any unit,
    ///   even an empty one
    #[instrument(skip(self, session), fields(staged = session.new_files().len()))]
    pub fn allocate(&self, session: &mut ScanSession) -> Result<AllocationReport> {
        if let Some(err) = session
            .new_files()
            .iter()
            .filter(|f| f.is_sized())
            .find_map(|f| self.oversized(session.units(), f))
        {
            return Err(err);
        }

        let staged = session.take_new_files();
        let checkpoint = Checkpoint::take(session, &staged);
        let mut report = AllocationReport::default();

        match self.assign(session, staged, &mut report) {
            Ok(remaining) => {
                session.stats.new_unit_count += report.new_units.len() as u64;
                session.restage(remaining);
            }
            Err(err) => {
                warn!("Allocation aborted, rolling back {} assignments", report.assigned_files);
                checkpoint.restore(session);
                return Err(err);
            }
        }

        info!(
            "Allocated {} files across {} units ({} new)",
            report.assigned_files,
            session.units().len(),
            report.new_units.len()
        );
        Ok(report)
    }

    /// First-fit loop; returns the records left staged
    fn assign(
        &self,
        session: &mut ScanSession,
        staged: Vec<SourceFileRecord>,
        report: &mut AllocationReport,
    ) -> Result<Vec<SourceFileRecord>> {
        let total = staged.len() as u64;
        let mut remaining = Vec::new();
        let mut sampler = ProgressSampler::new(
            self.progress_callback.clone(),
            Stage::Allocating,
            self.progress_interval_ms,
        );

        for record in staged {
            if !record.is_sized() {
                report.unsized_files += 1;
                remaining.push(record);
                continue;
            }

            let size = record.size_or_zero();
            let index = match session.units().iter().position(|u| u.can_accept(size)) {
                Some(index) => index,
                None => {
                    // Earlier files in this pass can fill the only unit
                    // large enough for this one.
                    if let Some(err) = self.oversized(session.units(), &record) {
                        return Err(err);
                    }

                    let unit_number = session.next_unit_number();
                    debug!("Minting {} unit {}", self.template.kind, unit_number);
                    session.push_unit(DestinationUnit::new(unit_number, &self.template));
                    report.new_units.push(unit_number);
                    session.units().len() - 1
                }
            };

            let key = record.key();
            let unit = &mut session.units_mut()[index];
            let unit_number = unit.unit_number;
            trace!("{} -> {}", record.relative_path, unit.name());
            unit.add_file(record)?;
            session.mark_assigned(key, unit_number);

            report.assigned_files += 1;
            report.assigned_bytes += size;
            session.stats.allocated_file_count += 1;

            sampler.sample(report.assigned_files, Some(total), report.assigned_bytes, &session.stats);
        }

        sampler.finish(report.assigned_files, Some(total), report.assigned_bytes, &session.stats);
        Ok(remaining)
    }
}

/// Session state before an allocation pass
struct Checkpoint {
    unit_count: usize,
    pending_counts: Vec<usize>,
    staged: Vec<SourceFileRecord>,
    allocated_file_count: u64,
}

impl Checkpoint {
    fn take(session: &ScanSession, staged: &[SourceFileRecord]) -> Self {
        Self {
            unit_count: session.units().len(),
            pending_counts: session
                .units()
                .iter()
                .map(|u| u.pending_file_count() as usize)
                .collect(),
            staged: staged.to_vec(),
            allocated_file_count: session.stats.allocated_file_count,
        }
    }

    /// Drop minted units, unassign this pass's files and restage them in
    /// discovery order
    fn restore(self, session: &mut ScanSession) {
        session.truncate_units(self.unit_count);
        for (unit, keep) in session.units_mut().iter_mut().zip(self.pending_counts) {
            unit.truncate_pending(keep);
        }
        session.stats.allocated_file_count = self.allocated_file_count;
        session.restage(self.staged);
    }
}
