//! Destination units
//!
//! A [`DestinationUnit`] is one physical piece of media: a disc, a CSD drive
//! or a tape. It owns two disjoint file lists:
//!
//! - **committed files**: payload written and confirmed (`copied == true`)
//! - **pending files**: assigned by the allocator, not yet written
//!
//! ## Counter discipline
//!
//! The cached counters (`total_files`, `data_size`, `data_size_on_disk` and the
//! three pending counters) are maintained incrementally by every method that
//! mutates the file lists. The lists are private, so there is no other way to
//! change them and the counters cannot drift. [`DestinationUnit::sync_stats`]
//! recomputes everything from the lists and is called at the two checkpoints
//! where the lists arrive from outside: after loading an index record and when
//! taking a snapshot.
//!
//! ## Capacity
//!
//! Block-aligned media (CSD, tape) count each file at its size rounded up to
//! the unit's block size:
//!
//! ```text
//! usable_free_space = total_space - reserved - data_size_on_disk - pending_bytes_on_disk
//! full             <=> usable_free_space <= block_size
//! accepts(size)    <=> !full && usable_free_space > round(size, block_size)
//! ```
//!
//! Discs use a flat limit instead: a disc accepts a file while
//! `data_size + pending_bytes + size < total_space - reserved`.
//!
//! A unit flagged as capacity-suspect (the device turned out smaller than
//! assumed) or a finalized disc is always full.

use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt, PathKey};
use crate::error::{MediaspanError, Result};
use crate::source_file::SourceFileRecord;
use crate::types::{MediaKind, UnitTemplate};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of one verification pass over a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// When the verification ran
    pub verified_at: DateTime<Utc>,
    /// Whether every file matched its recorded digest
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Committed,
    Pending,
}

/// One piece of destination media
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationUnit {
    /// Monotonic unit number, assigned at creation
    pub unit_number: u32,
    /// Media kind
    pub kind: MediaKind,
    /// Raw capacity in bytes
    pub total_space: u64,
    /// Allocation granularity
    pub block_size: u64,
    /// Headroom kept free
    #[serde(default)]
    pub reserved_capacity_bytes: u64,
    /// Tar blocking factor (tape only)
    #[serde(default)]
    pub blocking_factor: u32,
    /// When the unit was registered
    pub registered_at: DateTime<Utc>,
    /// One entry per write session
    #[serde(default)]
    pub write_history: Vec<DateTime<Utc>>,
    /// Bytes physically written to the media, as reported by the device
    #[serde(default)]
    pub bytes_on_media: u64,
    /// Disc has been burned and accepts no further files
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    capacity_suspect: bool,
    #[serde(default)]
    verifications: Vec<VerificationResult>,
    #[serde(rename = "files", default)]
    committed_files: Vec<SourceFileRecord>,
    #[serde(skip_deserializing)]
    total_files: u64,
    #[serde(skip_deserializing)]
    data_size: u64,
    #[serde(skip_deserializing)]
    data_size_on_disk: u64,
    #[serde(skip)]
    pending_files: VecDeque<SourceFileRecord>,
    #[serde(skip)]
    pending_file_count: u64,
    #[serde(skip)]
    pending_bytes: u64,
    #[serde(skip)]
    pending_bytes_on_disk: u64,
    #[serde(skip)]
    is_new: bool,
    #[serde(skip)]
    slots: HashMap<PathKey, Slot>,
}

impl DestinationUnit {
    /// Mint a new, empty unit from a template
    pub fn new(unit_number: u32, template: &UnitTemplate) -> Self {
        Self {
            unit_number,
            kind: template.kind,
            total_space: template.total_space,
            block_size: template.block_size.max(1),
            reserved_capacity_bytes: template.reserved_capacity_bytes,
            blocking_factor: template.blocking_factor,
            registered_at: Utc::now(),
            write_history: Vec::new(),
            bytes_on_media: 0,
            finalized: false,
            capacity_suspect: false,
            verifications: Vec::new(),
            committed_files: Vec::new(),
            total_files: 0,
            data_size: 0,
            data_size_on_disk: 0,
            pending_files: VecDeque::new(),
            pending_file_count: 0,
            pending_bytes: 0,
            pending_bytes_on_disk: 0,
            is_new: true,
            slots: HashMap::new(),
        }
    }

    /// Zero-padded label, e.g. `CSD007` or `DISC0012`
    pub fn name(&self) -> String {
        format!(
            "{}{:0width$}",
            self.kind.label_prefix(),
            self.unit_number,
            width = self.kind.label_width()
        )
    }

    /// File name of this unit's record in the index directory
    pub fn index_file_name(&self) -> String {
        format!(
            "{}_{:0width$}.json",
            self.kind,
            self.unit_number,
            width = self.kind.label_width()
        )
    }

    /// Whether the unit was minted in this session and has never been persisted
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.is_new = false;
    }

    /// Number of committed files
    pub fn total_files(&self) -> u64 {
        self.total_files
    }

    /// Sum of committed file sizes
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Sum of committed file sizes, each rounded to the block size
    pub fn data_size_on_disk(&self) -> u64 {
        self.data_size_on_disk
    }

    /// Number of pending files
    pub fn pending_file_count(&self) -> u64 {
        self.pending_file_count
    }

    /// Sum of pending file sizes
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Sum of pending file sizes, each rounded to the block size
    pub fn pending_bytes_on_disk(&self) -> u64 {
        self.pending_bytes_on_disk
    }

    /// Whether any assigned file still waits to be written
    pub fn has_pending_writes(&self) -> bool {
        self.pending_file_count > 0
    }

    /// Committed files in insertion order
    pub fn committed_files(&self) -> &[SourceFileRecord] {
        &self.committed_files
    }

    pub(crate) fn committed_files_mut(&mut self) -> impl Iterator<Item = &mut SourceFileRecord> {
        self.committed_files.iter_mut()
    }

    /// Pending files in assignment order
    pub fn pending_files(&self) -> impl Iterator<Item = &SourceFileRecord> {
        self.pending_files.iter()
    }

    /// Whether the unit tracks a file with this relative path
    pub fn contains(&self, relative_path: &str) -> bool {
        self.slots.contains_key(&PathKey::new(relative_path))
    }

    /// Bytes a file of `size` occupies on this unit
    pub fn footprint(&self, size: u64) -> u64 {
        utils::round_to_next_multiple(size, self.block_size)
    }

    /// Capacity below which the unit is considered full
    pub fn capacity_limit(&self) -> u64 {
        self.total_space.saturating_sub(self.reserved_capacity_bytes)
    }

    /// Raw space not used by committed files
    pub fn free_space(&self) -> u64 {
        self.total_space.saturating_sub(self.data_size_on_disk)
    }

    /// Space still available for new assignments
    pub fn usable_free_space(&self) -> u64 {
        self.capacity_limit()
            .saturating_sub(self.data_size_on_disk)
            .saturating_sub(self.pending_bytes_on_disk)
    }

    /// Whether the unit can take no further files
    pub fn is_full(&self) -> bool {
        if self.finalized || self.capacity_suspect {
            return true;
        }

        if self.kind.is_block_aligned() {
            self.usable_free_space() <= self.block_size
        } else {
            self.data_size + self.pending_bytes >= self.capacity_limit()
        }
    }

    /// Whether a file of `size` bytes may be assigned here
    pub fn can_accept(&self, size: u64) -> bool {
        if self.is_full() {
            return false;
        }

        if self.kind.is_block_aligned() {
            self.usable_free_space() > self.footprint(size)
        } else {
            self.data_size
                .saturating_add(self.pending_bytes)
                .saturating_add(size)
                < self.capacity_limit()
        }
    }

    /// Largest file an empty unit of this shape could accept
    pub fn max_file_size(&self) -> u64 {
        let limit = self.capacity_limit();
        if self.kind.is_block_aligned() {
            if limit <= self.block_size {
                return 0;
            }
            ((limit - 1) / self.block_size) * self.block_size
        } else {
            limit.saturating_sub(1)
        }
    }

    /// Whether the device has been flagged smaller than assumed
    pub fn is_capacity_suspect(&self) -> bool {
        self.capacity_suspect
    }

    /// Flag the unit full until a successful verification is recorded
    pub fn mark_capacity_suspect(&mut self) {
        if !self.capacity_suspect {
            warn!("Unit {} marked full after a capacity mismatch", self.name());
        }
        self.capacity_suspect = true;
    }

    /// Assign a file to this unit
    ///
    /// Copied records go straight to the committed list, anything else is
    /// queued as pending.
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::AlreadyAssigned`] if the unit already tracks the path
    pub fn add_file(&mut self, mut file: SourceFileRecord) -> Result<()> {
        let key = file.key();
        if self.slots.contains_key(&key) {
            return Err(MediaspanError::AlreadyAssigned {
                path: file.relative_path,
                unit: self.unit_number,
            });
        }

        file.set_destination_unit(Some(self.unit_number));
        let size = file.size_or_zero();
        let on_disk = self.footprint(size);

        if file.is_copied() {
            self.committed_files.push(file);
            self.slots.insert(key, Slot::Committed);
            self.total_files += 1;
            self.data_size += size;
            self.data_size_on_disk += on_disk;
        } else {
            self.pending_files.push_back(file);
            self.slots.insert(key, Slot::Pending);
            self.pending_file_count += 1;
            self.pending_bytes += size;
            self.pending_bytes_on_disk += on_disk;
        }

        Ok(())
    }

    /// Unassign pending files beyond the first `keep`, newest first
    ///
    /// Returns the removed records in assignment order.
    pub fn truncate_pending(&mut self, keep: usize) -> Vec<SourceFileRecord> {
        let mut removed = Vec::new();
        while self.pending_files.len() > keep {
            let Some(mut file) = self.pending_files.pop_back() else { break };
            let size = file.size_or_zero();
            let on_disk = self.footprint(size);

            self.slots.remove(&file.key());
            self.pending_file_count -= 1;
            self.pending_bytes -= size;
            self.pending_bytes_on_disk -= on_disk;

            file.set_destination_unit(None);
            removed.push(file);
        }
        removed.reverse();
        removed
    }

    ///
    /// Returns `true` when the file moved, `false` when it was already
    /// committed (the call is then a no-op).
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::FileNotInUnit`] if the unit does not track the path
    pub fn mark_file_copied(&mut self, relative_path: &str, hash: Option<String>) -> Result<bool> {
        let key = PathKey::new(relative_path);

        match self.slots.get(&key) {
            None => Err(MediaspanError::FileNotInUnit {
                unit: self.unit_number,
                path: relative_path.to_string(),
            }),
            Some(Slot::Committed) => Ok(false),
            Some(Slot::Pending) => {
                let position = self
                    .pending_files
                    .iter()
                    .position(|f| f.key() == key)
                    .ok_or_else(|| {
                        MediaspanError::internal(format!(
                            "{} is indexed as pending on unit {} but missing from the pending list",
                            relative_path, self.unit_number
                        ))
                    })?;

                let mut file = self
                    .pending_files
                    .remove(position)
                    .ok_or_else(|| MediaspanError::internal("pending list shrank during commit"))?;

                let size = file.size_or_zero();
                let on_disk = self.footprint(size);

                self.pending_file_count -= 1;
                self.pending_bytes -= size;
                self.pending_bytes_on_disk -= on_disk;

                if hash.is_some() {
                    file.hash = hash;
                }
                file.set_copied(Utc::now());

                self.committed_files.push(file);
                self.slots.insert(key, Slot::Committed);
                self.total_files += 1;
                self.data_size += size;
                self.data_size_on_disk += on_disk;

                debug!("Committed {} to {}", relative_path, self.name());
                Ok(true)
            }
        }
    }

    /// Re-point a committed file at its renamed source path
    pub fn rename_committed_file(&mut self, relative_path: &str, renamed: &SourceFileRecord) -> Result<()> {
        let old_key = PathKey::new(relative_path);
        let new_key = renamed.key();

        if old_key != new_key && self.slots.contains_key(&new_key) {
            return Err(MediaspanError::AlreadyAssigned {
                path: renamed.relative_path.clone(),
                unit: self.unit_number,
            });
        }

        let file = self
            .committed_files
            .iter_mut()
            .find(|f| f.key() == old_key)
            .ok_or_else(|| MediaspanError::FileNotInUnit {
                unit: self.unit_number,
                path: relative_path.to_string(),
            })?;

        file.repoint(renamed);
        self.slots.remove(&old_key);
        self.slots.insert(new_key, Slot::Committed);
        Ok(())
    }

    /// Order the pending list by relative path
    pub fn sort_pending_files(&mut self) {
        self.pending_files
            .make_contiguous()
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    }

    /// Recompute every cached counter and the path lookup from the file lists
    ///
    /// With `include_pending == false` the pending counters are left alone.
    pub fn sync_stats(&mut self, include_pending: bool) {
        let block_size = self.block_size;
        let footprint = |f: &SourceFileRecord| utils::round_to_next_multiple(f.size_or_zero(), block_size);

        self.total_files = self.committed_files.len() as u64;
        self.data_size = self.committed_files.iter().map(|f| f.size_or_zero()).sum();
        self.data_size_on_disk = self.committed_files.iter().map(footprint).sum();

        if include_pending {
            self.pending_file_count = self.pending_files.len() as u64;
            self.pending_bytes = self.pending_files.iter().map(|f| f.size_or_zero()).sum();
            self.pending_bytes_on_disk = self.pending_files.iter().map(footprint).sum();
        }

        let unit_number = self.unit_number;
        self.slots = HashMap::with_capacity(self.committed_files.len() + self.pending_files.len());
        for file in self.committed_files.iter_mut() {
            file.set_destination_unit(Some(unit_number));
            self.slots.insert(file.key(), Slot::Committed);
        }
        for file in self.pending_files.iter_mut() {
            file.set_destination_unit(Some(unit_number));
            self.slots.insert(file.key(), Slot::Pending);
        }
    }

    /// Detached copy holding the committed files, and pending files if asked
    ///
    /// The live unit is not touched; the copy is what gets serialized.
    pub fn take_snapshot(&self, include_pending: bool) -> DestinationUnit {
        let mut copy = DestinationUnit {
            unit_number: self.unit_number,
            kind: self.kind,
            total_space: self.total_space,
            block_size: self.block_size,
            reserved_capacity_bytes: self.reserved_capacity_bytes,
            blocking_factor: self.blocking_factor,
            registered_at: self.registered_at,
            write_history: self.write_history.clone(),
            bytes_on_media: self.bytes_on_media,
            finalized: self.finalized,
            capacity_suspect: self.capacity_suspect,
            verifications: self.verifications.clone(),
            committed_files: self.committed_files.clone(),
            total_files: 0,
            data_size: 0,
            data_size_on_disk: 0,
            pending_files: if include_pending {
                self.pending_files.clone()
            } else {
                VecDeque::new()
            },
            pending_file_count: 0,
            pending_bytes: 0,
            pending_bytes_on_disk: 0,
            is_new: self.is_new,
            slots: HashMap::new(),
        };
        copy.sync_stats(true);
        copy
    }

    /// Record the start of a write session
    pub fn add_write_date(&mut self) {
        self.write_history.push(Utc::now());
    }

    /// Record how many bytes the device reports as written
    pub fn record_media_usage(&mut self, bytes_on_media: u64) {
        self.bytes_on_media = bytes_on_media;
    }

    /// Append a verification result
    ///
    /// A successful verification clears the capacity-suspect flag.
    pub fn record_verification(&mut self, verified_at: DateTime<Utc>, valid: bool) {
        self.verifications.push(VerificationResult { verified_at, valid });
        if valid {
            self.capacity_suspect = false;
        }
    }

    /// Verification history in recording order
    pub fn verifications(&self) -> &[VerificationResult] {
        &self.verifications
    }

    /// Validity of the chronologically latest verification (false if none)
    pub fn last_verify_success(&self) -> bool {
        self.verifications
            .iter()
            .max_by_key(|v| v.verified_at)
            .map(|v| v.valid)
            .unwrap_or(false)
    }

    /// Whole days since the latest verification, `None` if never verified
    pub fn days_since_last_verify(&self) -> Option<i64> {
        self.days_since_last_verify_at(Utc::now())
    }

    /// [`days_since_last_verify`](Self::days_since_last_verify) relative to `now`
    pub fn days_since_last_verify_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.verifications
            .iter()
            .map(|v| v.verified_at)
            .max()
            .map(|latest| (now - latest).num_days())
    }

    /// Structural sanity check for a record read from the index
    pub fn validate(&self, source: &Path) -> Result<()> {
        if self.unit_number == 0 {
            return Err(MediaspanError::corrupt(source, "unit number must be at least 1"));
        }
        if self.total_space == 0 {
            return Err(MediaspanError::corrupt(source, "total space is zero"));
        }
        if self.block_size == 0 {
            return Err(MediaspanError::corrupt(source, "block size is zero"));
        }
        if self.reserved_capacity_bytes >= self.total_space {
            return Err(MediaspanError::corrupt(source, "reserved capacity exceeds total space"));
        }

        let mut seen: HashSet<PathKey> = HashSet::with_capacity(self.committed_files.len());
        for (idx, file) in self.committed_files.iter().enumerate() {
            if file.relative_path.is_empty() {
                return Err(MediaspanError::corrupt(source, format!("file #{} has no relative path", idx)));
            }
            if !file.is_copied() {
                return Err(MediaspanError::corrupt(
                    source,
                    format!("{} is listed as committed but not copied", file.relative_path),
                ));
            }
            if file.size.is_none() {
                return Err(MediaspanError::corrupt(
                    source,
                    format!("{} has no recorded size", file.relative_path),
                ));
            }
            if !seen.insert(file.key()) {
                return Err(MediaspanError::corrupt(
                    source,
                    format!("{} is listed more than once", file.relative_path),
                ));
            }
        }

        Ok(())
    }
}

impl UnitTemplate {
    /// Whether an empty unit minted from this template could take `size` bytes
    pub fn can_hold(&self, size: u64) -> bool {
        DestinationUnit::new(0, self).can_accept(size)
    }

    /// Largest single file an empty unit minted from this template accepts
    pub fn max_file_size(&self) -> u64 {
        DestinationUnit::new(0, self).max_file_size()
    }
}
