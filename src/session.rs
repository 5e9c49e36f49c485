//! Scan session state
//!
//! A [`ScanSession`] is the staging area for one scan → size → allocate run.
//! It owns the live unit list, a case-insensitive lookup from relative path to
//! where that path currently lives, the staging list of newly discovered
//! records in discovery order, and the run's [`ScanStats`].
//!
//! Nothing here is persisted directly. Decisions reach disk through the units,
//! and the session is dropped when the run completes.

use crate::collections::{HashMap, HashMapExt, HashSet, PathKey};
use crate::error::{MediaspanError, Result};
use crate::source_file::SourceFileRecord;
use crate::types::ScanStats;
use crate::unit::DestinationUnit;
use tracing::debug;

/// Where a relative path currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    /// Committed to a unit in an earlier session
    Archived {
        /// Owning unit
        unit: u32,
    },
    /// Assigned to a unit, payload not yet written
    Pending {
        /// Owning unit
        unit: u32,
    },
    /// Discovered in this session, position in the staging list
    New(usize),
}

impl IndexEntry {
    /// Owning unit for assigned entries
    pub fn unit(&self) -> Option<u32> {
        match self {
            IndexEntry::Archived { unit } | IndexEntry::Pending { unit } => Some(*unit),
            IndexEntry::New(_) => None,
        }
    }
}

/// Result of comparing pending bytes against room on existing units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceCheck {
    /// Sized bytes waiting for allocation
    pub pending_bytes: u64,
    /// Usable free space across existing, non-full units
    pub usable_free_space: u64,
    /// Rough count of additional units needed, ignoring block rounding
    pub additional_units: u64,
}

impl FreeSpaceCheck {
    /// Whether existing units look large enough to take every pending byte
    pub fn is_sufficient(&self) -> bool {
        self.pending_bytes <= self.usable_free_space
    }
}

/// Staging area for one archive run
#[derive(Debug)]
pub struct ScanSession {
    units: Vec<DestinationUnit>,
    lookup: HashMap<PathKey, IndexEntry>,
    new_files: Vec<SourceFileRecord>,
    /// Run counters
    pub stats: ScanStats,
}

impl ScanSession {
    /// Start a session over the units loaded from the index
    ///
    /// Units are kept in ascending unit-number order, which is the order the
    /// allocator searches them in.
    pub fn new(mut units: Vec<DestinationUnit>) -> Self {
        units.sort_by_key(|u| u.unit_number);

        let capacity = units
            .iter()
            .map(|u| (u.total_files() + u.pending_file_count()) as usize)
            .sum();
        let mut lookup = HashMap::with_capacity(capacity);

        for unit in &units {
            for file in unit.committed_files() {
                lookup.insert(file.key(), IndexEntry::Archived { unit: unit.unit_number });
            }
            for file in unit.pending_files() {
                lookup.insert(file.key(), IndexEntry::Pending { unit: unit.unit_number });
            }
        }

        debug!("Session seeded with {} indexed paths over {} units", lookup.len(), units.len());

        Self {
            units,
            lookup,
            new_files: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    /// Live units in ascending unit-number order
    pub fn units(&self) -> &[DestinationUnit] {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut [DestinationUnit] {
        &mut self.units
    }

    /// Consume the session, returning the live units
    pub fn into_units(self) -> Vec<DestinationUnit> {
        self.units
    }

    /// Look up a unit by number
    pub fn unit(&self, unit_number: u32) -> Result<&DestinationUnit> {
        self.units
            .iter()
            .find(|u| u.unit_number == unit_number)
            .ok_or(MediaspanError::UnitNotFound(unit_number))
    }

    /// Look up a unit by number for mutation
    pub fn unit_mut(&mut self, unit_number: u32) -> Result<&mut DestinationUnit> {
        self.units
            .iter_mut()
            .find(|u| u.unit_number == unit_number)
            .ok_or(MediaspanError::UnitNotFound(unit_number))
    }

    /// Number the allocator gives the next minted unit
    pub fn next_unit_number(&self) -> u32 {
        self.units.iter().map(|u| u.unit_number).max().map_or(1, |n| n + 1)
    }

    pub(crate) fn push_unit(&mut self, unit: DestinationUnit) {
        self.units.push(unit);
    }

    /// Drop units past `len`, forgetting the paths they held
    pub(crate) fn truncate_units(&mut self, len: usize) {
        for unit in self.units.drain(len.min(self.units.len())..) {
            for file in unit.committed_files().iter().chain(unit.pending_files()) {
                self.lookup.remove(&file.key());
            }
        }
    }

    /// Where a relative path currently lives, if anywhere
    pub fn lookup(&self, relative_path: &str) -> Option<IndexEntry> {
        self.lookup.get(&PathKey::new(relative_path)).copied()
    }

    pub(crate) fn lookup_key(&self, key: &PathKey) -> Option<IndexEntry> {
        self.lookup.get(key).copied()
    }

    /// Number of indexed paths (archived, pending and new)
    pub fn indexed_path_count(&self) -> usize {
        self.lookup.len()
    }

    /// Stage a newly discovered record
    ///
    /// Returns `false` without staging when the path is already indexed.
    pub fn register_new_file(&mut self, record: SourceFileRecord) -> bool {
        let key = record.key();
        if self.lookup.contains_key(&key) {
            return false;
        }
        self.lookup.insert(key, IndexEntry::New(self.new_files.len()));
        self.new_files.push(record);
        true
    }

    /// Records staged in this session, in discovery order
    pub fn new_files(&self) -> &[SourceFileRecord] {
        &self.new_files
    }

    pub(crate) fn new_files_mut(&mut self) -> &mut [SourceFileRecord] {
        &mut self.new_files
    }

    /// Staged bytes that have been sized but not yet assigned
    pub fn staged_bytes(&self) -> u64 {
        self.new_files.iter().map(|f| f.size_or_zero()).sum()
    }

    /// Remove staged records, forgetting their paths entirely
    pub(crate) fn discard_new_files(&mut self, keys: &[PathKey]) -> Vec<SourceFileRecord> {
        if keys.is_empty() {
            return Vec::new();
        }

        let keys: HashSet<&PathKey> = keys.iter().collect();
        let mut removed = Vec::with_capacity(keys.len());
        let staged = std::mem::take(&mut self.new_files);
        let mut kept = Vec::with_capacity(staged.len());

        for record in staged {
            let key = record.key();
            if keys.contains(&key) {
                self.lookup.remove(&key);
                removed.push(record);
            } else {
                kept.push(record);
            }
        }

        self.restage(kept);
        removed
    }

    /// Take the staging list for allocation
    pub(crate) fn take_new_files(&mut self) -> Vec<SourceFileRecord> {
        std::mem::take(&mut self.new_files)
    }

    /// Put records back into staging, re-pointing their lookup entries
    pub(crate) fn restage(&mut self, records: Vec<SourceFileRecord>) {
        self.new_files = records;
        for (idx, record) in self.new_files.iter().enumerate() {
            self.lookup.insert(record.key(), IndexEntry::New(idx));
        }
    }

    /// Record that a staged path now lives on a unit as pending
    pub(crate) fn mark_assigned(&mut self, key: PathKey, unit: u32) {
        self.lookup.insert(key, IndexEntry::Pending { unit });
    }

    /// Record that a path moved from one key to another on an archived unit
    pub(crate) fn rekey_archived(&mut self, old: &PathKey, new: PathKey, unit: u32) {
        self.lookup.remove(old);
        self.lookup.insert(new, IndexEntry::Archived { unit });
    }

    /// Compare sized pending bytes against room left on existing units
    pub fn verify_free_space(&self) -> FreeSpaceCheck {
        let pending_bytes = self.staged_bytes();
        let usable_free_space = self
            .units
            .iter()
            .filter(|u| !u.is_full())
            .map(|u| u.usable_free_space())
            .sum::<u64>();

        let shortfall = pending_bytes.saturating_sub(usable_free_space);
        let per_unit = self
            .units
            .first()
            .map(|u| u.capacity_limit())
            .unwrap_or(0);
        let additional_units = if shortfall == 0 || per_unit == 0 {
            0
        } else {
            shortfall.div_ceil(per_unit)
        };

        FreeSpaceCheck {
            pending_bytes,
            usable_free_space,
            additional_units,
        }
    }
}
