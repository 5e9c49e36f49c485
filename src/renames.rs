//! Rename detection
//!
//! A newly discovered file is a rename candidate when an archived file has the
//! same size, extension and creation time but a different path. Each archived
//! file is matched at most once, to the first new file that fits.
//!
//! Applying a rename re-points the archived record at the new path instead of
//! archiving the bytes a second time. The record remembers the path it was
//! first archived under in `original_path`.

use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt, PathKey};
use crate::error::{MediaspanError, Result};
use crate::session::ScanSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// An archived file that probably moved to a newly discovered path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameCandidate {
    /// Unit holding the archived copy
    pub unit: u32,
    /// Relative path the archived copy is recorded under
    pub archived_path: String,
    /// Full source path recorded for the archived copy
    pub archived_full_path: String,
    /// Relative path of the newly discovered file
    pub new_path: String,
    /// Full source path of the newly discovered file
    pub new_full_path: String,
    /// Size shared by both files
    pub size: u64,
    /// Creation time shared by both files
    pub creation_time_utc: DateTime<Utc>,
}

type Fingerprint = (u64, String, DateTime<Utc>);

/// Match sized staged files against archived files
///
/// Staged files must have been sized; unsized records never match.
#[instrument(skip(session))]
pub fn find_rename_candidates(session: &ScanSession) -> Vec<RenameCandidate> {
    let mut archived: HashMap<Fingerprint, Vec<(u32, usize)>> = HashMap::new();

    for unit in session.units() {
        for (idx, file) in unit.committed_files().iter().enumerate() {
            if let (Some(size), Some(created)) = (file.size, file.creation_time_utc) {
                archived
                    .entry((size, file.extension.clone(), created))
                    .or_default()
                    .push((unit.unit_number, idx));
            }
        }
    }

    let mut claimed: HashSet<(u32, usize)> = HashSet::new();
    let mut candidates = Vec::new();

    for new_file in session.new_files() {
        let (Some(size), Some(created)) = (new_file.size, new_file.creation_time_utc) else {
            continue;
        };

        let Some(matches) = archived.get(&(size, new_file.extension.clone(), created)) else {
            continue;
        };

        let new_full = new_file.full_path.to_lowercase();
        for &(unit_number, idx) in matches {
            if claimed.contains(&(unit_number, idx)) {
                continue;
            }

            let Ok(unit) = session.unit(unit_number) else {
                continue;
            };
            let old = &unit.committed_files()[idx];
            if old.full_path.to_lowercase() == new_full {
                continue;
            }

            claimed.insert((unit_number, idx));
            candidates.push(RenameCandidate {
                unit: unit_number,
                archived_path: old.relative_path.clone(),
                archived_full_path: old.full_path.clone(),
                new_path: new_file.relative_path.clone(),
                new_full_path: new_file.full_path.clone(),
                size,
                creation_time_utc: created,
            });
            break;
        }
    }

    debug!("Found {} rename candidates", candidates.len());
    candidates
}

/// Re-point an archived record at its new path and drop the staged duplicate
///
/// # Errors
///
/// - [`MediaspanError::UnitNotFound`] if the candidate's unit is gone
/// - [`MediaspanError::FileNotInUnit`] if the archived path is no longer on the unit
/// - [`MediaspanError::AlreadyAssigned`] if the unit already tracks the new path
pub fn apply_rename(session: &mut ScanSession, candidate: &RenameCandidate) -> Result<()> {
    let new_key = PathKey::new(&candidate.new_path);
    let old_key = PathKey::new(&candidate.archived_path);

    let staged = session
        .new_files()
        .iter()
        .find(|f| f.key() == new_key)
        .cloned()
        .ok_or_else(|| MediaspanError::internal(format!("{} is not staged as a new file", candidate.new_path)))?;

    let unit = session.unit_mut(candidate.unit)?;
    let was_deleted = unit
        .committed_files()
        .iter()
        .find(|f| f.key() == old_key)
        .map(|f| f.file_deleted == Some(true))
        .unwrap_or(false);
    unit.rename_committed_file(&candidate.archived_path, &staged)?;

    session.discard_new_files(std::slice::from_ref(&new_key));
    session.rekey_archived(&old_key, new_key, candidate.unit);

    let stats = &mut session.stats;
    stats.renamed_file_count += 1;
    stats.new_file_count = stats.new_file_count.saturating_sub(1);
    if staged.is_sized() {
        stats.total_size_pending = stats.total_size_pending.saturating_sub(staged.size_or_zero());
    }
    if was_deleted {
        stats.deleted_file_count = stats.deleted_file_count.saturating_sub(1);
    }

    info!(
        "Renamed {} -> {} on unit {}",
        candidate.archived_path, candidate.new_path, candidate.unit
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_file::SourceFileRecord;
    use crate::types::{MediaKind, UnitTemplate};
    use crate::unit::DestinationUnit;
    use chrono::TimeZone;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(path: &str, size: u64, created: DateTime<Utc>) -> SourceFileRecord {
        let mut record = SourceFileRecord::from_clean_path(path);
        record.size = Some(size);
        record.creation_time_utc = Some(created);
        record
    }

    fn session_with_archived(path: &str) -> ScanSession {
        let template = UnitTemplate {
            kind: MediaKind::Csd,
            total_space: 1_000_000,
            block_size: 1,
            reserved_capacity_bytes: 0,
            blocking_factor: 0,
        };
        let mut unit = DestinationUnit::new(1, &template);
        let mut archived = record(path, 42, created());
        archived.set_copied(Utc::now());
        unit.add_file(archived).unwrap();
        ScanSession::new(vec![unit])
    }

    #[test]
    fn test_candidate_requires_matching_fingerprint() {
        let mut session = session_with_archived("/photos/a.jpg");
        session.register_new_file(record("/photos/2020/a.jpg", 42, created()));
        session.register_new_file(record("/photos/other.jpg", 43, created()));
        session.register_new_file(record("/photos/a.png", 42, created()));

        let candidates = find_rename_candidates(&session);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].archived_path, "/photos/a.jpg");
        assert_eq!(candidates[0].new_path, "/photos/2020/a.jpg");
    }

    #[test]
    fn test_archived_file_matched_once() {
        let mut session = session_with_archived("/photos/a.jpg");
        session.register_new_file(record("/x/a.jpg", 42, created()));
        session.register_new_file(record("/y/a.jpg", 42, created()));

        assert_eq!(find_rename_candidates(&session).len(), 1);
    }

    #[test]
    fn test_apply_rename() {
        let mut session = session_with_archived("/photos/a.jpg");
        session.register_new_file(record("/photos/2020/a.jpg", 42, created()));
        session.stats.new_file_count = 1;

        let candidate = find_rename_candidates(&session).remove(0);
        apply_rename(&mut session, &candidate).unwrap();

        assert!(session.new_files().is_empty());
        assert_eq!(session.stats.renamed_file_count, 1);
        assert_eq!(session.stats.new_file_count, 0);
        assert_eq!(
            session.lookup("/photos/2020/a.jpg"),
            Some(crate::session::IndexEntry::Archived { unit: 1 })
        );
        assert_eq!(session.lookup("/photos/a.jpg"), None);

        let file = &session.units()[0].committed_files()[0];
        assert_eq!(file.relative_path, "/photos/2020/a.jpg");
        assert_eq!(file.original_path.as_deref(), Some("/photos/a.jpg"));
    }
}
