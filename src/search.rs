//! Archive search
//!
//! Finds committed files whose relative path contains a term, ignoring case,
//! and reports the unit each one lives on so the right piece of media can be
//! pulled from the shelf.

use crate::collections::PathKey;
use crate::unit::DestinationUnit;
use serde::Serialize;

/// One committed file matching a search term
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Owning unit number
    pub unit_number: u32,
    /// Owning unit label, e.g. `CSD003`
    pub unit_name: String,
    /// Relative path as recorded in the index
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the source file has since been deleted
    pub deleted: bool,
}

/// Committed files on `units` whose relative path contains `term`
///
/// Matching is case-insensitive and ignores surrounding whitespace in the
/// term. Hits come back in unit-number order, then in the order files were
/// committed. A blank term matches nothing.
pub fn search_units(units: &[DestinationUnit], term: &str) -> Vec<SearchHit> {
    let needle = PathKey::new(term.trim());
    if needle.as_str().is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<&DestinationUnit> = units.iter().collect();
    ordered.sort_by_key(|u| u.unit_number);

    ordered
        .into_iter()
        .flat_map(|unit| {
            let name = unit.name();
            unit.committed_files()
                .iter()
                .filter(|f| f.key().as_str().contains(needle.as_str()))
                .map(move |f| SearchHit {
                    unit_number: unit.unit_number,
                    unit_name: name.clone(),
                    relative_path: f.relative_path.clone(),
                    size: f.size_or_zero(),
                    deleted: f.file_deleted.unwrap_or(false),
                })
        })
        .collect()
}
