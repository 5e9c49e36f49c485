//! Archive set summary
//!
//! Read-only aggregation over a unit list: overall totals, one row per unit
//! and a histogram of file extensions across every assigned file. An empty
//! unit list produces zero totals, and a unit with zero capacity reports 0%
//! used rather than dividing by zero.

use crate::collections::{HashMap, HashMapExt};
use crate::types::MediaKind;
use crate::unit::DestinationUnit;
use crate::utils::format_bytes;
use serde::Serialize;
use std::fmt;

/// Histogram label for files without an extension
pub const NO_EXTENSION: &str = "<none>";

/// One row of the per-unit table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSummary {
    /// Unit number
    pub unit_number: u32,
    /// Unit label
    pub name: String,
    /// Media kind
    pub kind: MediaKind,
    /// Raw capacity
    pub capacity: u64,
    /// Committed file count
    pub file_count: u64,
    /// Pending file count
    pub pending_file_count: u64,
    /// Committed bytes
    pub data_size: u64,
    /// Committed plus pending bytes, block rounded
    pub used_on_disk: u64,
    /// Space still available for assignment
    pub usable_free_space: u64,
    /// Used percentage of raw capacity (0 for zero-capacity units)
    pub used_percent: f64,
    /// Whether the unit accepts no further files
    pub full: bool,
    /// Latest verification outcome
    pub last_verify_success: bool,
    /// Days since the latest verification
    pub days_since_last_verify: Option<i64>,
    /// Estimated tar stream length (tape only)
    pub archive_bytes: Option<u64>,
    /// Archive bytes over bytes on media (tape only, 0 until recorded)
    pub compression_ratio: Option<f64>,
}

/// One histogram bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionCount {
    /// Lowercase extension, or [`NO_EXTENSION`]
    pub extension: String,
    /// Number of files
    pub count: u64,
}

/// Aggregate statistics over an archive set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    /// Number of units
    pub total_units: u64,
    /// Committed files across all units
    pub total_files: u64,
    /// Pending files across all units
    pub pending_files: u64,
    /// Raw capacity across all units
    pub total_capacity: u64,
    /// Committed logical bytes
    pub total_data_size: u64,
    /// Committed bytes, block rounded
    pub total_data_size_on_disk: u64,
    /// Pending logical bytes
    pub total_pending_bytes: u64,
    /// Files whose source was found missing by a scan
    pub deleted_files: u64,
    /// Per-unit rows in unit-number order
    pub units: Vec<UnitSummary>,
    /// Extension histogram, by descending count then extension
    pub extensions: Vec<ExtensionCount>,
}

fn percent(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        used as f64 / capacity as f64 * 100.0
    }
}

impl ArchiveSummary {
    /// Aggregate over a unit list
    pub fn from_units(units: &[DestinationUnit]) -> Self {
        let mut rows: Vec<UnitSummary> = units
            .iter()
            .map(|unit| {
                let used_on_disk = unit.data_size_on_disk() + unit.pending_bytes_on_disk();
                let is_tape = unit.kind == MediaKind::Tape;
                UnitSummary {
                    unit_number: unit.unit_number,
                    name: unit.name(),
                    kind: unit.kind,
                    capacity: unit.total_space,
                    file_count: unit.total_files(),
                    pending_file_count: unit.pending_file_count(),
                    data_size: unit.data_size(),
                    used_on_disk,
                    usable_free_space: unit.usable_free_space(),
                    used_percent: percent(used_on_disk, unit.total_space),
                    full: unit.is_full(),
                    last_verify_success: unit.last_verify_success(),
                    days_since_last_verify: unit.days_since_last_verify(),
                    archive_bytes: is_tape.then(|| unit.total_archive_bytes(true)),
                    compression_ratio: is_tape.then(|| unit.compression_ratio()),
                }
            })
            .collect();
        rows.sort_by_key(|r| r.unit_number);

        let mut histogram: HashMap<String, u64> = HashMap::new();
        for unit in units {
            for file in unit.committed_files().iter().chain(unit.pending_files()) {
                let label = if file.extension.is_empty() {
                    NO_EXTENSION.to_string()
                } else {
                    file.extension.clone()
                };
                *histogram.entry(label).or_insert(0) += 1;
            }
        }

        let mut extensions: Vec<ExtensionCount> = histogram
            .into_iter()
            .map(|(extension, count)| ExtensionCount { extension, count })
            .collect();
        extensions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.extension.cmp(&b.extension)));

        Self {
            total_units: units.len() as u64,
            total_files: units.iter().map(|u| u.total_files()).sum(),
            pending_files: units.iter().map(|u| u.pending_file_count()).sum(),
            total_capacity: units.iter().map(|u| u.total_space).sum(),
            total_data_size: units.iter().map(|u| u.data_size()).sum(),
            total_data_size_on_disk: units.iter().map(|u| u.data_size_on_disk()).sum(),
            total_pending_bytes: units.iter().map(|u| u.pending_bytes()).sum(),
            deleted_files: units
                .iter()
                .flat_map(|u| u.committed_files())
                .filter(|f| f.file_deleted == Some(true))
                .count() as u64,
            units: rows,
            extensions,
        }
    }

    /// Render as plain text lines
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();

        lines.push("Overall Archive Statistics".to_string());
        lines.push("=".repeat(62));
        lines.push(format!("        Total Units: {}", self.total_units));
        lines.push(format!("        Total Files: {}", self.total_files));
        lines.push(format!("      Pending Files: {}", self.pending_files));
        lines.push(format!(
            "     Total Capacity: {} ({})",
            self.total_capacity,
            format_bytes(self.total_capacity)
        ));
        lines.push(format!(
            "    Total Data Size: {} ({})",
            self.total_data_size,
            format_bytes(self.total_data_size)
        ));
        lines.push(format!(
            "  Total Size on Disk: {} ({})",
            self.total_data_size_on_disk,
            format_bytes(self.total_data_size_on_disk)
        ));
        if self.deleted_files > 0 {
            lines.push(format!("      Deleted Files: {}", self.deleted_files));
        }

        if !self.units.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "{:<10} {:>12} {:>12} {:>8} {:>10} {:>8}",
                "Unit", "Free Space", "Capacity", "Used %", "Files", "Pending"
            ));
            lines.push("-".repeat(65));
            for row in &self.units {
                lines.push(format!(
                    "{:<10} {:>12} {:>12} {:>7.1}% {:>10} {:>8}",
                    row.name,
                    format_bytes(row.usable_free_space),
                    format_bytes(row.capacity),
                    row.used_percent,
                    row.file_count,
                    row.pending_file_count
                ));
                if let (Some(archive), Some(ratio)) = (row.archive_bytes, row.compression_ratio) {
                    lines.push(format!(
                        "{:<10} archive {} compression {:.2}:1",
                        "",
                        format_bytes(archive),
                        ratio
                    ));
                }
            }
        }

        if !self.extensions.is_empty() {
            lines.push(String::new());
            lines.push("File Type Statistics".to_string());
            lines.push("=".repeat(62));

            let label_width = self
                .extensions
                .iter()
                .map(|e| e.extension.len())
                .max()
                .unwrap_or(0)
                .max(6)
                + 5;
            let count_width = self
                .extensions
                .iter()
                .map(|e| e.count.to_string().len())
                .max()
                .unwrap_or(0)
                + 2;

            for entry in &self.extensions {
                lines.push(format!(
                    "{:>lw$}: {:>cw$}",
                    entry.extension,
                    entry.count,
                    lw = label_width,
                    cw = count_width
                ));
            }
        }

        lines
    }
}

impl fmt::Display for ArchiveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.render() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
