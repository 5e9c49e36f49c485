//! Tape footprint estimation
//!
//! Tape units are written as a single tar stream, so their on-media footprint
//! includes per-entry framing that block rounding alone does not capture:
//!
//! ```text
//! per file:       512-byte header + size rounded to 512 (nothing for empty files)
//! per directory:  512-byte header
//! end of archive: 1024 bytes
//! total:          rounded up to blocking_factor * 512
//! ```
//!
//! Every ancestor directory of an archived file is counted once, since tar
//! emits an entry for each level of the tree.

use crate::collections::{HashSet, HashSetExt};
use crate::source_file::SourceFileRecord;
use crate::types::TAR_RECORD_SIZE;
use crate::unit::DestinationUnit;
use crate::utils::round_to_next_multiple;

const END_OF_ARCHIVE_BYTES: u64 = 2 * TAR_RECORD_SIZE;

/// Breakdown of an estimated tar stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapeArchiveEstimate {
    /// Number of file entries
    pub file_count: u64,
    /// Number of distinct directory entries
    pub directory_count: u64,
    /// Sum of raw file sizes
    pub data_bytes: u64,
    /// Estimated stream length including framing and final block padding
    pub total_archive_bytes: u64,
}

impl TapeArchiveEstimate {
    /// Estimate the tar stream for a set of files
    pub fn from_files<'a, I>(files: I, blocking_factor: u32) -> Self
    where
        I: IntoIterator<Item = &'a SourceFileRecord>,
    {
        let mut directories: HashSet<String> = HashSet::new();
        let mut estimate = TapeArchiveEstimate::default();
        let mut size = 0u64;

        for file in files {
            let file_size = file.size_or_zero();
            estimate.file_count += 1;
            estimate.data_bytes += file_size;

            size += TAR_RECORD_SIZE;
            if file_size > 0 {
                size += round_to_next_multiple(file_size, TAR_RECORD_SIZE);
            }

            let mut dir = file.relative_directory.as_str();
            while !dir.is_empty() && dir != "/" {
                if !directories.insert(dir.to_lowercase()) {
                    break;
                }
                dir = match dir.rfind('/') {
                    Some(idx) => &dir[..idx],
                    None => "",
                };
            }
        }

        estimate.directory_count = directories.len() as u64;
        size += TAR_RECORD_SIZE * estimate.directory_count;
        size += END_OF_ARCHIVE_BYTES;

        let block = TAR_RECORD_SIZE * u64::from(blocking_factor.max(1));
        estimate.total_archive_bytes = round_to_next_multiple(size, block);
        estimate
    }
}

impl DestinationUnit {
    /// Estimated tar stream length for this unit
    ///
    /// With `include_pending` the estimate covers everything assigned to the
    /// unit, otherwise only what has been written.
    pub fn total_archive_bytes(&self, include_pending: bool) -> u64 {
        self.tape_estimate(include_pending).total_archive_bytes
    }

    /// Full tar stream estimate for this unit
    pub fn tape_estimate(&self, include_pending: bool) -> TapeArchiveEstimate {
        let committed = self.committed_files().iter();
        if include_pending {
            TapeArchiveEstimate::from_files(committed.chain(self.pending_files()), self.blocking_factor)
        } else {
            TapeArchiveEstimate::from_files(committed, self.blocking_factor)
        }
    }

    /// Estimated archive bytes over bytes the device reports on media
    ///
    /// `0.0` until media usage has been recorded.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_on_media == 0 {
            return 0.0;
        }
        self.total_archive_bytes(false) as f64 / self.bytes_on_media as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaKind, UnitTemplate};
    use chrono::Utc;

    fn record(path: &str, size: u64) -> SourceFileRecord {
        let mut record = SourceFileRecord::from_clean_path(path);
        record.size = Some(size);
        record
    }

    #[test]
    fn test_empty_archive_is_one_block() {
        let estimate = TapeArchiveEstimate::from_files(std::iter::empty(), 20);
        assert_eq!(estimate.total_archive_bytes, 20 * 512);
        assert_eq!(estimate.directory_count, 0);
    }

    #[test]
    fn test_estimate_counts_headers_and_directories() {
        let files = vec![record("/a/b/one.txt", 1), record("/a/b/two.txt", 0), record("/a/three.txt", 513)];
        let estimate = TapeArchiveEstimate::from_files(&files, 1);

        // /a and /a/b
        assert_eq!(estimate.directory_count, 2);
        assert_eq!(estimate.file_count, 3);
        assert_eq!(estimate.data_bytes, 514);

        let expected = (512 + 512) + 512 + (512 + 1024) + 2 * 512 + 1024;
        assert_eq!(estimate.total_archive_bytes, expected);
    }

    #[test]
    fn test_estimate_rounds_to_blocking_factor() {
        let files = vec![record("/x.bin", 100)];
        let estimate = TapeArchiveEstimate::from_files(&files, 512);
        assert_eq!(estimate.total_archive_bytes, 512 * 512);
    }

    #[test]
    fn test_compression_ratio() {
        let template = UnitTemplate {
            kind: MediaKind::Tape,
            total_space: 1_000_000_000,
            block_size: 512,
            reserved_capacity_bytes: 0,
            blocking_factor: 1,
        };
        let mut unit = DestinationUnit::new(1, &template);
        let mut file = record("/x.bin", 2048);
        file.set_copied(Utc::now());
        unit.add_file(file).unwrap();

        assert_eq!(unit.compression_ratio(), 0.0);

        let archive = unit.total_archive_bytes(false);
        unit.record_media_usage(archive / 2);
        assert!((unit.compression_ratio() - 2.0).abs() < 1e-9);
    }
}
