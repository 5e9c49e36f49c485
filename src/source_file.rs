//! Per-file metadata records
//!
//! A [`SourceFileRecord`] is created the first time a scan sees a relative
//! path that is not in the index. Its size and attributes are read once by the
//! sizing stage, after which the allocator hands it to exactly one
//! [`DestinationUnit`](crate::unit::DestinationUnit). The record's `copied`
//! flag can only be flipped by that unit's
//! [`mark_file_copied`](crate::unit::DestinationUnit::mark_file_copied), which
//! keeps the unit's pending and committed lists consistent with it.

use crate::collections::PathKey;
use crate::error::Result;
use crate::utils::{self, FileAttributes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::trace;

/// Metadata for one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    /// Canonical relative path, unique within an index (case-insensitive)
    pub relative_path: String,
    /// File name including extension
    pub name: String,
    /// Lowercase extension without the dot, empty if none
    pub extension: String,
    /// Absolute source path used to re-read the file
    pub full_path: String,
    /// Relative path of the containing directory
    pub relative_directory: String,
    /// Size in bytes, `None` until sized
    pub size: Option<u64>,
    /// Last access time at sizing
    pub last_access_time_utc: Option<DateTime<Utc>>,
    /// Last write time at sizing
    pub last_write_time_utc: Option<DateTime<Utc>>,
    /// Creation time at sizing
    pub creation_time_utc: Option<DateTime<Utc>>,
    /// Platform attribute bits at sizing
    #[serde(default)]
    pub attributes: u32,
    /// Whether the payload has been committed to its unit
    #[serde(default)]
    copied: bool,
    /// SHA-256 digest of the payload, set when copied
    #[serde(default)]
    pub hash: Option<String>,
    /// When the payload was committed
    #[serde(default)]
    pub archive_time_utc: Option<DateTime<Utc>>,
    /// Set when a later scan no longer finds the source file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_deleted: Option<bool>,
    /// Relative path before a rename was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    /// Owning unit number (lookup only)
    #[serde(skip)]
    destination_unit: Option<u32>,
}

impl SourceFileRecord {
    /// Create an unsized record for a file found on disk
    pub fn from_path(full_path: &Path) -> Self {
        Self::from_clean_path(&utils::clean_os_path(full_path))
    }

    /// Create an unsized record from an already cleaned absolute path
    pub fn from_clean_path(clean_full_path: &str) -> Self {
        let relative_path = utils::relative_path(clean_full_path);
        let name = utils::file_name(clean_full_path).to_string();

        Self {
            extension: utils::extension(&name),
            relative_directory: utils::relative_directory(&relative_path),
            relative_path,
            name,
            full_path: clean_full_path.to_string(),
            size: None,
            last_access_time_utc: None,
            last_write_time_utc: None,
            creation_time_utc: None,
            attributes: 0,
            copied: false,
            hash: None,
            archive_time_utc: None,
            file_deleted: None,
            original_path: None,
            destination_unit: None,
        }
    }

    /// Case-insensitive lookup key
    pub fn key(&self) -> PathKey {
        PathKey::new(&self.relative_path)
    }

    /// Whether the payload has been committed
    pub fn is_copied(&self) -> bool {
        self.copied
    }

    /// Whether size and attributes have been read
    pub fn is_sized(&self) -> bool {
        self.size.is_some()
    }

    /// Size in bytes, zero while unsized
    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Unit this record is assigned to
    pub fn destination_unit(&self) -> Option<u32> {
        self.destination_unit
    }

    pub(crate) fn set_destination_unit(&mut self, unit_number: Option<u32>) {
        self.destination_unit = unit_number;
    }

    pub(crate) fn set_copied(&mut self, archive_time: DateTime<Utc>) {
        self.copied = true;
        if self.archive_time_utc.is_none() {
            self.archive_time_utc = Some(archive_time);
        }
    }

    /// Read size, timestamps and attributes from disk once
    ///
    /// Returns the size that was read, or `None` when the record was already
    /// sized (the call is then a no-op).
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::SourceNotFound`](crate::MediaspanError::SourceNotFound) if
    ///   the file vanished since it was enumerated
    pub fn read_size_and_attributes(&mut self) -> Result<Option<u64>> {
        if self.is_sized() {
            return Ok(None);
        }

        let attrs = utils::read_attributes(Path::new(&self.full_path))?;
        let size = attrs.size;
        self.apply_attributes(attrs);

        trace!("Sized {} ({} bytes)", self.relative_path, size);
        Ok(Some(size))
    }

    /// Populate size and attributes from an already performed stat
    pub fn apply_attributes(&mut self, attrs: FileAttributes) {
        self.size = Some(attrs.size);
        self.last_access_time_utc = Some(attrs.accessed);
        self.last_write_time_utc = Some(attrs.modified);
        self.creation_time_utc = Some(attrs.created);
        self.attributes = attrs.attributes;
    }

    /// Point this archived record at the file's new location
    ///
    /// The first rename remembers the original relative path; renaming back
    /// to that path forgets it again.
    pub fn repoint(&mut self, renamed: &SourceFileRecord) {
        if self.original_path.is_none() {
            self.original_path = Some(self.relative_path.clone());
        }

        self.name = renamed.name.clone();
        self.extension = renamed.extension.clone();
        self.full_path = renamed.full_path.clone();
        self.relative_directory = renamed.relative_directory.clone();
        self.relative_path = renamed.relative_path.clone();
        self.file_deleted = None;

        if self.original_path.as_deref() == Some(self.relative_path.as_str()) {
            self.original_path = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_from_clean_path_fields() {
        let record = SourceFileRecord::from_clean_path("D:/photos/2021/IMG_0001.JPG");
        assert_eq!(record.relative_path, "/photos/2021/IMG_0001.JPG");
        assert_eq!(record.relative_directory, "/photos/2021");
        assert_eq!(record.name, "IMG_0001.JPG");
        assert_eq!(record.extension, "jpg");
        assert!(!record.is_sized());
        assert!(!record.is_copied());
        assert_eq!(record.key(), PathKey::new("/PHOTOS/2021/img_0001.jpg"));
    }

    #[test]
    fn test_read_size_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.bin");
        fs::write(&path, vec![0u8; 700]).unwrap();

        let mut record = SourceFileRecord::from_path(&path);
        assert_eq!(record.read_size_and_attributes().unwrap(), Some(700));

        // A later change on disk is not picked up; the first read wins.
        fs::write(&path, vec![0u8; 10]).unwrap();
        assert_eq!(record.read_size_and_attributes().unwrap(), None);
        assert_eq!(record.size, Some(700));
        assert!(record.last_write_time_utc.is_some());
    }

    #[test]
    fn test_read_size_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut record = SourceFileRecord::from_path(&temp_dir.path().join("gone.txt"));
        assert!(record.read_size_and_attributes().is_err());
        assert!(!record.is_sized());
    }

    #[test]
    fn test_repoint_tracks_original_path() {
        let mut archived = SourceFileRecord::from_clean_path("/data/old/a.txt");
        let renamed = SourceFileRecord::from_clean_path("/data/new/a.txt");

        archived.repoint(&renamed);
        assert_eq!(archived.relative_path, "/data/new/a.txt");
        assert_eq!(archived.original_path.as_deref(), Some("/data/old/a.txt"));

        let back = SourceFileRecord::from_clean_path("/data/old/a.txt");
        archived.repoint(&back);
        assert_eq!(archived.original_path, None);
    }

    #[test]
    fn test_serde_skips_destination_unit() {
        let mut record = SourceFileRecord::from_clean_path("/data/a.txt");
        record.set_destination_unit(Some(3));
        let json = serde_json::to_string(&record).unwrap();
        let back: SourceFileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.destination_unit(), None);
        assert_eq!(back.relative_path, record.relative_path);
    }
}
