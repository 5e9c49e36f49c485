//! Utility functions for mediaspan
//!
//! This module provides the small pure helpers the pipeline stages share,
//! plus the two filesystem collaborators the core consumes.
//!
//! ## Categories of Utilities
//!
//! ### Path Canonicalization
//! - Forward-slash, no-trailing-slash canonical form ([`clean_path`])
//! - Drive/UNC-free relative form used as the index key ([`relative_path`])
//! - File name, lowercase extension and relative directory extraction
//!
//! ### Size Arithmetic
//! - Block rounding ([`round_to_next_multiple`])
//! - Human-readable byte formatting ([`format_bytes`])
//!
//! ### Filesystem Collaborators
//! - Attribute reading: size, three timestamps and platform attribute bits
//!   ([`read_attributes`])
//! - SHA-256 digest of a byte stream ([`hash_reader`], [`hash_file_content`])
//! - Atomic file writing for index records ([`atomic_write`])
//! - Worker pools for the parallel stages ([`worker_pool`])
//!
//! ## Example Usage
//!
//! ```rust
//! use mediaspan::utils::{clean_path, relative_path, round_to_next_multiple};
//!
//! let full = clean_path(r"D:\photos\2021\IMG_0001.JPG");
//! assert_eq!(full, "D:/photos/2021/IMG_0001.JPG");
//! assert_eq!(relative_path(&full), "/photos/2021/IMG_0001.JPG");
//!
//! assert_eq!(round_to_next_multiple(513, 512), 1024);
//! ```

use crate::error::{MediaspanError, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;
use tracing::trace;

/// Canonicalize a path string: backslashes become forward slashes and any
/// trailing slash is removed.
pub fn clean_path(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Canonicalize a filesystem path, see [`clean_path`]
pub fn clean_os_path(path: &Path) -> String {
    clean_path(&path.to_string_lossy())
}

/// Compute the index key form of a cleaned absolute path
///
/// The drive designator (`C:`) or UNC host (`//server`) is stripped so the
/// same tree mounted under a different letter or host keeps its identity.
/// Unix absolute paths are already in relative form and are returned as is.
///
/// # Example
///
/// ```rust
/// use mediaspan::utils::relative_path;
///
/// assert_eq!(relative_path("C:/data/a.txt"), "/data/a.txt");
/// assert_eq!(relative_path("//nas/share/a.txt"), "/share/a.txt");
/// assert_eq!(relative_path("/srv/data/a.txt"), "/srv/data/a.txt");
/// ```
pub fn relative_path(clean_full_path: &str) -> String {
    if let Some(rest) = clean_full_path.strip_prefix("//") {
        let rest = rest.trim_start_matches('/');
        return match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        };
    }

    let bytes = clean_full_path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return clean_full_path[2..].to_string();
    }

    clean_full_path.to_string()
}

/// Final component of a cleaned path
pub fn file_name(clean_path: &str) -> &str {
    match clean_path.rfind('/') {
        Some(idx) => &clean_path[idx + 1..],
        None => clean_path,
    }
}

/// Directory part of a cleaned relative path (empty when there is none)
pub fn relative_directory(relative_path: &str) -> String {
    match relative_path.rfind('/') {
        Some(idx) => relative_path[..idx].to_string(),
        None => String::new(),
    }
}

/// Lowercase extension of a file name without the dot, empty if none
///
/// A leading dot (`.bashrc`) is part of the name, not an extension.
pub fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => name[idx + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// Round `value` up to the next multiple of `multiple`
///
/// `0` stays `0`. A `multiple` of `0` or `1` returns `value` unchanged.
/// Results that would not fit in 64 bits saturate at `u64::MAX`.
pub fn round_to_next_multiple(value: u64, multiple: u64) -> u64 {
    if multiple <= 1 {
        return value;
    }
    value.div_ceil(multiple).saturating_mul(multiple)
}

/// Size, timestamps and attributes of a file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    /// Length in bytes
    pub size: u64,
    /// Creation time (falls back to modification time where unsupported)
    pub created: DateTime<Utc>,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Last access time
    pub accessed: DateTime<Utc>,
    /// Platform attribute bits (Unix mode or Windows file attributes)
    pub attributes: u32,
}

/// Read the size, timestamps and attribute bits of a file
///
/// # Errors
///
/// - [`MediaspanError::SourceNotFound`] if the file no longer exists
/// - [`MediaspanError::Io`] for any other stat failure
pub fn read_attributes(path: &Path) -> Result<FileAttributes> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MediaspanError::SourceNotFound {
            path: path.to_path_buf(),
        },
        _ => MediaspanError::Io(e),
    })?;

    let modified = to_utc(metadata.modified()?);
    let created = metadata.created().map(to_utc).unwrap_or(modified);
    let accessed = metadata.accessed().map(to_utc).unwrap_or(modified);

    Ok(FileAttributes {
        size: metadata.len(),
        created,
        modified,
        accessed,
        attributes: platform_attributes(&metadata),
    })
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(unix)]
fn platform_attributes(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(windows)]
fn platform_attributes(metadata: &fs::Metadata) -> u32 {
    use std::os::windows::fs::MetadataExt;
    metadata.file_attributes()
}

#[cfg(not(any(unix, windows)))]
fn platform_attributes(metadata: &fs::Metadata) -> u32 {
    u32::from(metadata.permissions().readonly())
}

/// Compute the SHA-256 digest of a byte stream as lowercase hex
pub fn hash_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 digest of a file's content
pub fn hash_file_content(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MediaspanError::SourceNotFound {
            path: path.to_path_buf(),
        },
        _ => MediaspanError::Io(e),
    })?;
    hash_reader(io::BufReader::new(file))
}

/// Format bytes in human-readable form (1024-based units)
///
/// ```rust
/// use mediaspan::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Build a rayon pool for a parallel stage
///
/// `workers == 0` uses one thread per CPU.
pub fn worker_pool(workers: usize, stage: &'static str) -> Result<rayon::ThreadPool> {
    let threads = if workers == 0 { num_cpus::get() } else { workers };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("mediaspan-{}-{}", stage, i))
        .build()
        .map_err(|e| MediaspanError::internal(format!("failed to build {} thread pool: {}", stage, e)))
}

/// Atomic file write (write to a temp file in the same directory, then rename)
///
/// The target is either the old content or the complete new content, never a
/// partially written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| MediaspanError::Io(e.error))?;

    trace!("Atomically wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_to_next_multiple() {
        assert_eq!(round_to_next_multiple(0, 512), 0);
        assert_eq!(round_to_next_multiple(1, 512), 512);
        assert_eq!(round_to_next_multiple(512, 512), 512);
        assert_eq!(round_to_next_multiple(513, 512), 1024);
        assert_eq!(round_to_next_multiple(600, 1), 600);
    }

    #[test]
    fn test_round_large_values() {
        let twenty_tb = 20 * 1024u64.pow(4) + 1;
        assert_eq!(round_to_next_multiple(twenty_tb, 4096), 20 * 1024u64.pow(4) + 4096);
        assert_eq!(round_to_next_multiple(u64::MAX, 4096), u64::MAX);
    }

    #[test]
    fn test_clean_and_relative_paths() {
        assert_eq!(clean_path(r"C:\data\photos\"), "C:/data/photos");
        assert_eq!(relative_path("C:/data/photos/a.jpg"), "/data/photos/a.jpg");
        assert_eq!(relative_path("//nas/share/a.jpg"), "/share/a.jpg");
        assert_eq!(relative_path("/home/me/a.jpg"), "/home/me/a.jpg");
        assert_eq!(relative_directory("/data/photos/a.jpg"), "/data/photos");
        assert_eq!(file_name("/data/photos/a.jpg"), "a.jpg");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("IMG_0001.JPG"), "jpg");
        assert_eq!(extension("archive.tar.gz"), "gz");
        assert_eq!(extension("README"), "");
        assert_eq!(extension(".bashrc"), "");
        assert_eq!(extension("trailing."), "");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_099_511_627_776), "1.00 TB");
    }

    #[test]
    fn test_read_attributes_and_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, b"Hello, World!").unwrap();

        let attrs = read_attributes(&file).unwrap();
        assert_eq!(attrs.size, 13);

        let hash = hash_file_content(&file).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_reader(&b"Hello, World!"[..]).unwrap());
    }

    #[test]
    fn test_read_attributes_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_attributes(&temp_dir.path().join("gone.txt")).unwrap_err();
        assert!(matches!(err, MediaspanError::SourceNotFound { .. }));
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("unit_001.json");

        atomic_write(&file_path, b"first").unwrap();
        atomic_write(&file_path, b"second").unwrap();

        assert_eq!(fs::read(&file_path).unwrap(), b"second");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
