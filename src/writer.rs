//! Copy/commit stage
//!
//! The [`UnitWriter`] copies every pending file of one unit to a mounted
//! destination, hashing the bytes as they stream through, and promotes each
//! file with [`DestinationUnit::mark_file_copied`] once its copy is complete.
//!
//! Files land under `<mount>/data/<relative path>`. Pending files are written
//! in relative-path order.
//!
//! ## Failures
//!
//! - A source that vanished is skipped and stays pending.
//! - Running out of space on the device means the unit is smaller than the
//!   allocator assumed. The partial copy is removed, the file stays pending,
//!   the unit is flagged capacity-suspect (full until verified again) and the
//!   write stops. The mismatch is returned in the [`WriteReport`].
//!
//! Payload bytes go through a [`MediaSink`]. The default [`FileSink`]
//! writes plain files and syncs each one before it is committed.
//!
//! ## Auto-save
//!
//! With an index attached, the unit record is saved every
//! `auto_save_interval_secs` seconds (0 saves after every file, a negative
//! value only saves at the end), and always once when the write finishes.

use crate::error::{MediaspanError, Result};
use crate::index::UnitIndex;
use crate::types::{CancellationToken, ProgressCallback, ProgressSampler, ScanStats, Stage};
use crate::unit::DestinationUnit;
use crate::utils;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Directory under the mount root that receives file payloads
pub const DATA_DIR: &str = "data";

/// Outcome of writing one unit
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Unit that was written
    pub unit_number: u32,
    /// Files promoted to committed
    pub files_written: u64,
    /// Bytes copied
    pub bytes_written: u64,
    /// Pending files whose source could not be found
    pub missing_sources: u64,
    /// Pending files left after the write
    pub files_remaining: u64,
    /// Set when the device ran out of space
    pub capacity_mismatch: Option<MediaspanError>,
    /// Whether the write stopped on a cancellation request
    pub cancelled: bool,
}

/// Location of a file's payload on a mounted unit
pub fn payload_path(mount: &Path, relative_path: &str) -> PathBuf {
    let trimmed = relative_path.trim_start_matches('/');
    let mut path = mount.join(DATA_DIR);
    for component in trimmed.split('/').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path
}

/// Whether an I/O error means the device is out of space
pub fn is_out_of_space(error: &io::Error) -> bool {
    match error.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == 28,
        #[cfg(windows)]
        Some(code) => code == 112 || code == 39,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}

/// Destination for payload bytes on mounted media
pub trait MediaSink: Send + Sync {
    /// Open `destination` for writing, creating parent directories
    ///
    /// A successful `flush` on the returned writer means the payload is
    /// durable.
    fn create(&self, destination: &Path) -> io::Result<Box<dyn Write>>;
}

/// Writes payloads as regular files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSink;

impl MediaSink for FileSink {
    fn create(&self, destination: &Path) -> io::Result<Box<dyn Write>> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(SyncedFile(BufWriter::new(File::create(destination)?))))
    }
}

struct SyncedFile(BufWriter<File>);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.get_ref().sync_all()
    }
}

enum CopyError {
    SourceMissing,
    OutOfSpace,
    Other(MediaspanError),
}

/// Copies a unit's pending files to mounted media
pub struct UnitWriter<'a> {
    mount: PathBuf,
    sink: Arc<dyn MediaSink>,
    index: Option<&'a UnitIndex>,
    auto_save_interval_secs: i64,
    progress_interval_ms: u64,
    progress_callback: Option<ProgressCallback>,
    cancellation: CancellationToken,
}

impl<'a> UnitWriter<'a> {
    /// Writer targeting the media mounted at `mount`
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            sink: Arc::new(FileSink),
            index: None,
            auto_save_interval_secs: 300,
            progress_interval_ms: 250,
            progress_callback: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Send payload bytes to `sink` instead of plain files
    pub fn with_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Save unit records to this index while writing
    pub fn with_index(mut self, index: &'a UnitIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Seconds between auto-saves (0 after every file, negative disables)
    pub fn with_auto_save_interval(mut self, seconds: i64) -> Self {
        self.auto_save_interval_secs = seconds;
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

    /// Token polled before every file
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    fn save(&self, unit: &mut DestinationUnit) -> Result<()> {
        match self.index {
            Some(index) => index.save_unit(unit),
            None => Ok(()),
        }
    }

    /// Write every pending file of `unit`
    ///
    /// # Errors
    ///
    /// Per-file failures are reported in the [`WriteReport`]; an error is only
    /// returned when the mount cannot be prepared or the index cannot be saved.
    #[instrument(skip(self, unit), fields(unit = unit.unit_number))]
    pub fn write_unit(&self, unit: &mut DestinationUnit) -> Result<WriteReport> {
        let mut report = WriteReport {
            unit_number: unit.unit_number,
            ..Default::default()
        };

        if !unit.has_pending_writes() {
            debug!("{} has nothing pending", unit.name());
            return Ok(report);
        }

        fs::create_dir_all(self.mount.join(DATA_DIR))?;
        unit.sort_pending_files();
        unit.add_write_date();

        let pending: Vec<(String, String, u64)> = unit
            .pending_files()
            .map(|f| (f.relative_path.clone(), f.full_path.clone(), f.size_or_zero()))
            .collect();
        let total = pending.len() as u64;

        info!("Writing {} files to {} at {:?}", total, unit.name(), self.mount);

        let mut sampler = ProgressSampler::new(
            self.progress_callback.clone(),
            Stage::Writing,
            self.progress_interval_ms,
        );
        let mut last_save = Instant::now();
        let auto_save = u64::try_from(self.auto_save_interval_secs).ok().map(Duration::from_secs);
        let stats = ScanStats::default();

        for (relative_path, full_path, size) in pending {
            if self.cancellation.is_cancelled() {
                info!("Write to {} cancelled", unit.name());
                report.cancelled = true;
                break;
            }

            let destination = payload_path(&self.mount, &relative_path);
            match copy_and_hash(self.sink.as_ref(), Path::new(&full_path), &destination) {
                Ok((hash, copied)) => {
                    if copied != size {
                        debug!("{} changed size since sizing ({} -> {})", relative_path, size, copied);
                    }
                    unit.mark_file_copied(&relative_path, Some(hash))?;
                    report.files_written += 1;
                    report.bytes_written += copied;
                }
                Err(CopyError::SourceMissing) => {
                    warn!("Source vanished before copy: {}", full_path);
                    report.missing_sources += 1;
                }
                Err(CopyError::OutOfSpace) => {
                    let available = unit.usable_free_space() + unit.pending_bytes_on_disk();
                    let needed = unit.footprint(size);
                    if let Err(e) = fs::remove_file(&destination) {
                        debug!("No partial copy to remove at {:?}: {}", destination, e);
                    }
                    unit.mark_capacity_suspect();
                    let err = MediaspanError::DeviceCapacityMismatch {
                        unit: unit.unit_number,
                        path: relative_path,
                        needed,
                        available,
                    };
                    warn!("{}", err);
                    report.capacity_mismatch = Some(err);
                    break;
                }
                Err(CopyError::Other(e)) => return Err(e),
            }

            if let Some(interval) = auto_save {
                if last_save.elapsed() >= interval {
                    self.save(unit)?;
                    last_save = Instant::now();
                }
            }

            sampler.sample(report.files_written, Some(total), report.bytes_written, &stats);
        }

        self.save(unit)?;
        report.files_remaining = unit.pending_file_count();
        sampler.finish(report.files_written, Some(total), report.bytes_written, &stats);

        info!(
            "Wrote {} files ({}) to {} in {:?}",
            report.files_written,
            utils::format_bytes(report.bytes_written),
            unit.name(),
            sampler.elapsed()
        );
        Ok(report)
    }
}

fn copy_and_hash(
    sink: &dyn MediaSink,
    source: &Path,
    destination: &Path,
) -> std::result::Result<(String, u64), CopyError> {
    let input = match File::open(source) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CopyError::SourceMissing),
        Err(e) => return Err(CopyError::Other(e.into())),
    };

    let write_err = |e: io::Error| {
        if is_out_of_space(&e) {
            CopyError::OutOfSpace
        } else {
            CopyError::Other(e.into())
        }
    };

    let mut reader = BufReader::new(input);
    let mut writer = sink.create(destination).map_err(write_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut copied = 0u64;

    loop {
        let read = reader.read(&mut buffer).map_err(|e| CopyError::Other(e.into()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read]).map_err(write_err)?;
        copied += read as u64;
    }

    writer.flush().map_err(write_err)?;

    Ok((hex::encode(hasher.finalize()), copied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_file::SourceFileRecord;
    use crate::types::{MediaKind, UnitTemplate};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    /// Real files on a device that holds `remaining` more bytes
    struct SmallDevice {
        remaining: Arc<AtomicU64>,
    }

    struct SmallDeviceFile {
        file: File,
        remaining: Arc<AtomicU64>,
    }

    impl MediaSink for SmallDevice {
        fn create(&self, destination: &Path) -> io::Result<Box<dyn Write>> {
            fs::create_dir_all(destination.parent().unwrap())?;
            Ok(Box::new(SmallDeviceFile {
                file: File::create(destination)?,
                remaining: self.remaining.clone(),
            }))
        }
    }

    impl Write for SmallDeviceFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let remaining = self.remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(io::Error::from_raw_os_error(28));
            }
            let n = buf.len().min(remaining as usize);
            let written = self.file.write(&buf[..n])?;
            self.remaining.fetch_sub(written as u64, Ordering::SeqCst);
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    fn unit_with_pending(files: &[PathBuf]) -> DestinationUnit {
        let template = UnitTemplate {
            kind: MediaKind::Csd,
            total_space: 1_000_000,
            block_size: 512,
            reserved_capacity_bytes: 0,
            blocking_factor: 0,
        };
        let mut unit = DestinationUnit::new(1, &template);
        for path in files {
            let mut record = SourceFileRecord::from_path(path);
            record.read_size_and_attributes().unwrap();
            unit.add_file(record).unwrap();
        }
        unit
    }

    #[test]
    fn test_payload_path() {
        let path = payload_path(Path::new("/mnt/csd"), "/photos/2021/a.jpg");
        assert_eq!(path, Path::new("/mnt/csd/data/photos/2021/a.jpg"));
    }

    #[cfg(unix)]
    #[test]
    fn test_out_of_space_detection() {
        assert!(is_out_of_space(&io::Error::from_raw_os_error(28)));
        assert!(!is_out_of_space(&io::Error::from_raw_os_error(2)));
        assert!(!is_out_of_space(&io::Error::new(io::ErrorKind::Other, "x")));
    }

    #[cfg(unix)]
    #[test]
    fn test_full_device_marks_unit_capacity_suspect() {
        let source = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let a = source.path().join("a.txt");
        let b = source.path().join("b.bin");
        let c = source.path().join("c.bin");
        fs::write(&a, vec![1u8; 100]).unwrap();
        fs::write(&b, vec![2u8; 4000]).unwrap();
        fs::write(&c, vec![3u8; 10]).unwrap();

        let config = crate::types::ArchiveConfig {
            source_paths: vec![source.path().to_path_buf()],
            ..crate::types::ArchiveConfig::for_media(MediaKind::Csd, 1_000_000, 512)
        };
        let index = UnitIndex::init(index_dir.path().join("index"), config).unwrap();

        let mut unit = unit_with_pending(&[a.clone(), b.clone(), c]);
        assert!(!unit.is_full());
        let device = SmallDevice {
            remaining: Arc::new(AtomicU64::new(1000)),
        };

        let report = UnitWriter::new(mount.path())
            .with_sink(Arc::new(device))
            .with_index(&index)
            .write_unit(&mut unit)
            .unwrap();

        match &report.capacity_mismatch {
            Some(MediaspanError::DeviceCapacityMismatch { unit, path, needed, .. }) => {
                assert_eq!(*unit, 1);
                assert!(path.ends_with("/b.bin"));
                assert_eq!(*needed, 4096);
            }
            other => panic!("expected DeviceCapacityMismatch, got {:?}", other),
        }
        assert_eq!(report.files_written, 1);
        assert_eq!(report.files_remaining, 2);

        // The partial copy is gone and the file is still pending
        let b_relative = SourceFileRecord::from_path(&b).relative_path;
        assert!(!payload_path(mount.path(), &b_relative).exists());
        assert!(unit.pending_files().any(|f| f.relative_path == b_relative));
        assert!(unit.is_capacity_suspect());
        assert!(unit.is_full());
        assert!(!unit.can_accept(1));

        // The flag survives a reload
        let mut loaded = index.load_units().unwrap().remove(0);
        assert_eq!(loaded.total_files(), 1);
        assert!(loaded.is_capacity_suspect());
        assert!(loaded.is_full());

        loaded.record_verification(Utc::now(), false);
        assert!(loaded.is_capacity_suspect());
        loaded.record_verification(Utc::now(), true);
        assert!(!loaded.is_capacity_suspect());
        assert!(!loaded.is_full());
    }

    #[test]
    fn test_write_commits_pending_files() {
        let source = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let a = source.path().join("a.txt");
        let b = source.path().join("b.txt");
        fs::write(&a, b"Hello, World!").unwrap();
        fs::write(&b, b"second").unwrap();

        let mut unit = unit_with_pending(&[b.clone(), a.clone()]);
        let report = UnitWriter::new(mount.path()).write_unit(&mut unit).unwrap();

        assert_eq!(report.files_written, 2);
        assert_eq!(report.bytes_written, 19);
        assert_eq!(report.files_remaining, 0);
        assert!(report.capacity_mismatch.is_none());
        assert_eq!(unit.total_files(), 2);
        assert_eq!(unit.data_size_on_disk(), 1024);
        assert_eq!(unit.write_history.len(), 1);

        let written = &unit.committed_files()[0];
        assert_eq!(written.name, "a.txt");
        assert_eq!(written.hash, Some(utils::hash_file_content(&a).unwrap()));

        let copy = payload_path(mount.path(), &written.relative_path);
        assert_eq!(fs::read(copy).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_missing_source_stays_pending() {
        let source = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let a = source.path().join("a.txt");
        let b = source.path().join("b.txt");
        fs::write(&a, b"aaa").unwrap();
        fs::write(&b, b"bbb").unwrap();

        let mut unit = unit_with_pending(&[a.clone(), b]);
        fs::remove_file(&a).unwrap();

        let report = UnitWriter::new(mount.path()).write_unit(&mut unit).unwrap();
        assert_eq!(report.files_written, 1);
        assert_eq!(report.missing_sources, 1);
        assert_eq!(report.files_remaining, 1);
        assert_eq!(unit.committed_files()[0].name, "b.txt");
        assert_eq!(unit.pending_files().next().unwrap().name, "a.txt");
    }

    #[test]
    fn test_write_saves_to_index() {
        let source = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let a = source.path().join("a.txt");
        fs::write(&a, b"aaa").unwrap();

        let config = crate::types::ArchiveConfig {
            source_paths: vec![source.path().to_path_buf()],
            ..crate::types::ArchiveConfig::for_media(MediaKind::Csd, 1_000_000, 512)
        };
        let index = UnitIndex::init(index_dir.path().join("index"), config).unwrap();

        let mut unit = unit_with_pending(&[a]);
        UnitWriter::new(mount.path())
            .with_index(&index)
            .with_auto_save_interval(0)
            .write_unit(&mut unit)
            .unwrap();

        let loaded = index.load_units().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].total_files(), 1);
        assert!(loaded[0].committed_files()[0].hash.is_some());
    }

    #[test]
    fn test_cancelled_write_leaves_files_pending() {
        let source = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let a = source.path().join("a.txt");
        fs::write(&a, b"aaa").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let mut unit = unit_with_pending(&[a]);
        let report = UnitWriter::new(mount.path())
            .with_cancellation(token)
            .write_unit(&mut unit)
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(unit.pending_file_count(), 1);
    }
}
