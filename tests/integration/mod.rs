//! Integration tests for mediaspan
//!
//! Multi-run scenarios: a source tree that keeps growing, units filled over
//! several write sessions, renames, and damaged media.

use ::mediaspan::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Generates source trees with reproducible content
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Write `count` files of random size in `[min, max)` under `root/dir`
    pub fn populate(&mut self, root: &Path, dir: &str, count: usize, min: usize, max: usize) -> Vec<PathBuf> {
        let base = root.join(dir);
        fs::create_dir_all(&base).unwrap();

        (0..count)
            .map(|i| {
                let len = self.rng.random_range(min..max);
                let mut content = vec![0u8; len];
                self.rng.fill(&mut content[..]);
                let extension = ["jpg", "raw", "mov", "txt"][i % 4];
                let path = base.join(format!("file_{:04}.{}", i, extension));
                fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }
}

/// An archive set over a temporary source tree, with one mount per unit
pub struct ArchiveTestHarness {
    pub source: TempDir,
    pub index: TempDir,
    pub mounts: TempDir,
    pub archiver: Archiver,
    pub generator: FileGenerator,
}

impl ArchiveTestHarness {
    pub fn new(media: MediaKind, capacity: u64, block_size: u64) -> Self {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let mounts = TempDir::new().unwrap();

        let archiver = ArchiverBuilder::new()
            .media(media)
            .unit_capacity(capacity)
            .block_size(block_size)
            .reserved_capacity_bytes(0)
            .parallel_workers(4)
            .auto_save_interval_secs(0)
            .source_paths(vec![source.path().to_path_buf()])
            .build(index.path().join("index"))
            .unwrap();

        Self {
            source,
            index,
            mounts,
            archiver,
            generator: FileGenerator::new(42),
        }
    }

    pub fn mount(&self, unit: u32) -> PathBuf {
        let path = self.mounts.path().join(format!("unit_{}", unit));
        fs::create_dir_all(&path).unwrap();
        path
    }

    /// Write every unit that has pending files, in unit order
    pub fn write_all(&self) -> Vec<WriteReport> {
        let plan = self.archiver.plan().unwrap();
        let targets: Vec<u32> = plan
            .session
            .units()
            .iter()
            .filter(|u| u.has_pending_writes())
            .map(|u| u.unit_number)
            .collect();
        drop(plan);

        targets
            .into_iter()
            .map(|n| {
                let report = self.archiver.write_unit(n, self.mount(n)).unwrap();
                info!("unit {} wrote {} files", n, report.files_written);
                report
            })
            .collect()
    }

    pub fn units(&self) -> Vec<DestinationUnit> {
        self.archiver.units().unwrap()
    }
}

fn assert_capacity_invariant(units: &[DestinationUnit]) {
    for unit in units {
        let used = unit.data_size_on_disk() + unit.pending_bytes_on_disk();
        assert!(
            used <= unit.total_space - unit.reserved_capacity_bytes,
            "{} holds {} bytes over a limit of {}",
            unit.name(),
            used,
            unit.total_space - unit.reserved_capacity_bytes
        );
    }
}

#[test]
fn test_growing_collection_across_runs() {
    let mut harness = ArchiveTestHarness::new(MediaKind::Csd, 64 * 1024, 4096);
    let source = harness.source.path().to_path_buf();

    harness.generator.populate(&source, "2023", 20, 500, 9000);
    let first = harness.write_all();
    assert!(!first.is_empty());
    let after_first = harness.units();
    let files_first: u64 = after_first.iter().map(|u| u.total_files()).sum();
    assert_eq!(files_first, 20);
    assert_capacity_invariant(&after_first);

    harness.generator.populate(&source, "2024", 20, 500, 9000);
    harness.write_all();
    let after_second = harness.units();
    assert_eq!(after_second.iter().map(|u| u.total_files()).sum::<u64>(), 40);
    assert_capacity_invariant(&after_second);

    for before in &after_first {
        let after = after_second.iter().find(|u| u.unit_number == before.unit_number).unwrap();
        for file in before.committed_files() {
            assert!(after.contains(&file.relative_path), "{} moved units", file.relative_path);
        }
    }

    let plan = harness.archiver.plan().unwrap();
    assert_eq!(plan.stats().new_file_count, 0);
    assert_eq!(plan.stats().existing_file_count, 40);
}

#[test]
fn test_every_unit_verifies() {
    let mut harness = ArchiveTestHarness::new(MediaKind::Tape, 32 * 1024, 512);
    let source = harness.source.path().to_path_buf();
    harness.generator.populate(&source, "clips", 12, 1000, 6000);
    harness.write_all();

    let units = harness.units();
    assert!(units.len() > 1);
    for unit in &units {
        let report = harness.archiver.verify_unit(unit.unit_number, harness.mount(unit.unit_number)).unwrap();
        assert!(report.is_valid(), "{}", report.summary());
        assert_eq!(report.total_files_checked as u64, unit.total_files());
    }

    let summary = harness.archiver.summary().unwrap();
    assert_eq!(summary.total_files, 12);
    assert!(summary.units.iter().all(|u| u.last_verify_success));
    assert!(summary.units.iter().all(|u| u.archive_bytes.unwrap_or(0) > u.data_size));
}

#[test]
fn test_damaged_media_fails_verification() {
    let mut harness = ArchiveTestHarness::new(MediaKind::Csd, 1024 * 1024, 4096);
    let source = harness.source.path().to_path_buf();
    harness.generator.populate(&source, "docs", 5, 100, 1000);
    harness.write_all();

    let mount = harness.mount(1);
    let unit = harness.units().remove(0);
    let victim = unit.committed_files()[2].relative_path.clone();
    fs::write(writer::payload_path(&mount, &victim), b"bit rot").unwrap();

    let report = harness.archiver.verify_unit(1, &mount).unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].relative_path, victim);
    assert_eq!(harness.archiver.status().unwrap().units_needing_verification, vec![1]);
}

#[test]
fn test_moved_file_is_renamed_not_rearchived() {
    let harness = ArchiveTestHarness::new(MediaKind::Csd, 1024 * 1024, 4096);
    let source = harness.source.path();
    fs::write(source.join("IMG_0001.jpg"), vec![7u8; 2048]).unwrap();
    harness.write_all();

    fs::create_dir(source.join("sorted")).unwrap();
    fs::rename(source.join("IMG_0001.jpg"), source.join("sorted/IMG_0001.jpg")).unwrap();

    // A copy gets a fresh creation time, so it is new content, not a rename.
    fs::write(source.join("copy.jpg"), vec![7u8; 2048]).unwrap();
    filetime::set_file_mtime(
        source.join("copy.jpg"),
        filetime::FileTime::from_unix_time(1_000_000_000, 0),
    )
    .unwrap();

    let candidates = harness.archiver.find_renames().unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].new_path.ends_with("sorted/IMG_0001.jpg"));

    let applied = harness.archiver.apply_renames().unwrap();
    assert_eq!(applied.len(), 1);

    let unit = harness.units().remove(0);
    assert_eq!(unit.total_files(), 1);
    let file = &unit.committed_files()[0];
    assert!(file.relative_path.ends_with("sorted/IMG_0001.jpg"));
    assert!(file.original_path.as_deref().unwrap().ends_with("IMG_0001.jpg"));
    assert_eq!(file.file_deleted, None);

    let plan = harness.archiver.plan().unwrap();
    assert_eq!(plan.stats().new_file_count, 1);
    assert_eq!(plan.stats().deleted_file_count, 0);
}

#[test]
fn test_disc_set_finalized_units_are_skipped() -> anyhow::Result<()> {
    let harness = ArchiveTestHarness::new(MediaKind::Disc, 10_000, 2048);
    let source = harness.source.path();
    fs::write(source.join("a.iso"), vec![1u8; 3000])?;
    harness.write_all();
    harness.archiver.finalize_unit(1)?;

    fs::write(source.join("b.iso"), vec![2u8; 3000])?;
    let plan = harness.archiver.plan()?;
    assert_eq!(plan.allocation.new_units, vec![2]);
    assert_eq!(plan.session.unit(1)?.pending_file_count(), 0);
    Ok(())
}

#[test]
fn test_late_file_joins_partly_written_unit() {
    let mut harness = ArchiveTestHarness::new(MediaKind::Csd, 1024 * 1024, 4096);
    let source = harness.source.path().to_path_buf();
    let files = harness.generator.populate(&source, "batch", 6, 100, 400);

    fs::remove_file(&files[0]).unwrap();
    let plan = harness.archiver.plan().unwrap();
    assert_eq!(plan.stats().new_file_count, 5);
    drop(plan);

    let report = harness.archiver.write_unit(1, harness.mount(1)).unwrap();
    assert_eq!(report.files_written, 5);

    fs::write(&files[0], b"back again").unwrap();
    let report = harness.archiver.write_unit(1, harness.mount(1)).unwrap();
    assert_eq!(report.files_written, 1);
    assert_eq!(harness.units()[0].total_files(), 6);
}
