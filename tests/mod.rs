//! Main test module for mediaspan
//!
//! This module includes all test suites:
//! - Integration tests for multi-run archive scenarios
//! - Property-based tests for allocation invariants
//! - Edge cases around paths, exclusions and damaged indexes

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::mediaspan::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn archiver_for(source: &Path, index: &Path, capacity: u64) -> Archiver {
        ArchiverBuilder::new()
            .media(MediaKind::Csd)
            .unit_capacity(capacity)
            .block_size(1)
            .reserved_capacity_bytes(0)
            .parallel_workers(2)
            .source_paths(vec![source.to_path_buf()])
            .build(index.join("index"))
            .unwrap()
    }

    #[test]
    fn test_empty_source() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let archiver = archiver_for(source.path(), index.path(), 1000);

        let plan = archiver.plan().unwrap();
        assert_eq!(plan.stats().total_seen(), 0);
        assert!(plan.allocation.new_units.is_empty());
        assert_eq!(plan.summary().total_units, 0);
    }

    #[test]
    fn test_missing_source_root_is_fatal() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let archiver = archiver_for(&source.path().join("not-there"), index.path(), 1000);

        assert!(matches!(
            archiver.plan(),
            Err(MediaspanError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_special_and_unicode_filenames() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let archiver = archiver_for(source.path(), index.path(), 1_000_000);

        let names = [
            "file with spaces.txt",
            "file.with.dots.txt",
            "file(with)parens.txt",
            "файл.txt",
            "文件.txt",
            "🚀.txt",
        ];
        let mut created = 0;
        for name in &names {
            if fs::write(source.path().join(name), format!("content of {}", name)).is_ok() {
                created += 1;
            }
        }

        let report = archiver.write_unit(1, mount.path()).unwrap();
        assert_eq!(report.files_written, created);
        assert!(archiver.verify_unit(1, mount.path()).unwrap().is_valid());
        assert_eq!(archiver.summary().unwrap().extensions[0].extension, "txt");
    }

    #[test]
    fn test_case_insensitive_paths_are_one_file() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let archiver = archiver_for(source.path(), index.path(), 1_000_000);

        fs::write(source.path().join("Photo.JPG"), b"one").unwrap();
        if fs::write(source.path().join("photo.jpg"), b"two").is_err() {
            return;
        }

        let plan = archiver.plan().unwrap();
        assert_eq!(plan.stats().new_file_count, 1);
        assert_eq!(plan.allocation.assigned_files, 1);
        drop(plan);

        archiver.write_unit(1, mount.path()).unwrap();
        assert_eq!(archiver.status().unwrap().total_files, 1);
    }

    #[test]
    fn test_exclusions() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("Cache/deep")).unwrap();
        fs::write(source.path().join("Cache/deep/blob.bin"), b"x").unwrap();
        fs::write(source.path().join("keep.txt"), b"x").unwrap();
        fs::write(source.path().join("draft.TMP"), b"x").unwrap();

        let cache = source.path().join("cache").to_string_lossy().to_string();
        let archiver = ArchiverBuilder::new()
            .unit_capacity(1_000_000)
            .reserved_capacity_bytes(0)
            .source_paths(vec![source.path().to_path_buf()])
            .exclude_paths(vec![cache])
            .exclude_files(vec![".tmp".to_string()])
            .build(index.path().join("index"))
            .unwrap();

        let plan = archiver.plan().unwrap();
        assert_eq!(plan.stats().new_file_count, 1);
        assert_eq!(plan.stats().excluded_file_count, 1);
        assert_eq!(plan.allocation.assigned_files, 1);
    }

    #[test]
    fn test_oversized_file_aborts_plan() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let archiver = archiver_for(source.path(), index.path(), 100);
        fs::write(source.path().join("small.bin"), vec![0u8; 10]).unwrap();
        fs::write(source.path().join("huge.bin"), vec![0u8; 500]).unwrap();

        let plan = archiver.plan().unwrap();
        assert!(!plan.is_complete());
        assert_eq!(plan.stats().new_file_count, 2);
        assert_eq!(plan.allocation.assigned_files, 0);
        assert_eq!(plan.session.new_files().len(), 2);
        assert!(plan.session.units().is_empty());

        match plan.into_result() {
            Err(MediaspanError::CapacityExhausted { size, max_capacity, .. }) => {
                assert_eq!(size, 500);
                assert_eq!(max_capacity, 99);
            }
            other => panic!("expected CapacityExhausted, got {:?}", other.map(|p| p.allocation)),
        }
        assert!(matches!(
            archiver.write_unit(1, index.path().join("mount")),
            Err(MediaspanError::CapacityExhausted { .. })
        ));
        assert!(archiver.units().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_unit_record() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let archiver = archiver_for(source.path(), index.path(), 1000);
        fs::write(source.path().join("a.txt"), b"a").unwrap();
        archiver.write_unit(1, mount.path()).unwrap();

        let record = archiver.root().join("units").join("csd_001.json");
        assert!(record.exists());
        fs::write(&record, b"{ not json").unwrap();

        let err = archiver.plan().unwrap_err();
        assert!(err.is_corruption());
        assert!(err.user_message().contains("csd_001.json"));
    }

    #[test]
    fn test_corrupt_metadata() {
        let index = TempDir::new().unwrap();
        let root = index.path().join("index");
        {
            let source = TempDir::new().unwrap();
            archiver_for(source.path(), index.path(), 1000);
        }
        fs::write(root.join("metadata.json"), b"[]").unwrap();

        let err = Archiver::open(root.clone()).unwrap_err();
        assert!(err.is_corruption());
        assert!(!root.join("index.lock").exists());
    }

    #[test]
    fn test_init_twice_fails() {
        let source = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        let root = archiver_for(source.path(), index.path(), 1000).root().to_path_buf();

        let mut config = ArchiveConfig::for_media(MediaKind::Csd, 1000, 1);
        config.source_paths = vec![source.path().to_path_buf()];
        assert!(matches!(
            Archiver::init(root, config),
            Err(MediaspanError::IndexAlreadyExists(_))
        ));
    }
}

pub use integration::{ArchiveTestHarness, FileGenerator};
