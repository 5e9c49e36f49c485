//! Persisted unit index
//!
//! The index is a directory holding one JSON record per destination unit plus
//! the archive set's configuration:
//!
//! ```text
//! index_root/
//! ├── metadata.json      # IndexMetadata (format version, config)
//! ├── index.lock         # present while a session holds the index
//! └── units/
//!     ├── csd_001.json   # one DestinationUnit snapshot per unit
//!     └── csd_002.json
//! ```
//!
//! Unit records are written atomically from a snapshot holding committed
//! files only, so a crash mid-write leaves the previous record intact. Cached
//! counters in a record are informational: loading always recomputes them
//! from the file list, and any record that fails to parse or fails a
//! structural check aborts the load with [`MediaspanError::IndexCorrupt`].
//!
//! Only one session may use an index at a time. [`IndexLock`] enforces this
//! with a lock file created exclusively and removed on drop.

use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt};
use crate::error::{MediaspanError, Result};
use crate::types::ArchiveConfig;
use crate::unit::DestinationUnit;
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Current on-disk format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

const METADATA_FILE: &str = "metadata.json";
const UNITS_DIR: &str = "units";
const LOCK_FILE: &str = "index.lock";

/// Whether `root` holds an initialized index
pub fn index_exists(root: &Path) -> bool {
    root.join(METADATA_FILE).is_file()
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Version of the index format
    pub format_version: u32,
    /// mediaspan version that created the index
    pub mediaspan_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last time a session opened the index
    pub last_accessed: DateTime<Utc>,
    /// Archive set configuration
    pub config: ArchiveConfig,
}

/// Exclusive hold on an index directory
///
/// The lock file records the holder's process id. It is removed when the
/// lock is dropped; a lock left behind by a crashed process must be removed
/// by hand.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    /// Take the lock for `root`
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexLocked`] if another session holds it
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(MediaspanError::IndexLocked(root.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "acquired={}", Utc::now().to_rfc3339())?;
        debug!("Acquired index lock {:?}", path);

        Ok(Self { path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release index lock {:?}: {}", self.path, e);
        }
    }
}

/// Handle on an index directory
#[derive(Debug)]
pub struct UnitIndex {
    root: PathBuf,
    metadata: RwLock<IndexMetadata>,
}

impl UnitIndex {
    /// Create a new index directory
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexAlreadyExists`] if `root` already holds an index
    /// - [`MediaspanError::InvalidConfiguration`] if `config` fails validation
    #[instrument(skip(config))]
    pub fn init(root: PathBuf, mut config: ArchiveConfig) -> Result<Self> {
        if root.join(METADATA_FILE).exists() {
            return Err(MediaspanError::IndexAlreadyExists(root));
        }
        config.validate()?;
        config.version = env!("CARGO_PKG_VERSION").to_string();

        fs::create_dir_all(root.join(UNITS_DIR))?;

        let now = Utc::now();
        let metadata = IndexMetadata {
            format_version: INDEX_FORMAT_VERSION,
            mediaspan_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            last_accessed: now,
            config,
        };
        utils::atomic_write(&root.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?.as_bytes())?;

        info!("Initialized index at {:?}", root);
        Ok(Self {
            root,
            metadata: RwLock::new(metadata),
        })
    }

    /// Open an existing index directory
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexNotInitialized`] if there is no index at `root`
    /// - [`MediaspanError::IndexCorrupt`] if `metadata.json` cannot be parsed
    #[instrument]
    pub fn open(root: PathBuf) -> Result<Self> {
        let metadata_path = root.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(MediaspanError::IndexNotInitialized(root));
        }

        let json = fs::read_to_string(&metadata_path)?;
        let mut metadata: IndexMetadata =
            serde_json::from_str(&json).map_err(|e| MediaspanError::corrupt(&metadata_path, e.to_string()))?;

        if metadata.format_version > INDEX_FORMAT_VERSION {
            return Err(MediaspanError::corrupt(
                &metadata_path,
                format!(
                    "format version {} is newer than supported version {}",
                    metadata.format_version, INDEX_FORMAT_VERSION
                ),
            ));
        }

        metadata.last_accessed = Utc::now();
        fs::create_dir_all(root.join(UNITS_DIR))?;

        let index = Self {
            root,
            metadata: RwLock::new(metadata),
        };
        index.write_metadata()?;
        Ok(index)
    }

    /// Index root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy of the current metadata
    pub fn metadata(&self) -> IndexMetadata {
        self.metadata.read().clone()
    }

    /// Copy of the archive set configuration
    pub fn config(&self) -> ArchiveConfig {
        self.metadata.read().config.clone()
    }

    /// Modify and persist the metadata
    pub fn update_metadata<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut IndexMetadata),
    {
        {
            let mut metadata = self.metadata.write();
            updater(&mut metadata);
            metadata.last_accessed = Utc::now();
        }
        self.write_metadata()
    }

    fn write_metadata(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.metadata.read())?;
        utils::atomic_write(&self.root.join(METADATA_FILE), json.as_bytes())
    }

    /// Path of a unit's record
    pub fn unit_path(&self, unit: &DestinationUnit) -> PathBuf {
        self.root.join(UNITS_DIR).join(unit.index_file_name())
    }

    /// Load every unit record
    ///
    /// Counters are recomputed from each record's file list. Units are
    /// returned in ascending unit-number order.
    ///
    /// # Errors
    ///
    /// - [`MediaspanError::IndexCorrupt`] if a record fails to parse, fails its
    ///   structural check, repeats a unit number, or lists a path another unit
    ///   already holds
    #[instrument(skip(self))]
    pub fn load_units(&self) -> Result<Vec<DestinationUnit>> {
        let units_dir = self.root.join(UNITS_DIR);
        let mut paths: Vec<PathBuf> = fs::read_dir(&units_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut units = Vec::with_capacity(paths.len());
        let mut numbers: HashMap<u32, PathBuf> = HashMap::with_capacity(paths.len());
        let mut owners = HashSet::new();

        for path in paths {
            let json = fs::read_to_string(&path)?;
            let mut unit: DestinationUnit =
                serde_json::from_str(&json).map_err(|e| MediaspanError::corrupt(&path, e.to_string()))?;

            unit.validate(&path)?;
            unit.sync_stats(true);
            unit.mark_persisted();

            if let Some(previous) = numbers.insert(unit.unit_number, path.clone()) {
                return Err(MediaspanError::corrupt(
                    &path,
                    format!("unit number {} is also used by {:?}", unit.unit_number, previous),
                ));
            }

            for file in unit.committed_files() {
                if !owners.insert(file.key()) {
                    return Err(MediaspanError::corrupt(
                        &path,
                        format!("{} is already recorded on another unit", file.relative_path),
                    ));
                }
            }

            debug!(
                "Loaded {} with {} files ({})",
                unit.name(),
                unit.total_files(),
                utils::format_bytes(unit.data_size())
            );
            units.push(unit);
        }

        units.sort_by_key(|u| u.unit_number);
        info!("Loaded {} units from {:?}", units.len(), units_dir);
        Ok(units)
    }

    /// Persist a unit's committed state
    pub fn save_unit(&self, unit: &mut DestinationUnit) -> Result<()> {
        let snapshot = unit.take_snapshot(false);
        let json = serde_json::to_string_pretty(&snapshot)?;
        utils::atomic_write(&self.unit_path(unit), json.as_bytes())?;
        unit.mark_persisted();
        debug!("Saved {} ({} committed files)", unit.name(), snapshot.total_files());
        Ok(())
    }

    /// Persist every unit that has something to record
    ///
    /// Units minted this session that hold no committed files yet are skipped;
    /// their pending assignments are recomputed on the next run.
    pub fn save_units(&self, units: &mut [DestinationUnit]) -> Result<usize> {
        let mut saved = 0;
        for unit in units.iter_mut() {
            if unit.is_new() && unit.total_files() == 0 {
                continue;
            }
            self.save_unit(unit)?;
            saved += 1;
        }
        Ok(saved)
    }
}
