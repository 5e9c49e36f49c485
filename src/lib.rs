//! # mediaspan - Spread a growing file collection across removable media
//!
//! An archive allocator and set manager for backups that outgrow any single
//! disc, cold-storage drive or tape.
//!
//! ## Overview
//!
//! mediaspan keeps an index of every file it has archived and which unit of
//! media holds it. Each run:
//! - Scans the source trees and diffs them against the index
//! - Sizes the newly discovered files in parallel
//! - Assigns them first-fit to existing units, minting new units as needed
//! - Copies one unit's assignments onto mounted media and records digests
//! - Re-hashes written units to track when each was last verified
//!
//! ## Architecture
//!
//! - **Index**: one JSON record per unit under an index directory, written
//!   atomically and guarded by an exclusive lock file
//! - **Session**: a [`ScanSession`] holds the loaded units, a
//!   case-insensitive path lookup and the staging list of new files
//! - **Capacity policies**: block-aligned accounting for CSD and tape units,
//!   a flat limit for discs, with reserved headroom on every unit
//! - **Pending vs committed**: allocation only stages files on a unit; a file
//!   is committed once it has been copied and hashed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mediaspan::{Archiver, ArchiveConfig, MediaKind};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ArchiveConfig::for_media(MediaKind::Disc, 25_025_314_816, 2048);
//! config.source_paths = vec![PathBuf::from("/srv/photos")];
//!
//! let archiver = Archiver::init(PathBuf::from("/var/lib/mediaspan"), config)?;
//!
//! // Scan, size and allocate; nothing is persisted yet
//! let plan = archiver.plan()?;
//! print!("{}", plan.summary());
//!
//! // Burn the first unit's files to a mounted disc image
//! let report = archiver.write_unit(1, "/mnt/disc")?;
//! println!("Wrote {} files", report.files_written);
//!
//! // Later: check the media is still readable
//! let verification = archiver.verify_unit(1, "/mnt/disc")?;
//! println!("{}", verification.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Units
//!
//! A [`DestinationUnit`] is one physical piece of media. Its capacity check
//! counts committed and pending bytes rounded up to the unit's block size and
//! keeps `reserved_capacity_bytes` free. Units are append-only: a file once
//! assigned is never moved to another unit.
//!
//! ### Paths
//!
//! Paths are compared case-insensitively after canonicalization to forward
//! slashes. A file's relative path is its full path without the drive or
//! share prefix, so the same tree archived from two mounts maps to the same
//! records.
//!
//! ### Content changes
//!
//! Only new paths are archived. A file whose content changes while its path
//! stays the same is considered already archived.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, MediaspanError>`. Per-file problems met
//! while scanning or sizing are logged and counted rather than returned.
//!
//! ## Module Organization
//!
//! - [`archiver`]: the [`Archiver`] session and its builder
//! - [`scanner`], [`sizer`], [`allocator`]: the planning stages
//! - [`writer`], [`verification`]: the media stages
//! - [`unit`], [`tape`]: unit capacity and statistics
//! - [`index`]: persistence and locking
//! - [`renames`], [`search`], [`summary`]: reporting helpers
//! - [`types`]: configuration, progress and cancellation types
//! - [`error`]: error types

pub mod allocator;
pub mod archiver;
pub mod collections;
pub mod error;
pub mod index;
pub mod renames;
pub mod scanner;
pub mod search;
pub mod session;
pub mod sizer;
pub mod source_file;
pub mod summary;
pub mod tape;
pub mod types;
pub mod unit;
pub mod utils;
pub mod verification;
pub mod writer;

pub use allocator::{AllocationReport, Allocator};
pub use archiver::{ArchivePlan, ArchiveStatus, Archiver, ArchiverBuilder};
pub use error::{MediaspanError, Result};
pub use index::UnitIndex;
pub use renames::RenameCandidate;
pub use search::SearchHit;
pub use session::{FreeSpaceCheck, IndexEntry, ScanSession};
pub use source_file::SourceFileRecord;
pub use summary::ArchiveSummary;
pub use types::*;
pub use unit::{DestinationUnit, VerificationResult};
pub use verification::{UnitVerificationReport, UnitVerifier};
pub use writer::{UnitWriter, WriteReport};
