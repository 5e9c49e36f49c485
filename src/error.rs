//! Error types for the mediaspan library
//!
//! This module defines all error types that can occur while scanning a source
//! tree, sizing and allocating files, and persisting the unit index. Errors
//! fall into two groups:
//!
//! - **Per-file errors** ([`MediaspanError::SourceNotFound`],
//!   [`MediaspanError::DeviceCapacityMismatch`]) are recovered by the stage that
//!   raised them: the file is skipped and counted, and the run continues.
//! - **Run-level errors** ([`MediaspanError::CapacityExhausted`],
//!   [`MediaspanError::IndexCorrupt`], lock and configuration errors) propagate
//!   to the caller and abort the run.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the mediaspan library
pub type Result<T> = std::result::Result<T, MediaspanError>;

/// Main error type for all mediaspan operations
#[derive(Debug, Error)]
pub enum MediaspanError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A source file vanished between enumeration and stat
    #[error("Source not found: {path:?}")]
    SourceNotFound {
        /// Path that could no longer be read
        path: PathBuf,
    },

    /// A single file is larger than any unit can ever hold
    #[error("Capacity exhausted: {path:?} ({size} bytes) does not fit on any unit (max {max_capacity} bytes)")]
    CapacityExhausted {
        /// Path to the oversized file
        path: PathBuf,
        /// Size of the file in bytes
        size: u64,
        /// Largest file an empty unit could accept
        max_capacity: u64,
    },

    /// A persisted unit record failed to parse or failed a sanity check
    #[error("Index corrupt: {path:?}: {reason}")]
    IndexCorrupt {
        /// Index file that failed
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// The destination media had less room than the allocator assumed
    #[error("Device capacity mismatch on unit {unit}: {path} needs {needed} bytes but the device ran out ({available} bytes were assumed usable)")]
    DeviceCapacityMismatch {
        /// Unit number being written
        unit: u32,
        /// Relative path of the file that failed to copy
        path: String,
        /// Bytes the file needed on the media
        needed: u64,
        /// Bytes the allocator believed were still usable
        available: u64,
    },

    /// Unit number not present in the live unit list
    #[error("Unit not found: {0}")]
    UnitNotFound(u32),

    /// File is not tracked by the given unit
    #[error("File {path} is not assigned to unit {unit}")]
    FileNotInUnit {
        /// Unit number searched
        unit: u32,
        /// Relative path looked up
        path: String,
    },

    /// File is already tracked by a unit
    #[error("File {path} is already assigned to unit {unit}")]
    AlreadyAssigned {
        /// Relative path of the file
        path: String,
        /// Unit that already holds it
        unit: u32,
    },

    /// Index directory has not been initialized
    #[error("Index not initialized at path: {0:?}")]
    IndexNotInitialized(PathBuf),

    /// Index directory already exists
    #[error("Index already exists at path: {0:?}")]
    IndexAlreadyExists(PathBuf),

    /// Another session holds the index lock
    #[error("Index is locked by another session: {0:?}")]
    IndexLocked(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation was cancelled through a cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaspanError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        MediaspanError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        MediaspanError::InvalidConfiguration(msg.into())
    }

    /// Create an index corruption error for a file
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MediaspanError::IndexCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error only affects a single file and the run can continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MediaspanError::SourceNotFound { .. } | MediaspanError::DeviceCapacityMismatch { .. }
        )
    }

    /// Check if this error indicates a damaged index
    pub fn is_corruption(&self) -> bool {
        matches!(self, MediaspanError::IndexCorrupt { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            MediaspanError::CapacityExhausted { path, size, max_capacity } => {
                format!(
                    "File {:?} is {} bytes but an empty unit can hold at most {} bytes. \
                     Exclude the file or configure larger media.",
                    path, size, max_capacity
                )
            }
            MediaspanError::IndexCorrupt { path, reason } => {
                format!(
                    "Index file {:?} is damaged ({}). Restore it from a backup of the index \
                     before running again.",
                    path, reason
                )
            }
            MediaspanError::IndexNotInitialized(path) => {
                format!("No index at {:?}. Run 'mediaspan init' first.", path)
            }
            MediaspanError::IndexLocked(path) => {
                format!(
                    "Another session is using the index at {:?}. Wait for it to finish, \
                     or remove the stale lock file if no session is running.",
                    path
                )
            }
            MediaspanError::DeviceCapacityMismatch { unit, .. } => {
                format!(
                    "{} Unit {} has been marked full until it is verified again.",
                    self, unit
                )
            }
            _ => self.to_string(),
        }
    }
}
