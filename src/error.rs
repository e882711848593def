//! Error taxonomy of the stacking engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::LevelKey;

/// Failures of the pyramid level store and its backing storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scratch directory {} is not usable: {source}", .path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spill {key} to {}: {source}", .path.display())]
    Spill {
        key: LevelKey,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reload {key} from {}: {source}", .path.display())]
    Reload {
        key: LevelKey,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete scratch data at {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spill file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("backing store rejected {key}: {reason}")]
    Rejected { key: LevelKey, reason: String },

    #[error("{0} is not present in the store")]
    Missing(LevelKey),
}

/// Terminal failures of a stacking run.
///
/// Per-image alignment problems are not errors; they are reported as
/// [`crate::alignment::AlignmentWarning`]s alongside a successful result.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("no input images")]
    EmptyInput,

    #[error("image {index} ({}) could not be read: {reason}", .path.display())]
    Unreadable {
        index: usize,
        path: PathBuf,
        reason: String,
    },

    #[error(
        "image {index} is {}x{} but the stack is {}x{}",
        .found.0, .found.1, .expected.0, .expected.1
    )]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("reference index {index} is out of range for {count} images")]
    InvalidReference { index: usize, count: usize },

    #[error("reference image {index} failed: {reason}")]
    ReferenceFailure { index: usize, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("run cancelled")]
    Cancelled,

    #[error("a run is already in progress")]
    Busy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl StackError {
    /// Input problems detected before any pipeline stage ran.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            StackError::EmptyInput
                | StackError::Unreadable { .. }
                | StackError::DimensionMismatch { .. }
                | StackError::InvalidReference { .. }
        )
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, StackError::Storage(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StackError::Cancelled)
    }
}
