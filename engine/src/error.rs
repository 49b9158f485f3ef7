//! Error types for the transfer engine.
//!
//! Three layers of failure are kept apart:
//! - `EngineError`: a call on the engine was rejected (bad configuration,
//!   wrong state, unreadable transfer list). Nothing was mutated.
//! - `ScanError`: one source path could not be expanded. The scan goes on.
//! - `TransferError`: one item failed while executing. It is recorded on the
//!   item and routed through the error-recovery policy.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collision::{CollisionClass, Resolution};
use crate::model::{EngineState, ItemId, ItemStatus, Mode};

/// Classification carried by `itemError` events and persisted on items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A source could not be read while scanning
    Scan,
    /// Read, write, rename or permission failure
    Io,
    /// Destination digest differs from the source digest
    ChecksumMismatch,
    /// The digest could not be computed
    ChecksumUnavailable,
    /// Destination full or over quota
    Capacity,
    /// Invalid engine setting
    Configuration,
}

/// Errors returned synchronously by engine calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("option `{key}` has a malformed value: {reason}")]
    OptionValue { key: String, reason: String },

    #[error("failed to access options file {}", path.display())]
    OptionsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no source given")]
    NoSources,

    #[error("a destination is required")]
    MissingDestination,

    #[error("destination directory does not exist: {}", path.display())]
    DestinationNotFound { path: PathBuf },

    #[error("the engine is forced to {forced}, a {requested} request is rejected")]
    ForcedMode { forced: Mode, requested: Mode },

    #[error("the mode was already forced to {0}")]
    ModeAlreadyForced(Mode),

    #[error("the engine is {0} and does not accept this call")]
    InvalidState(EngineState),

    #[error("failed to read transfer list {}", path.display())]
    TransferListRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write transfer list {}", path.display())]
    TransferListWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed transfer list {}: {source}", path.display())]
    TransferListFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("transfer list {} has unsupported version {version}", path.display())]
    TransferListVersion { path: PathBuf, version: u32 },

    #[error("item {0} is not waiting for a decision")]
    NoPendingDecision(ItemId),

    #[error("{resolution:?} does not answer a {class} decision")]
    UnsuitableResolution {
        class: CollisionClass,
        resolution: Resolution,
    },

    #[error(transparent)]
    List(#[from] ListError),

    #[error("failed to start engine threads")]
    Spawn(#[source] io::Error),

    #[error("the engine control thread has stopped")]
    Disconnected,
}

/// Rejected mutations of the Transfer List.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListError {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),

    #[error("item {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },
}

/// Errors raised while expanding a source path.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("source not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("symbolic link to a directory is not followed: {}", path.display())]
    SymlinkToDirectory { path: PathBuf },

    #[error("source has no file name: {}", path.display())]
    NoFileName { path: PathBuf },
}

impl ScanError {
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ScanError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ScanError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// The source path the error is about.
    pub fn path(&self) -> &Path {
        match self {
            ScanError::NotFound { path }
            | ScanError::Unreadable { path, .. }
            | ScanError::SymlinkToDirectory { path }
            | ScanError::NoFileName { path } => path,
        }
    }
}

/// Errors that fail a single item.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("destination is full: {}", path.display())]
    Capacity {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove source {}: {source}", path.display())]
    RemoveSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to apply metadata to {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} changed during the transfer: expected {expected} bytes, read {actual}", path.display())]
    SourceChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {}: source {expected}, destination {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cannot compute checksum of {}: {source}", path.display())]
    ChecksumUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Build a write error, recognizing a full destination.
    pub(crate) fn write(path: &Path, source: io::Error) -> Self {
        if is_capacity_error(&source) {
            TransferError::Capacity {
                path: path.to_path_buf(),
                source,
            }
        } else {
            TransferError::Write {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub(crate) fn read(path: &Path, source: io::Error) -> Self {
        TransferError::Read {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            TransferError::ChecksumUnavailable { .. } => ErrorKind::ChecksumUnavailable,
            TransferError::Capacity { .. } => ErrorKind::Capacity,
            _ => ErrorKind::Io,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            TransferError::Read { source, .. }
            | TransferError::Write { source, .. }
            | TransferError::Capacity { source, .. }
            | TransferError::CreateDirectory { source, .. }
            | TransferError::RemoveSource { source, .. }
            | TransferError::Metadata { source, .. }
            | TransferError::ChecksumUnavailable { source, .. } => source.raw_os_error(),
            TransferError::SourceChanged { .. } | TransferError::ChecksumMismatch { .. } => None,
        }
    }
}

fn is_capacity_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_from_not_found() {
        let err = ScanError::from_io(
            Path::new("/missing"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, ScanError::NotFound { .. }));
        assert_eq!(err.path(), Path::new("/missing"));
    }

    #[test]
    fn test_write_error_classifies_capacity() {
        let full = TransferError::write(
            Path::new("/dst/a"),
            io::Error::from(io::ErrorKind::StorageFull),
        );
        assert_eq!(full.kind(), ErrorKind::Capacity);

        let denied = TransferError::write(
            Path::new("/dst/a"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_list_error_converts_into_engine_error() {
        let id = ItemId::new();
        let err: EngineError = ListError::UnknownItem(id).into();
        assert!(err.to_string().contains(&id.to_string()));
    }
}
