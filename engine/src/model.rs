//! Core data model for the transfer worklist.
//!
//! This module defines the main data structures shared by every component:
//! - TransferItem: one atomic filesystem action tracked by the Transfer List
//! - ItemKind, ItemStatus, Mode: enums describing what an item does and where it is
//! - EngineState: the controller state machine
//! - TransferStat: aggregate progress snapshot

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collision::Resolution;
use crate::error::ErrorKind;

/// Stable identifier of a transfer item within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        ItemId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the copy/move request an item originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The operation mode of a request. Inherited by every item it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Copy files; source remains unchanged
    Copy,
    /// Move files; source deleted after a successful transfer
    Move,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Copy => write!(f, "copy"),
            Mode::Move => write!(f, "move"),
        }
    }
}

/// What a transfer item does on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Transfer the bytes of one file
    File,
    /// Create a destination folder before its children
    FolderCreate,
    /// Remove an emptied source folder after its children (move only)
    FolderRemove,
}

/// The state of an individual item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for a worker (or for a collision decision)
    Pending,
    /// Held by a worker
    InProgress,
    /// Held by a worker that halted at a block boundary
    Paused,
    /// Fully transferred
    Done,
    /// Not transferred because of a policy, a decision or a user skip
    Skipped,
    /// Failed; may still be recovered by the error policy
    Error,
    /// Stopped by a cancel
    Canceled,
}

impl ItemStatus {
    /// Returns true if no worker will touch this item again without an explicit requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Done | ItemStatus::Skipped | ItemStatus::Error | ItemStatus::Canceled
        )
    }

    /// Returns true while a worker holds the item.
    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::InProgress | ItemStatus::Paused)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in progress",
            ItemStatus::Paused => "paused",
            ItemStatus::Done => "done",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Error => "error",
            ItemStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// One filesystem action.
///
/// Items are exclusively owned by the Transfer List. Workers only ever see a
/// copy of the paths they need and report back through the controller, which
/// performs every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    /// Unique identifier, stable for the session
    pub id: ItemId,

    /// File, folder creation or folder removal
    pub kind: ItemKind,

    /// Full source path
    pub source_path: PathBuf,

    /// Full destination path (may be rewritten by a rename decision)
    pub destination_path: PathBuf,

    /// File size in bytes (0 for folder markers)
    pub size_bytes: u64,

    /// Bytes committed to the destination so far
    pub bytes_transferred: u64,

    /// Current state of this item
    pub status: ItemStatus,

    /// Copy or Move, inherited from the request
    pub mode: Mode,

    /// Request this item belongs to
    pub request: RequestId,

    /// Collision or error decision already made for this item
    pub decision: Option<Resolution>,

    /// True once collision handling has run; retries skip it
    #[serde(default)]
    pub resolved: bool,

    /// Number of times the item was put back at the end of the list
    #[serde(default)]
    pub attempts: u32,

    /// Classification of the last failure
    pub error_kind: Option<ErrorKind>,

    /// Human-readable message of the last failure
    pub error_message: Option<String>,

    /// Whether the destination digest matched the source (None if not checked)
    pub verified: Option<bool>,
}

impl TransferItem {
    fn new(
        kind: ItemKind,
        request: RequestId,
        mode: Mode,
        source_path: PathBuf,
        destination_path: PathBuf,
        size_bytes: u64,
    ) -> Self {
        TransferItem {
            id: ItemId::new(),
            kind,
            source_path,
            destination_path,
            size_bytes,
            bytes_transferred: 0,
            status: ItemStatus::Pending,
            mode,
            request,
            decision: None,
            resolved: false,
            attempts: 0,
            error_kind: None,
            error_message: None,
            verified: None,
        }
    }

    pub fn file(
        request: RequestId,
        mode: Mode,
        source_path: PathBuf,
        destination_path: PathBuf,
        size_bytes: u64,
    ) -> Self {
        Self::new(ItemKind::File, request, mode, source_path, destination_path, size_bytes)
    }

    pub fn folder_create(
        request: RequestId,
        mode: Mode,
        source_path: PathBuf,
        destination_path: PathBuf,
    ) -> Self {
        Self::new(ItemKind::FolderCreate, request, mode, source_path, destination_path, 0)
    }

    pub fn folder_remove(
        request: RequestId,
        mode: Mode,
        source_path: PathBuf,
        destination_path: PathBuf,
    ) -> Self {
        Self::new(ItemKind::FolderRemove, request, mode, source_path, destination_path, 0)
    }

    /// Highest progress shown before the item is Done. Only completion
    /// brings `bytes_transferred` up to `size_bytes`.
    pub fn progress_cap(&self) -> u64 {
        self.size_bytes.saturating_sub(1)
    }

    /// Record a progress report, keeping `bytes_transferred` monotonic and
    /// below `size_bytes`. Returns true if the value changed.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        let next = bytes.max(self.bytes_transferred).min(self.progress_cap());
        if next == self.bytes_transferred {
            return false;
        }
        self.bytes_transferred = next;
        true
    }

    /// True if `path` lies strictly below this item's source path.
    pub fn contains_source(&self, path: &Path) -> bool {
        path != self.source_path && path.starts_with(&self.source_path)
    }

    /// Name shown to users: the last component of the source path.
    pub fn display_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_path.display().to_string())
    }
}

/// State of the Engine Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No request received yet (or reset)
    Idle,
    /// Sources are being expanded, nothing executable yet
    Scanning,
    /// Workers are draining the list
    Transferring,
    /// Workers are halted at a block boundary
    Paused,
    /// Every item reached a final state
    Completed,
    /// Stopped by the user
    Canceled,
    /// Stopped by an unrecoverable condition
    Error,
}

impl EngineState {
    /// Returns true for states that only `reset` leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Canceled | EngineState::Error)
    }

    /// Returns true while new requests are accepted.
    pub fn accepts_requests(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Scanning => "scanning",
            EngineState::Transferring => "transferring",
            EngineState::Paused => "paused",
            EngineState::Completed => "completed",
            EngineState::Canceled => "canceled",
            EngineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Aggregate snapshot of the worklist, recomputed periodically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStat {
    /// Sum of all planned file sizes
    pub bytes_total: u64,
    /// Sum of committed bytes over all items
    pub bytes_transferred: u64,
    /// Bytes actually written, including re-copies after a requeue
    pub real_bytes_transferred: u64,
    /// Items in a final state (done or skipped count as done)
    pub items_done: usize,
    /// Items in the list
    pub items_total: usize,
    /// Items skipped (included in `items_done`)
    pub items_skipped: usize,
    /// Items currently in error
    pub items_failed: usize,
    /// Bytes per second over the recent window
    pub throughput: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(size: u64) -> TransferItem {
        TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src/a.txt"),
            PathBuf::from("/dst/a.txt"),
            size,
        )
    }

    #[test]
    fn test_record_progress_is_monotonic_and_bounded() {
        let mut item = sample_file(100);
        assert!(item.record_progress(40));
        assert!(!item.record_progress(10), "progress must never go backwards");
        assert_eq!(item.bytes_transferred, 40);
        assert!(item.record_progress(500));
        assert_eq!(item.bytes_transferred, 99, "only completion reaches the item size");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ItemStatus::Done.is_terminal());
        assert!(ItemStatus::Canceled.is_terminal());
        assert!(!ItemStatus::Paused.is_terminal());
        assert!(ItemStatus::Paused.is_active());
        assert!(EngineState::Canceled.is_terminal());
        assert!(EngineState::Completed.accepts_requests());
    }

    #[test]
    fn test_contains_source() {
        let folder = TransferItem::folder_create(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        );
        assert!(folder.contains_source(Path::new("/src/dir/file")));
        assert!(!folder.contains_source(Path::new("/src/dir")));
        assert!(!folder.contains_source(Path::new("/src/directory")));
    }
}
