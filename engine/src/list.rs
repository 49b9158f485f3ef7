//! Transfer List.
//!
//! The ordered worklist owned by the control thread. Order is priority: idle
//! workers are offered the first dispatchable Pending item. Every status
//! change goes through [`TransferList::transition`], which rejects moves the
//! item lifecycle does not allow.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collision::Resolution;
use crate::error::{EngineError, ErrorKind, ListError, ScanError};
use crate::model::{ItemId, ItemKind, ItemStatus, Mode, RequestId, TransferItem, TransferStat};

/// Version written in exported transfer lists.
pub const TRANSFER_LIST_VERSION: u32 = 1;

fn transition_allowed(from: ItemStatus, to: ItemStatus) -> bool {
    use ItemStatus::*;
    if from == to {
        return true;
    }
    match from {
        Pending => matches!(to, InProgress | Skipped | Canceled | Done | Error),
        InProgress => matches!(to, Paused | Done | Skipped | Error | Canceled),
        Paused => matches!(to, InProgress | Done | Skipped | Error | Canceled),
        Error => matches!(to, Pending | Skipped | Canceled),
        Done | Skipped | Canceled => false,
    }
}

/// `path` moved from under `old_root` to under `new_root`, if it lies
/// strictly below `old_root`.
pub(crate) fn rebase(path: &Path, old_root: &Path, new_root: &Path) -> Option<PathBuf> {
    match path.strip_prefix(old_root) {
        Ok(rest) if !rest.as_os_str().is_empty() => Some(new_root.join(rest)),
        _ => None,
    }
}

/// Ordered collection of transfer items.
#[derive(Debug, Clone, Default)]
pub struct TransferList {
    items: Vec<TransferItem>,
    /// Position of every item in `items`
    index: HashMap<ItemId, usize>,
}

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransferItem> {
        self.items.iter()
    }

    pub fn get(&self, id: ItemId) -> Option<&TransferItem> {
        self.index.get(&id).map(|&index| &self.items[index])
    }

    fn index_of(&self, id: ItemId) -> Result<usize, ListError> {
        self.index.get(&id).copied().ok_or(ListError::UnknownItem(id))
    }

    /// Rebuild the id index after items changed places.
    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| (item.id, position))
            .collect();
    }

    fn item_mut(&mut self, id: ItemId) -> Result<&mut TransferItem, ListError> {
        let index = self.index_of(id)?;
        Ok(&mut self.items[index])
    }

    /// Append an item at the tail.
    pub fn append(&mut self, item: TransferItem) -> ItemId {
        let id = item.id;
        self.index.insert(id, self.items.len());
        self.items.push(item);
        id
    }

    /// Change the status of one item. Returns the previous status.
    pub fn transition(&mut self, id: ItemId, to: ItemStatus) -> Result<ItemStatus, ListError> {
        let item = self.item_mut(id)?;
        let from = item.status;
        if !transition_allowed(from, to) {
            return Err(ListError::InvalidTransition { id, from, to });
        }
        item.status = to;
        Ok(from)
    }

    /// Record committed bytes. Returns the visible value if it changed.
    pub fn record_progress(&mut self, id: ItemId, bytes: u64) -> Result<Option<u64>, ListError> {
        let item = self.item_mut(id)?;
        Ok(item.record_progress(bytes).then_some(item.bytes_transferred))
    }

    /// Replace the planned size with the size found when the file was opened.
    pub fn set_size(&mut self, id: ItemId, size: u64) -> Result<(), ListError> {
        let item = self.item_mut(id)?;
        item.size_bytes = size;
        item.bytes_transferred = item.bytes_transferred.min(item.progress_cap());
        Ok(())
    }

    /// Mark an item Done with `bytes` as its final size.
    pub fn complete(&mut self, id: ItemId, bytes: u64, verified: Option<bool>) -> Result<(), ListError> {
        self.transition(id, ItemStatus::Done)?;
        let item = self.item_mut(id)?;
        item.size_bytes = bytes;
        item.bytes_transferred = bytes;
        item.verified = verified;
        item.error_kind = None;
        item.error_message = None;
        Ok(())
    }

    /// Mark an item Error and keep the failure on it.
    pub fn fail(&mut self, id: ItemId, kind: ErrorKind, message: String) -> Result<(), ListError> {
        self.transition(id, ItemStatus::Error)?;
        let item = self.item_mut(id)?;
        item.error_kind = Some(kind);
        item.error_message = Some(message);
        if kind == ErrorKind::ChecksumMismatch {
            item.verified = Some(false);
        }
        Ok(())
    }

    /// Put a failed item back at the tail as Pending.
    ///
    /// Committed bytes are kept so the retry resumes from them.
    pub fn requeue(&mut self, id: ItemId) -> Result<(), ListError> {
        self.transition(id, ItemStatus::Pending)?;
        let index = self.index_of(id)?;
        let mut item = self.items.remove(index);
        item.attempts += 1;
        item.error_kind = None;
        item.error_message = None;
        self.items.push(item);
        self.reindex();
        Ok(())
    }

    pub fn set_decision(&mut self, id: ItemId, decision: Resolution) -> Result<(), ListError> {
        self.item_mut(id)?.decision = Some(decision);
        Ok(())
    }

    pub fn mark_resolved(&mut self, id: ItemId) -> Result<(), ListError> {
        self.item_mut(id)?.resolved = true;
        Ok(())
    }

    /// Rewrite an item's destination.
    ///
    /// For a folder, the Pending items of the same request lying under the
    /// folder's source follow it, including its `FolderRemove`. Items held by
    /// a worker keep the path they are being written to.
    pub fn redirect(&mut self, id: ItemId, destination: PathBuf) -> Result<(), ListError> {
        let folder = self.item_mut(id)?;
        folder.destination_path = destination.clone();
        if folder.kind != ItemKind::FolderCreate {
            return Ok(());
        }
        let (source, request) = (folder.source_path.clone(), folder.request);
        for item in self.items.iter_mut() {
            if item.id == id || item.request != request || item.status != ItemStatus::Pending {
                continue;
            }
            if item.kind == ItemKind::FolderRemove && item.source_path == source {
                item.destination_path = destination.clone();
            } else if let Some(moved) = rebase(&item.source_path, &source, &destination) {
                item.destination_path = moved;
            }
        }
        Ok(())
    }

    /// Skip every Pending item of the folder's request lying under its
    /// source, including the matching `FolderRemove`. Returns the skipped ids.
    pub fn skip_subtree(&mut self, folder: ItemId) -> Result<Vec<ItemId>, ListError> {
        let folder_item = self.get(folder).ok_or(ListError::UnknownItem(folder))?.clone();
        let mut skipped = Vec::new();
        for item in self.items.iter_mut() {
            if item.id == folder
                || item.request != folder_item.request
                || item.status != ItemStatus::Pending
            {
                continue;
            }
            let under = folder_item.contains_source(&item.source_path);
            let own_remove =
                item.kind == ItemKind::FolderRemove && item.source_path == folder_item.source_path;
            if under || own_remove {
                item.status = ItemStatus::Skipped;
                skipped.push(item.id);
            }
        }
        Ok(skipped)
    }

    /// Remove items from the list. Items held InProgress are left alone.
    /// Returns the removed items.
    pub fn remove(&mut self, ids: &[ItemId]) -> Vec<TransferItem> {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if wanted.contains(&item.id) && item.status != ItemStatus::InProgress {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        self.reindex();
        removed
    }

    fn movable(&self, ids: &[ItemId]) -> HashSet<ItemId> {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();
        self.items
            .iter()
            .filter(|item| wanted.contains(&item.id) && item.status != ItemStatus::InProgress)
            .map(|item| item.id)
            .collect()
    }

    /// Move the selected items to the head, keeping their relative order.
    pub fn move_top(&mut self, ids: &[ItemId]) {
        let selected = self.movable(ids);
        let (mut head, tail): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| selected.contains(&item.id));
        head.extend(tail);
        self.items = head;
        self.reindex();
    }

    /// Move the selected items to the tail, keeping their relative order.
    pub fn move_bottom(&mut self, ids: &[ItemId]) {
        let selected = self.movable(ids);
        let (tail, mut head): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| selected.contains(&item.id));
        head.extend(tail);
        self.items = head;
        self.reindex();
    }

    /// Move each selected item one slot towards the head.
    pub fn move_up(&mut self, ids: &[ItemId]) {
        let selected = self.movable(ids);
        for i in 1..self.items.len() {
            if selected.contains(&self.items[i].id) && !selected.contains(&self.items[i - 1].id) {
                self.items.swap(i - 1, i);
            }
        }
        self.reindex();
    }

    /// Move each selected item one slot towards the tail.
    pub fn move_down(&mut self, ids: &[ItemId]) {
        let selected = self.movable(ids);
        for i in (0..self.items.len().saturating_sub(1)).rev() {
            if selected.contains(&self.items[i].id) && !selected.contains(&self.items[i + 1].id) {
                self.items.swap(i, i + 1);
            }
        }
        self.reindex();
    }

    /// The first Pending item that may start now.
    ///
    /// Items waiting for a decision are passed over. An item is held back
    /// while a `FolderCreate` above it is not finished, and a `FolderRemove`
    /// is held back while anything below it is not finished.
    pub fn next_dispatchable(&self, awaiting: impl Fn(&ItemId) -> bool) -> Option<&TransferItem> {
        let open_folders: HashSet<(RequestId, &Path)> = self
            .items
            .iter()
            .filter(|item| item.kind == ItemKind::FolderCreate && !item.status.is_terminal())
            .map(|item| (item.request, item.source_path.as_path()))
            .collect();

        self.items.iter().find(|item| {
            if item.status != ItemStatus::Pending || awaiting(&item.id) {
                return false;
            }
            let parent_open = item
                .source_path
                .ancestors()
                .skip(1)
                .any(|ancestor| open_folders.contains(&(item.request, ancestor)));
            if parent_open {
                return false;
            }
            if item.kind == ItemKind::FolderRemove {
                return !self.items.iter().any(|other| {
                    other.id != item.id
                        && other.request == item.request
                        && !other.status.is_terminal()
                        && other.source_path.starts_with(&item.source_path)
                });
            }
            true
        })
    }

    /// Aggregate counters. Throughput and real bytes are filled by the caller.
    pub fn stat(&self) -> TransferStat {
        let mut stat = TransferStat {
            items_total: self.items.len(),
            ..TransferStat::default()
        };
        for item in &self.items {
            stat.bytes_transferred += item.bytes_transferred;
            match item.status {
                ItemStatus::Done => {
                    stat.items_done += 1;
                    stat.bytes_total += item.size_bytes;
                }
                ItemStatus::Skipped => {
                    stat.items_done += 1;
                    stat.items_skipped += 1;
                    stat.bytes_total += item.bytes_transferred;
                }
                ItemStatus::Canceled => stat.bytes_total += item.bytes_transferred,
                ItemStatus::Error => {
                    stat.items_failed += 1;
                    stat.bytes_total += item.size_bytes;
                }
                _ => stat.bytes_total += item.size_bytes,
            }
        }
        stat
    }

    /// True while any item is Pending, InProgress or Paused.
    pub fn has_unfinished(&self) -> bool {
        self.items.iter().any(|item| !item.status.is_terminal())
    }

    /// True while an item sits in Error, waiting for recovery.
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|item| item.status == ItemStatus::Error)
    }

    /// `Some(with_error)` once every item of `request` is settled: Done,
    /// Skipped or Canceled. `with_error` is set if one of them was given up
    /// after a failure.
    pub fn request_outcome(&self, request: RequestId) -> Option<bool> {
        let mut with_error = false;
        for item in self.items.iter().filter(|item| item.request == request) {
            match item.status {
                ItemStatus::Done | ItemStatus::Canceled => {}
                ItemStatus::Skipped => with_error |= item.error_kind.is_some(),
                _ => return None,
            }
        }
        Some(with_error)
    }

    /// Cancel every Pending item. Returns their ids.
    pub fn cancel_pending(&mut self) -> Vec<ItemId> {
        self.items
            .iter_mut()
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| {
                item.status = ItemStatus::Canceled;
                item.id
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    /// Write every unfinished item to `path` as a Pending record.
    /// Returns the number of records written.
    pub fn export(&self, path: &Path) -> Result<usize, EngineError> {
        let file = TransferListFile {
            version: TRANSFER_LIST_VERSION,
            exported_at: Utc::now(),
            items: self
                .items
                .iter()
                .filter(|item| !item.status.is_terminal())
                .map(TransferRecord::from_item)
                .collect(),
        };
        let text = serde_json::to_string_pretty(&file).map_err(|source| {
            EngineError::TransferListFormat {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, text).map_err(|source| EngineError::TransferListWrite {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(file.items.len())
    }
}

/// One exported item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub kind: ItemKind,
    pub mode: Mode,
    pub size_bytes: u64,
    pub status: ItemStatus,
    #[serde(default)]
    pub decision: Option<Resolution>,
}

impl TransferRecord {
    pub fn from_item(item: &TransferItem) -> Self {
        TransferRecord {
            source_path: item.source_path.clone(),
            destination_path: item.destination_path.clone(),
            kind: item.kind,
            mode: item.mode,
            size_bytes: item.size_bytes,
            status: ItemStatus::Pending,
            decision: item.decision,
        }
    }

    /// Rebuild a Pending item, checking that the source still exists.
    /// File sizes are read again from disk.
    pub fn into_item(self, request: RequestId) -> Result<TransferItem, ScanError> {
        let metadata = fs::metadata(&self.source_path)
            .map_err(|e| ScanError::from_io(&self.source_path, e))?;
        let mut item = match self.kind {
            ItemKind::File => TransferItem::file(
                request,
                self.mode,
                self.source_path,
                self.destination_path,
                metadata.len(),
            ),
            ItemKind::FolderCreate => {
                TransferItem::folder_create(request, self.mode, self.source_path, self.destination_path)
            }
            ItemKind::FolderRemove => {
                TransferItem::folder_remove(request, self.mode, self.source_path, self.destination_path)
            }
        };
        item.decision = self.decision;
        Ok(item)
    }
}

/// On-disk shape of an exported transfer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferListFile {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub items: Vec<TransferRecord>,
}

/// Read and parse an exported transfer list.
pub fn read_transfer_list(path: &Path) -> Result<TransferListFile, EngineError> {
    let text = fs::read_to_string(path).map_err(|source| EngineError::TransferListRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file: TransferListFile =
        serde_json::from_str(&text).map_err(|source| EngineError::TransferListFormat {
            path: path.to_path_buf(),
            source,
        })?;
    if file.version != TRANSFER_LIST_VERSION {
        return Err(EngineError::TransferListVersion {
            path: path.to_path_buf(),
            version: file.version,
        });
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> TransferItem {
        TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src").join(name),
            PathBuf::from("/dst").join(name),
            size,
        )
    }

    fn list_of(names: &[&str]) -> (TransferList, Vec<ItemId>) {
        let mut list = TransferList::new();
        let ids = names.iter().map(|n| list.append(file(n, 10))).collect();
        (list, ids)
    }

    fn order(list: &TransferList) -> Vec<String> {
        list.iter().map(|i| i.display_name()).collect()
    }

    #[test]
    fn test_transitions_are_validated() {
        let (mut list, ids) = list_of(&["a"]);
        assert_eq!(list.transition(ids[0], ItemStatus::InProgress), Ok(ItemStatus::Pending));
        list.complete(ids[0], 10, None).expect("complete");
        assert!(matches!(
            list.transition(ids[0], ItemStatus::Pending),
            Err(ListError::InvalidTransition { .. })
        ));
        assert!(matches!(
            list.transition(ItemId::new(), ItemStatus::Done),
            Err(ListError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_complete_sets_size_and_bytes() {
        let (mut list, ids) = list_of(&["a"]);
        list.transition(ids[0], ItemStatus::InProgress).expect("start");
        list.record_progress(ids[0], 4).expect("progress");
        list.complete(ids[0], 12, Some(true)).expect("complete");
        let item = list.get(ids[0]).expect("item");
        assert_eq!((item.size_bytes, item.bytes_transferred), (12, 12));
        assert_eq!(item.verified, Some(true));
    }

    #[test]
    fn test_requeue_moves_to_tail_and_keeps_progress() {
        let (mut list, ids) = list_of(&["a", "b", "c"]);
        list.transition(ids[0], ItemStatus::InProgress).expect("start");
        list.record_progress(ids[0], 6).expect("progress");
        list.fail(ids[0], ErrorKind::Io, "disk hiccup".to_string()).expect("fail");
        list.requeue(ids[0]).expect("requeue");

        assert_eq!(order(&list), vec!["b", "c", "a"]);
        let item = list.get(ids[0]).expect("item");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.bytes_transferred, 6);
        assert_eq!(item.error_message, None);
    }

    #[test]
    fn test_move_up_and_down_preserve_relative_order() {
        let (mut list, ids) = list_of(&["a", "b", "c", "d", "e"]);
        list.move_up(&[ids[0], ids[2], ids[3]]);
        assert_eq!(order(&list), vec!["a", "c", "d", "b", "e"]);

        list.move_down(&[ids[2], ids[3]]);
        assert_eq!(order(&list), vec!["a", "b", "c", "d", "e"]);

        list.move_down(&[ids[3], ids[4]]);
        assert_eq!(order(&list), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_move_top_and_bottom() {
        let (mut list, ids) = list_of(&["a", "b", "c", "d"]);
        list.move_top(&[ids[3], ids[1]]);
        assert_eq!(order(&list), vec!["b", "d", "a", "c"]);
        list.move_bottom(&[ids[1]]);
        assert_eq!(order(&list), vec!["d", "a", "c", "b"]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_in_progress_items_are_neither_moved_nor_removed() {
        let (mut list, ids) = list_of(&["a", "b", "c"]);
        list.transition(ids[2], ItemStatus::InProgress).expect("start");
        list.move_top(&[ids[2]]);
        assert_eq!(order(&list), vec!["a", "b", "c"]);

        let removed = list.remove(&[ids[0], ids[2]]);
        assert_eq!(removed.len(), 1);
        assert_eq!(order(&list), vec!["b", "c"]);
    }

    #[test]
    fn test_children_wait_for_their_folder() {
        let mut list = TransferList::new();
        let folder = list.append(TransferItem::folder_create(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        ));
        let child = list.append(TransferItem::file(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir/a"),
            PathBuf::from("/dst/dir/a"),
            1,
        ));
        let remove = list.append(TransferItem::folder_remove(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        ));
        let awaiting = |_: &ItemId| false;

        assert_eq!(list.next_dispatchable(awaiting).map(|i| i.id), Some(folder));
        list.transition(folder, ItemStatus::InProgress).expect("start");
        assert_eq!(list.next_dispatchable(awaiting).map(|i| i.id), None);

        list.complete(folder, 0, None).expect("complete");
        assert_eq!(list.next_dispatchable(awaiting).map(|i| i.id), Some(child));
        list.transition(child, ItemStatus::InProgress).expect("start");
        assert_eq!(list.next_dispatchable(awaiting).map(|i| i.id), None);

        list.complete(child, 1, None).expect("complete");
        assert_eq!(list.next_dispatchable(awaiting).map(|i| i.id), Some(remove));
    }

    #[test]
    fn test_awaiting_items_are_passed_over() {
        let (list, ids) = list_of(&["a", "b"]);
        let waiting = ids[0];
        assert_eq!(list.next_dispatchable(|id| *id == waiting).map(|i| i.id), Some(ids[1]));
    }

    #[test]
    fn test_redirect_folder_rewrites_descendants() {
        let mut list = TransferList::new();
        let folder = list.append(TransferItem::folder_create(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        ));
        let child = list.append(TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src/dir/a"),
            PathBuf::from("/dst/dir/a"),
            1,
        ));
        let sibling = list.append(file("dir2", 1));

        list.redirect(folder, PathBuf::from("/dst/dir - copy")).expect("redirect");
        assert_eq!(
            list.get(child).expect("child").destination_path,
            PathBuf::from("/dst/dir - copy/a")
        );
        assert_eq!(
            list.get(sibling).expect("sibling").destination_path,
            PathBuf::from("/dst/dir2")
        );
    }

    #[test]
    fn test_redirect_leaves_other_sources_with_same_folder_name() {
        let mut list = TransferList::new();
        let first = list.append(TransferItem::folder_create(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/x/A"),
            PathBuf::from("/dst/A"),
        ));
        let running = list.append(TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/x/A/big.bin"),
            PathBuf::from("/dst/A/big.bin"),
            100,
        ));
        let second = list.append(TransferItem::folder_create(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/y/A"),
            PathBuf::from("/dst/A"),
        ));
        let child = list.append(TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/y/A/g.txt"),
            PathBuf::from("/dst/A/g.txt"),
            1,
        ));
        list.complete(first, 0, None).expect("complete");
        list.transition(running, ItemStatus::InProgress).expect("start");

        list.redirect(second, PathBuf::from("/dst/A - copy")).expect("redirect");
        assert_eq!(
            list.get(running).expect("running").destination_path,
            PathBuf::from("/dst/A/big.bin")
        );
        assert_eq!(
            list.get(child).expect("child").destination_path,
            PathBuf::from("/dst/A - copy/g.txt")
        );
    }

    #[test]
    fn test_rebase_only_strictly_below() {
        let old = Path::new("/dst/A");
        let new = Path::new("/dst/A - copy");
        assert_eq!(
            rebase(Path::new("/dst/A/b/c"), old, new),
            Some(PathBuf::from("/dst/A - copy/b/c"))
        );
        assert_eq!(rebase(Path::new("/dst/A"), old, new), None);
        assert_eq!(rebase(Path::new("/dst/AB"), old, new), None);
    }

    #[test]
    fn test_skip_subtree() {
        let mut list = TransferList::new();
        let folder = list.append(TransferItem::folder_create(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        ));
        list.append(TransferItem::file(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir/a"),
            PathBuf::from("/dst/dir/a"),
            1,
        ));
        list.append(TransferItem::folder_remove(
            RequestId(1),
            Mode::Move,
            PathBuf::from("/src/dir"),
            PathBuf::from("/dst/dir"),
        ));
        let other = list.append(file("dirx", 1));

        let skipped = list.skip_subtree(folder).expect("skip");
        assert_eq!(skipped.len(), 2);
        assert_eq!(list.get(other).expect("other").status, ItemStatus::Pending);
    }

    #[test]
    fn test_stat_and_request_outcome() {
        let (mut list, ids) = list_of(&["a", "b", "c"]);
        list.transition(ids[0], ItemStatus::InProgress).expect("start");
        list.complete(ids[0], 10, None).expect("complete");
        list.transition(ids[1], ItemStatus::Skipped).expect("skip");
        assert_eq!(list.request_outcome(RequestId(1)), None);

        list.fail(ids[2], ErrorKind::Io, "unreadable".to_string()).expect("fail");
        let stat = list.stat();
        assert_eq!(stat.items_total, 3);
        assert_eq!(stat.items_done, 2);
        assert_eq!(stat.items_skipped, 1);
        assert_eq!(stat.items_failed, 1);
        assert_eq!(stat.bytes_total, 20);
        assert_eq!(stat.bytes_transferred, 10);
        assert!(!list.has_unfinished());
        assert!(list.has_errors());
        assert_eq!(list.request_outcome(RequestId(1)), None, "an item still waits for recovery");

        list.transition(ids[2], ItemStatus::Skipped).expect("give up");
        assert!(!list.has_errors());
        assert_eq!(list.request_outcome(RequestId(1)), Some(true));
    }

    #[test]
    fn test_progress_reaches_size_only_when_done() {
        let (mut list, ids) = list_of(&["a", "b"]);
        list.transition(ids[0], ItemStatus::InProgress).expect("start");
        assert_eq!(list.record_progress(ids[0], 10).expect("progress"), Some(9));
        list.fail(ids[0], ErrorKind::ChecksumMismatch, "digest differs".to_string())
            .expect("fail");
        assert_eq!(list.get(ids[0]).expect("item").bytes_transferred, 9);

        list.transition(ids[1], ItemStatus::InProgress).expect("start");
        list.record_progress(ids[1], 10).expect("progress");
        list.complete(ids[1], 10, Some(true)).expect("complete");
        assert_eq!(list.get(ids[1]).expect("item").bytes_transferred, 10);
    }

    #[test]
    fn test_index_follows_reordering() {
        let (mut list, ids) = list_of(&["a", "b", "c", "d"]);
        list.move_bottom(&[ids[0]]);
        list.remove(&[ids[1]]);
        list.transition(ids[2], ItemStatus::Error).expect("fail");
        list.requeue(ids[2]).expect("requeue");

        assert_eq!(order(&list), vec!["d", "a", "c"]);
        for id in [ids[0], ids[2], ids[3]] {
            assert_eq!(list.get(id).expect("indexed").id, id);
        }
        assert!(list.get(ids[1]).is_none());
    }

    #[test]
    fn test_export_then_read_back() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, b"hello").expect("write");
        let path = temp_dir.path().join("list.json");

        let mut list = TransferList::new();
        let pending = list.append(TransferItem::file(
            RequestId(1),
            Mode::Move,
            src.clone(),
            temp_dir.path().join("out/a.txt"),
            3,
        ));
        let done = list.append(file("b", 1));
        list.transition(done, ItemStatus::Skipped).expect("skip");
        list.set_decision(pending, Resolution::Error(crate::collision::ErrorAction::Skip))
            .expect("decide");

        assert_eq!(list.export(&path).expect("export"), 1);
        let file = read_transfer_list(&path).expect("read back");
        assert_eq!(file.version, TRANSFER_LIST_VERSION);
        assert_eq!(file.items.len(), 1);

        let item = file.items[0].clone().into_item(RequestId(7)).expect("source exists");
        assert_eq!(item.source_path, src);
        assert_eq!(item.mode, Mode::Move);
        assert_eq!(item.size_bytes, 5, "size is read again from disk");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_ne!(item.id, pending);
    }

    #[test]
    fn test_import_rejects_missing_source_and_bad_version() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let record = TransferRecord::from_item(&file("gone", 1));
        assert!(matches!(
            record.into_item(RequestId(1)),
            Err(ScanError::NotFound { .. })
        ));

        let path = temp_dir.path().join("list.json");
        fs::write(
            &path,
            r#"{"version": 99, "exported_at": "2024-01-01T00:00:00Z", "items": []}"#,
        )
        .expect("write");
        assert!(matches!(
            read_transfer_list(&path),
            Err(EngineError::TransferListVersion { version: 99, .. })
        ));
    }
}
