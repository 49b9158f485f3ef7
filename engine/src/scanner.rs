//! Path Scanner.
//!
//! Expands a request's source paths into transfer items, lazily. Each
//! directory is listed when the walk enters it, so the first items are
//! available long before a large tree is fully read.
//!
//! Order is depth-first pre-order: a `FolderCreate` precedes everything under
//! it and, for moves, the matching `FolderRemove` follows everything under it.
//! Entries of one directory are visited sorted by name.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use crate::error::ScanError;
use crate::filters::CompiledFilters;
use crate::model::{Mode, RequestId, TransferItem};

struct Frame {
    source_dir: PathBuf,
    destination_dir: PathBuf,
    entries: std::vec::IntoIter<OsString>,
    /// Emitted once every entry has been visited
    remove_marker: Option<TransferItem>,
}

/// Lazy walk over the sources of one request.
pub struct Scanner {
    request: RequestId,
    mode: Mode,
    destination: PathBuf,
    filters: CompiledFilters,
    roots: VecDeque<PathBuf>,
    stack: Vec<Frame>,
    deferred: VecDeque<Result<TransferItem, ScanError>>,
}

impl Scanner {
    pub fn new(
        request: RequestId,
        mode: Mode,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        filters: CompiledFilters,
    ) -> Self {
        Scanner {
            request,
            mode,
            destination,
            filters,
            roots: sources.into(),
            stack: Vec::new(),
            deferred: VecDeque::new(),
        }
    }

    fn visit_root(&mut self, source: PathBuf) -> Option<Result<TransferItem, ScanError>> {
        let Some(name) = source.file_name() else {
            return Some(Err(ScanError::NoFileName { path: source }));
        };
        let destination = self.destination.join(name);
        self.visit(source, destination, true)
    }

    /// Turn one filesystem entry into an item. Returns `None` when the entry
    /// is filtered out.
    fn visit(
        &mut self,
        source: PathBuf,
        destination: PathBuf,
        is_root: bool,
    ) -> Option<Result<TransferItem, ScanError>> {
        let metadata = match fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            Err(e) => return Some(Err(ScanError::from_io(&source, e))),
        };
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if metadata.file_type().is_symlink() {
            let target = match fs::metadata(&source) {
                Ok(target) => target,
                Err(e) => return Some(Err(ScanError::from_io(&source, e))),
            };
            if target.is_dir() {
                return Some(Err(ScanError::SymlinkToDirectory { path: source }));
            }
            if !is_root && !self.filters.accepts(&name, false) {
                return None;
            }
            return Some(Ok(TransferItem::file(
                self.request,
                self.mode,
                source,
                destination,
                target.len(),
            )));
        }

        if !metadata.is_dir() {
            if !is_root && !self.filters.accepts(&name, false) {
                return None;
            }
            return Some(Ok(TransferItem::file(
                self.request,
                self.mode,
                source,
                destination,
                metadata.len(),
            )));
        }

        if !is_root && !self.filters.accepts(&name, true) {
            log::debug!("filtered out folder {}", source.display());
            return None;
        }

        let reader = match fs::read_dir(&source) {
            Ok(reader) => reader,
            Err(e) => return Some(Err(ScanError::from_io(&source, e))),
        };
        let mut entries = Vec::new();
        for entry in reader {
            match entry {
                Ok(entry) => entries.push(entry.file_name()),
                Err(e) => self.deferred.push_back(Err(ScanError::from_io(&source, e))),
            }
        }
        entries.sort();

        let create = TransferItem::folder_create(
            self.request,
            self.mode,
            source.clone(),
            destination.clone(),
        );
        let remove_marker = (self.mode == Mode::Move).then(|| {
            TransferItem::folder_remove(self.request, self.mode, source.clone(), destination.clone())
        });
        self.stack.push(Frame {
            source_dir: source,
            destination_dir: destination,
            entries: entries.into_iter(),
            remove_marker,
        });
        Some(Ok(create))
    }
}

impl Iterator for Scanner {
    type Item = Result<TransferItem, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(deferred) = self.deferred.pop_front() {
                return Some(deferred);
            }

            if let Some(frame) = self.stack.last_mut() {
                match frame.entries.next() {
                    Some(name) => {
                        let source = frame.source_dir.join(&name);
                        let destination = frame.destination_dir.join(&name);
                        // Never descend into our own output.
                        if source == self.destination {
                            continue;
                        }
                        if let Some(result) = self.visit(source, destination, false) {
                            return Some(result);
                        }
                    }
                    None => {
                        if let Some(marker) = self.stack.pop().and_then(|f| f.remove_marker) {
                            return Some(Ok(marker));
                        }
                    }
                }
                continue;
            }

            let root = self.roots.pop_front()?;
            if let Some(result) = self.visit_root(root) {
                return Some(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FilterRule, FilterSet};
    use crate::model::ItemKind;
    use std::path::Path;

    fn scan(mode: Mode, sources: Vec<PathBuf>, destination: &Path, filters: FilterSet) -> Vec<Result<TransferItem, ScanError>> {
        let compiled = filters.compile().expect("compile filters");
        Scanner::new(RequestId(1), mode, sources, destination.to_path_buf(), compiled).collect()
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("src/sub")).expect("mkdir");
        fs::write(root.join("src/b.txt"), b"bb").expect("write");
        fs::write(root.join("src/a.tmp"), b"a").expect("write");
        fs::write(root.join("src/sub/c.txt"), b"ccc").expect("write");
    }

    #[test]
    fn test_copy_tree_is_pre_order_and_sorted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let dst = temp_dir.path().join("dst");

        let items: Vec<TransferItem> = scan(Mode::Copy, vec![temp_dir.path().join("src")], &dst, FilterSet::default())
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("scan succeeds");

        let summary: Vec<(ItemKind, PathBuf)> = items
            .iter()
            .map(|i| (i.kind, i.destination_path.strip_prefix(&dst).expect("under dst").to_path_buf()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ItemKind::FolderCreate, PathBuf::from("src")),
                (ItemKind::File, PathBuf::from("src/a.tmp")),
                (ItemKind::File, PathBuf::from("src/b.txt")),
                (ItemKind::FolderCreate, PathBuf::from("src/sub")),
                (ItemKind::File, PathBuf::from("src/sub/c.txt")),
            ]
        );
        assert_eq!(items[2].size_bytes, 2);
    }

    #[test]
    fn test_move_emits_folder_remove_after_children() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let dst = temp_dir.path().join("dst");

        let kinds: Vec<ItemKind> = scan(Mode::Move, vec![temp_dir.path().join("src")], &dst, FilterSet::default())
            .into_iter()
            .map(|r| r.expect("scan succeeds").kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ItemKind::FolderCreate,
                ItemKind::File,
                ItemKind::File,
                ItemKind::FolderCreate,
                ItemKind::File,
                ItemKind::FolderRemove,
                ItemKind::FolderRemove,
            ]
        );
    }

    #[test]
    fn test_filters_apply_to_children_only() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let dst = temp_dir.path().join("dst");
        let filters = FilterSet {
            include: vec![],
            exclude: vec![FilterRule::wildcard("*.tmp")],
        };

        let sources = vec![temp_dir.path().join("src"), temp_dir.path().join("src/a.tmp")];
        let names: Vec<String> = scan(Mode::Copy, sources, &dst, filters)
            .into_iter()
            .map(|r| r.expect("scan succeeds").display_name())
            .collect();
        assert_eq!(names, vec!["src", "b.txt", "sub", "c.txt", "a.tmp"]);
    }

    #[test]
    fn test_missing_source_is_reported_and_scan_continues() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let dst = temp_dir.path().join("dst");

        let results = scan(
            Mode::Copy,
            vec![temp_dir.path().join("missing"), temp_dir.path().join("src/b.txt")],
            &dst,
            FilterSet::default(),
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ScanError::NotFound { .. })));
        let item = results[1].as_ref().expect("second source scanned");
        assert_eq!(item.destination_path, dst.join("b.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed_into_directories() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let src = temp_dir.path().join("src");
        std::os::unix::fs::symlink(src.join("sub"), src.join("loop")).expect("symlink dir");
        std::os::unix::fs::symlink(src.join("b.txt"), src.join("link.txt")).expect("symlink file");

        let results = scan(Mode::Copy, vec![src.clone()], &temp_dir.path().join("dst"), FilterSet::default());
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ScanError::SymlinkToDirectory { path }) if path == &src.join("loop"))));
        let link = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .find(|i| i.display_name() == "link.txt")
            .expect("file link transferred as a file");
        assert_eq!(link.kind, ItemKind::File);
        assert_eq!(link.size_bytes, 2);
    }

    #[test]
    fn test_destination_inside_source_is_not_rescanned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        build_tree(temp_dir.path());
        let src = temp_dir.path().join("src");
        let dst = src.join("sub");

        let results = scan(Mode::Copy, vec![src.join("b.txt"), src.clone()], &dst, FilterSet::default());
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(!results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .any(|i| i.source_path.starts_with(&dst)));
    }
}
