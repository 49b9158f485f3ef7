//! Collision resolution.
//!
//! Before an item becomes executable the resolver checks its destination and
//! turns the configured policy (or an explicit per-item decision) into a
//! `Verdict`. When nothing is configured the verdict is `Ask` and the item
//! waits, still Pending, for an external answer.
//!
//! "Apply to all" answers are kept in a small map from collision class to
//! resolution that is consulted before the policy.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::model::{ItemKind, Mode, TransferItem};
use crate::rename::{Renamer, RenamingRules};

/// What to do when a destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileExistsAction {
    #[default]
    NotSet,
    Skip,
    Overwrite,
    /// Overwrite unless size and modification time are identical
    OverwriteIfNotSame,
    OverwriteIfNewer,
    OverwriteIfOlder,
    Rename,
}

/// What to do when a destination folder already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderExistsAction {
    #[default]
    NotSet,
    Merge,
    Skip,
    Rename,
}

/// What to do when an item fails mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    NotSet,
    Skip,
    /// Re-enqueue the item at the tail of the list
    PutToEndOfList,
}

/// The four situations that can need a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionClass {
    FileExists,
    FolderExists,
    FileError,
    FolderError,
}

impl CollisionClass {
    /// The error class matching an item kind.
    pub fn error_for(kind: ItemKind) -> Self {
        if kind == ItemKind::File {
            CollisionClass::FileError
        } else {
            CollisionClass::FolderError
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CollisionClass::FileError | CollisionClass::FolderError)
    }

    /// Every answer an observer may give for this class.
    pub fn proposed_outcomes(&self) -> Vec<Resolution> {
        match self {
            CollisionClass::FileExists => [
                FileExistsAction::Skip,
                FileExistsAction::Overwrite,
                FileExistsAction::OverwriteIfNotSame,
                FileExistsAction::OverwriteIfNewer,
                FileExistsAction::OverwriteIfOlder,
                FileExistsAction::Rename,
            ]
            .into_iter()
            .map(Resolution::FileExists)
            .collect(),
            CollisionClass::FolderExists => [
                FolderExistsAction::Merge,
                FolderExistsAction::Skip,
                FolderExistsAction::Rename,
            ]
            .into_iter()
            .map(Resolution::FolderExists)
            .collect(),
            CollisionClass::FileError | CollisionClass::FolderError => {
                [ErrorAction::Skip, ErrorAction::PutToEndOfList]
                    .into_iter()
                    .map(Resolution::Error)
                    .collect()
            }
        }
    }
}

impl fmt::Display for CollisionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollisionClass::FileExists => "file exists",
            CollisionClass::FolderExists => "folder exists",
            CollisionClass::FileError => "file error",
            CollisionClass::FolderError => "folder error",
        };
        f.write_str(name)
    }
}

/// A decision, tagged by the kind of situation it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "action")]
pub enum Resolution {
    FileExists(FileExistsAction),
    FolderExists(FolderExistsAction),
    Error(ErrorAction),
}

impl Resolution {
    /// True if this resolution answers `class`.
    pub fn answers(&self, class: CollisionClass) -> bool {
        match self {
            Resolution::FileExists(_) => class == CollisionClass::FileExists,
            Resolution::FolderExists(_) => class == CollisionClass::FolderExists,
            Resolution::Error(_) => class.is_error(),
        }
    }

    /// False for the `NotSet` variants.
    pub fn is_set(&self) -> bool {
        !matches!(
            self,
            Resolution::FileExists(FileExistsAction::NotSet)
                | Resolution::FolderExists(FolderExistsAction::NotSet)
                | Resolution::Error(ErrorAction::NotSet)
        )
    }
}

/// Configured action per collision class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionPolicy {
    #[serde(default)]
    pub file_exists: FileExistsAction,
    #[serde(default)]
    pub folder_exists: FolderExistsAction,
    #[serde(default)]
    pub file_error: ErrorAction,
    #[serde(default)]
    pub folder_error: ErrorAction,
}

impl CollisionPolicy {
    pub fn resolution_for(&self, class: CollisionClass) -> Resolution {
        match class {
            CollisionClass::FileExists => Resolution::FileExists(self.file_exists),
            CollisionClass::FolderExists => Resolution::FolderExists(self.folder_exists),
            CollisionClass::FileError => Resolution::Error(self.file_error),
            CollisionClass::FolderError => Resolution::Error(self.folder_error),
        }
    }
}

/// Outcome of collision handling for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No collision, or overwrite
    Proceed,
    /// Destination folder exists and is reused
    Merge,
    /// Leave the destination alone
    Skip,
    /// Execute against a renamed destination
    Redirect(PathBuf),
    /// Wait for an external decision
    Ask(CollisionClass),
}

/// Decides collisions and error recovery for the Engine Controller.
#[derive(Debug)]
pub struct CollisionResolver {
    policy: CollisionPolicy,
    remembered: HashMap<CollisionClass, Resolution>,
    renamer: Renamer,
}

impl CollisionResolver {
    pub fn new(policy: CollisionPolicy, rules: RenamingRules) -> Self {
        CollisionResolver {
            policy,
            remembered: HashMap::new(),
            renamer: Renamer::new(rules),
        }
    }

    /// Replace the policy. Remembered answers for classes whose policy
    /// changed are dropped so the new setting wins.
    pub fn set_policy(&mut self, policy: CollisionPolicy) {
        for class in [
            CollisionClass::FileExists,
            CollisionClass::FolderExists,
            CollisionClass::FileError,
            CollisionClass::FolderError,
        ] {
            if self.policy.resolution_for(class) != policy.resolution_for(class) {
                self.remembered.remove(&class);
            }
        }
        self.policy = policy;
    }

    pub fn set_renaming_rules(&mut self, rules: RenamingRules) {
        self.renamer.set_rules(rules);
    }

    /// Remember `resolution` for every later case of `class`.
    pub fn remember(&mut self, class: CollisionClass, resolution: Resolution) {
        if resolution.answers(class) && resolution.is_set() {
            log::debug!("remembering {:?} for every {}", resolution, class);
            self.remembered.insert(class, resolution);
        }
    }

    /// Forget remembered answers and rename reservations.
    pub fn reset(&mut self) {
        self.remembered.clear();
        self.renamer.clear();
    }

    /// The answer in force for `class`: remembered first, then the policy.
    pub fn effective(&self, class: CollisionClass) -> Resolution {
        self.remembered
            .get(&class)
            .copied()
            .unwrap_or_else(|| self.policy.resolution_for(class))
    }

    /// The error action for a failed item.
    pub fn error_action(&self, item: &TransferItem) -> ErrorAction {
        let class = CollisionClass::error_for(item.kind);
        let resolution = match item.decision {
            Some(decision @ Resolution::Error(_)) if decision.is_set() => decision,
            _ => self.effective(class),
        };
        match resolution {
            Resolution::Error(action) => action,
            _ => ErrorAction::NotSet,
        }
    }

    /// Decide what happens to `item` given the current state of its destination.
    pub fn resolve(&mut self, item: &TransferItem) -> Verdict {
        match item.kind {
            ItemKind::File => self.resolve_file(item),
            ItemKind::FolderCreate => self.resolve_folder(item),
            ItemKind::FolderRemove => Verdict::Proceed,
        }
    }

    fn resolve_file(&mut self, item: &TransferItem) -> Verdict {
        let destination = &item.destination_path;
        let existing = match fs::metadata(destination) {
            Ok(metadata) => Some(metadata),
            Err(_) if self.renamer.is_reserved(destination) => None,
            Err(_) => return Verdict::Proceed,
        };

        if same_file(&item.source_path, destination) {
            // Copying a file onto itself can only produce a renamed copy.
            return if item.mode == Mode::Move {
                Verdict::Skip
            } else {
                self.rename(destination, false)
            };
        }

        let action = match item.decision {
            Some(Resolution::FileExists(action)) if action != FileExistsAction::NotSet => action,
            _ => match self.effective(CollisionClass::FileExists) {
                Resolution::FileExists(action) => action,
                _ => FileExistsAction::NotSet,
            },
        };

        let Some(existing) = existing else {
            // Reserved by a pending rename but not written yet.
            return match action {
                FileExistsAction::NotSet => Verdict::Ask(CollisionClass::FileExists),
                FileExistsAction::Rename => self.rename(destination, false),
                _ => Verdict::Skip,
            };
        };

        match action {
            FileExistsAction::NotSet => Verdict::Ask(CollisionClass::FileExists),
            FileExistsAction::Skip => Verdict::Skip,
            FileExistsAction::Overwrite => Verdict::Proceed,
            FileExistsAction::Rename => self.rename(destination, false),
            FileExistsAction::OverwriteIfNotSame
            | FileExistsAction::OverwriteIfNewer
            | FileExistsAction::OverwriteIfOlder => {
                let source = match fs::metadata(&item.source_path) {
                    Ok(metadata) => metadata,
                    // Let the worker surface the read error.
                    Err(_) => return Verdict::Proceed,
                };
                let source_time = FileTime::from_last_modification_time(&source).unix_seconds();
                let dest_time = FileTime::from_last_modification_time(&existing).unix_seconds();
                let overwrite = match action {
                    FileExistsAction::OverwriteIfNotSame => {
                        source.len() != existing.len() || source_time != dest_time
                    }
                    FileExistsAction::OverwriteIfNewer => source_time > dest_time,
                    _ => source_time < dest_time,
                };
                if overwrite {
                    Verdict::Proceed
                } else {
                    Verdict::Skip
                }
            }
        }
    }

    fn resolve_folder(&mut self, item: &TransferItem) -> Verdict {
        let destination = &item.destination_path;
        let is_dir = match fs::metadata(destination) {
            Ok(metadata) => metadata.is_dir(),
            Err(_) => return Verdict::Proceed,
        };
        if !is_dir {
            // A file is in the way; creating the folder fails and goes
            // through the folder error policy.
            return Verdict::Proceed;
        }

        let action = match item.decision {
            Some(Resolution::FolderExists(action)) if action != FolderExistsAction::NotSet => action,
            _ => match self.effective(CollisionClass::FolderExists) {
                Resolution::FolderExists(action) => action,
                _ => FolderExistsAction::NotSet,
            },
        };
        match action {
            FolderExistsAction::NotSet => Verdict::Ask(CollisionClass::FolderExists),
            FolderExistsAction::Merge => Verdict::Merge,
            FolderExistsAction::Skip => Verdict::Skip,
            FolderExistsAction::Rename => self.rename(destination, true),
        }
    }

    fn rename(&mut self, destination: &Path, is_dir: bool) -> Verdict {
        let proposed = self
            .renamer
            .propose(destination, is_dir, |candidate| fs::symlink_metadata(candidate).is_ok());
        log::debug!(
            "renaming {} to {}",
            destination.display(),
            proposed.display()
        );
        Verdict::Redirect(proposed)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
