//! Rename rule engine.
//!
//! Generates non-colliding destination names from two templates: the first
//! collision on a destination uses `first`, every later collision on the same
//! destination uses `other` with an increasing `{number}`.
//!
//! Placeholders: `{name}` (file stem, or the whole folder name), `{suffix}`
//! (extension including the dot) and `{number}`. When a template has no
//! `{suffix}`, the extension is appended after it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const SUFFIX_PLACEHOLDER: &str = "{suffix}";
pub const NUMBER_PLACEHOLDER: &str = "{number}";

/// The renaming template pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamingRules {
    pub first: String,
    pub other: String,
}

impl Default for RenamingRules {
    fn default() -> Self {
        RenamingRules {
            first: "{name} - copy".to_string(),
            other: "{name} - copy ({number})".to_string(),
        }
    }
}

impl RenamingRules {
    pub fn new(first: impl Into<String>, other: impl Into<String>) -> Self {
        RenamingRules {
            first: first.into(),
            other: other.into(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for (label, template) in [("first", &self.first), ("other", &self.other)] {
            if template.trim().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "{} renaming rule is empty",
                    label
                )));
            }
            if template.contains('/') || template.contains('\\') {
                return Err(EngineError::Configuration(format!(
                    "{} renaming rule `{}` contains a path separator",
                    label, template
                )));
            }
        }
        if !self.other.contains(NUMBER_PLACEHOLDER) {
            return Err(EngineError::Configuration(format!(
                "other renaming rule `{}` must contain {}",
                self.other, NUMBER_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

/// Fill a template for a name split into stem and suffix.
pub fn render(template: &str, stem: &str, suffix: &str, number: u32) -> String {
    let mut name = template
        .replace(NAME_PLACEHOLDER, stem)
        .replace(NUMBER_PLACEHOLDER, &number.to_string());
    if name.contains(SUFFIX_PLACEHOLDER) {
        name = name.replace(SUFFIX_PLACEHOLDER, suffix);
    } else {
        name.push_str(suffix);
    }
    name
}

fn split_name(path: &Path, is_dir: bool) -> (String, String) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if is_dir {
        return (file_name, String::new());
    }
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => (
            stem.to_string_lossy().into_owned(),
            format!(".{}", ext.to_string_lossy()),
        ),
        _ => (file_name, String::new()),
    }
}

/// Session state of the rename engine.
///
/// Remembers how many times each destination collided, and every name it
/// handed out so two items renamed before either is written never receive
/// the same path.
#[derive(Debug, Default)]
pub struct Renamer {
    rules: RenamingRules,
    counters: HashMap<PathBuf, u32>,
    reserved: HashSet<PathBuf>,
}

impl Renamer {
    pub fn new(rules: RenamingRules) -> Self {
        Renamer {
            rules,
            counters: HashMap::new(),
            reserved: HashSet::new(),
        }
    }

    pub fn set_rules(&mut self, rules: RenamingRules) {
        self.rules = rules;
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.contains(path)
    }

    /// Forget every counter and reservation.
    pub fn clear(&mut self) {
        self.counters.clear();
        self.reserved.clear();
    }

    /// Produce a free name for `destination`.
    ///
    /// `taken` reports whether a candidate already exists on disk; reserved
    /// names are checked internally. The returned path is reserved.
    pub fn propose(
        &mut self,
        destination: &Path,
        is_dir: bool,
        taken: impl Fn(&Path) -> bool,
    ) -> PathBuf {
        let parent = destination.parent().unwrap_or_else(|| Path::new(""));
        let (stem, suffix) = split_name(destination, is_dir);

        let counter = self.counters.entry(destination.to_path_buf()).or_insert(0);
        let mut number = *counter;
        loop {
            let name = if number == 0 {
                render(&self.rules.first, &stem, &suffix, 1)
            } else {
                render(&self.rules.other, &stem, &suffix, number)
            };
            let candidate = parent.join(name);
            number = if number == 0 { 2 } else { number + 1 };

            if candidate != destination && !self.reserved.contains(&candidate) && !taken(&candidate) {
                *counter = number;
                self.reserved.insert(candidate.clone());
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_appends_suffix() {
        assert_eq!(render("{name} (1)", "a", ".txt", 1), "a (1).txt");
        assert_eq!(render("{name}-{number}{suffix}.bak", "a", ".txt", 3), "a-3.txt.bak");
        assert_eq!(render("{name} - copy", "dir", "", 1), "dir - copy");
    }

    #[test]
    fn test_validate_rules() {
        assert!(RenamingRules::default().validate().is_ok());
        assert!(RenamingRules::new("", "{name} ({number})").validate().is_err());
        assert!(RenamingRules::new("{name} (1)", "{name} copy").validate().is_err());
        assert!(RenamingRules::new("a/{name}", "{name} ({number})").validate().is_err());
    }

    #[test]
    fn test_first_then_other_rule() {
        let mut renamer = Renamer::new(RenamingRules::new("{name} (1)", "{name} ({number})"));
        let destination = Path::new("/dst/a.txt");

        let first = renamer.propose(destination, false, |_| false);
        let second = renamer.propose(destination, false, |_| false);
        assert_eq!(first, PathBuf::from("/dst/a (1).txt"));
        assert_eq!(second, PathBuf::from("/dst/a (2).txt"));
        assert!(renamer.is_reserved(&second));
    }

    #[test]
    fn test_skips_names_taken_on_disk() {
        let mut renamer = Renamer::new(RenamingRules::default());
        let destination = Path::new("/dst/report.pdf");
        let taken = |p: &Path| {
            p == Path::new("/dst/report - copy.pdf") || p == Path::new("/dst/report - copy (2).pdf")
        };
        let proposed = renamer.propose(destination, false, taken);
        assert_eq!(proposed, PathBuf::from("/dst/report - copy (3).pdf"));
    }

    #[test]
    fn test_folders_keep_dots_in_name() {
        let mut renamer = Renamer::new(RenamingRules::default());
        let proposed = renamer.propose(Path::new("/dst/v1.2"), true, |_| false);
        assert_eq!(proposed, PathBuf::from("/dst/v1.2 - copy"));
    }
}
