//! Include/exclude filter rules applied while scanning.
//!
//! A rule matches an entry *name* (not the full path). Exclude rules drop a
//! matching entry, and a dropped folder takes its whole subtree with it.
//! Include rules, when present, keep only the files matching one of them;
//! folders are only checked against include rules that target folders, so an
//! include like `*.txt` still lets the scanner descend into every folder.

use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How `search_text` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// Literal text
    Raw,
    /// Shell wildcard (`*`, `?`, `[...]`)
    Wildcard,
    /// Regular expression
    Regex,
}

/// Which entries a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOn {
    File,
    Folder,
    FileAndFolder,
}

impl ApplyOn {
    fn covers(&self, is_dir: bool) -> bool {
        match self {
            ApplyOn::File => !is_dir,
            ApplyOn::Folder => is_dir,
            ApplyOn::FileAndFolder => true,
        }
    }
}

/// One user-defined filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub search_text: String,
    pub search_type: SearchType,
    pub apply_on: ApplyOn,
    /// Match the whole name instead of any part of it
    pub need_match_all: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl FilterRule {
    /// A whole-name wildcard rule applied to files, the common case.
    pub fn wildcard(pattern: impl Into<String>) -> Self {
        FilterRule {
            search_text: pattern.into(),
            search_type: SearchType::Wildcard,
            apply_on: ApplyOn::File,
            need_match_all: true,
            case_sensitive: false,
        }
    }

    pub fn apply_on(mut self, apply_on: ApplyOn) -> Self {
        self.apply_on = apply_on;
        self
    }

    fn compile(&self) -> Result<CompiledRule, EngineError> {
        let invalid = |reason: String| {
            EngineError::Configuration(format!("invalid filter `{}`: {}", self.search_text, reason))
        };
        if self.search_text.is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }
        let matcher = match self.search_type {
            SearchType::Wildcard => {
                let pattern = if self.need_match_all {
                    self.search_text.clone()
                } else {
                    format!("*{}*", self.search_text)
                };
                let glob = GlobBuilder::new(&pattern)
                    .case_insensitive(!self.case_sensitive)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                Matcher::Glob(glob.compile_matcher())
            }
            SearchType::Raw | SearchType::Regex => {
                let body = if self.search_type == SearchType::Raw {
                    regex::escape(&self.search_text)
                } else {
                    self.search_text.clone()
                };
                let pattern = if self.need_match_all {
                    format!("^(?:{})$", body)
                } else {
                    body
                };
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(!self.case_sensitive)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                Matcher::Regex(regex)
            }
        };
        Ok(CompiledRule {
            apply_on: self.apply_on,
            matcher,
        })
    }
}

/// The include and exclude rule lists, as stored in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub include: Vec<FilterRule>,
    #[serde(default)]
    pub exclude: Vec<FilterRule>,
}

impl FilterSet {
    pub fn compile(&self) -> Result<CompiledFilters, EngineError> {
        Ok(CompiledFilters {
            include: self
                .include
                .iter()
                .map(FilterRule::compile)
                .collect::<Result<_, _>>()?,
            exclude: self
                .exclude
                .iter()
                .map(FilterRule::compile)
                .collect::<Result<_, _>>()?,
        })
    }
}

enum Matcher {
    Glob(GlobMatcher),
    Regex(Regex),
}

struct CompiledRule {
    apply_on: ApplyOn,
    matcher: Matcher,
}

impl CompiledRule {
    fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Glob(glob) => glob.is_match(name),
            Matcher::Regex(regex) => regex.is_match(name),
        }
    }
}

/// Filter rules ready to be evaluated by the scanner.
#[derive(Default)]
pub struct CompiledFilters {
    include: Vec<CompiledRule>,
    exclude: Vec<CompiledRule>,
}

impl CompiledFilters {
    /// Decide whether an entry named `name` is kept.
    pub fn accepts(&self, name: &str, is_dir: bool) -> bool {
        if self
            .exclude
            .iter()
            .any(|rule| rule.apply_on.covers(is_dir) && rule.matches(name))
        {
            return false;
        }

        let mut includes = self.include.iter().filter(|rule| {
            if is_dir {
                rule.apply_on == ApplyOn::Folder
            } else {
                rule.apply_on.covers(false)
            }
        });
        match includes.next() {
            None => true,
            Some(first) => first.matches(name) || includes.any(|rule| rule.matches(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filters_accept_everything() {
        let filters = FilterSet::default().compile().expect("compile");
        assert!(filters.accepts("anything.bin", false));
        assert!(filters.accepts("folder", true));
    }

    #[test]
    fn test_exclude_wildcard() {
        let set = FilterSet {
            include: vec![],
            exclude: vec![FilterRule::wildcard("*.tmp")],
        };
        let filters = set.compile().expect("compile");
        assert!(!filters.accepts("build.TMP", false), "wildcards are case-insensitive by default");
        assert!(filters.accepts("build.rs", false));
        assert!(filters.accepts("cache.tmp", true), "file rule does not apply to folders");
    }

    #[test]
    fn test_include_only_filters_files() {
        let set = FilterSet {
            include: vec![FilterRule::wildcard("*.txt")],
            exclude: vec![],
        };
        let filters = set.compile().expect("compile");
        assert!(filters.accepts("notes.txt", false));
        assert!(!filters.accepts("image.png", false));
        assert!(filters.accepts("photos", true));
    }

    #[test]
    fn test_raw_substring_and_regex() {
        let set = FilterSet {
            include: vec![],
            exclude: vec![
                FilterRule {
                    search_text: "node_modules".to_string(),
                    search_type: SearchType::Raw,
                    apply_on: ApplyOn::Folder,
                    need_match_all: true,
                    case_sensitive: true,
                },
                FilterRule {
                    search_text: r"^~\$".to_string(),
                    search_type: SearchType::Regex,
                    apply_on: ApplyOn::FileAndFolder,
                    need_match_all: false,
                    case_sensitive: true,
                },
            ],
        };
        let filters = set.compile().expect("compile");
        assert!(!filters.accepts("node_modules", true));
        assert!(filters.accepts("node_modules_backup", true));
        assert!(!filters.accepts("~$report.docx", false));
        assert!(filters.accepts("report.docx", false));
    }

    #[test]
    fn test_invalid_regex_is_a_configuration_error() {
        let set = FilterSet {
            include: vec![],
            exclude: vec![FilterRule {
                search_text: "(unclosed".to_string(),
                search_type: SearchType::Regex,
                apply_on: ApplyOn::File,
                need_match_all: false,
                case_sensitive: false,
            }],
        };
        assert!(matches!(set.compile(), Err(EngineError::Configuration(_))));
    }
}
