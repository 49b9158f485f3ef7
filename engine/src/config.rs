//! Engine configuration and the options store it is persisted to.
//!
//! `Configuration` is owned by the Engine Controller as an `Arc` snapshot.
//! Every item dispatched after an update sees the new values; items already
//! running keep the snapshot they started with. The speed limit is applied
//! live to the shared token bucket.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksums::ChecksumAlgorithm;
use crate::collision::{CollisionPolicy, ErrorAction, FileExistsAction, FolderExistsAction};
use crate::error::EngineError;
use crate::filters::{FilterRule, FilterSet};
use crate::rename::RenamingRules;

/// Hard upper bound on simultaneous file transfers.
pub const MAX_PARALLEL_TRANSFERS: usize = 8;

pub const MIN_BLOCK_SIZE: usize = 1024;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Integrity verification settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumOptions {
    pub enabled: bool,
    pub algorithm: ChecksumAlgorithm,
    /// Only verify after a suspected failure (short read, resumed transfer)
    pub only_on_error: bool,
    /// Downgrade "cannot compute digest" to a warning
    pub ignore_if_impossible: bool,
}

impl Default for ChecksumOptions {
    fn default() -> Self {
        ChecksumOptions {
            enabled: false,
            algorithm: ChecksumAlgorithm::Blake3,
            only_on_error: true,
            ignore_if_impossible: true,
        }
    }
}

/// OS buffering settings.
///
/// With `os_buffer` off every block is flushed to the device before the next
/// one is read. With `os_buffer` on, writes go through the page cache; if
/// `limited` is also set, the bytes sitting unflushed across all workers never
/// exceed `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOptions {
    pub os_buffer: bool,
    pub limited: bool,
    pub limit: u64,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            os_buffer: false,
            limited: false,
            limit: 512 * 1024,
        }
    }
}

/// Every tunable of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Size in bytes of one I/O block, the unit of throttling and checkpointing
    pub block_size: usize,
    /// Global throughput ceiling in bytes per second, 0 for unlimited
    pub speed_limit: u64,
    /// Maximum number of simultaneous file transfers
    pub parallel_transfers: usize,
    pub checksum: ChecksumOptions,
    pub buffer: BufferOptions,
    pub preserve_timestamps: bool,
    pub preserve_permissions: bool,
    /// Start transferring as soon as an item is executable
    pub auto_start: bool,
    /// Reject requests whose destination directory is missing
    pub check_destination_folder: bool,
    pub filters: FilterSet,
    pub renaming: RenamingRules,
    pub collision: CollisionPolicy,
    /// How many times an item may be put back at the end of the list
    pub max_requeue: u32,
    /// Minimum delay between two progress reports of one item, in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            block_size: DEFAULT_BLOCK_SIZE,
            speed_limit: 0,
            parallel_transfers: 2,
            checksum: ChecksumOptions::default(),
            buffer: BufferOptions::default(),
            preserve_timestamps: false,
            preserve_permissions: false,
            auto_start: true,
            check_destination_folder: true,
            filters: FilterSet::default(),
            renaming: RenamingRules::default(),
            collision: CollisionPolicy::default(),
            max_requeue: 3,
            progress_interval_ms: 200,
        }
    }
}

impl Configuration {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Capacity of the shared buffer gate, if one applies.
    pub fn buffer_capacity(&self) -> Option<u64> {
        (self.buffer.os_buffer && self.buffer.limited).then_some(self.buffer.limit)
    }

    /// Check every scalar and rule set.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(EngineError::Configuration(format!(
                "block size {} is outside {}..={} bytes",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if !(1..=MAX_PARALLEL_TRANSFERS).contains(&self.parallel_transfers) {
            return Err(EngineError::Configuration(format!(
                "parallel transfers must be between 1 and {}, got {}",
                MAX_PARALLEL_TRANSFERS, self.parallel_transfers
            )));
        }
        if self.buffer.limited && self.buffer.limit == 0 {
            return Err(EngineError::Configuration(
                "OS buffer limit must be greater than zero".to_string(),
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(EngineError::Configuration(
                "progress interval must be greater than zero".to_string(),
            ));
        }
        self.renaming.validate()?;
        self.filters.compile()?;
        Ok(())
    }

    /// Read a configuration from an options store.
    ///
    /// Missing keys keep their default. A malformed value is an error and
    /// nothing is returned.
    pub fn load(store: &dyn OptionsStore) -> Result<Self, EngineError> {
        let mut config = Configuration::default();

        if let Some(kib) = read::<usize>(store, "block_size")? {
            config.block_size = kib.saturating_mul(1024);
        }
        if let Some(limit) = read::<i64>(store, "speed_limit")? {
            config.speed_limit = speed_limit_from(limit)?;
        }
        if let Some(n) = read(store, "parallel_transfers")? {
            config.parallel_transfers = n;
        }
        if let Some(flag) = read(store, "keep_date")? {
            config.preserve_timestamps = flag;
        }
        if let Some(flag) = read(store, "do_right_transfer")? {
            config.preserve_permissions = flag;
        }
        if let Some(flag) = read(store, "auto_start")? {
            config.auto_start = flag;
        }
        if let Some(flag) = read(store, "check_destination_folder")? {
            config.check_destination_folder = flag;
        }
        if let Some(action) = read::<FileExistsAction>(store, "file_collision")? {
            config.collision.file_exists = action;
        }
        if let Some(action) = read::<FolderExistsAction>(store, "folder_collision")? {
            config.collision.folder_exists = action;
        }
        if let Some(action) = read::<ErrorAction>(store, "file_error")? {
            config.collision.file_error = action;
        }
        if let Some(action) = read::<ErrorAction>(store, "folder_error")? {
            config.collision.folder_error = action;
        }
        if let Some(rules) = read::<Vec<FilterRule>>(store, "include_filters")? {
            config.filters.include = rules;
        }
        if let Some(rules) = read::<Vec<FilterRule>>(store, "exclude_filters")? {
            config.filters.exclude = rules;
        }
        if let Some(flag) = read(store, "do_checksum")? {
            config.checksum.enabled = flag;
        }
        if let Some(algorithm) = read(store, "checksum_algorithm")? {
            config.checksum.algorithm = algorithm;
        }
        if let Some(flag) = read(store, "checksum_ignore_if_impossible")? {
            config.checksum.ignore_if_impossible = flag;
        }
        if let Some(flag) = read(store, "checksum_only_on_error")? {
            config.checksum.only_on_error = flag;
        }
        if let Some(flag) = read(store, "os_buffer")? {
            config.buffer.os_buffer = flag;
        }
        if let Some(flag) = read(store, "os_buffer_limited")? {
            config.buffer.limited = flag;
        }
        if let Some(kib) = read::<u64>(store, "os_buffer_limit")? {
            config.buffer.limit = kib.saturating_mul(1024);
        }
        if let Some(rule) = read::<String>(store, "first_renaming_rule")? {
            config.renaming.first = rule;
        }
        if let Some(rule) = read::<String>(store, "other_renaming_rule")? {
            config.renaming.other = rule;
        }

        config.validate()?;
        Ok(config)
    }

    /// Write every key to an options store.
    pub fn store(&self, store: &mut dyn OptionsStore) -> Result<(), EngineError> {
        put(store, "block_size", self.block_size / 1024)?;
        put(store, "speed_limit", self.speed_limit)?;
        put(store, "parallel_transfers", self.parallel_transfers)?;
        put(store, "keep_date", self.preserve_timestamps)?;
        put(store, "do_right_transfer", self.preserve_permissions)?;
        put(store, "auto_start", self.auto_start)?;
        put(store, "check_destination_folder", self.check_destination_folder)?;
        put(store, "file_collision", self.collision.file_exists)?;
        put(store, "folder_collision", self.collision.folder_exists)?;
        put(store, "file_error", self.collision.file_error)?;
        put(store, "folder_error", self.collision.folder_error)?;
        put(store, "include_filters", &self.filters.include)?;
        put(store, "exclude_filters", &self.filters.exclude)?;
        put(store, "do_checksum", self.checksum.enabled)?;
        put(store, "checksum_algorithm", self.checksum.algorithm)?;
        put(store, "checksum_ignore_if_impossible", self.checksum.ignore_if_impossible)?;
        put(store, "checksum_only_on_error", self.checksum.only_on_error)?;
        put(store, "os_buffer", self.buffer.os_buffer)?;
        put(store, "os_buffer_limited", self.buffer.limited)?;
        put(store, "os_buffer_limit", self.buffer.limit / 1024)?;
        put(store, "first_renaming_rule", &self.renaming.first)?;
        put(store, "other_renaming_rule", &self.renaming.other)?;
        Ok(())
    }
}

/// Convert a signed speed limit as received from callers.
pub fn speed_limit_from(limit: i64) -> Result<u64, EngineError> {
    u64::try_from(limit).map_err(|_| {
        EngineError::Configuration(format!("speed limit must not be negative, got {}", limit))
    })
}

fn read<T: DeserializeOwned>(store: &dyn OptionsStore, key: &str) -> Result<Option<T>, EngineError> {
    match store.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| EngineError::OptionValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

fn put<T: Serialize>(store: &mut dyn OptionsStore, key: &str, value: T) -> Result<(), EngineError> {
    let value = serde_json::to_value(value).map_err(|e| EngineError::OptionValue {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.set(key, value);
    Ok(())
}

/// Persistent key/value settings owned by the host application.
pub trait OptionsStore {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
}

/// An options store living in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    values: BTreeMap<String, Value>,
}

impl MemoryOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OptionsStore for MemoryOptions {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

/// An options store backed by a JSON object file.
#[derive(Debug, Clone)]
pub struct JsonFileOptions {
    path: PathBuf,
    values: serde_json::Map<String, Value>,
}

impl JsonFileOptions {
    /// Open the file at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| EngineError::OptionValue {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(source) => return Err(EngineError::OptionsFile { path, source }),
        };
        Ok(JsonFileOptions { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store back to its file.
    pub fn save(&self) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(&self.values).map_err(|e| {
            EngineError::OptionValue {
                key: self.path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        fs::write(&self.path, text).map_err(|source| EngineError::OptionsFile {
            path: self.path.clone(),
            source,
        })
    }
}

impl OptionsStore for JsonFileOptions {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.buffer_capacity(), None);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Configuration {
            block_size: 10,
            ..Configuration::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        config.block_size = DEFAULT_BLOCK_SIZE;
        config.parallel_transfers = MAX_PARALLEL_TRANSFERS + 1;
        assert!(config.validate().is_err());

        config.parallel_transfers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_speed_limit_is_rejected() {
        assert!(speed_limit_from(-1).is_err());
        assert_eq!(speed_limit_from(1024).expect("valid"), 1024);
    }

    #[test]
    fn test_store_then_load_keeps_values() {
        let mut config = Configuration::default();
        config.block_size = 128 * 1024;
        config.speed_limit = 1_000_000;
        config.preserve_timestamps = true;
        config.collision.file_exists = FileExistsAction::OverwriteIfNewer;
        config.collision.file_error = ErrorAction::PutToEndOfList;
        config.filters.exclude.push(FilterRule::wildcard("*.tmp"));
        config.checksum.enabled = true;
        config.checksum.algorithm = ChecksumAlgorithm::Sha256;

        let mut store = MemoryOptions::new();
        config.store(&mut store).expect("store");
        assert_eq!(store.get("block_size"), Some(json!(128)));
        assert_eq!(store.get("file_collision"), Some(json!("overwrite_if_newer")));

        let loaded = Configuration::load(&store).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_keys_falls_back_to_defaults() {
        let store = MemoryOptions::new();
        assert_eq!(Configuration::load(&store).expect("load"), Configuration::default());
    }

    #[test]
    fn test_load_rejects_malformed_values() {
        let mut store = MemoryOptions::new();
        store.set("auto_start", json!("sometimes"));
        assert!(matches!(
            Configuration::load(&store),
            Err(EngineError::OptionValue { key, .. }) if key == "auto_start"
        ));

        let mut store = MemoryOptions::new();
        store.set("speed_limit", json!(-5));
        assert!(matches!(
            Configuration::load(&store),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_json_file_options_roundtrip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("options.json");

        let mut options = JsonFileOptions::open(&path).expect("open missing file");
        options.set("parallel_transfers", json!(4));
        options.save().expect("save");

        let reopened = JsonFileOptions::open(&path).expect("reopen");
        assert_eq!(reopened.get("parallel_transfers"), Some(json!(4)));
        assert_eq!(Configuration::load(&reopened).expect("load").parallel_transfers, 4);
    }
}
