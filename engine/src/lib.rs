//! # Transfer Engine - File Copy/Move Worklist Library
//!
//! A headless engine that turns copy and move requests into an ordered,
//! editable Transfer List and executes it with a pool of workers.
//! Designed as the foundation for several front-ends (CLI, GUI, remote
//! request listeners).
//!
//! ## Overview
//!
//! - Recursive source expansion with include/exclude filters
//! - Collision handling (file exists, folder exists, errors) by policy or
//!   by asking the front-end through events
//! - Rename rules such as `{name} - copy ({number})`
//! - Pause, resume, cancel and per-item skip at block boundaries
//! - Global speed limit and optional write-through buffering
//! - Checksum verification and resumable retries
//! - Export and import of the unfinished part of the list
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use transfer_engine::{Configuration, Engine, EngineEvent};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(Configuration::default())?;
//! engine.new_copy(vec![PathBuf::from("/data/photos")], "/backup")?;
//!
//! for event in engine.events().iter() {
//!     match event {
//!         EngineEvent::AggregateProgress(stat) => {
//!             println!("{}/{} bytes", stat.bytes_transferred, stat.bytes_total);
//!         }
//!         EngineEvent::Completed | EngineEvent::Canceled => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Items, states and aggregate counters
//! - **error**: Error types and handling
//! - **config**: Engine settings and their persistence
//! - **scanner**: Source expansion into items
//! - **collision**: Collision and error-recovery decisions
//! - **rename**: Rename rule engine
//! - **list**: The Transfer List and its export format
//! - **engine**: The Engine Controller and its façade
//! - **fs_ops**: Low-level filesystem operations
//! - **checksums**: Checksum computation and verification

pub mod checksums;
pub mod collision;
pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod fs_ops;
pub mod list;
pub mod model;
pub mod orders;
pub mod progress;
pub mod rename;
pub mod scanner;
pub mod throttle;
mod worker;

// Re-export main types
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use collision::{
    CollisionClass, CollisionPolicy, ErrorAction, FileExistsAction, FolderExistsAction, Resolution,
};
pub use config::{
    BufferOptions, ChecksumOptions, Configuration, JsonFileOptions, MemoryOptions, OptionsStore,
};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, ListError, ScanError, TransferError};
pub use filters::{ApplyOn, FilterRule, FilterSet, SearchType};
pub use list::{read_transfer_list, TransferList, TransferListFile, TransferRecord};
pub use model::{
    EngineState, ItemId, ItemKind, ItemStatus, Mode, RequestId, TransferItem, TransferStat,
};
pub use orders::{OrderId, RemoteRequest};
pub use progress::EngineEvent;
pub use rename::RenamingRules;
