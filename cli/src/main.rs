//! transfer - Command-line interface for the transfer engine.
//!
//! Queues one copy or move request (or an exported transfer list), prints
//! progress to stderr and answers collision prompts from stdin.

use clap::Parser;
use std::collections::HashMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use transfer_engine::config::speed_limit_from;
use transfer_engine::{
    ApplyOn, ChecksumAlgorithm, CollisionClass, Configuration, Engine, EngineEvent, EngineState,
    ErrorAction, FileExistsAction, FilterRule, FolderExistsAction, ItemId, ItemStatus,
    JsonFileOptions, Mode, RenamingRules, Resolution, SearchType, TransferItem, TransferStat,
};

/// transfer - copy and move files with a pausable, editable worklist
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(version = "0.1.0")]
#[command(about = "Copy or move files and directories with progress tracking")]
struct Args {
    /// Source file or directory (repeatable)
    #[arg(long, value_name = "PATH", required_unless_present = "import")]
    src: Vec<PathBuf>,

    /// Destination directory
    #[arg(long, value_name = "PATH", required_unless_present = "import")]
    dst: Option<PathBuf>,

    /// Operation mode: copy or move
    #[arg(long, value_name = "MODE", default_value = "copy")]
    mode: String,

    /// Existing file: ask, skip, overwrite, if-not-same, if-newer, if-older, rename
    #[arg(long, value_name = "ACTION", default_value = "ask")]
    on_file_exists: String,

    /// Existing folder: ask, merge, skip, rename
    #[arg(long, value_name = "ACTION", default_value = "merge")]
    on_folder_exists: String,

    /// Failed item: ask, skip, retry (put back at the end of the list)
    #[arg(long, value_name = "ACTION", default_value = "ask")]
    on_error: String,

    /// Never prompt; unanswered decisions are skipped
    #[arg(long)]
    no_prompt: bool,

    /// Verify every transferred file with a checksum
    #[arg(long)]
    verify: bool,

    /// Checksum algorithm for verification: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM", default_value = "blake3")]
    hash: String,

    /// Only verify transfers that were resumed or read short
    #[arg(long, requires = "verify")]
    checksum_only_on_error: bool,

    /// Fail the item when its checksum cannot be computed
    #[arg(long, requires = "verify")]
    strict_checksum: bool,

    /// I/O block size in KiB
    #[arg(long, value_name = "KIB")]
    block_size: Option<usize>,

    /// Global speed limit in bytes per second, 0 for unlimited
    #[arg(long, value_name = "BYTES", allow_negative_numbers = true)]
    speed_limit: Option<i64>,

    /// Number of files transferred at once
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Keep modification times
    #[arg(long)]
    keep_date: bool,

    /// Keep permissions
    #[arg(long)]
    keep_permissions: bool,

    /// Only transfer files whose name matches (repeatable)
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,

    /// Leave out files and folders whose name matches (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Read --include/--exclude patterns as regular expressions
    #[arg(long)]
    regex: bool,

    /// Name given to the first renamed copy, e.g. "{name} - copy"
    #[arg(long, value_name = "TEMPLATE")]
    first_rename: Option<String>,

    /// Name given to later renamed copies, must contain {number}
    #[arg(long, value_name = "TEMPLATE")]
    other_rename: Option<String>,

    /// Run an exported transfer list instead of --src/--dst
    #[arg(long, value_name = "FILE", conflicts_with = "src")]
    import: Option<PathBuf>,

    /// Write the unfinished items to FILE when the run ends
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// JSON options file to start from
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    /// Store the effective settings back into --options
    #[arg(long, requires = "options")]
    save_options: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// How a run ended, when it was not a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunResult {
    Success,
    /// Completed, but some items are in error
    ItemErrors,
}

/// Prints engine events to stderr and asks the user for decisions.
struct CliProgress {
    verbose: bool,
    interactive: bool,
    start_time: Instant,
    last_progress_update: Instant,
    /// Item names, filled lazily for verbose output
    names: HashMap<ItemId, String>,
}

impl CliProgress {
    fn new(verbose: bool, interactive: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            interactive,
            start_time: now,
            last_progress_update: now.checked_sub(Duration::from_secs(1)).unwrap_or(now),
            names: HashMap::new(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!(
            "[{}{}] {}%",
            "=".repeat(filled),
            " ".repeat(empty),
            percent
        )
    }

    fn name_of(&mut self, engine: &Engine, id: ItemId) -> String {
        if !self.names.contains_key(&id) {
            if let Ok(items) = engine.items() {
                for item in &items {
                    self.names.insert(item.id, item.display_name());
                }
            }
        }
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn on_progress(&mut self, stat: &TransferStat) {
        // Throttle progress updates to avoid spam (max once per 200ms)
        if self.last_progress_update.elapsed().as_millis() < 200 {
            return;
        }
        self.last_progress_update = Instant::now();

        let total_bytes = stat.bytes_total.max(1);
        let percent = (stat.bytes_transferred as f64 / total_bytes as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{} | {}/{} items | {}/s   ",
            Self::print_progress_bar(percent),
            Self::format_bytes(stat.bytes_transferred),
            Self::format_bytes(stat.bytes_total),
            stat.items_done,
            stat.items_total,
            Self::format_bytes(stat.throughput)
        );
        let _ = io::stderr().flush();
    }

    fn on_status(&mut self, engine: &Engine, id: ItemId, status: ItemStatus) {
        if self.verbose && status != ItemStatus::InProgress {
            let name = self.name_of(engine, id);
            eprintln!("\r{}: {}", status, name);
        }
    }

    /// Ask the user how to settle a decision. Returns the answer and whether
    /// it applies to every later case.
    fn decide(&self, class: CollisionClass, destination: &Path) -> (Resolution, bool) {
        if !self.interactive {
            log::warn!(
                "{} at {}, skipping (no prompt)",
                class,
                destination.display()
            );
            return (skip_for(class), false);
        }
        let stdin = io::stdin();
        let mut input = stdin.lock();
        loop {
            eprintln!();
            eprintln!("{}: {}", class, destination.display());
            eprint!("{} (uppercase applies to all): ", prompt_for(class));
            let _ = io::stderr().flush();

            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => return (skip_for(class), false),
                Ok(_) => {}
            }
            if let Some(answer) = parse_answer(class, line.trim()) {
                return answer;
            }
            eprintln!("Unrecognized answer '{}'", line.trim());
        }
    }

    fn on_finished(&self, stat: &TransferStat, items: &[TransferItem], verify: bool) {
        eprintln!();
        eprintln!("Transfer complete!");

        let verified_ok = items.iter().filter(|i| i.verified == Some(true)).count();
        let verified_mismatch = items.iter().filter(|i| i.verified == Some(false)).count();
        let elapsed = self.start_time.elapsed();

        let failed = failed_items(items);
        eprintln!(
            "Summary: {} done, {} skipped, {} failed",
            stat.items_done - stat.items_skipped,
            stat.items_skipped,
            failed.len()
        );
        if verify {
            eprintln!(
                "Verification: {} OK, {} mismatch",
                verified_ok, verified_mismatch
            );
        }
        eprintln!(
            "Bytes copied: {}",
            Self::format_bytes(stat.real_bytes_transferred)
        );
        eprintln!("Elapsed: {}", Self::format_duration(elapsed));

        if !failed.is_empty() {
            eprintln!();
            eprintln!("Failed items:");
            for item in failed {
                match &item.error_message {
                    Some(msg) => eprintln!("  {}: {}", item.display_name(), msg),
                    None => eprintln!("  {}: (unknown error)", item.display_name()),
                }
            }
        }
    }
}

/// Items that failed and were not recovered, including those skipped after
/// the failure.
fn failed_items(items: &[TransferItem]) -> Vec<&TransferItem> {
    items
        .iter()
        .filter(|i| i.status != ItemStatus::Done && i.error_message.is_some())
        .collect()
}

fn prompt_for(class: CollisionClass) -> &'static str {
    match class {
        CollisionClass::FileExists => {
            "[s]kip, [o]verwrite, overwrite if [n]ot same, if ne[w]er, if ol[d]er, [r]ename"
        }
        CollisionClass::FolderExists => "[m]erge, [s]kip, [r]ename",
        CollisionClass::FileError | CollisionClass::FolderError => {
            "[s]kip, [e]nd of list (retry later)"
        }
    }
}

fn skip_for(class: CollisionClass) -> Resolution {
    match class {
        CollisionClass::FileExists => Resolution::FileExists(FileExistsAction::Skip),
        CollisionClass::FolderExists => Resolution::FolderExists(FolderExistsAction::Skip),
        CollisionClass::FileError | CollisionClass::FolderError => {
            Resolution::Error(ErrorAction::Skip)
        }
    }
}

/// Map a one-letter prompt answer onto a resolution.
fn parse_answer(class: CollisionClass, answer: &str) -> Option<(Resolution, bool)> {
    let mut chars = answer.chars();
    let letter = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    let all = letter.is_uppercase();
    let resolution = match (class, letter.to_ascii_lowercase()) {
        (CollisionClass::FileExists, 's') => Resolution::FileExists(FileExistsAction::Skip),
        (CollisionClass::FileExists, 'o') => Resolution::FileExists(FileExistsAction::Overwrite),
        (CollisionClass::FileExists, 'n') => {
            Resolution::FileExists(FileExistsAction::OverwriteIfNotSame)
        }
        (CollisionClass::FileExists, 'w') => {
            Resolution::FileExists(FileExistsAction::OverwriteIfNewer)
        }
        (CollisionClass::FileExists, 'd') => {
            Resolution::FileExists(FileExistsAction::OverwriteIfOlder)
        }
        (CollisionClass::FileExists, 'r') => Resolution::FileExists(FileExistsAction::Rename),
        (CollisionClass::FolderExists, 'm') => {
            Resolution::FolderExists(FolderExistsAction::Merge)
        }
        (CollisionClass::FolderExists, 's') => Resolution::FolderExists(FolderExistsAction::Skip),
        (CollisionClass::FolderExists, 'r') => {
            Resolution::FolderExists(FolderExistsAction::Rename)
        }
        (CollisionClass::FileError | CollisionClass::FolderError, 's') => {
            Resolution::Error(ErrorAction::Skip)
        }
        (CollisionClass::FileError | CollisionClass::FolderError, 'e') => {
            Resolution::Error(ErrorAction::PutToEndOfList)
        }
        _ => return None,
    };
    Some((resolution, all))
}

fn parse_mode(mode: &str) -> Result<Mode, String> {
    match mode.to_lowercase().as_str() {
        "copy" => Ok(Mode::Copy),
        "move" => Ok(Mode::Move),
        _ => Err(format!("Invalid mode '{}'. Must be 'copy' or 'move'", mode)),
    }
}

fn parse_file_action(action: &str) -> Result<FileExistsAction, String> {
    match action.to_lowercase().as_str() {
        "ask" => Ok(FileExistsAction::NotSet),
        "skip" => Ok(FileExistsAction::Skip),
        "overwrite" => Ok(FileExistsAction::Overwrite),
        "if-not-same" => Ok(FileExistsAction::OverwriteIfNotSame),
        "if-newer" => Ok(FileExistsAction::OverwriteIfNewer),
        "if-older" => Ok(FileExistsAction::OverwriteIfOlder),
        "rename" => Ok(FileExistsAction::Rename),
        _ => Err(format!(
            "Invalid file collision action '{}'. Must be 'ask', 'skip', 'overwrite', \
             'if-not-same', 'if-newer', 'if-older' or 'rename'",
            action
        )),
    }
}

fn parse_folder_action(action: &str) -> Result<FolderExistsAction, String> {
    match action.to_lowercase().as_str() {
        "ask" => Ok(FolderExistsAction::NotSet),
        "merge" => Ok(FolderExistsAction::Merge),
        "skip" => Ok(FolderExistsAction::Skip),
        "rename" => Ok(FolderExistsAction::Rename),
        _ => Err(format!(
            "Invalid folder collision action '{}'. Must be 'ask', 'merge', 'skip' or 'rename'",
            action
        )),
    }
}

fn parse_error_action(action: &str) -> Result<ErrorAction, String> {
    match action.to_lowercase().as_str() {
        "ask" => Ok(ErrorAction::NotSet),
        "skip" => Ok(ErrorAction::Skip),
        "retry" => Ok(ErrorAction::PutToEndOfList),
        _ => Err(format!(
            "Invalid error action '{}'. Must be 'ask', 'skip' or 'retry'",
            action
        )),
    }
}

fn filter_rule(pattern: &str, regex: bool, apply_on: ApplyOn) -> FilterRule {
    let mut rule = FilterRule::wildcard(pattern).apply_on(apply_on);
    if regex {
        rule.search_type = SearchType::Regex;
    }
    rule
}

/// Build the engine configuration from the options file and the flags.
fn build_configuration(args: &Args) -> Result<Configuration, String> {
    let mut config = match &args.options {
        Some(path) => {
            let store = JsonFileOptions::open(path).map_err(|e| e.to_string())?;
            Configuration::load(&store).map_err(|e| e.to_string())?
        }
        None => Configuration::default(),
    };

    config.collision.file_exists = parse_file_action(&args.on_file_exists)?;
    config.collision.folder_exists = parse_folder_action(&args.on_folder_exists)?;
    config.collision.file_error = parse_error_action(&args.on_error)?;
    config.collision.folder_error = config.collision.file_error;

    if args.verify {
        config.checksum.enabled = true;
        config.checksum.algorithm = ChecksumAlgorithm::from_str(&args.hash)?;
        config.checksum.only_on_error = args.checksum_only_on_error;
        config.checksum.ignore_if_impossible = !args.strict_checksum;
    }
    if let Some(kib) = args.block_size {
        config.block_size = kib.saturating_mul(1024);
    }
    if let Some(limit) = args.speed_limit {
        config.speed_limit = speed_limit_from(limit).map_err(|e| e.to_string())?;
    }
    if let Some(parallel) = args.parallel {
        config.parallel_transfers = parallel;
    }
    config.preserve_timestamps |= args.keep_date;
    config.preserve_permissions |= args.keep_permissions;

    for pattern in &args.include {
        config
            .filters
            .include
            .push(filter_rule(pattern, args.regex, ApplyOn::File));
    }
    for pattern in &args.exclude {
        config
            .filters
            .exclude
            .push(filter_rule(pattern, args.regex, ApplyOn::FileAndFolder));
    }
    if args.first_rename.is_some() || args.other_rename.is_some() {
        let defaults = config.renaming.clone();
        config.renaming = RenamingRules::new(
            args.first_rename.clone().unwrap_or(defaults.first),
            args.other_rename.clone().unwrap_or(defaults.other),
        );
    }

    config.validate().map_err(|e| e.to_string())?;

    if args.save_options {
        if let Some(path) = &args.options {
            let mut store = JsonFileOptions::open(path).map_err(|e| e.to_string())?;
            config.store(&mut store).map_err(|e| e.to_string())?;
            store.save().map_err(|e| e.to_string())?;
            log::info!("options saved to {}", store.path().display());
        }
    }
    Ok(config)
}

/// Parse and validate command-line arguments, then run the transfer
fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Exit code tracking
    let exit_code = match run_cli(&args) {
        Ok(RunResult::Success) => 0,
        Ok(RunResult::ItemErrors) => {
            eprintln!("Error: one or more items failed to transfer");
            1
        }
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<RunResult, String> {
    let config = build_configuration(args)?;
    let verify = config.checksum.enabled;
    let engine = Engine::new(config).map_err(|e| format!("Engine start failed: {}", e))?;

    match &args.import {
        Some(list) => {
            engine
                .import_transfer_list(list)
                .map_err(|e| format!("Import failed: {}", e))?;
            eprintln!("Importing transfer list {}", list.display());
        }
        None => {
            let mode = parse_mode(&args.mode)?;
            let dst = args
                .dst
                .clone()
                .ok_or_else(|| "A destination is required".to_string())?;
            for src in &args.src {
                if !src.exists() {
                    return Err(format!("Source does not exist: {}", src.display()));
                }
            }
            eprintln!("Preparing transfer...");
            eprintln!("  Destination: {}", dst.display());
            eprintln!("  Mode: {}", mode);
            let request = match mode {
                Mode::Copy => engine.new_copy(args.src.clone(), dst),
                Mode::Move => engine.new_move(args.src.clone(), dst),
            };
            request.map_err(|e| format!("Request rejected: {}", e))?;
        }
    }

    let interactive = !args.no_prompt && io::stdin().is_terminal();
    let mut progress = CliProgress::new(args.verbose, interactive);
    let mut fatal = None;

    for event in engine.events().iter() {
        match event {
            EngineEvent::AggregateProgress(stat) => progress.on_progress(&stat),
            EngineEvent::ItemStatusChanged { id, status } => {
                progress.on_status(&engine, id, status)
            }
            EngineEvent::CollisionDetected {
                id,
                class,
                destination,
                ..
            } => {
                let (resolution, all) = progress.decide(class, &destination);
                engine
                    .resolve(id, resolution, all)
                    .map_err(|e| format!("Decision rejected: {}", e))?;
            }
            EngineEvent::ItemError { id, message, .. } => {
                let name = progress.name_of(&engine, id);
                eprintln!("\r{}: {}", name, message);
            }
            EngineEvent::ScanFailed { path, message } => {
                eprintln!("\rCannot read {}: {}", path.display(), message);
            }
            EngineEvent::StateChanged {
                state: EngineState::Error,
                message,
            } => {
                fatal = Some(message.unwrap_or_else(|| "transfer failed".to_string()));
                break;
            }
            EngineEvent::Completed | EngineEvent::Canceled => break,
            _ => {}
        }
    }

    let stat = engine.stat().map_err(|e| e.to_string())?;
    let items = engine.items().map_err(|e| e.to_string())?;

    if let Some(path) = &args.export {
        let written = engine
            .export_transfer_list(path)
            .map_err(|e| format!("Export failed: {}", e))?;
        eprintln!("Exported {} unfinished item(s) to {}", written, path.display());
    }
    if let Some(message) = fatal {
        return Err(message);
    }

    progress.on_finished(&stat, &items, verify);
    if !failed_items(&items).is_empty() {
        Ok(RunResult::ItemErrors)
    } else {
        Ok(RunResult::Success)
    }
}
