//! Engine Controller.
//!
//! `Engine` is the façade handed to front-ends. Every call is turned into a
//! `Command` sent to a single control thread, which owns the Transfer List,
//! the collision resolver and the state machine:
//!
//! ```text
//! Idle -> Scanning -> Transferring <-> Paused -> Completed
//!                         any state -> Canceled | Error
//! ```
//!
//! The control thread multiplexes four inputs: commands from the façade,
//! reports from the worker pool, batches from the scan thread and a ticker
//! driving aggregate progress. Events flow back on a bounded channel
//! returned by [`Engine::events`]; the observer is expected to drain it.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender, TryRecvError, TrySendError};

use crate::collision::{CollisionClass, CollisionPolicy, CollisionResolver, ErrorAction, Resolution, Verdict};
use crate::config::{speed_limit_from, Configuration, OptionsStore};
use crate::error::{EngineError, ErrorKind, ListError, ScanError, TransferError};
use crate::filters::CompiledFilters;
use crate::fs_ops;
use crate::list::{read_transfer_list, rebase, TransferList};
use crate::model::{EngineState, ItemId, ItemKind, ItemStatus, Mode, RequestId, TransferItem, TransferStat};
use crate::orders::{OrderBook, OrderId, RemoteRequest};
use crate::progress::{EngineEvent, ThroughputMeter};
use crate::scanner::Scanner;
use crate::worker::{ItemControl, Job, Outcome, RunControl, Shared, WorkerPool, WorkerReport};

/// Capacity of the event channel.
pub const EVENT_CAPACITY: usize = 8192;

const COMMAND_CAPACITY: usize = 64;
const TICK: Duration = Duration::from_millis(200);
const SCAN_BATCH: usize = 256;
const SCAN_FLUSH: Duration = Duration::from_millis(50);

type Reply<T> = Sender<Result<T, EngineError>>;
type Update = Box<dyn FnOnce(&mut Configuration) -> Result<(), EngineError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reorder {
    Top,
    Up,
    Down,
    Bottom,
}

enum Command {
    Submit {
        mode: Mode,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        order: Option<OrderId>,
        reply: Reply<RequestId>,
    },
    Import {
        path: PathBuf,
        reply: Reply<RequestId>,
    },
    Export {
        path: PathBuf,
        reply: Reply<usize>,
    },
    Pause(Reply<()>),
    Resume(Reply<()>),
    Cancel(Reply<()>),
    Skip {
        id: ItemId,
        reply: Reply<()>,
    },
    Remove {
        ids: Vec<ItemId>,
        reply: Reply<usize>,
    },
    Reorder {
        direction: Reorder,
        ids: Vec<ItemId>,
        reply: Reply<()>,
    },
    Resolve {
        id: ItemId,
        resolution: Resolution,
        apply_to_all: bool,
        reply: Reply<()>,
    },
    SetDefault {
        class: CollisionClass,
        resolution: Resolution,
        reply: Reply<()>,
    },
    Update {
        update: Update,
        reply: Reply<()>,
    },
    ForceMode {
        mode: Mode,
        reply: Reply<()>,
    },
    Items(Reply<Vec<TransferItem>>),
    Stat(Reply<TransferStat>),
    State(Reply<EngineState>),
    Config(Reply<Configuration>),
    SameDestination {
        path: PathBuf,
        reply: Reply<bool>,
    },
    SameSource {
        sources: Vec<PathBuf>,
        reply: Reply<bool>,
    },
    Reset(Reply<()>),
    Shutdown,
}

enum ScanReport {
    Batch {
        request: RequestId,
        items: Vec<TransferItem>,
    },
    Failed {
        request: RequestId,
        error: ScanError,
    },
    Finished {
        request: RequestId,
    },
}

/// The transfer engine façade.
///
/// Dropping the engine stops every transfer at its next checkpoint and joins
/// the engine threads.
pub struct Engine {
    commands: Sender<Command>,
    events: Receiver<EngineEvent>,
    control: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start an engine with `config`.
    pub fn new(config: Configuration) -> Result<Self, EngineError> {
        config.validate()?;
        let (commands, command_rx) = crossbeam_channel::bounded(COMMAND_CAPACITY);
        let (event_tx, events) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();
        let (scan_tx, scan_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared::new(&config));
        let pool = WorkerPool::spawn(Arc::clone(&shared), worker_tx).map_err(EngineError::Spawn)?;
        let controller = Controller::new(config, shared, pool, event_tx, scan_tx);
        let control = thread::Builder::new()
            .name("transfer-control".to_string())
            .spawn(move || controller.run(command_rx, worker_rx, scan_rx))
            .map_err(EngineError::Spawn)?;

        Ok(Engine {
            commands,
            events,
            control: Some(control),
        })
    }

    /// Start an engine configured from an options store.
    pub fn with_options(store: &dyn OptionsStore) -> Result<Self, EngineError> {
        Self::new(Configuration::load(store)?)
    }

    /// The event stream.
    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Disconnected)?;
        response.recv().map_err(|_| EngineError::Disconnected)?
    }

    fn submit_request(
        &self,
        mode: Mode,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        order: Option<OrderId>,
    ) -> Result<RequestId, EngineError> {
        self.call(|reply| Command::Submit {
            mode,
            sources,
            destination,
            order,
            reply,
        })
    }

    /// Queue a copy of `sources` into `destination`.
    pub fn new_copy(
        &self,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<RequestId, EngineError> {
        self.submit_request(Mode::Copy, sources, destination.into(), None)
    }

    /// Queue a move of `sources` into `destination`.
    pub fn new_move(
        &self,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<RequestId, EngineError> {
        self.submit_request(Mode::Move, sources, destination.into(), None)
    }

    pub fn new_copy_for_order(
        &self,
        order: OrderId,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<RequestId, EngineError> {
        self.submit_request(Mode::Copy, sources, destination.into(), Some(order))
    }

    pub fn new_move_for_order(
        &self,
        order: OrderId,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<RequestId, EngineError> {
        self.submit_request(Mode::Move, sources, destination.into(), Some(order))
    }

    /// Queue an order received from a remote request source.
    pub fn submit(&self, request: RemoteRequest) -> Result<RequestId, EngineError> {
        let destination = request.destination.ok_or(EngineError::MissingDestination)?;
        self.submit_request(request.mode, request.sources, destination, Some(request.order))
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.call(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.call(Command::Resume)
    }

    pub fn cancel(&self) -> Result<(), EngineError> {
        self.call(Command::Cancel)
    }

    /// Skip one item. A running item stops at its next checkpoint.
    pub fn skip(&self, id: ItemId) -> Result<(), EngineError> {
        self.call(|reply| Command::Skip { id, reply })
    }

    /// Remove items from the list. Items in progress are kept. Returns the
    /// number of items removed.
    pub fn remove_items(&self, ids: &[ItemId]) -> Result<usize, EngineError> {
        let ids = ids.to_vec();
        self.call(|reply| Command::Remove { ids, reply })
    }

    fn reorder(&self, direction: Reorder, ids: &[ItemId]) -> Result<(), EngineError> {
        let ids = ids.to_vec();
        self.call(|reply| Command::Reorder {
            direction,
            ids,
            reply,
        })
    }

    pub fn move_items_top(&self, ids: &[ItemId]) -> Result<(), EngineError> {
        self.reorder(Reorder::Top, ids)
    }

    pub fn move_items_up(&self, ids: &[ItemId]) -> Result<(), EngineError> {
        self.reorder(Reorder::Up, ids)
    }

    pub fn move_items_down(&self, ids: &[ItemId]) -> Result<(), EngineError> {
        self.reorder(Reorder::Down, ids)
    }

    pub fn move_items_bottom(&self, ids: &[ItemId]) -> Result<(), EngineError> {
        self.reorder(Reorder::Bottom, ids)
    }

    /// Answer a `CollisionDetected` event. With `apply_to_all`, the answer
    /// also settles every later decision of the same class.
    pub fn resolve(
        &self,
        id: ItemId,
        resolution: Resolution,
        apply_to_all: bool,
    ) -> Result<(), EngineError> {
        self.call(|reply| Command::Resolve {
            id,
            resolution,
            apply_to_all,
            reply,
        })
    }

    /// Answer every current and future decision of `class`.
    pub fn set_default_resolution(
        &self,
        class: CollisionClass,
        resolution: Resolution,
    ) -> Result<(), EngineError> {
        self.call(|reply| Command::SetDefault {
            class,
            resolution,
            reply,
        })
    }

    /// Write the unfinished part of the list to `path`. Returns the number
    /// of records written.
    pub fn export_transfer_list(&self, path: impl Into<PathBuf>) -> Result<usize, EngineError> {
        let path = path.into();
        self.call(|reply| Command::Export { path, reply })
    }

    /// Append the records of an exported list as a new request.
    pub fn import_transfer_list(&self, path: impl Into<PathBuf>) -> Result<RequestId, EngineError> {
        let path = path.into();
        self.call(|reply| Command::Import { path, reply })
    }

    /// Apply a change to the configuration. The change is validated as a
    /// whole; on error nothing is modified.
    pub fn update_configuration(
        &self,
        update: impl FnOnce(&mut Configuration) -> Result<(), EngineError> + Send + 'static,
    ) -> Result<(), EngineError> {
        self.call(|reply| Command::Update {
            update: Box::new(update),
            reply,
        })
    }

    pub fn configure(&self, config: Configuration) -> Result<(), EngineError> {
        self.update_configuration(move |current| {
            *current = config;
            Ok(())
        })
    }

    /// Set the global speed limit in bytes per second, 0 for unlimited.
    /// Negative values are rejected.
    pub fn set_speed_limitation(&self, limit: i64) -> Result<(), EngineError> {
        let limit = speed_limit_from(limit)?;
        self.update_configuration(move |config| {
            config.speed_limit = limit;
            Ok(())
        })
    }

    pub fn set_block_size(&self, block_size: usize) -> Result<(), EngineError> {
        self.update_configuration(move |config| {
            config.block_size = block_size;
            Ok(())
        })
    }

    pub fn set_parallel_transfers(&self, count: usize) -> Result<(), EngineError> {
        self.update_configuration(move |config| {
            config.parallel_transfers = count;
            Ok(())
        })
    }

    pub fn set_collision_policy(&self, policy: CollisionPolicy) -> Result<(), EngineError> {
        self.update_configuration(move |config| {
            config.collision = policy;
            Ok(())
        })
    }

    pub fn configuration(&self) -> Result<Configuration, EngineError> {
        self.call(Command::Config)
    }

    /// Persist the current configuration.
    pub fn save_options(&self, store: &mut dyn OptionsStore) -> Result<(), EngineError> {
        self.configuration()?.store(store)
    }

    /// Pin the engine to one mode; requests of the other mode are rejected.
    pub fn force_mode(&self, mode: Mode) -> Result<(), EngineError> {
        self.call(|reply| Command::ForceMode { mode, reply })
    }

    /// True if a request of this session targets `destination`.
    pub fn has_same_destination(&self, destination: impl Into<PathBuf>) -> Result<bool, EngineError> {
        let path = destination.into();
        self.call(|reply| Command::SameDestination { path, reply })
    }

    /// True if one of `sources` is, or lies under, a source of a request of
    /// this session.
    pub fn has_same_source(&self, sources: &[PathBuf]) -> Result<bool, EngineError> {
        let sources = sources.to_vec();
        self.call(|reply| Command::SameSource { sources, reply })
    }

    /// Snapshot of the Transfer List.
    pub fn items(&self) -> Result<Vec<TransferItem>, EngineError> {
        self.call(Command::Items)
    }

    pub fn stat(&self) -> Result<TransferStat, EngineError> {
        self.call(Command::Stat)
    }

    pub fn state(&self) -> Result<EngineState, EngineError> {
        self.call(Command::State)
    }

    /// Clear the list and return to Idle. Rejected while workers hold items.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.call(Command::Reset)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        loop {
            match self.commands.try_send(Command::Shutdown) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(_)) => {
                    while self.events.try_recv().is_ok() {}
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        if let Some(handle) = self.control.take() {
            while !handle.is_finished() {
                while self.events.try_recv().is_ok() {}
                thread::sleep(Duration::from_millis(10));
            }
            if handle.join().is_err() {
                log::error!("the engine control thread panicked");
            }
        }
    }
}

#[derive(Debug)]
struct RequestInfo {
    sources: Vec<PathBuf>,
    destination: PathBuf,
    /// The destination existed when the request was accepted
    destination_existed: bool,
    scan_done: bool,
    settled: bool,
}

struct ScanJob {
    request: RequestId,
    mode: Mode,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    filters: CompiledFilters,
}

struct RunningScan {
    request: RequestId,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Log a list update the control thread could not apply. These come from
/// reports racing with removals or user edits and are not fatal.
fn checked<T>(result: Result<T, ListError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("transfer list update rejected: {}", e);
            None
        }
    }
}

/// State owned by the control thread.
struct Controller {
    state: EngineState,
    config: Arc<Configuration>,
    list: TransferList,
    resolver: CollisionResolver,
    /// Items waiting for an external decision
    awaiting: HashMap<ItemId, CollisionClass>,
    /// Items held by workers
    active: HashMap<ItemId, Arc<ItemControl>>,
    run: Arc<RunControl>,
    shared: Arc<Shared>,
    pool: WorkerPool,
    events: Sender<EngineEvent>,
    scan_tx: Sender<ScanReport>,
    scan_queue: VecDeque<ScanJob>,
    scanning: Option<RunningScan>,
    requests: HashMap<RequestId, RequestInfo>,
    next_request: u64,
    /// Folders resolved to Skip or Redirect, applied to items still arriving.
    /// Both are keyed by the folder's source path.
    skipped_folders: Vec<(RequestId, PathBuf)>,
    redirected_folders: Vec<(RequestId, PathBuf, PathBuf)>,
    orders: OrderBook,
    forced_mode: Option<Mode>,
    meter: ThroughputMeter,
    real_bytes: u64,
    stat_dirty: bool,
    cancel_announced: bool,
}

impl Controller {
    fn new(
        config: Configuration,
        shared: Arc<Shared>,
        pool: WorkerPool,
        events: Sender<EngineEvent>,
        scan_tx: Sender<ScanReport>,
    ) -> Self {
        let resolver = CollisionResolver::new(config.collision, config.renaming.clone());
        Controller {
            state: EngineState::Idle,
            config: Arc::new(config),
            list: TransferList::new(),
            resolver,
            awaiting: HashMap::new(),
            active: HashMap::new(),
            run: Arc::new(RunControl::new(false)),
            shared,
            pool,
            events,
            scan_tx,
            scan_queue: VecDeque::new(),
            scanning: None,
            requests: HashMap::new(),
            next_request: 1,
            skipped_folders: Vec::new(),
            redirected_folders: Vec::new(),
            orders: OrderBook::new(),
            forced_mode: None,
            meter: ThroughputMeter::default(),
            real_bytes: 0,
            stat_dirty: false,
            cancel_announced: true,
        }
    }

    fn run(
        mut self,
        commands: Receiver<Command>,
        worker_reports: Receiver<WorkerReport>,
        scan_reports: Receiver<ScanReport>,
    ) {
        let ticker = crossbeam_channel::tick(TICK);
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(worker_reports) -> report => {
                    if let Ok(report) = report {
                        self.on_worker_report(report);
                    }
                }
                recv(scan_reports) -> report => {
                    if let Ok(report) = report {
                        self.on_scan_report(report);
                    }
                }
                recv(ticker) -> _ => self.on_tick(),
            }
            self.settle();
        }
        self.shutdown(&worker_reports);
    }

    fn shutdown(&mut self, worker_reports: &Receiver<WorkerReport>) {
        log::debug!("engine shutting down");
        self.run.cancel();
        self.stop_scans();
        self.pool.shutdown();
        // Drain what the workers reported on their way out.
        loop {
            match worker_reports.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if let Some(scan) = self.scanning.take() {
            let _ = scan.handle.join();
        }
    }

    fn emit(&self, event: EngineEvent) {
        if event.is_progress() {
            let _ = self.events.try_send(event);
        } else {
            let _ = self.events.send(event);
        }
    }

    fn emit_status(&self, id: ItemId) {
        if let Some(item) = self.list.get(id) {
            self.emit(EngineEvent::ItemStatusChanged {
                id,
                status: item.status,
            });
        }
    }

    fn set_state(&mut self, state: EngineState, message: Option<String>) {
        if self.state == state {
            return;
        }
        log::info!("engine state {} -> {}", self.state, state);
        self.state = state;
        self.emit(EngineEvent::StateChanged { state, message });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                mode,
                sources,
                destination,
                order,
                reply,
            } => {
                let _ = reply.send(self.submit(mode, sources, destination, order));
            }
            Command::Import { path, reply } => {
                let _ = reply.send(self.import(&path));
            }
            Command::Export { path, reply } => {
                let _ = reply.send(self.list.export(&path));
            }
            Command::Pause(reply) => {
                self.pause();
                let _ = reply.send(Ok(()));
            }
            Command::Resume(reply) => {
                self.resume();
                let _ = reply.send(Ok(()));
            }
            Command::Cancel(reply) => {
                self.cancel();
                let _ = reply.send(Ok(()));
            }
            Command::Skip { id, reply } => {
                let _ = reply.send(self.skip(id));
            }
            Command::Remove { ids, reply } => {
                let _ = reply.send(Ok(self.remove(&ids)));
            }
            Command::Reorder {
                direction,
                ids,
                reply,
            } => {
                match direction {
                    Reorder::Top => self.list.move_top(&ids),
                    Reorder::Up => self.list.move_up(&ids),
                    Reorder::Down => self.list.move_down(&ids),
                    Reorder::Bottom => self.list.move_bottom(&ids),
                }
                let _ = reply.send(Ok(()));
            }
            Command::Resolve {
                id,
                resolution,
                apply_to_all,
                reply,
            } => {
                let _ = reply.send(self.resolve(id, resolution, apply_to_all));
            }
            Command::SetDefault {
                class,
                resolution,
                reply,
            } => {
                let _ = reply.send(self.set_default(class, resolution));
            }
            Command::Update { update, reply } => {
                let _ = reply.send(self.update_config(update));
            }
            Command::ForceMode { mode, reply } => {
                let result = match self.forced_mode {
                    Some(forced) => Err(EngineError::ModeAlreadyForced(forced)),
                    None => {
                        self.forced_mode = Some(mode);
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Items(reply) => {
                let _ = reply.send(Ok(self.list.items().to_vec()));
            }
            Command::Stat(reply) => {
                let _ = reply.send(Ok(self.current_stat()));
            }
            Command::State(reply) => {
                let _ = reply.send(Ok(self.state));
            }
            Command::Config(reply) => {
                let _ = reply.send(Ok((*self.config).clone()));
            }
            Command::SameDestination { path, reply } => {
                let same = self.requests.values().any(|r| r.destination == path);
                let _ = reply.send(Ok(same));
            }
            Command::SameSource { sources, reply } => {
                let same = sources.iter().any(|source| {
                    self.requests
                        .values()
                        .any(|r| r.sources.iter().any(|known| source.starts_with(known)))
                });
                let _ = reply.send(Ok(same));
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Command::Shutdown => {}
        }
    }

    fn submit(
        &mut self,
        mode: Mode,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        order: Option<OrderId>,
    ) -> Result<RequestId, EngineError> {
        if !self.state.accepts_requests() {
            return Err(EngineError::InvalidState(self.state));
        }
        if sources.is_empty() {
            return Err(EngineError::NoSources);
        }
        if let Some(forced) = self.forced_mode {
            if forced != mode {
                return Err(EngineError::ForcedMode {
                    forced,
                    requested: mode,
                });
            }
        }
        let destination_existed = destination.is_dir();
        if self.config.check_destination_folder && !destination_existed {
            return Err(EngineError::DestinationNotFound { path: destination });
        }
        let filters = self.config.filters.compile()?;

        let request = RequestId(self.next_request);
        self.next_request += 1;
        log::info!(
            "request {}: {} {} source(s) to {}",
            request,
            mode,
            sources.len(),
            destination.display()
        );
        self.requests.insert(
            request,
            RequestInfo {
                sources: sources.clone(),
                destination: destination.clone(),
                destination_existed,
                scan_done: false,
                settled: false,
            },
        );
        if let Some(order) = order {
            self.orders.track(request, order);
        }
        self.scan_queue.push_back(ScanJob {
            request,
            mode,
            sources,
            destination,
            filters,
        });
        if matches!(self.state, EngineState::Idle | EngineState::Completed) {
            self.set_state(EngineState::Scanning, None);
        }
        self.start_next_scan();
        Ok(request)
    }

    fn import(&mut self, path: &Path) -> Result<RequestId, EngineError> {
        if !self.state.accepts_requests() {
            return Err(EngineError::InvalidState(self.state));
        }
        let file = read_transfer_list(path)?;
        let request = RequestId(self.next_request);
        self.next_request += 1;

        let destination = file
            .items
            .first()
            .and_then(|record| record.destination_path.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let sources = file.items.iter().map(|r| r.source_path.clone()).collect();
        self.requests.insert(
            request,
            RequestInfo {
                sources,
                destination_existed: destination.is_dir(),
                destination,
                scan_done: true,
                settled: false,
            },
        );

        let mut imported = 0usize;
        for record in file.items {
            match record.into_item(request) {
                Ok(item) => {
                    self.list.append(item);
                    imported += 1;
                }
                Err(error) => self.report_scan_error(error),
            }
        }
        log::info!(
            "request {}: imported {} item(s) from {}",
            request,
            imported,
            path.display()
        );
        self.stat_dirty = true;
        if matches!(self.state, EngineState::Idle | EngineState::Completed) {
            self.set_state(EngineState::Scanning, None);
        }
        self.on_items_available();
        Ok(request)
    }

    fn start_next_scan(&mut self) {
        if self.scanning.is_some() {
            return;
        }
        let Some(job) = self.scan_queue.pop_front() else {
            return;
        };
        let stop = Arc::new(AtomicBool::new(false));
        let tx = self.scan_tx.clone();
        let request = job.request;
        let flag = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name(format!("transfer-scan-{}", request.0))
            .spawn(move || scan_thread(job, tx, flag));
        match spawned {
            Ok(handle) => {
                self.scanning = Some(RunningScan {
                    request,
                    stop,
                    handle,
                })
            }
            Err(e) => {
                log::error!("cannot start scan thread: {}", e);
                self.fatal(format!("cannot start scan thread: {}", e));
            }
        }
    }

    fn stop_scans(&mut self) {
        self.scan_queue.clear();
        if let Some(scan) = &self.scanning {
            scan.stop.store(true, Ordering::SeqCst);
        }
    }

    fn report_scan_error(&self, error: ScanError) {
        log::warn!("scan error: {}", error);
        self.emit(EngineEvent::ScanFailed {
            path: error.path().to_path_buf(),
            message: error.to_string(),
        });
    }

    fn on_scan_report(&mut self, report: ScanReport) {
        match report {
            ScanReport::Batch { request, items } => {
                if !self.requests.contains_key(&request) || !self.accepting_items() {
                    return;
                }
                for item in items {
                    self.append_scanned(item);
                }
                self.stat_dirty = true;
                self.on_items_available();
            }
            ScanReport::Failed { request, error } => {
                if self.requests.contains_key(&request) {
                    self.report_scan_error(error);
                }
            }
            ScanReport::Finished { request } => {
                if let Some(info) = self.requests.get_mut(&request) {
                    info.scan_done = true;
                }
                if let Some(scan) = self.scanning.take() {
                    if scan.request == request {
                        let _ = scan.handle.join();
                    } else {
                        self.scanning = Some(scan);
                    }
                }
                log::debug!("request {}: scan finished", request);
                if self.accepting_items() {
                    self.start_next_scan();
                }
                self.dispatch();
            }
        }
    }

    fn accepting_items(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Append an item from the scanner, applying folder decisions taken
    /// before it arrived.
    fn append_scanned(&mut self, mut item: TransferItem) {
        for (request, source, destination) in &self.redirected_folders {
            if item.request != *request {
                continue;
            }
            if item.kind == ItemKind::FolderRemove && item.source_path == *source {
                item.destination_path = destination.clone();
            } else if let Some(moved) = rebase(&item.source_path, source, destination) {
                item.destination_path = moved;
            }
        }
        let skipped = self.skipped_folders.iter().any(|(request, source)| {
            item.request == *request
                && item.source_path.starts_with(source)
                && !(item.kind == ItemKind::FolderCreate && item.source_path == *source)
        });
        if skipped {
            item.status = ItemStatus::Skipped;
        }
        self.list.append(item);
    }

    /// Leave Scanning once the list has something to execute.
    fn on_items_available(&mut self) {
        if self.state == EngineState::Scanning && self.list.has_unfinished() {
            if !self.config.auto_start || self.run.is_paused() {
                self.run.pause();
                self.set_state(EngineState::Paused, None);
            } else {
                self.set_state(EngineState::Transferring, None);
            }
        }
        self.dispatch();
    }

    fn pause(&mut self) {
        match self.state {
            EngineState::Transferring => {
                self.run.pause();
                self.set_state(EngineState::Paused, None);
            }
            EngineState::Scanning => self.run.pause(),
            _ => {}
        }
    }

    fn resume(&mut self) {
        match self.state {
            EngineState::Paused => {
                self.run.resume();
                self.set_state(EngineState::Transferring, None);
                self.dispatch();
            }
            EngineState::Scanning => self.run.resume(),
            _ => {}
        }
    }

    fn cancel(&mut self) {
        if self.state == EngineState::Canceled {
            return;
        }
        log::info!("canceling transfer");
        self.run.cancel();
        self.stop_scans();
        self.set_state(EngineState::Canceled, None);

        for id in self.list.cancel_pending() {
            self.emit_status(id);
        }
        let awaiting: Vec<ItemId> = self.awaiting.drain().map(|(id, _)| id).collect();
        for id in awaiting {
            if checked(self.list.transition(id, ItemStatus::Canceled)).is_some() {
                self.emit_status(id);
            }
        }
        for order in self.orders.drain() {
            self.emit(EngineEvent::OrderCanceled { order });
        }
        self.cancel_announced = false;
        self.announce_cancel();
    }

    fn announce_cancel(&mut self) {
        if !self.cancel_announced && self.active.is_empty() {
            self.cancel_announced = true;
            let stat = self.current_stat();
            self.emit(EngineEvent::AggregateProgress(stat));
            self.emit(EngineEvent::Canceled);
        }
    }

    fn skip(&mut self, id: ItemId) -> Result<(), EngineError> {
        let item = self.list.get(id).ok_or(ListError::UnknownItem(id))?;
        let (status, kind) = (item.status, item.kind);
        match status {
            status if status.is_active() => {
                if let Some(control) = self.active.get(&id) {
                    control.request_skip();
                    self.run.wake();
                }
            }
            ItemStatus::Pending | ItemStatus::Error => {
                self.awaiting.remove(&id);
                self.list.transition(id, ItemStatus::Skipped)?;
                self.emit_status(id);
                if kind == ItemKind::FolderCreate {
                    self.skip_folder(id);
                }
                self.stat_dirty = true;
                self.dispatch();
            }
            _ => {}
        }
        Ok(())
    }

    fn skip_folder(&mut self, id: ItemId) {
        if let Some(folder) = self.list.get(id) {
            self.skipped_folders
                .push((folder.request, folder.source_path.clone()));
        }
        if let Some(skipped) = checked(self.list.skip_subtree(id)) {
            for child in skipped {
                self.awaiting.remove(&child);
                self.emit_status(child);
            }
        }
    }

    fn remove(&mut self, ids: &[ItemId]) -> usize {
        for id in ids {
            let paused = self
                .list
                .get(*id)
                .is_some_and(|item| item.status == ItemStatus::Paused);
            if paused {
                if let Some(control) = self.active.get(id) {
                    control.request_skip();
                }
            }
        }
        self.run.wake();
        let removed = self.list.remove(ids);
        for item in &removed {
            self.awaiting.remove(&item.id);
        }
        self.stat_dirty = true;
        self.dispatch();
        removed.len()
    }

    fn resolve(
        &mut self,
        id: ItemId,
        resolution: Resolution,
        apply_to_all: bool,
    ) -> Result<(), EngineError> {
        let class = *self
            .awaiting
            .get(&id)
            .ok_or(EngineError::NoPendingDecision(id))?;
        if !resolution.answers(class) || !resolution.is_set() {
            return Err(EngineError::UnsuitableResolution { class, resolution });
        }
        self.awaiting.remove(&id);
        self.list.set_decision(id, resolution)?;
        log::debug!("item {} resolved with {:?}", id, resolution);
        if class.is_error() {
            self.apply_error_decision(id, resolution, true);
        }
        if apply_to_all {
            self.resolver.remember(class, resolution);
            self.settle_awaiting(class);
        }
        self.dispatch();
        Ok(())
    }

    fn set_default(&mut self, class: CollisionClass, resolution: Resolution) -> Result<(), EngineError> {
        if !resolution.answers(class) {
            return Err(EngineError::UnsuitableResolution { class, resolution });
        }
        self.resolver.remember(class, resolution);
        if resolution.is_set() {
            self.settle_awaiting(class);
        }
        self.dispatch();
        Ok(())
    }

    /// Release every item waiting on `class` now that an answer is remembered.
    fn settle_awaiting(&mut self, class: CollisionClass) {
        let waiting: Vec<ItemId> = self
            .awaiting
            .iter()
            .filter(|(_, c)| **c == class)
            .map(|(id, _)| *id)
            .collect();
        let resolution = self.resolver.effective(class);
        for id in waiting {
            self.awaiting.remove(&id);
            if class.is_error() {
                self.apply_error_decision(id, resolution, true);
            }
        }
    }

    /// Carry out an error-recovery answer for an item in Error.
    fn apply_error_decision(&mut self, id: ItemId, resolution: Resolution, explicit: bool) {
        let Resolution::Error(action) = resolution else {
            return;
        };
        match action {
            ErrorAction::Skip => {
                if checked(self.list.transition(id, ItemStatus::Skipped)).is_some() {
                    self.emit_status(id);
                    if self.list.get(id).is_some_and(|i| i.kind == ItemKind::FolderCreate) {
                        self.skip_folder(id);
                    }
                }
            }
            ErrorAction::PutToEndOfList => {
                let attempts = self.list.get(id).map_or(0, |item| item.attempts);
                if explicit || attempts < self.config.max_requeue {
                    if checked(self.list.requeue(id)).is_some() {
                        log::debug!("item {} put back at the end of the list", id);
                        self.emit_status(id);
                    }
                } else if let Some(item) = self.list.get(id).cloned() {
                    // Out of retries: stays in Error until a decision arrives.
                    log::warn!("item {} failed {} times, asking what to do", id, attempts + 1);
                    self.ask(&item, CollisionClass::error_for(item.kind));
                }
            }
            ErrorAction::NotSet => {}
        }
        self.stat_dirty = true;
    }

    fn update_config(&mut self, update: Update) -> Result<(), EngineError> {
        let mut next = (*self.config).clone();
        update(&mut next)?;
        next.validate()?;
        self.resolver.set_policy(next.collision);
        self.resolver.set_renaming_rules(next.renaming.clone());
        self.shared.apply(&next);
        log::debug!("configuration updated");
        self.config = Arc::new(next);
        self.dispatch();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        if !self.active.is_empty() {
            return Err(EngineError::InvalidState(self.state));
        }
        self.stop_scans();
        for order in self.orders.drain() {
            self.emit(EngineEvent::OrderCanceled { order });
        }
        self.list.clear();
        self.awaiting.clear();
        self.requests.clear();
        self.skipped_folders.clear();
        self.redirected_folders.clear();
        self.resolver.reset();
        self.run = Arc::new(RunControl::new(false));
        self.meter.reset();
        self.real_bytes = 0;
        self.stat_dirty = false;
        self.cancel_announced = true;
        self.set_state(EngineState::Idle, None);
        Ok(())
    }

    fn fatal(&mut self, message: String) {
        log::error!("{}", message);
        self.run.cancel();
        self.stop_scans();
        self.awaiting.clear();
        self.set_state(EngineState::Error, Some(message));
        for request in self.orders.requests() {
            if let Some(order) = self.orders.close(request) {
                self.emit(EngineEvent::OrderFinished {
                    order,
                    with_error: true,
                });
            }
        }
    }

    /// Start every item that may start now.
    fn dispatch(&mut self) {
        while self.state == EngineState::Transferring {
            let awaiting = &self.awaiting;
            let Some(item) = self.list.next_dispatchable(|id| awaiting.contains_key(id)) else {
                break;
            };
            if item.kind == ItemKind::File && self.active.len() >= self.config.parallel_transfers {
                break;
            }
            let mut item = item.clone();

            if !item.resolved {
                match self.resolver.resolve(&item) {
                    Verdict::Proceed | Verdict::Merge => {}
                    Verdict::Skip => {
                        log::debug!("skipping {} (destination exists)", item.destination_path.display());
                        checked(self.list.transition(item.id, ItemStatus::Skipped));
                        self.emit_status(item.id);
                        if item.kind == ItemKind::FolderCreate {
                            self.skip_folder(item.id);
                        }
                        self.stat_dirty = true;
                        continue;
                    }
                    Verdict::Redirect(destination) => {
                        if item.kind == ItemKind::FolderCreate {
                            self.redirected_folders.push((
                                item.request,
                                item.source_path.clone(),
                                destination.clone(),
                            ));
                        }
                        checked(self.list.redirect(item.id, destination.clone()));
                        item.destination_path = destination;
                    }
                    Verdict::Ask(class) => {
                        self.ask(&item, class);
                        continue;
                    }
                }
                checked(self.list.mark_resolved(item.id));
            }

            match item.kind {
                ItemKind::File => self.start_file(item),
                ItemKind::FolderCreate => self.run_folder_create(item),
                ItemKind::FolderRemove => self.run_folder_remove(item),
            }
        }
    }

    fn ask(&mut self, item: &TransferItem, class: CollisionClass) {
        log::debug!("item {} waits for a {} decision", item.id, class);
        self.awaiting.insert(item.id, class);
        self.emit(EngineEvent::CollisionDetected {
            id: item.id,
            class,
            proposed: class.proposed_outcomes(),
            destination: item.destination_path.clone(),
        });
    }

    fn start_file(&mut self, item: TransferItem) {
        if checked(self.list.transition(item.id, ItemStatus::InProgress)).is_none() {
            return;
        }
        self.emit_status(item.id);
        let control = Arc::new(ItemControl::default());
        let resume_from = if item.verified == Some(false) {
            0
        } else {
            item.bytes_transferred
        };
        let job = Job {
            id: item.id,
            source: item.source_path,
            destination: item.destination_path,
            mode: item.mode,
            size_bytes: item.size_bytes,
            resume_from,
            config: Arc::clone(&self.config),
            run: Arc::clone(&self.run),
            control: Arc::clone(&control),
        };
        self.active.insert(item.id, control);
        if !self.pool.submit(job) {
            self.active.remove(&item.id);
            self.fatal("the worker pool has stopped".to_string());
        }
    }

    fn run_folder_create(&mut self, item: TransferItem) {
        checked(self.list.transition(item.id, ItemStatus::InProgress));
        match fs_ops::create_folder(&item.destination_path) {
            Ok(()) => {
                checked(self.list.complete(item.id, 0, None));
                self.emit_status(item.id);
            }
            Err(error) => self.handle_failure(item.id, error),
        }
        self.stat_dirty = true;
    }

    fn run_folder_remove(&mut self, item: TransferItem) {
        checked(self.list.transition(item.id, ItemStatus::InProgress));
        match fs_ops::remove_empty_folder(&item.source_path) {
            Ok(true) => {
                checked(self.list.complete(item.id, 0, None));
                self.emit_status(item.id);
            }
            Ok(false) => {
                log::warn!(
                    "{} is not empty, leaving it in place",
                    item.source_path.display()
                );
                checked(self.list.transition(item.id, ItemStatus::Skipped));
                self.emit_status(item.id);
            }
            Err(error) => self.handle_failure(item.id, error),
        }
        self.stat_dirty = true;
    }

    /// Record a failed item and apply the error-recovery policy.
    fn handle_failure(&mut self, id: ItemId, error: TransferError) {
        let kind = error.kind();
        let message = error.to_string();
        log::warn!("item {} failed: {}", id, message);
        if checked(self.list.fail(id, kind, message.clone())).is_none() {
            return;
        }
        self.emit_status(id);
        self.emit(EngineEvent::ItemError { id, kind, message });
        self.stat_dirty = true;

        let Some(item) = self.list.get(id).cloned() else {
            return;
        };
        if let Some(root) = self.lost_destination(item.request) {
            self.fatal(format!(
                "destination {} is no longer available",
                root.display()
            ));
            return;
        }
        match self.resolver.error_action(&item) {
            ErrorAction::NotSet => self.ask(&item, CollisionClass::error_for(item.kind)),
            action => self.apply_error_decision(id, Resolution::Error(action), false),
        }
    }

    /// The destination root of `request`, if it existed and is gone.
    fn lost_destination(&self, request: RequestId) -> Option<PathBuf> {
        let info = self.requests.get(&request)?;
        if !info.destination_existed {
            return None;
        }
        match fs::metadata(&info.destination) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Some(info.destination.clone()),
            _ => None,
        }
    }

    fn on_worker_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Started { id, size_bytes } => {
                checked(self.list.set_size(id, size_bytes));
                self.stat_dirty = true;
            }
            WorkerReport::Progress { id, bytes, written } => {
                self.real_bytes += written;
                self.meter.record(Instant::now(), written);
                if let Some(Some(visible)) = checked(self.list.record_progress(id, bytes)) {
                    self.emit(EngineEvent::ItemProgress {
                        id,
                        bytes_transferred: visible,
                    });
                }
                self.stat_dirty = true;
            }
            WorkerReport::Paused { id } => {
                if checked(self.list.transition(id, ItemStatus::Paused)).is_some() {
                    self.emit_status(id);
                }
            }
            WorkerReport::Resumed { id } => {
                if checked(self.list.transition(id, ItemStatus::InProgress)).is_some() {
                    self.emit_status(id);
                }
            }
            WorkerReport::Finished { id, outcome } => {
                self.active.remove(&id);
                self.on_finished(id, outcome);
                self.stat_dirty = true;
                self.announce_cancel();
                self.dispatch();
            }
        }
    }

    fn on_finished(&mut self, id: ItemId, outcome: Outcome) {
        if self.list.get(id).is_none() {
            // removed while paused
            return;
        }
        match self.state {
            EngineState::Error => {
                match outcome {
                    Outcome::Done { bytes, verified } => {
                        checked(self.list.complete(id, bytes, verified));
                    }
                    Outcome::Skipped { bytes }
                    | Outcome::Canceled { bytes }
                    | Outcome::Failed { bytes, .. } => {
                        checked(self.list.record_progress(id, bytes));
                        checked(self.list.fail(
                            id,
                            ErrorKind::Io,
                            "transfer stopped by an unrecoverable error".to_string(),
                        ));
                    }
                }
                self.emit_status(id);
                return;
            }
            EngineState::Canceled => {
                // No recovery after a cancel: whatever did not finish is Canceled.
                match outcome {
                    Outcome::Done { bytes, verified } => {
                        checked(self.list.complete(id, bytes, verified));
                    }
                    Outcome::Skipped { bytes } => {
                        checked(self.list.record_progress(id, bytes));
                        checked(self.list.transition(id, ItemStatus::Skipped));
                    }
                    Outcome::Canceled { bytes } | Outcome::Failed { bytes, .. } => {
                        checked(self.list.record_progress(id, bytes));
                        checked(self.list.transition(id, ItemStatus::Canceled));
                    }
                }
                self.emit_status(id);
                return;
            }
            _ => {}
        }
        match outcome {
            Outcome::Done { bytes, verified } => {
                if checked(self.list.complete(id, bytes, verified)).is_some() {
                    log::debug!("item {} done ({} bytes)", id, bytes);
                    self.emit(EngineEvent::ItemProgress {
                        id,
                        bytes_transferred: bytes,
                    });
                    self.emit_status(id);
                }
            }
            Outcome::Skipped { bytes } => {
                checked(self.list.record_progress(id, bytes));
                if checked(self.list.transition(id, ItemStatus::Skipped)).is_some() {
                    self.emit_status(id);
                }
            }
            Outcome::Canceled { bytes } => {
                checked(self.list.record_progress(id, bytes));
                if checked(self.list.transition(id, ItemStatus::Canceled)).is_some() {
                    self.emit_status(id);
                }
            }
            Outcome::Failed { error, bytes } => {
                checked(self.list.record_progress(id, bytes));
                self.handle_failure(id, error);
            }
        }
    }

    fn current_stat(&mut self) -> TransferStat {
        let mut stat = self.list.stat();
        stat.real_bytes_transferred = self.real_bytes;
        stat.throughput = self.meter.rate(Instant::now());
        stat
    }

    fn on_tick(&mut self) {
        if self.stat_dirty || !self.active.is_empty() {
            self.stat_dirty = false;
            let stat = self.current_stat();
            self.emit(EngineEvent::AggregateProgress(stat));
        }
    }

    /// Report settled requests and detect completion.
    fn settle(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let open: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, info)| info.scan_done && !info.settled)
            .map(|(id, _)| *id)
            .collect();
        for request in open {
            let waiting = self
                .awaiting
                .keys()
                .any(|id| self.list.get(*id).is_some_and(|item| item.request == request));
            if waiting {
                continue;
            }
            if let Some(with_error) = self.list.request_outcome(request) {
                if let Some(info) = self.requests.get_mut(&request) {
                    info.settled = true;
                }
                log::info!(
                    "request {} finished{}",
                    request,
                    if with_error { " with errors" } else { "" }
                );
                if let Some(order) = self.orders.close(request) {
                    self.emit(EngineEvent::OrderFinished { order, with_error });
                }
            }
        }

        let busy = self.list.has_unfinished()
            || self.list.has_errors()
            || !self.awaiting.is_empty()
            || !self.active.is_empty()
            || self.scanning.is_some()
            || !self.scan_queue.is_empty();
        let running = matches!(
            self.state,
            EngineState::Scanning | EngineState::Transferring | EngineState::Paused
        );
        if running && !busy {
            let stat = self.current_stat();
            self.stat_dirty = false;
            self.emit(EngineEvent::AggregateProgress(stat));
            self.set_state(EngineState::Completed, None);
            self.emit(EngineEvent::Completed);
        }
    }
}

fn scan_thread(job: ScanJob, tx: Sender<ScanReport>, stop: Arc<AtomicBool>) {
    let request = job.request;
    let scanner = Scanner::new(request, job.mode, job.sources, job.destination, job.filters);
    let mut batch = Vec::new();
    let mut last_flush = Instant::now();

    let flush = |batch: &mut Vec<TransferItem>, last_flush: &mut Instant| -> bool {
        *last_flush = Instant::now();
        if batch.is_empty() {
            return true;
        }
        tx.send(ScanReport::Batch {
            request,
            items: std::mem::take(batch),
        })
        .is_ok()
    };

    for result in scanner {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match result {
            Ok(item) => batch.push(item),
            Err(error) => {
                if !flush(&mut batch, &mut last_flush)
                    || tx.send(ScanReport::Failed { request, error }).is_err()
                {
                    return;
                }
            }
        }
        if (batch.len() >= SCAN_BATCH || last_flush.elapsed() >= SCAN_FLUSH)
            && !flush(&mut batch, &mut last_flush)
        {
            return;
        }
    }
    if !stop.load(Ordering::SeqCst) {
        flush(&mut batch, &mut last_flush);
    }
    let _ = tx.send(ScanReport::Finished { request });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: Configuration) -> (Controller, Receiver<EngineEvent>) {
        let (event_tx, events) = crossbeam_channel::unbounded();
        let (worker_tx, _worker_rx) = crossbeam_channel::unbounded();
        let (scan_tx, _scan_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new(&config));
        let pool = WorkerPool::spawn(Arc::clone(&shared), worker_tx).expect("Failed to spawn workers");
        (Controller::new(config, shared, pool, event_tx, scan_tx), events)
    }

    fn in_progress(controller: &mut Controller, size: u64) -> ItemId {
        let mut item = TransferItem::file(
            RequestId(1),
            Mode::Copy,
            PathBuf::from("/src/a.bin"),
            PathBuf::from("/dst/a.bin"),
            size,
        );
        item.status = ItemStatus::InProgress;
        let id = controller.list.append(item);
        controller.active.insert(id, Arc::new(ItemControl::default()));
        controller.state = EngineState::Transferring;
        id
    }

    #[test]
    fn test_failure_reported_after_cancel_ends_canceled() {
        let mut config = Configuration::default();
        config.collision.file_error = ErrorAction::PutToEndOfList;
        let (mut controller, events) = controller(config);
        let id = in_progress(&mut controller, 100);

        controller.cancel();
        assert_eq!(controller.list.get(id).map(|item| item.status), Some(ItemStatus::InProgress));

        controller.on_worker_report(WorkerReport::Finished {
            id,
            outcome: Outcome::Failed {
                error: TransferError::Write {
                    path: PathBuf::from("/dst/a.bin"),
                    source: io::Error::new(io::ErrorKind::Other, "interrupted"),
                },
                bytes: 40,
            },
        });

        let item = controller.list.get(id).expect("item kept");
        assert_eq!(item.status, ItemStatus::Canceled);
        assert_eq!(item.bytes_transferred, 40);
        assert_eq!(item.attempts, 0, "a canceled run never requeues");
        assert!(controller.awaiting.is_empty());

        let events: Vec<EngineEvent> = events.try_iter().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::CollisionDetected { .. } | EngineEvent::ItemError { .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Canceled)));
    }

    #[test]
    fn test_success_reported_after_cancel_stays_done() {
        let (mut controller, _events) = controller(Configuration::default());
        let id = in_progress(&mut controller, 100);

        controller.cancel();
        controller.on_worker_report(WorkerReport::Finished {
            id,
            outcome: Outcome::Done {
                bytes: 100,
                verified: None,
            },
        });

        let item = controller.list.get(id).expect("item kept");
        assert_eq!(item.status, ItemStatus::Done);
        assert_eq!(item.bytes_transferred, 100);
    }
}
