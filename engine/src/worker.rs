//! Transfer Worker Pool.
//!
//! A fixed set of threads receives file jobs from the control thread and
//! reports back over a channel. Workers never touch the Transfer List: they
//! hold a copy of the paths they need and describe what happened in
//! `WorkerReport`s, and the control thread turns those into status changes.
//!
//! Pause, cancel and skip are cooperative. A worker looks at them at every
//! block boundary (its checkpoint), so a destination is always either
//! untouched, complete, or cut at a block boundary.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::checksums::{compute_file_checksum, feed_prefix, RollingDigest};
use crate::config::{Configuration, MAX_PARALLEL_TRANSFERS};
use crate::error::TransferError;
use crate::fs_ops;
use crate::model::{ItemId, Mode};
use crate::throttle::{BufferGate, SpeedLimiter};

const POLL: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a worker should do after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Continue,
    Skip,
    Cancel,
}

/// Run-wide flags shared by the control thread and every worker.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    paused: Mutex<bool>,
    resumed: Condvar,
    canceled: AtomicBool,
}

impl RunControl {
    pub fn new(paused: bool) -> Self {
        RunControl {
            paused: Mutex::new(paused),
            resumed: Condvar::new(),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        *lock(&self.paused) = true;
    }

    pub fn resume(&self) {
        *lock(&self.paused) = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.paused)
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.resumed.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Wake paused workers so they look at their flags again.
    pub fn wake(&self) {
        self.resumed.notify_all();
    }

    fn interrupted(&self, item: &ItemControl) -> Option<Checkpoint> {
        if self.is_canceled() {
            Some(Checkpoint::Cancel)
        } else if item.skip_requested() {
            Some(Checkpoint::Skip)
        } else {
            None
        }
    }

    /// Block while the run is paused.
    pub fn wait_while_paused(&self, item: &ItemControl) -> Checkpoint {
        let mut paused = lock(&self.paused);
        while *paused {
            if let Some(stop) = self.interrupted(item) {
                return stop;
            }
            paused = self
                .resumed
                .wait_timeout(paused, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(paused);
        self.interrupted(item).unwrap_or(Checkpoint::Continue)
    }

    /// Sleep for `duration`, waking early on cancel or skip.
    pub fn sleep(&self, duration: Duration, item: &ItemControl) -> Checkpoint {
        let deadline = Instant::now() + duration;
        loop {
            if let Some(stop) = self.interrupted(item) {
                return stop;
            }
            let now = Instant::now();
            if now >= deadline {
                return Checkpoint::Continue;
            }
            thread::sleep((deadline - now).min(POLL));
        }
    }
}

/// Per-item flag set by `skip` or `remove_items`.
#[derive(Debug, Default)]
pub(crate) struct ItemControl {
    skip: AtomicBool,
}

impl ItemControl {
    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn skip_requested(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }
}

/// Resources every worker draws on.
#[derive(Debug)]
pub(crate) struct Shared {
    pub limiter: SpeedLimiter,
    pub gate: BufferGate,
}

impl Shared {
    pub fn new(config: &Configuration) -> Self {
        Shared {
            limiter: SpeedLimiter::new(config.speed_limit, config.block_size as u64),
            gate: BufferGate::new(config.buffer_capacity()),
        }
    }

    /// Apply the settings that act on running transfers.
    pub fn apply(&self, config: &Configuration) {
        self.limiter.set_rate(config.speed_limit);
        self.limiter.set_burst(config.block_size as u64);
        self.gate.set_capacity(config.buffer_capacity());
    }
}

/// One file transfer handed to a worker.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: ItemId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: Mode,
    /// Planned size, used to detect a short read
    pub size_bytes: u64,
    /// Committed offset of a previous attempt
    pub resume_from: u64,
    pub config: Arc<Configuration>,
    pub run: Arc<RunControl>,
    pub control: Arc<ItemControl>,
}

/// How a job ended. `bytes` is the committed offset at that point.
#[derive(Debug)]
pub(crate) enum Outcome {
    Done { bytes: u64, verified: Option<bool> },
    Skipped { bytes: u64 },
    Canceled { bytes: u64 },
    Failed { error: TransferError, bytes: u64 },
}

/// Messages from workers to the control thread.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    Started { id: ItemId, size_bytes: u64 },
    /// `written` counts bytes written since the previous report
    Progress { id: ItemId, bytes: u64, written: u64 },
    Paused { id: ItemId },
    Resumed { id: ItemId },
    Finished { id: ItemId, outcome: Outcome },
}

/// The worker threads.
pub(crate) struct WorkerPool {
    jobs: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `MAX_PARALLEL_TRANSFERS` workers. The control thread decides how
    /// many of them are busy at once.
    pub fn spawn(shared: Arc<Shared>, reports: Sender<WorkerReport>) -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::bounded::<Job>(MAX_PARALLEL_TRANSFERS);
        let mut handles = Vec::with_capacity(MAX_PARALLEL_TRANSFERS);
        for index in 0..MAX_PARALLEL_TRANSFERS {
            let queue: Receiver<Job> = queue.clone();
            let shared = Arc::clone(&shared);
            let reports = reports.clone();
            let handle = thread::Builder::new()
                .name(format!("transfer-worker-{}", index))
                .spawn(move || worker_loop(queue, shared, reports))?;
            handles.push(handle);
        }
        Ok(WorkerPool {
            jobs: Some(jobs),
            handles,
        })
    }

    /// Hand a job to the next idle worker. Returns false if the pool is gone.
    pub fn submit(&self, job: Job) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs and wait for every worker to exit.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("a transfer worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: Receiver<Job>, shared: Arc<Shared>, reports: Sender<WorkerReport>) {
    for job in queue.iter() {
        log::debug!(
            "worker {:?} starts {}",
            thread::current().name(),
            job.source.display()
        );
        let mut transfer = FileTransfer::new(&job, &shared, &reports);
        let outcome = transfer.run();
        transfer.flush_progress();
        if reports
            .send(WorkerReport::Finished { id: job.id, outcome })
            .is_err()
        {
            break;
        }
    }
}

/// State of one running file transfer.
struct FileTransfer<'a> {
    job: &'a Job,
    shared: &'a Shared,
    reports: &'a Sender<WorkerReport>,
    /// Offset up to which the destination is written
    position: u64,
    /// Bytes written since the last progress report
    unreported: u64,
    last_report: Instant,
}

impl<'a> FileTransfer<'a> {
    fn new(job: &'a Job, shared: &'a Shared, reports: &'a Sender<WorkerReport>) -> Self {
        FileTransfer {
            job,
            shared,
            reports,
            position: job.resume_from,
            unreported: 0,
            last_report: Instant::now(),
        }
    }

    fn report(&self, report: WorkerReport) {
        // The control thread outlives the workers; a failed send only
        // happens during shutdown.
        let _ = self.reports.send(report);
    }

    fn flush_progress(&mut self) {
        if self.unreported > 0 {
            self.report(WorkerReport::Progress {
                id: self.job.id,
                bytes: self.position,
                written: self.unreported,
            });
            self.unreported = 0;
        }
        self.last_report = Instant::now();
    }

    fn checkpoint(&mut self) -> Checkpoint {
        let run = &self.job.run;
        if let Some(stop) = run.interrupted(&self.job.control) {
            return stop;
        }
        if !run.is_paused() {
            return Checkpoint::Continue;
        }
        self.flush_progress();
        self.report(WorkerReport::Paused { id: self.job.id });
        let next = run.wait_while_paused(&self.job.control);
        if next == Checkpoint::Continue {
            self.report(WorkerReport::Resumed { id: self.job.id });
        }
        next
    }

    fn stopped(&self, checkpoint: Checkpoint) -> Outcome {
        if checkpoint == Checkpoint::Cancel {
            Outcome::Canceled {
                bytes: self.position,
            }
        } else {
            Outcome::Skipped {
                bytes: self.position,
            }
        }
    }

    fn failed(&self, error: TransferError) -> Outcome {
        Outcome::Failed {
            error,
            bytes: self.position,
        }
    }

    fn run(&mut self) -> Outcome {
        let checkpoint = self.checkpoint();
        if checkpoint != Checkpoint::Continue {
            return self.stopped(checkpoint);
        }
        if self.job.mode == Mode::Move && self.job.resume_from == 0 {
            if let Some(outcome) = self.try_move_by_rename() {
                return outcome;
            }
        }
        match self.copy() {
            Ok(outcome) => outcome,
            Err(error) => self.failed(error),
        }
    }

    fn try_move_by_rename(&mut self) -> Option<Outcome> {
        let job = self.job;
        let metadata = std::fs::symlink_metadata(&job.source).ok()?;
        if metadata.file_type().is_symlink() {
            return None;
        }
        if !fs_ops::try_rename(&job.source, &job.destination) {
            return None;
        }
        self.report(WorkerReport::Started {
            id: job.id,
            size_bytes: metadata.len(),
        });
        self.position = metadata.len();
        log::debug!(
            "moved {} to {} by rename",
            job.source.display(),
            job.destination.display()
        );
        Some(Outcome::Done {
            bytes: metadata.len(),
            verified: None,
        })
    }

    fn copy(&mut self) -> Result<Outcome, TransferError> {
        let job = self.job;
        let shared = self.shared;
        let config = &*job.config;

        let mut source =
            File::open(&job.source).map_err(|e| TransferError::read(&job.source, e))?;
        let metadata = source
            .metadata()
            .map_err(|e| TransferError::read(&job.source, e))?;
        let size = metadata.len();
        self.report(WorkerReport::Started {
            id: job.id,
            size_bytes: size,
        });

        fs_ops::ensure_parent_dir_exists(&job.destination)?;
        let offset = job
            .resume_from
            .min(size)
            .min(fs_ops::existing_len(&job.destination));
        self.position = offset;
        let mut destination = fs_ops::open_destination(&job.destination, offset)?;

        let mut digest = config
            .checksum
            .enabled
            .then(|| RollingDigest::new(config.checksum.algorithm));
        if offset > 0 {
            log::debug!("resuming {} at byte {}", job.source.display(), offset);
            match digest.as_mut() {
                Some(digest) => {
                    let fed = feed_prefix(&mut source, offset, digest)
                        .map_err(|e| TransferError::read(&job.source, e))?;
                    if fed < offset {
                        return Err(TransferError::SourceChanged {
                            path: job.source.clone(),
                            expected: offset,
                            actual: fed,
                        });
                    }
                }
                None => {
                    source
                        .seek(SeekFrom::Start(offset))
                        .map_err(|e| TransferError::read(&job.source, e))?;
                }
            }
        }

        let gated = config.buffer_capacity().is_some();
        let write_through = !config.buffer.os_buffer || gated;
        let mut buffer = vec![0u8; config.block_size];

        loop {
            let checkpoint = self.checkpoint();
            if checkpoint != Checkpoint::Continue {
                return Ok(self.stopped(checkpoint));
            }

            let permit = if gated {
                let run = &job.run;
                let control = &job.control;
                match shared.gate.acquire(buffer.len() as u64, || {
                    run.is_canceled() || control.skip_requested()
                }) {
                    Some(permit) => Some(permit),
                    None => continue,
                }
            } else {
                None
            };

            let n = read_block(&mut source, &mut buffer)
                .map_err(|e| TransferError::read(&job.source, e))?;
            if n == 0 {
                break;
            }

            let wait = shared.limiter.reserve(n as u64);
            if !wait.is_zero() {
                let checkpoint = job.run.sleep(wait, &job.control);
                if checkpoint != Checkpoint::Continue {
                    return Ok(self.stopped(checkpoint));
                }
            }

            destination
                .write_all(&buffer[..n])
                .map_err(|e| TransferError::write(&job.destination, e))?;
            if write_through {
                destination
                    .sync_data()
                    .map_err(|e| TransferError::write(&job.destination, e))?;
            }
            drop(permit);

            if let Some(digest) = digest.as_mut() {
                digest.update(&buffer[..n]);
            }
            self.position += n as u64;
            self.unreported += n as u64;
            if self.last_report.elapsed() >= config.progress_interval() {
                self.flush_progress();
            }
        }
        drop(destination);
        self.flush_progress();

        let short_read = self.position < job.size_bytes.min(size);
        let suspect = offset > 0 || short_read;
        let verified = match digest {
            Some(digest) if !config.checksum.only_on_error || suspect => self.verify(digest)?,
            _ if short_read => {
                return Err(TransferError::SourceChanged {
                    path: job.source.clone(),
                    expected: size,
                    actual: self.position,
                })
            }
            _ => None,
        };

        fs_ops::preserve_metadata(
            &metadata,
            &job.destination,
            config.preserve_timestamps,
            config.preserve_permissions,
        )?;

        if job.mode == Mode::Move {
            fs_ops::remove_source_file(&job.source)?;
        }

        Ok(Outcome::Done {
            bytes: self.position,
            verified,
        })
    }

    /// Re-read the destination and compare it with the digest of the bytes read.
    fn verify(&self, digest: RollingDigest) -> Result<Option<bool>, TransferError> {
        let job = self.job;
        let checksum = &job.config.checksum;
        let expected = digest.finalize();
        match compute_file_checksum(&job.destination, checksum.algorithm) {
            Ok(actual) if actual == expected => Ok(Some(true)),
            Ok(actual) => Err(TransferError::ChecksumMismatch {
                path: job.destination.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            Err(e) if checksum.ignore_if_impossible => {
                log::warn!(
                    "cannot verify {}: {}, keeping the transfer",
                    job.destination.display(),
                    e
                );
                Ok(None)
            }
            Err(source) => Err(TransferError::ChecksumUnavailable {
                path: job.destination.clone(),
                source,
            }),
        }
    }
}

/// Fill `buffer` as far as the source allows. Returns 0 at end of file.
fn read_block<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use std::fs;

    struct Harness {
        shared: Arc<Shared>,
        reports: Receiver<WorkerReport>,
        sender: Sender<WorkerReport>,
    }

    impl Harness {
        fn new(config: &Configuration) -> Self {
            let (sender, reports) = crossbeam_channel::unbounded();
            Harness {
                shared: Arc::new(Shared::new(config)),
                reports,
                sender,
            }
        }

        fn run(&self, job: &Job) -> Outcome {
            let mut transfer = FileTransfer::new(job, &self.shared, &self.sender);
            let outcome = transfer.run();
            transfer.flush_progress();
            outcome
        }
    }

    fn job(config: Configuration, source: PathBuf, destination: PathBuf, mode: Mode) -> Job {
        let size_bytes = fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        Job {
            id: ItemId::new(),
            source,
            destination,
            mode,
            size_bytes,
            resume_from: 0,
            config: Arc::new(config),
            run: Arc::new(RunControl::new(false)),
            control: Arc::new(ItemControl::default()),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_copy_with_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let data = pattern(300 * 1024);
        fs::write(&src, &data).expect("write");
        let config = Configuration {
            checksum: crate::config::ChecksumOptions {
                enabled: true,
                algorithm: ChecksumAlgorithm::Sha256,
                only_on_error: false,
                ignore_if_impossible: false,
            },
            ..Configuration::default()
        };
        let harness = Harness::new(&config);
        let job = job(config, src.clone(), temp_dir.path().join("out/dst.bin"), Mode::Copy);

        match harness.run(&job) {
            Outcome::Done { bytes, verified } => {
                assert_eq!(bytes, data.len() as u64);
                assert_eq!(verified, Some(true));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fs::read(temp_dir.path().join("out/dst.bin")).expect("read"), data);
        assert!(src.exists(), "copy keeps the source");

        let written: u64 = harness
            .reports
            .try_iter()
            .filter_map(|r| match r {
                WorkerReport::Progress { written, .. } => Some(written),
                _ => None,
            })
            .sum();
        assert_eq!(written, data.len() as u64);
    }

    #[test]
    fn test_resume_from_committed_offset() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        let data = pattern(10_000);
        fs::write(&src, &data).expect("write");
        // a previous attempt wrote 4000 bytes, the last 1000 of them garbage past the commit point
        let mut partial = data[..3000].to_vec();
        partial.extend_from_slice(&[0xff; 1000]);
        fs::write(&dst, &partial).expect("write partial");

        let config = Configuration::default();
        let harness = Harness::new(&config);
        let mut job = job(config, src, dst.clone(), Mode::Copy);
        job.resume_from = 3000;

        match harness.run(&job) {
            Outcome::Done { bytes, .. } => assert_eq!(bytes, 10_000),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fs::read(&dst).expect("read"), data);
        let written: u64 = harness
            .reports
            .try_iter()
            .filter_map(|r| match r {
                WorkerReport::Progress { written, .. } => Some(written),
                _ => None,
            })
            .sum();
        assert_eq!(written, 7000, "only the missing tail is rewritten");
    }

    #[test]
    fn test_move_removes_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        let dst = temp_dir.path().join("moved/dst.txt");
        fs::write(&src, b"payload").expect("write");

        let config = Configuration::default();
        let harness = Harness::new(&config);
        let job = job(config, src.clone(), dst.clone(), Mode::Move);
        assert!(matches!(harness.run(&job), Outcome::Done { bytes: 7, .. }));
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("read"), b"payload");
    }

    #[test]
    fn test_canceled_before_start_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        let dst = temp_dir.path().join("dst.txt");
        fs::write(&src, b"payload").expect("write");

        let config = Configuration::default();
        let harness = Harness::new(&config);
        let job = job(config, src, dst.clone(), Mode::Copy);
        job.run.cancel();
        assert!(matches!(harness.run(&job), Outcome::Canceled { bytes: 0 }));
        assert!(!dst.exists());
    }

    #[test]
    fn test_skip_request_stops_at_block_boundary() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        fs::write(&src, pattern(64 * 1024)).expect("write");

        let config = Configuration {
            block_size: 4096,
            speed_limit: 16 * 1024,
            ..Configuration::default()
        };
        let harness = Harness::new(&config);
        let job = job(config, src, dst.clone(), Mode::Copy);
        let control = Arc::clone(&job.control);
        let skipper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            control.request_skip();
        });

        let outcome = harness.run(&job);
        skipper.join().expect("skipper");
        match outcome {
            Outcome::Skipped { bytes } => {
                assert!(bytes < 64 * 1024);
                assert_eq!(bytes % 4096, 0, "cut at a block boundary");
                assert_eq!(fs::metadata(&dst).expect("stat").len(), bytes);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_missing_source_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Configuration::default();
        let harness = Harness::new(&config);
        let job = job(
            config,
            temp_dir.path().join("missing"),
            temp_dir.path().join("dst"),
            Mode::Copy,
        );
        assert!(matches!(
            harness.run(&job),
            Outcome::Failed {
                error: TransferError::Read { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_pause_then_resume() {
        let run = RunControl::new(true);
        let item = ItemControl::default();
        let run = Arc::new(run);
        let resumer = {
            let run = Arc::clone(&run);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                run.resume();
            })
        };
        assert_eq!(run.wait_while_paused(&item), Checkpoint::Continue);
        resumer.join().expect("resumer");

        run.pause();
        run.cancel();
        assert_eq!(run.wait_while_paused(&item), Checkpoint::Cancel);
    }
}
