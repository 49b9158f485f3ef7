//! Progress reporting.
//!
//! The engine reports to its observer through `EngineEvent`s sent on a
//! bounded channel, which keeps it decoupled from any UI technology. The
//! CLI prints them; any other front-end can map them onto its own visuals.
//!
//! Per-item progress is coalesced by the workers (one report per progress
//! interval) and aggregate progress by the control thread (one snapshot per
//! tick). Lifecycle events are never dropped; progress events may be when
//! the observer falls behind.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::collision::{CollisionClass, Resolution};
use crate::error::ErrorKind;
use crate::model::{EngineState, ItemId, ItemStatus, TransferStat};
use crate::orders::OrderId;

/// Notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The controller moved to a new state. `message` explains fatal errors.
    StateChanged {
        state: EngineState,
        message: Option<String>,
    },
    /// Committed bytes of one item.
    ItemProgress { id: ItemId, bytes_transferred: u64 },
    /// Periodic aggregate snapshot.
    AggregateProgress(TransferStat),
    ItemStatusChanged { id: ItemId, status: ItemStatus },
    /// An item waits for a decision; answer with `Engine::resolve`.
    CollisionDetected {
        id: ItemId,
        class: CollisionClass,
        proposed: Vec<Resolution>,
        destination: PathBuf,
    },
    ItemError {
        id: ItemId,
        kind: ErrorKind,
        message: String,
    },
    /// A source path could not be expanded; the scan went on.
    ScanFailed { path: PathBuf, message: String },
    Completed,
    Canceled,
    /// Every item of a remote order is final.
    OrderFinished { order: OrderId, with_error: bool },
    OrderCanceled { order: OrderId },
}

impl EngineEvent {
    /// Progress events may be dropped when the channel is full.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            EngineEvent::ItemProgress { .. } | EngineEvent::AggregateProgress(_)
        )
    }
}

/// Sliding-window throughput estimate.
#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        ThroughputMeter {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record `bytes` written at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        if bytes > 0 {
            self.samples.push_back((now, bytes));
        }
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        (total as f64 / self.window.as_secs_f64()) as u64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_over_window() {
        let mut meter = ThroughputMeter::new(Duration::from_secs(2));
        let start = Instant::now();
        meter.record(start, 1000);
        meter.record(start + Duration::from_secs(1), 1000);
        assert_eq!(meter.rate(start + Duration::from_secs(1)), 1000);

        // the first sample falls out of the window
        assert_eq!(meter.rate(start + Duration::from_millis(2500)), 500);
        assert_eq!(meter.rate(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_progress_events_are_droppable() {
        let id = ItemId::new();
        assert!(EngineEvent::ItemProgress { id, bytes_transferred: 1 }.is_progress());
        assert!(!EngineEvent::Completed.is_progress());
    }
}
