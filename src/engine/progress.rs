//! Batch progress reporting

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::models::{BatchItemResult, BatchSummary};

/// Published on every completed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub batch_id: Uuid,
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct ProgressState {
    completed: usize,
    succeeded: usize,
    bytes: u64,
    last_logged_at: Instant,
    last_logged_count: usize,
}

/// Counts completions for one batch and throttles progress log lines
///
/// A line is logged every `every` completions or every `interval`,
/// whichever comes first.
#[derive(Debug)]
pub struct ProgressReporter {
    batch_id: Uuid,
    total: usize,
    every: usize,
    interval: Duration,
    started: Instant,
    state: Mutex<ProgressState>,
    events: Option<broadcast::Sender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(batch_id: Uuid, total: usize, every: usize, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            batch_id,
            total,
            every: every.max(1),
            interval,
            started: now,
            state: Mutex::new(ProgressState {
                completed: 0,
                succeeded: 0,
                bytes: 0,
                last_logged_at: now,
                last_logged_count: 0,
            }),
            events: None,
        }
    }

    /// Also publish every completion on `sender`
    pub fn with_events(mut self, sender: broadcast::Sender<ProgressEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Record one finished item; returns the completed count
    pub fn complete(&self, item: &BatchItemResult) -> usize {
        let (event, log_line) = {
            let mut state = self.state.lock();
            state.completed += 1;
            if item.success {
                state.succeeded += 1;
                state.bytes += item.bytes;
            }

            let now = Instant::now();
            let due = state.completed - state.last_logged_count >= self.every
                || now.duration_since(state.last_logged_at) >= self.interval
                || state.completed == self.total;
            if due {
                state.last_logged_at = now;
                state.last_logged_count = state.completed;
            }

            let event = ProgressEvent {
                batch_id: self.batch_id,
                completed: state.completed,
                total: self.total,
                succeeded: state.succeeded,
                failed: state.completed - state.succeeded,
            };
            (event, due.then_some(state.bytes))
        };

        if let Some(bytes) = log_line {
            info!(
                batch_id = %self.batch_id,
                completed = event.completed,
                total = event.total,
                failed = event.failed,
                bytes,
                "Batch progress"
            );
        }

        let completed = event.completed;
        if let Some(sender) = &self.events {
            // No subscribers is fine
            let _ = sender.send(event);
        }
        completed
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }

    /// Summary over the final item list
    pub fn finish(&self, items: &[BatchItemResult]) -> BatchSummary {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();

        let succeeded = items.iter().filter(|item| item.success).count();
        let total_bytes: u64 = items
            .iter()
            .filter(|item| item.success)
            .map(|item| item.bytes)
            .sum();
        let recovered_by_fallback = items
            .iter()
            .filter(|item| item.success && item.tier.is_some_and(|tier| tier.is_fallback()))
            .count();

        let summary = BatchSummary {
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            recovered_by_fallback,
            total_bytes,
            elapsed_ms: elapsed.as_millis() as u64,
            items_per_sec: if secs > 0.0 {
                succeeded as f64 / secs
            } else {
                0.0
            },
            bytes_per_sec: (secs > 0.0 && total_bytes > 0).then(|| total_bytes as f64 / secs),
        };

        info!(
            batch_id = %self.batch_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            recovered = summary.recovered_by_fallback,
            elapsed_ms = summary.elapsed_ms,
            items_per_sec = format!("{:.2}", summary.items_per_sec),
            "Batch finished"
        );
        summary
    }
}
