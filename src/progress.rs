//! Progress aggregator
//!
//! Every worker reports through the hooks on [`ProgressAggregator`]; all of them lock
//! the same mutex, so concurrent completions cannot lose an increment. Observers only
//! ever receive copies ([`ProgressSnapshot`]).

use crate::types::{ProgressSnapshot, TaskId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Maximum number of titles listed in [`ProgressSnapshot::currently_active_titles`]
pub const MAX_ACTIVE_TITLES: usize = 8;

/// How often the reporter publishes a snapshot
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct ProgressState {
    total_tasks: u64,
    completed_tasks: u64,
    failed_tasks: u64,
    skipped_tasks: u64,
    bytes_transferred: u64,
    known_total_bytes: u64,
    unknown_sizes: u64,
    expected: HashMap<TaskId, Option<u64>>,
    active: BTreeMap<TaskId, String>,
    started_at: Option<Instant>,
}

/// Thread-safe accumulator of run progress
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    state: Mutex<ProgressState>,
}

impl ProgressAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        // Counters stay meaningful even if a holder panicked mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget every counter; called when a new run begins
    pub fn reset(&self) {
        *self.state() = ProgressState::default();
    }

    /// Count a task towards the totals
    ///
    /// `expected_bytes` is `None` when the size is unknown, which makes the byte total
    /// indeterminate until [`on_size_discovered`](Self::on_size_discovered) fills it in.
    /// Skipped tasks are registered with `Some(0)`. Registering the same id twice has
    /// no effect.
    pub fn register_task(&self, id: TaskId, expected_bytes: Option<u64>) {
        Self::register_locked(&mut self.state(), id, expected_bytes);
    }

    fn register_locked(state: &mut ProgressState, id: TaskId, expected_bytes: Option<u64>) {
        if state.expected.contains_key(&id) {
            return;
        }
        state.started_at.get_or_insert_with(Instant::now);
        state.total_tasks += 1;
        match expected_bytes {
            Some(n) => state.known_total_bytes += n,
            None => state.unknown_sizes += 1,
        }
        state.expected.insert(id, expected_bytes);
    }

    /// [`register_task`](Self::register_task) for a batch, under one lock
    pub fn register_tasks(&self, tasks: impl IntoIterator<Item = (TaskId, Option<u64>)>) {
        let mut state = self.state();
        for (id, expected_bytes) in tasks {
            Self::register_locked(&mut state, id, expected_bytes);
        }
    }

    /// The server announced the size of a task's payload
    ///
    /// Fills in an unknown size, or grows a hint that turned out too small. The total
    /// never shrinks.
    pub fn on_size_discovered(&self, id: TaskId, bytes: u64) {
        let mut state = self.state();
        let Some(previous) = state.expected.get(&id).copied() else {
            return;
        };
        match previous {
            None => {
                state.unknown_sizes = state.unknown_sizes.saturating_sub(1);
                state.known_total_bytes += bytes;
                state.expected.insert(id, Some(bytes));
            }
            Some(hint) if bytes > hint => {
                state.known_total_bytes += bytes - hint;
                state.expected.insert(id, Some(bytes));
            }
            Some(_) => {}
        }
    }

    /// A task acquired a slot and began transferring
    pub fn on_task_started(&self, id: TaskId, title: &str) {
        self.state().active.insert(id, title.to_string());
    }

    /// Bytes arrived for some task
    pub fn on_bytes(&self, delta: u64) {
        let mut state = self.state();
        state.bytes_transferred = state.bytes_transferred.saturating_add(delta);
    }

    /// A task released its slot without finishing (retry backoff or cancellation)
    pub fn on_task_paused(&self, id: TaskId) {
        self.state().active.remove(&id);
    }

    /// A task was validated and promoted
    pub fn on_task_completed(&self, id: TaskId) {
        let mut state = self.state();
        state.active.remove(&id);
        state.completed_tasks += 1;
    }

    /// A task ran out of attempts or hit a permanent error
    pub fn on_task_failed(&self, id: TaskId) {
        let mut state = self.state();
        state.active.remove(&id);
        state.failed_tasks += 1;
    }

    /// A task was found complete from an earlier run
    pub fn on_task_skipped(&self, id: TaskId) {
        let mut state = self.state();
        state.active.remove(&id);
        state.skipped_tasks += 1;
    }

    /// Consistent point-in-time copy of the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state();
        ProgressSnapshot {
            total_tasks: state.total_tasks,
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            skipped_tasks: state.skipped_tasks,
            active_tasks: state.active.len() as u64,
            bytes_transferred: state.bytes_transferred,
            total_bytes_estimate: (state.unknown_sizes == 0).then_some(state.known_total_bytes),
            currently_active_titles: state
                .active
                .values()
                .take(MAX_ACTIVE_TITLES)
                .cloned()
                .collect(),
            elapsed: state
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        }
    }

    /// Publish snapshots on a watch channel until `cancel_token` fires
    ///
    /// A final snapshot is sent on cancellation so late readers see the end state.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> (
        watch::Receiver<ProgressSnapshot>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = watch::channel(self.snapshot());
        let aggregator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tx.send(aggregator.snapshot()).is_err() {
                            // Every receiver is gone
                            break;
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        tx.send(aggregator.snapshot()).ok();
                        break;
                    }
                }
            }
        });
        (rx, handle)
    }
}
