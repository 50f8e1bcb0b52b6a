//! Download engine split into focused submodules.
//!
//! The `CourseDownloader` struct and its methods are organized by concern:
//! - [`worker_pool`] - Bounded-concurrency execution and the per-task retry loop
//! - [`transfer`] - Streaming one attempt into a temporary file
//! - [`finalization`] - Validation, promotion to the final path, completion records
//! - [`context`] - Shared handles passed to task drivers
//! - [`lifecycle`] - Startup cleanup and shutdown coordination

mod context;
mod finalization;
mod lifecycle;
mod transfer;
mod worker_pool;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::log_sink::LogSink;
use crate::plan::{self, Plan};
use crate::progress::{PROGRESS_UPDATE_INTERVAL, ProgressAggregator};
use crate::state_store::StateStore;
use crate::types::{
    AssetDescriptor, Component, DownloadTask, LogEvent, ProgressSnapshot, RunResult, Severity,
};
use crate::validator::TransferValidator;

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
///
/// One instance owns a destination root: its state file, temporary directory, event log
/// and progress counters. Runs on the same instance are serialized.
#[derive(Clone)]
pub struct CourseDownloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Source of asset bytes
    pub(crate) fetcher: Arc<dyn Fetcher>,
    /// Payload checks applied before promotion
    pub(crate) validator: Arc<TransferValidator>,
    /// Aggregate progress of the current run
    pub(crate) progress: Arc<ProgressAggregator>,
    /// Completion records for resume
    pub(crate) state_store: Arc<StateStore>,
    /// Event log shared by every component
    pub(crate) log_sink: Arc<LogSink>,
    /// Cancels in-flight and queued transfers
    pub(crate) cancel_token: CancellationToken,
    /// Stops background tasks; parent of `cancel_token`
    pub(crate) shutdown_token: CancellationToken,
    /// Latest snapshot published by the reporter
    pub(crate) progress_rx: watch::Receiver<ProgressSnapshot>,
    /// Progress reporter handle, taken on shutdown
    pub(crate) reporter: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    /// Held for the duration of a run
    pub(crate) run_lock: Arc<Mutex<()>>,
}

impl CourseDownloader {
    /// Create a downloader that fetches through `fetcher`
    ///
    /// Validates the configuration, starts the event log and the progress reporter, and
    /// removes temporary files left behind by an interrupted run. Must be called from
    /// within a Tokio runtime.
    pub async fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;

        let log_sink = Arc::new(LogSink::start(&config.logging)?);
        let state_store = Arc::new(StateStore::new(config.state_file_path()));
        let validator = Arc::new(TransferValidator::new(config.validation.clone()));
        let progress = Arc::new(ProgressAggregator::new());

        let shutdown_token = CancellationToken::new();
        let cancel_token = shutdown_token.child_token();
        let (progress_rx, reporter) =
            progress.spawn_reporter(PROGRESS_UPDATE_INTERVAL, shutdown_token.clone());

        // An unusable root is reported by `plan`, not here
        match lifecycle::clean_stale_parts(&config.incomplete_dir()).await {
            Ok(0) => {}
            Ok(removed) => log_sink.log(
                Severity::Info,
                Component::Engine,
                format!("Removed {removed} stale partial file(s) from an earlier run"),
            ),
            Err(e) => log_sink.log(
                Severity::Warn,
                Component::Engine,
                format!("Could not clean stale partial files: {e}"),
            ),
        }

        log_sink.log(
            Severity::Info,
            Component::Engine,
            format!(
                "Engine started: destination {}, {} concurrent transfer(s)",
                config.destination_root().display(),
                config.download.max_concurrent_downloads
            ),
        );

        Ok(Self {
            config: Arc::new(config),
            fetcher,
            validator,
            progress,
            state_store,
            log_sink,
            cancel_token,
            shutdown_token,
            progress_rx,
            reporter: Arc::new(Mutex::new(Some(reporter))),
            run_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create a downloader with a plain [`HttpFetcher`] built from `config.fetch`
    pub async fn with_http_fetcher(config: Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.fetch)?;
        Self::new(config, Arc::new(fetcher)).await
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the download plan for `descriptors` without transferring anything
    ///
    /// Descriptors excluded by the selection settings are dropped first. A state file
    /// that cannot be read is treated as empty, which only costs re-downloads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Plan`] when the destination root is not writable.
    pub async fn plan(&self, descriptors: &[AssetDescriptor]) -> Result<Plan> {
        let selected = self.select(descriptors);

        let existing = match self.state_store.load().await {
            Ok(existing) => existing,
            Err(e) => {
                self.log_sink.log(
                    Severity::Warn,
                    Component::StateStore,
                    format!("Resume state unavailable, planning without it: {e}"),
                );
                HashMap::new()
            }
        };

        // Filesystem probes and resume re-hashing stay off the async workers
        let root = self.config.destination_root().to_path_buf();
        let verify_hash = self.config.persistence.verify_hash_on_resume;
        let built =
            tokio::task::spawn_blocking(move || plan::build(&root, &selected, &existing, verify_hash))
                .await
                .map_err(|e| Error::Other(format!("planning task panicked: {e}")))?;

        let plan = built.map_err(|e| {
            self.log_sink
                .log(Severity::Error, Component::Plan, e.to_string());
            Error::Plan(e)
        })?;

        self.log_sink.log(
            Severity::Info,
            Component::Plan,
            format!(
                "Planned {} task(s): {} to download, {} already complete, {} duplicate(s) dropped",
                plan.tasks.len(),
                plan.pending(),
                plan.skipped(),
                plan.duplicates
            ),
        );
        Ok(plan)
    }

    /// Plan and download `descriptors`
    ///
    /// The final report is written to the event log before returning.
    ///
    /// # Errors
    ///
    /// Only planning failures are errors; per-task failures are reported in the
    /// [`RunResult`].
    pub async fn run(&self, descriptors: &[AssetDescriptor]) -> Result<RunResult> {
        let plan = self.plan(descriptors).await?;
        let result = self
            .run_tasks(plan.tasks, self.config.download.max_concurrent_downloads)
            .await;
        result.log_summary(&self.log_sink);
        Ok(result)
    }

    /// Execute already planned `tasks` with at most `concurrency_limit` transfers in flight
    ///
    /// Skipped tasks are counted but never touched. Failures of individual tasks are
    /// reported in the result; this method itself does not fail.
    pub async fn run_tasks(&self, tasks: Vec<DownloadTask>, concurrency_limit: usize) -> RunResult {
        let _running = self.run_lock.lock().await;
        self.log_sink.log(
            Severity::Info,
            Component::Engine,
            format!("Run started with {} task(s)", tasks.len()),
        );
        self.execute(tasks, concurrency_limit).await
    }

    /// Stop the current run
    ///
    /// In-flight transfers stop at their next chunk, their temporary files are removed
    /// and their tasks stay Pending. The downloader stays cancelled afterwards.
    pub fn cancel(&self) {
        if !self.cancel_token.is_cancelled() {
            self.log_sink
                .log(Severity::Warn, Component::Engine, "Cancellation requested");
            self.cancel_token.cancel();
        }
    }

    /// Whether [`cancel`](Self::cancel) or [`shutdown`](Self::shutdown) was called
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token that fires when the run is cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Current progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Progress published periodically; await `changed()` to follow a run
    pub fn progress_updates(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_rx.clone()
    }

    /// Subscribe to log events
    ///
    /// Returns a broadcast receiver that gets every event emitted from now on. Slow
    /// receivers may miss events (they get `RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_sink.subscribe()
    }

    /// The shared event log
    pub fn log_sink(&self) -> &LogSink {
        &self.log_sink
    }

    /// The completion-record store of the destination root
    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    fn select(&self, descriptors: &[AssetDescriptor]) -> Vec<AssetDescriptor> {
        let selection = &self.config.selection;
        let selected: Vec<AssetDescriptor> = descriptors
            .iter()
            .filter(|d| selection.accepts(d.kind))
            .cloned()
            .collect();

        let excluded = descriptors.len() - selected.len();
        if excluded > 0 {
            self.log_sink.log(
                Severity::Info,
                Component::Plan,
                format!("Excluded {excluded} asset(s) by the download type settings"),
            );
        }
        selected
    }
}
