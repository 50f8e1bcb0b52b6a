//! Per-task context: the shared handles a transfer needs, bundled to reduce parameter passing.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::log_sink::LogSink;
use crate::progress::ProgressAggregator;
use crate::state_store::StateStore;
use crate::types::{Component, DownloadTask, Severity};
use crate::validator::TransferValidator;

use super::CourseDownloader;

/// Everything a task driver touches besides its own [`DownloadTask`]
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) config: Arc<Config>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) validator: Arc<TransferValidator>,
    pub(crate) progress: Arc<ProgressAggregator>,
    pub(crate) state_store: Arc<StateStore>,
    pub(crate) log_sink: Arc<LogSink>,
    pub(crate) cancel_token: CancellationToken,
    /// `<root>/.incomplete`
    pub(crate) temp_dir: PathBuf,
}

impl TaskContext {
    /// Emit a worker-pool event about `task`
    pub(crate) fn log(&self, severity: Severity, task: &DownloadTask, message: impl Into<String>) {
        self.log_sink
            .log_task(severity, Component::WorkerPool, task.id, message);
    }

    /// Resolution passed to the fetcher: the descriptor's hint, else the configured default
    ///
    /// Only videos come in several resolutions.
    pub(crate) fn resolution_for(&self, task: &DownloadTask) -> Option<String> {
        if task.descriptor.kind != crate::types::AssetKind::Video {
            return None;
        }
        Some(
            task.descriptor
                .resolution_hint
                .clone()
                .unwrap_or_else(|| self.config.download.resolution_hint.clone()),
        )
    }
}

impl CourseDownloader {
    pub(crate) fn task_context(&self) -> TaskContext {
        TaskContext {
            config: Arc::clone(&self.config),
            fetcher: Arc::clone(&self.fetcher),
            validator: Arc::clone(&self.validator),
            progress: Arc::clone(&self.progress),
            state_store: Arc::clone(&self.state_store),
            log_sink: Arc::clone(&self.log_sink),
            cancel_token: self.cancel_token.clone(),
            temp_dir: self.config.incomplete_dir(),
        }
    }
}
