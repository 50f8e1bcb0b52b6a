//! Core types for course-dl

use crate::log_sink::LogSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Unique identifier for a download task within one plan
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of lesson asset
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    /// Lesson video
    Video,
    /// Simplified PDF handout
    PdfSimplified,
    /// Original PDF handout
    PdfOriginal,
    /// PDF handout with highlights
    PdfMarked,
    /// Mind map attached to a video
    MindMap,
    /// Written summary attached to a video
    Summary,
    /// Slide deck attached to a video
    Slides,
}

impl AssetKind {
    /// Every kind, in a fixed order
    pub const ALL: [AssetKind; 7] = [
        AssetKind::Video,
        AssetKind::PdfSimplified,
        AssetKind::PdfOriginal,
        AssetKind::PdfMarked,
        AssetKind::MindMap,
        AssetKind::Summary,
        AssetKind::Slides,
    ];

    /// File extension used for the final file
    pub fn extension(&self) -> &'static str {
        match self {
            AssetKind::Video => "mp4",
            _ => "pdf",
        }
    }

    /// Human label appended to the asset title in file names
    pub fn label(&self) -> Option<&'static str> {
        match self {
            AssetKind::Video => None,
            AssetKind::PdfSimplified => Some("Simplified"),
            AssetKind::PdfOriginal => Some("Original"),
            AssetKind::PdfMarked => Some("Marked"),
            AssetKind::MindMap => Some("Mind Map"),
            AssetKind::Summary => Some("Summary"),
            AssetKind::Slides => Some("Slides"),
        }
    }

    /// Whether this is one of the PDF handout variants
    pub fn is_pdf_variant(&self) -> bool {
        matches!(
            self,
            AssetKind::PdfSimplified | AssetKind::PdfOriginal | AssetKind::PdfMarked
        )
    }

    /// Whether this is auxiliary study material attached to a video
    pub fn is_extra(&self) -> bool {
        matches!(
            self,
            AssetKind::MindMap | AssetKind::Summary | AssetKind::Slides
        )
    }

    /// Stable string form, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::PdfSimplified => "pdf-simplified",
            AssetKind::PdfOriginal => "pdf-original",
            AssetKind::PdfMarked => "pdf-marked",
            AssetKind::MindMap => "mind-map",
            AssetKind::Summary => "summary",
            AssetKind::Slides => "slides",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable file discovered by the scraping layer
///
/// Immutable once produced. `source_ref` is opaque to the engine and is only
/// handed back to the [`Fetcher`](crate::fetcher::Fetcher).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Platform identifier of the course
    pub course_id: String,
    /// Human title of the course (first folder level)
    pub course_title: String,
    /// Platform identifier of the lesson
    pub lesson_id: String,
    /// Human title of the lesson (second folder level)
    pub lesson_title: String,
    /// What this asset is
    pub kind: AssetKind,
    /// Opaque locator resolved by the fetcher
    pub source_ref: String,
    /// Title of the asset itself
    pub display_title: String,
    /// Preferred resolution for videos (e.g. "720p")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_hint: Option<String>,
    /// Size in bytes, when the scraper knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl AssetDescriptor {
    /// Identity key used for deduplication
    pub fn key(&self) -> AssetKey {
        AssetKey {
            course_id: self.course_id.clone(),
            lesson_id: self.lesson_id.clone(),
            kind: self.kind,
            source_ref: self.source_ref.clone(),
        }
    }
}

/// Identity of an asset: two descriptors with equal keys are the same download
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetKey {
    /// Course identifier
    pub course_id: String,
    /// Lesson identifier
    pub lesson_id: String,
    /// Asset kind
    pub kind: AssetKind,
    /// Opaque locator
    pub source_ref: String,
}

/// Task status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a slot (or for its backoff to elapse)
    Pending,
    /// Bytes are being streamed into a temporary file
    InProgress,
    /// The temporary file is being checked
    Validating,
    /// Validated and moved to its final path
    Completed,
    /// Retry ceiling reached or non-retryable error
    Failed,
    /// Already present from an earlier run
    Skipped,
}

impl TaskStatus {
    /// Whether the task will not change state again within this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// A planned download, derived 1:1 from an [`AssetDescriptor`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Task identifier (position in the plan)
    pub id: TaskId,
    /// The asset being downloaded
    pub descriptor: AssetDescriptor,
    /// Final location of the file
    pub destination_path: PathBuf,
    /// Number of transfer attempts made so far
    pub attempt_count: u32,
    /// Current status
    pub status: TaskStatus,
    /// Last error message, if any attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DownloadTask {
    /// Title shown in progress displays
    pub fn title(&self) -> &str {
        &self.descriptor.display_title
    }
}

/// Point-in-time copy of aggregate progress
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Tasks registered for this run (including skipped)
    pub total_tasks: u64,
    /// Tasks completed in this run
    pub completed_tasks: u64,
    /// Tasks that ended Failed
    pub failed_tasks: u64,
    /// Tasks skipped because they were already on disk
    pub skipped_tasks: u64,
    /// Tasks currently holding a slot
    pub active_tasks: u64,
    /// Bytes received over the wire, including attempts that were later retried
    pub bytes_transferred: u64,
    /// Expected total bytes; `None` while any size is still unknown
    pub total_bytes_estimate: Option<u64>,
    /// Titles of tasks currently transferring (bounded)
    pub currently_active_titles: Vec<String>,
    /// Time since the first task was registered
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Tasks that reached a terminal state
    pub fn finished_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks + self.skipped_tasks
    }

    /// Fraction of tasks finished (0.0 to 1.0)
    pub fn item_fraction(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        (self.finished_tasks() as f64 / self.total_tasks as f64).min(1.0)
    }

    /// Byte progress percentage, or `None` when the total is indeterminate
    pub fn byte_percent(&self) -> Option<f32> {
        match self.total_bytes_estimate {
            Some(total) if total > 0 => {
                Some(((self.bytes_transferred as f64 / total as f64) * 100.0).min(100.0) as f32)
            }
            _ => None,
        }
    }

    /// Average throughput since the run started
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_transferred as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Content fingerprint stored with each completion record
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the content
    pub sha256: String,
}

/// Persisted proof that a destination file passed validation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Final path of the file
    pub destination_path: PathBuf,
    /// Size and hash of the validated content
    pub fingerprint: Fingerprint,
    /// Asset kind
    pub kind: AssetKind,
    /// When the record was written
    pub completed_at: DateTime<Utc>,
}

/// Log event severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic detail
    Debug,
    /// Normal progress
    Info,
    /// Recoverable problem
    Warn,
    /// Terminal failure of a task or component
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // pad() so that width specifiers like {:<5} apply
        f.pad(match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        })
    }
}

/// Engine component that produced a log event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Top-level engine lifecycle
    Engine,
    /// Asset queue & plan
    Plan,
    /// Worker pool and transfers
    WorkerPool,
    /// Transfer validator
    Validator,
    /// Resume/state store
    StateStore,
    /// Course catalog
    Catalog,
}

impl Component {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Engine => "engine",
            Component::Plan => "plan",
            Component::WorkerPool => "worker_pool",
            Component::Validator => "validator",
            Component::StateStore => "state_store",
            Component::Catalog => "catalog",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, append-only log entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: Severity,
    /// Producing component
    pub component: Component,
    /// Human-readable message
    pub message: String,
    /// Task the event refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl LogEvent {
    /// Create an event stamped with the current time
    pub fn new(severity: Severity, component: Component, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            component,
            message: message.into(),
            task_id: None,
        }
    }

    /// Attach the task this event refers to
    pub fn for_task(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    /// Render as a single human-readable line (no trailing newline)
    pub fn to_line(&self) -> String {
        match self.task_id {
            Some(id) => format!(
                "{} {:<5} [{}] task={} {}",
                self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                self.severity,
                self.component,
                id,
                self.message
            ),
            None => format!(
                "{} {:<5} [{}] {}",
                self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                self.severity,
                self.component,
                self.message
            ),
        }
    }
}

/// A task that ended Failed, with the reason of its last attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    /// Task identifier
    pub id: TaskId,
    /// Asset title
    pub title: String,
    /// Intended final path
    pub destination_path: PathBuf,
    /// Attempts made
    pub attempts: u32,
    /// Last error message
    pub reason: String,
}

/// Terminal classification of a run, mapped to process exit codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every non-skipped task completed
    Success,
    /// The run finished but some tasks failed
    Partial,
    /// The run was cancelled before all tasks finished
    Cancelled,
    /// Planning failed before any task started
    Fatal,
}

impl RunOutcome {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Fatal => "fatal",
        }
    }

    /// Exit code for a headless run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 1,
            RunOutcome::Fatal => 2,
            RunOutcome::Cancelled => 130,
        }
    }
}

/// Summary returned by a worker-pool run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunResult {
    /// Tasks completed in this run
    pub completed: usize,
    /// Tasks that ended Failed
    pub failed: usize,
    /// Tasks skipped as already present
    pub skipped: usize,
    /// Tasks left unfinished by cancellation
    pub cancelled: usize,
    /// Completed tasks whose completion record could not be persisted
    pub unrecorded: usize,
    /// Whether the run-level cancellation token fired
    pub was_cancelled: bool,
    /// Details of failed tasks
    pub failures: Vec<FailedTask>,
    /// Final state of every task, ordered by id
    pub tasks: Vec<DownloadTask>,
    /// Wall-clock duration of the run
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl RunResult {
    /// Classify the run
    pub fn outcome(&self) -> RunOutcome {
        if self.was_cancelled && self.cancelled > 0 {
            RunOutcome::Cancelled
        } else if self.failed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        }
    }

    /// Exit code for a headless run
    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }

    /// Write the end-of-run report to the event log
    pub fn log_summary(&self, sink: &LogSink) {
        let outcome = self.outcome();
        let severity = match outcome {
            RunOutcome::Success => Severity::Info,
            _ => Severity::Warn,
        };
        sink.log(
            severity,
            Component::Engine,
            format!(
                "Run finished in {:.1}s: {} completed, {} skipped, {} failed, {} cancelled ({}, exit code {})",
                self.elapsed.as_secs_f64(),
                self.completed,
                self.skipped,
                self.failed,
                self.cancelled,
                outcome.as_str(),
                outcome.exit_code()
            ),
        );
        if self.unrecorded > 0 {
            sink.log(
                Severity::Warn,
                Component::StateStore,
                format!(
                    "{} completed file(s) have no completion record and will be fetched again",
                    self.unrecorded
                ),
            );
        }
        for failure in &self.failures {
            sink.log_task(
                Severity::Error,
                Component::Engine,
                failure.id,
                format!(
                    "'{}' failed after {} attempt(s): {}",
                    failure.title, failure.attempts, failure.reason
                ),
            );
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
