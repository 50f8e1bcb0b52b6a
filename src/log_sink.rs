//! Rotating event log
//!
//! [`LogSink::emit`] never waits on disk: events go to live subscribers through a
//! broadcast channel and to a background writer through a bounded queue. When the
//! queue is full the event is dropped from the file (subscribers still see it) and
//! counted. The writer appends whole lines in batches and rotates the active file
//! before a write would push it past the size threshold.

use crate::config::LogConfig;
use crate::error::Result;
use crate::types::{Component, LogEvent, Severity, TaskId};
use futures::Stream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// Events written per batch before the writer flushes
const WRITE_BATCH: usize = 256;

enum Command {
    Event(LogEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Shared, rotating event log
pub struct LogSink {
    tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<LogEvent>,
    dropped: AtomicU64,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    active_path: PathBuf,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("active_path", &self.active_path)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl LogSink {
    /// Create the log directory and start the background writer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &LogConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create log directory '{}': {}",
                    config.log_dir.display(),
                    e
                ),
            )
        })?;

        let capacity = config.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (event_tx, _rx) = broadcast::channel(capacity);

        let writer = LogWriter::new(config);
        let active_path = writer.active_path();
        let handle = tokio::spawn(writer.run(rx));

        Ok(Self {
            tx,
            event_tx,
            dropped: AtomicU64::new(0),
            writer: Mutex::new(Some(handle)),
            active_path,
        })
    }

    /// Path of the active log file
    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Record an event without blocking
    pub fn emit(&self, event: LogEvent) {
        mirror_to_tracing(&event);

        // No subscribers is not an error
        self.event_tx.send(event.clone()).ok();

        if self.tx.try_send(Command::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Shorthand for an event without a task
    pub fn log(&self, severity: Severity, component: Component, message: impl Into<String>) {
        self.emit(LogEvent::new(severity, component, message));
    }

    /// Shorthand for an event about a task
    pub fn log_task(
        &self,
        severity: Severity,
        component: Component,
        task: TaskId,
        message: impl Into<String>,
    ) {
        self.emit(LogEvent::new(severity, component, message).for_task(task));
    }

    /// Events that could not be queued for the file
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.event_tx.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a stream; events missed by a slow reader are skipped
    pub fn subscribe_stream(&self) -> impl Stream<Item = LogEvent> + Send + 'static {
        BroadcastStream::new(self.event_tx.subscribe()).filter_map(|item| item.ok())
    }

    /// Wait until every event queued so far is on disk
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            done_rx.await.ok();
        }
    }

    /// Write out queued events and stop the writer
    ///
    /// Later events still reach subscribers but are no longer written.
    pub async fn close(&self) {
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        if self.tx.send(Command::Shutdown).await.is_ok()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Log writer task failed");
        }
    }
}

fn mirror_to_tracing(event: &LogEvent) {
    let component = event.component.as_str();
    let task_id = event.task_id.map(|t| t.get());
    match event.severity {
        Severity::Debug => tracing::debug!(component, task_id, "{}", event.message),
        Severity::Info => tracing::info!(component, task_id, "{}", event.message),
        Severity::Warn => tracing::warn!(component, task_id, "{}", event.message),
        Severity::Error => tracing::error!(component, task_id, "{}", event.message),
    }
}

struct LogWriter {
    dir: PathBuf,
    stem: String,
    extension: String,
    threshold: u64,
    max_archives: usize,
    file: Option<tokio::fs::File>,
    size: u64,
}

impl LogWriter {
    fn new(config: &LogConfig) -> Self {
        let name = Path::new(&config.file_name);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "course-dl".to_string());
        let extension = name
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "log".to_string());
        Self {
            dir: config.log_dir.clone(),
            stem,
            extension,
            threshold: config.rotation_threshold_bytes.max(1),
            max_archives: config.max_archives,
            file: None,
            size: 0,
        }
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, self.extension))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut batch: Vec<LogEvent> = Vec::with_capacity(WRITE_BATCH);
        while let Some(command) = rx.recv().await {
            let mut pending = Some(command);
            let mut stop = false;
            let mut flushed: Vec<oneshot::Sender<()>> = Vec::new();

            // Drain whatever is already queued into one batch
            while let Some(command) = pending.take() {
                match command {
                    Command::Event(event) => batch.push(event),
                    Command::Flush(done) => flushed.push(done),
                    Command::Shutdown => {
                        stop = true;
                        break;
                    }
                }
                if batch.len() >= WRITE_BATCH {
                    break;
                }
                pending = rx.try_recv().ok();
            }

            if !batch.is_empty() {
                if let Err(e) = self.write_batch(&batch).await {
                    tracing::error!(error = %e, lines = batch.len(), "Failed to write log batch");
                    // Start from a fresh handle next time
                    self.file = None;
                }
                batch.clear();
            }
            for done in flushed {
                done.send(()).ok();
            }
            if stop {
                break;
            }
        }

        if let Some(file) = self.file.as_mut()
            && let Err(e) = file.flush().await
        {
            tracing::error!(error = %e, "Failed to flush log file");
        }
    }

    async fn write_batch(&mut self, events: &[LogEvent]) -> std::io::Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        for event in events {
            let mut line = event.to_line().into_bytes();
            line.push(b'\n');
            let line_len = line.len() as u64;

            let used = self.current_size().await? + buffer.len() as u64;
            if used > 0 && used + line_len > self.threshold {
                self.write_raw(&buffer).await?;
                buffer.clear();
                self.rotate().await?;
            }
            buffer.extend_from_slice(&line);
        }
        self.write_raw(&buffer).await?;
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn current_size(&mut self) -> std::io::Result<u64> {
        self.ensure_open().await?;
        Ok(self.size)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_open().await?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes).await?;
            self.size += bytes.len() as u64;
        }
        Ok(())
    }

    async fn ensure_open(&mut self) -> std::io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let path = self.active_path();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;
        let mut size = file.metadata().await?.len();

        // Terminate a line left half-written by an earlier failed batch or a crash
        if size > 0 {
            file.seek(std::io::SeekFrom::Start(size - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                file.write_all(b"\n").await?;
                size += 1;
            }
        }
        self.size = size;
        self.file = Some(file);
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let active = self.active_path();
        let archive = self.archive_path();
        tokio::fs::rename(&active, &archive).await?;
        self.size = 0;
        tracing::debug!(archive = %archive.display(), "Rotated event log");
        self.prune_archives().await
    }

    fn archive_path(&self) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let mut candidate = self
            .dir
            .join(format!("{}-{}.{}", self.stem, timestamp, self.extension));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.dir.join(format!(
                "{}-{}_{}.{}",
                self.stem, timestamp, n, self.extension
            ));
            n += 1;
        }
        candidate
    }

    async fn prune_archives(&self) -> std::io::Result<()> {
        if self.max_archives == 0 {
            return Ok(());
        }
        let prefix = format!("{}-", self.stem);
        let suffix = format!(".{}", self.extension);

        let mut archives: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(&suffix) {
                archives.push(entry.path());
            }
        }
        // Timestamps sort chronologically as text
        archives.sort();

        let excess = archives.len().saturating_sub(self.max_archives);
        for old in archives.into_iter().take(excess) {
            if let Err(e) = tokio::fs::remove_file(&old).await {
                tracing::warn!(path = %old.display(), error = %e, "Failed to prune log archive");
            }
        }
        Ok(())
    }
}
