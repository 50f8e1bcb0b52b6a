//! Startup cleanup and shutdown coordination.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Component, Severity};

use super::CourseDownloader;

/// How long shutdown waits for a running plan to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl CourseDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Cancels the current run (in-flight transfers stop at their next chunk)
    /// 2. Waits for the run to return, with a timeout (30 seconds)
    /// 3. Stops the progress reporter after it published a final snapshot
    /// 4. Flushes and closes the event log
    ///
    /// Completion records are synced as they are written, so nothing else needs saving.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.cancel();
        self.shutdown_token.cancel();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.run_lock.lock()).await {
            Ok(_idle) => tracing::info!("No run in progress"),
            Err(_) => {
                tracing::warn!("Timeout waiting for the run to finish, proceeding with shutdown");
            }
        }

        let reporter = self.reporter.lock().await.take();
        if let Some(handle) = reporter
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Progress reporter failed");
        }

        self.log_sink
            .log(Severity::Info, Component::Engine, "Shutdown complete");
        self.log_sink.flush().await;
        self.log_sink.close().await;

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}

/// Delete `*.part` files left in the temporary directory by an interrupted run
///
/// A missing directory is not an error. Returns the number of files removed.
pub(crate) async fn clean_stale_parts(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "part") && entry.file_type().await?.is_file() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale partial file");
                }
            }
        }
    }
    Ok(removed)
}
