//! # course-dl
//!
//! Download orchestration engine for e-learning course media.
//!
//! Given the lesson assets discovered by a scraping layer, course-dl turns them into
//! validated files on disk: it deduplicates and lays out the output tree, runs a bounded
//! pool of transfers with retry and backoff, rejects HTML error pages disguised as media,
//! resumes from completion records, keeps a rotating event log, and aggregates progress
//! for a GUI or CLI shell to display.
//!
//! ## Design Philosophy
//!
//! course-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Injectable** - Bytes come from a [`Fetcher`], so sessions and tests plug in freely
//! - **Crash-safe** - Files appear at their final path only after validation
//! - **Observable** - Consumers pull snapshots or subscribe to log events
//!
//! ## Quick Start
//!
//! ```no_run
//! use course_dl::{AssetDescriptor, AssetKind, Config, CourseDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = CourseDownloader::with_http_fetcher(Config::default()).await?;
//!
//!     // Follow the event log
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}", event.to_line());
//!         }
//!     });
//!
//!     let assets = vec![AssetDescriptor {
//!         course_id: "4521".into(),
//!         course_title: "Direito Penal".into(),
//!         lesson_id: "1".into(),
//!         lesson_title: "Aula 00".into(),
//!         kind: AssetKind::PdfOriginal,
//!         source_ref: "https://cdn.example.com/aula-00.pdf".into(),
//!         display_title: "Aula 00".into(),
//!         resolution_hint: None,
//!         size_hint: None,
//!     }];
//!
//!     // A plan failure (unwritable destination) exits with code 2
//!     let code = match downloader.run(&assets).await {
//!         Ok(result) => result.exit_code(),
//!         Err(e) => e.exit_code(),
//!     };
//!     downloader.shutdown().await?;
//!     std::process::exit(code);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Course URL catalog
pub mod catalog;
/// Configuration types
pub mod config;
/// Download engine (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Fetcher seam and HTTP implementation
pub mod fetcher;
/// Rotating event log
pub mod log_sink;
/// Asset queue and download plan
pub mod plan;
/// Progress aggregation
pub mod progress;
/// Retry classification and exponential backoff
pub mod retry;
/// Completion records for resume
pub mod state_store;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;
/// Payload validation
pub mod validator;

// Re-export commonly used types
pub use catalog::{CourseCatalog, CourseEntry};
pub use config::{Config, DownloadType, PdfType};
pub use downloader::CourseDownloader;
pub use error::{Error, PlanError, RejectReason, Result, StateStoreError, TransportError};
pub use fetcher::{ByteStream, FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use log_sink::LogSink;
pub use plan::Plan;
pub use progress::ProgressAggregator;
pub use state_store::StateStore;
pub use types::{
    AssetDescriptor, AssetKind, CompletionRecord, Component, DownloadTask, FailedTask,
    Fingerprint, LogEvent, ProgressSnapshot, RunOutcome, RunResult, Severity, TaskId,
    TaskStatus,
};
pub use validator::{TransferValidator, Verdict};

/// Run `descriptors` and cancel the run when a termination signal arrives.
///
/// Cancelled transfers discard their temporary files, so the result of an interrupted
/// run reports [`RunOutcome::Cancelled`] (exit code 130) and a later run resumes from
/// the completion records. An `Err` means planning failed; [`Error::exit_code`] maps
/// it to [`RunOutcome::Fatal`] (exit code 2).
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use course_dl::{Config, CourseDownloader, run_until_signal};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = CourseDownloader::with_http_fetcher(Config::default()).await?;
///     let code = match run_until_signal(&downloader, &[]).await {
///         Ok(result) => result.exit_code(),
///         Err(e) => e.exit_code(),
///     };
///     downloader.shutdown().await?;
///     std::process::exit(code);
/// }
/// ```
pub async fn run_until_signal(
    downloader: &CourseDownloader,
    descriptors: &[AssetDescriptor],
) -> Result<RunResult> {
    let run = downloader.run(descriptors);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = wait_for_signal() => {
            downloader.cancel();
            run.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                ctrl_c_or_never().await;
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                ctrl_c_or_never().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c_or_never().await;
}

/// Resolve on Ctrl+C; if the handler cannot be installed, never resolve
async fn ctrl_c_or_never() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
