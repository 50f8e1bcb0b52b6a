//! Error types for course-dl
//!
//! This module provides the error taxonomy of the download engine:
//! - [`PlanError`] - fatal, raised before any task starts
//! - [`TransportError`] - transient fetch failures, retried per task
//! - [`RejectReason`] - validator rejections, retried like transport errors
//! - [`StateStoreError`] - completion records that could not be persisted
//!
//! Everything funnels into the top-level [`Error`] via `#[from]` conversions.

use crate::types::RunOutcome;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for course-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for course-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "destination_root")
        key: Option<String>,
    },

    /// The download plan could not be built
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Fetching the remote resource failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The fetched payload was rejected by the transfer validator
    #[error("payload rejected: {0}")]
    Rejected(#[from] RejectReason),

    /// The resume state could not be read or written
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the transfer
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// The run was cancelled before the operation finished
    #[error("cancelled")]
    Cancelled,

    /// Invalid course URL handed to the catalog
    #[error("invalid course URL {url}: {reason}")]
    InvalidCourseUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Fatal planning errors, surfaced before any task starts
#[derive(Debug, Error)]
pub enum PlanError {
    /// The destination root cannot be created or written to
    #[error("destination root {path} is not writable: {reason}")]
    DestinationNotWritable {
        /// The configured destination root
        path: PathBuf,
        /// The underlying failure
        reason: String,
    },
}

/// Transient failures while fetching a remote resource
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection could not be established or was dropped
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered with a non-success status
    #[error("HTTP status {status} for {source_ref}")]
    Status {
        /// The HTTP status code
        status: u16,
        /// The locator that was requested
        source_ref: String,
    },

    /// The request or a read timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// The body stream ended with an error mid-transfer
    #[error("stream interrupted after {received} bytes: {reason}")]
    Interrupted {
        /// Bytes received before the interruption
        received: u64,
        /// The underlying failure
        reason: String,
    },

    /// The source reference could not be resolved to a fetchable location
    #[error("unresolvable source reference {0}")]
    Unresolvable(String),
}

/// Reasons the transfer validator refuses a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// An HTML document was delivered where media was expected
    #[error("HTML document masquerading as {expected}")]
    HtmlMasqueradingAsMedia {
        /// Extension the asset kind expects (e.g. "pdf", "mp4")
        expected: String,
    },

    /// The payload is smaller than the configured minimum
    #[error("payload too small: {size} bytes (minimum {minimum})")]
    TooSmall {
        /// Size of the received payload
        size: u64,
        /// Configured minimum size
        minimum: u64,
    },

    /// Leading bytes do not carry the signature the kind requires
    #[error("missing {expected} signature")]
    SignatureMismatch {
        /// Signature that was expected (e.g. "%PDF-")
        expected: String,
    },

    /// Fewer bytes arrived than the server announced
    #[error("truncated payload: expected {expected} bytes, received {received}")]
    Truncated {
        /// Announced content length
        expected: u64,
        /// Bytes actually received
        received: u64,
    },
}

/// Failures of the resume/state store
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The state file could not be opened or read
    #[error("failed to read state file {path}: {source}")]
    Read {
        /// Path of the state file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A completion record could not be appended or flushed
    #[error("failed to persist completion record for {destination}: {reason}")]
    Append {
        /// Destination path of the record
        destination: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Rewriting the state file failed
    #[error("failed to rewrite state file {path}: {reason}")]
    Rewrite {
        /// Path of the state file
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },
}

impl Error {
    /// Short machine-readable code used in log events and run reports
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Plan(_) => "plan_error",
            Error::Transport(_) => "transport_error",
            Error::Rejected(_) => "validation_rejection",
            Error::StateStore(_) => "state_store_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::Cancelled => "cancelled",
            Error::InvalidCourseUrl { .. } => "invalid_course_url",
            Error::Other(_) => "internal_error",
        }
    }

    /// How a run that ended in this error is classified
    ///
    /// An error out of [`CourseDownloader::run`](crate::CourseDownloader::run) means no
    /// task started, so everything but cancellation is fatal.
    pub fn outcome(&self) -> RunOutcome {
        match self {
            Error::Cancelled => RunOutcome::Cancelled,
            _ => RunOutcome::Fatal,
        }
    }

    /// Exit code for a headless run that ended in this error
    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }
}

impl From<&Error> for RunOutcome {
    fn from(err: &Error) -> Self {
        err.outcome()
    }
}
