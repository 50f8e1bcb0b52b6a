//! Retry classification and backoff schedule
//!
//! Retry itself is a bounded state machine on
//! [`DownloadTask::attempt_count`](crate::types::DownloadTask) driven by the worker pool.
//! This module only answers two questions for it: is this error worth another attempt,
//! and how long should the task wait before making it.
//!
//! # Example
//!
//! ```
//! use course_dl::config::RetryConfig;
//! use course_dl::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     jitter: false,
//!     ..RetryConfig::default()
//! };
//! assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
//! assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
//! assert_eq!(backoff_delay(&config, 10), Duration::from_secs(60));
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, TransportError};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, dropped connections, error pages served instead of
/// content) should return `true`. Permanent failures (disk full, permission denied,
/// cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransportError {
    fn is_retryable(&self) -> bool {
        // Expired sessions and throttling both surface as ordinary HTTP errors here,
        // so every transport failure earns another attempt up to the ceiling
        true
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_retryable(),
            // Validator rejections go through the same retry path as transport errors
            Error::Rejected(_) => true,
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Disk space needs user action
            Error::InsufficientSpace { .. } => false,
            Error::Cancelled => false,
            Error::Config { .. }
            | Error::Plan(_)
            | Error::StateStore(_)
            | Error::Serialization(_)
            | Error::InvalidCourseUrl { .. }
            | Error::Other(_) => false,
        }
    }
}

/// Delay to wait after the given number of failed attempts
///
/// `failed_attempts` starts at 1: the delay after the first failure is
/// `initial_delay`, each further failure multiplies it by `backoff_multiplier`, and the
/// result never exceeds `max_delay` (jitter included).
pub fn backoff_delay(config: &RetryConfig, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base_secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let max_secs = config.max_delay.as_secs_f64();

    let delay = if base_secs.is_finite() {
        Duration::from_secs_f64(base_secs.min(max_secs))
    } else {
        config.max_delay
    };

    let delay = if config.jitter {
        add_jitter(delay)
    } else {
        delay
    };
    delay.min(config.max_delay)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
