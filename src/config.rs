//! Configuration types for course-dl

use crate::error::{Error, Result};
use crate::types::AssetKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download behavior configuration (destination, concurrency, resolution)
///
/// Used as a flattened sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root of the output tree (default: "./downloads")
    #[serde(default = "default_destination_root")]
    pub destination_root: PathBuf,

    /// Maximum concurrent transfers (default: 3)
    ///
    /// Kept small by default so the platform does not throttle the session.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Preferred video resolution when a descriptor carries no hint (default: "720p")
    #[serde(default = "default_resolution_hint")]
    pub resolution_hint: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            destination_root: default_destination_root(),
            max_concurrent_downloads: default_max_concurrent(),
            resolution_hint: default_resolution_hint(),
        }
    }
}

/// Which broad family of assets a run downloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    /// PDF handouts (plus extras when enabled)
    Pdf,
    /// Lesson videos (plus extras when enabled)
    Video,
    /// Everything the scraper discovered (default)
    #[default]
    All,
}

/// Which PDF handout variant(s) to keep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfType {
    /// Simplified handout
    Simplified,
    /// Original handout (default)
    #[default]
    Original,
    /// Handout with highlights
    Marked,
    /// All three variants
    All,
}

impl PdfType {
    /// Whether the given PDF variant is selected
    pub fn includes(&self, kind: AssetKind) -> bool {
        match self {
            PdfType::Simplified => kind == AssetKind::PdfSimplified,
            PdfType::Original => kind == AssetKind::PdfOriginal,
            PdfType::Marked => kind == AssetKind::PdfMarked,
            PdfType::All => kind.is_pdf_variant(),
        }
    }
}

/// Asset selection applied to discovered descriptors before planning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Asset family to download (default: all)
    #[serde(default)]
    pub download_type: DownloadType,

    /// PDF variant(s) kept in PDF mode (default: original)
    #[serde(default)]
    pub pdf_type: PdfType,

    /// Also download mind maps, summaries and slides (default: true)
    #[serde(default = "default_true")]
    pub download_extras: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            download_type: DownloadType::default(),
            pdf_type: PdfType::default(),
            download_extras: true,
        }
    }
}

impl SelectionConfig {
    /// Whether an asset of the given kind is part of the run
    pub fn accepts(&self, kind: AssetKind) -> bool {
        if kind.is_extra() {
            return self.download_type == DownloadType::All || self.download_extras;
        }
        match self.download_type {
            DownloadType::All => true,
            DownloadType::Video => kind == AssetKind::Video,
            DownloadType::Pdf => self.pdf_type.includes(kind),
        }
    }
}

/// Retry configuration for failed transfer attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per task before it is marked Failed (default: 3)
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Delay before the second attempt (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Transfer validation policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Smallest payload accepted, in bytes (default: 1024)
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,

    /// How many leading bytes are inspected for signatures (default: 1024)
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,

    /// Require the format's magic bytes (e.g. `%PDF-`) for PDF kinds (default: true)
    #[serde(default = "default_true")]
    pub strict_signatures: bool,

    /// Reject payloads served with a `text/html` content type (default: true)
    #[serde(default = "default_true")]
    pub reject_html_content_type: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: default_min_size_bytes(),
            sniff_bytes: default_sniff_bytes(),
            strict_signatures: true,
            reject_html_content_type: true,
        }
    }
}

/// Disk space checking configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Enable disk space checking (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Free space to keep on top of the expected file size (default: 64 MiB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: default_min_free_space(),
        }
    }
}

/// HTTP fetcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Longest wait for response headers (default: 300 seconds); body reads are bounded by `read_timeout`
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Longest wait for the next body chunk before the transfer is abandoned (default: 60 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Event log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the active log and its archives (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Name of the active log file (default: "course-dl.log")
    #[serde(default = "default_log_file_name")]
    pub file_name: String,

    /// Size at which the active log is archived (default: 5 MiB)
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold_bytes: u64,

    /// Archives kept after rotation, oldest pruned first (default: 5, 0 = keep all)
    #[serde(default = "default_max_archives")]
    pub max_archives: usize,

    /// Events buffered between emitters and the writer before new ones are dropped (default: 1024)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            file_name: default_log_file_name(),
            rotation_threshold_bytes: default_rotation_threshold(),
            max_archives: default_max_archives(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Resume state configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Completion-record file name, placed under the destination root
    #[serde(default = "default_state_file_name")]
    pub state_file_name: String,

    /// Directory name for temporary files, placed under the destination root
    #[serde(default = "default_incomplete_dir_name")]
    pub incomplete_dir_name: String,

    /// Re-hash files on resume instead of trusting size alone (default: false)
    #[serde(default)]
    pub verify_hash_on_resume: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file_name: default_state_file_name(),
            incomplete_dir_name: default_incomplete_dir_name(),
            verify_hash_on_resume: false,
        }
    }
}

/// Main configuration for [`CourseDownloader`](crate::CourseDownloader)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Destination, concurrency and resolution
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Which assets are downloaded
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Retry ceiling and backoff schedule
    #[serde(default)]
    pub retry: RetryConfig,

    /// Payload validation policy
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Free-space pre-check
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,

    /// HTTP fetcher settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Event log settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Resume state settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Destination root
    pub fn destination_root(&self) -> &Path {
        &self.download.destination_root
    }

    /// Path of the completion-record file
    pub fn state_file_path(&self) -> PathBuf {
        self.download
            .destination_root
            .join(&self.persistence.state_file_name)
    }

    /// Directory holding temporary transfer files
    pub fn incomplete_dir(&self) -> PathBuf {
        self.download
            .destination_root
            .join(&self.persistence.incomplete_dir_name)
    }

    /// Check settings that would make every run misbehave
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(config_error(
                "max_concurrent_downloads must be at least 1",
                "max_concurrent_downloads",
            ));
        }
        if self.retry.retry_ceiling == 0 {
            return Err(config_error(
                "retry_ceiling must be at least 1",
                "retry.retry_ceiling",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "initial_delay must not exceed max_delay",
                "retry.initial_delay",
            ));
        }
        if self.logging.rotation_threshold_bytes == 0 {
            return Err(config_error(
                "rotation_threshold_bytes must be greater than zero",
                "logging.rotation_threshold_bytes",
            ));
        }
        if self.logging.channel_capacity == 0 {
            return Err(config_error(
                "channel_capacity must be at least 1",
                "logging.channel_capacity",
            ));
        }
        if self.download.resolution_hint.trim().is_empty() {
            return Err(config_error(
                "resolution_hint must not be empty",
                "resolution_hint",
            ));
        }
        Ok(())
    }

    /// Load configuration from a JSON file
    ///
    /// A missing file yields defaults. A file that fails to parse is moved aside as
    /// `<name>.<unix-timestamp>.bak` and defaults are returned, so a corrupt file never
    /// blocks startup.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        match serde_json::from_str::<Config>(&raw) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Configuration loaded");
                Ok(config)
            }
            Err(e) => {
                let backup = corrupt_backup_path(path, chrono::Utc::now().timestamp());
                tracing::error!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Configuration file is corrupt, moving it aside and using defaults"
                );
                std::fs::rename(path, &backup)?;
                Ok(Self::default())
            }
        }
    }

    /// Save configuration as pretty JSON
    ///
    /// The previous file (if any) is kept as `<name>.bak`; the new content is written to
    /// a temporary sibling and renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if path.exists() {
            std::fs::copy(path, crate::utils::with_suffix(path, ".bak"))?;
        }
        crate::utils::write_atomic(path, json.as_bytes())?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn corrupt_backup_path(path: &Path, timestamp: i64) -> PathBuf {
    crate::utils::with_suffix(path, &format!(".{timestamp}.bak"))
}

// Default value functions
fn default_destination_root() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_resolution_hint() -> String {
    "720p".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_min_size_bytes() -> u64 {
    1024
}

fn default_sniff_bytes() -> usize {
    1024
}

fn default_min_free_space() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("course-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_file_name() -> String {
    "course-dl.log".to_string()
}

fn default_rotation_threshold() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_max_archives() -> usize {
    5
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_state_file_name() -> String {
    ".course-dl-state.jsonl".to_string()
}

fn default_incomplete_dir_name() -> String {
    ".incomplete".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
