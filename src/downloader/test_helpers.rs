//! Shared test helpers: scripted fetchers and downloaders rooted in a temp dir.

use crate::config::Config;
use crate::downloader::CourseDownloader;
use crate::error::TransportError;
use crate::fetcher::{FetchRequest, FetchResponse, Fetcher};
use crate::types::{AssetDescriptor, AssetKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// What a scripted fetcher answers for one request
pub(crate) enum Reply {
    /// Serve the body in the given chunks
    Body {
        chunks: Vec<Vec<u8>>,
        content_length: Option<u64>,
        content_type: Option<String>,
    },
    /// Serve the chunks, then never yield again
    Stall(Vec<Vec<u8>>),
    /// Fail before any byte
    Fail(TransportError),
}

impl Reply {
    /// A body served in one chunk with an accurate length
    pub(crate) fn bytes(body: Vec<u8>) -> Self {
        Reply::Body {
            content_length: Some(body.len() as u64),
            chunks: vec![body],
            content_type: None,
        }
    }
}

type Script = dyn Fn(&FetchRequest) -> Reply + Send + Sync;

/// Fetcher driven by a closure; records every request it receives
pub(crate) struct ScriptedFetcher {
    script: Box<Script>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedFetcher {
    pub(crate) fn new(script: impl Fn(&FetchRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Serves a valid PDF-sized payload for every request
    pub(crate) fn serving_pdfs() -> Arc<Self> {
        Self::new(|_| Reply::bytes(pdf_bytes(2048)))
    }

    /// Every request fails with a connection error
    pub(crate) fn always_failing() -> Arc<Self> {
        Self::new(|_| Reply::Fail(TransportError::Connection("connection reset by peer".into())))
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        match (self.script)(request) {
            Reply::Body {
                chunks,
                content_length,
                content_type,
            } => Ok(FetchResponse {
                content_length,
                content_type,
                body: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            }),
            Reply::Stall(chunks) => Ok(FetchResponse {
                content_length: None,
                content_type: None,
                body: futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending())
                    .boxed(),
            }),
            Reply::Fail(e) => Err(e),
        }
    }
}

/// A PDF-looking payload of exactly `len` bytes
pub(crate) fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut body = b"%PDF-1.7\n".to_vec();
    body.resize(len.max(body.len()), b'0');
    body
}

/// An HTML error page padded past the minimum size
pub(crate) fn html_page() -> Vec<u8> {
    let mut body = b"\n  <!DOCTYPE html><html><head><title>Sessao expirada</title></head>".to_vec();
    body.resize(4096, b' ');
    body
}

pub(crate) fn descriptor(lesson: u32, kind: AssetKind) -> AssetDescriptor {
    AssetDescriptor {
        course_id: "c-100".into(),
        course_title: "Direito Constitucional".into(),
        lesson_id: format!("l-{lesson}"),
        lesson_title: format!("Aula {lesson:02}"),
        kind,
        source_ref: format!("https://cdn.example.com/l-{lesson}/{}", kind.as_str()),
        display_title: format!("Aula {lesson:02}"),
        resolution_hint: None,
        size_hint: None,
    }
}

/// `count` PDF descriptors in distinct lessons
pub(crate) fn pdf_descriptors(count: u32) -> Vec<AssetDescriptor> {
    (1..=count)
        .map(|lesson| descriptor(lesson, AssetKind::PdfOriginal))
        .collect()
}

/// Configuration rooted in `dir` with fast retries and no free-space margin
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.destination_root = dir.join("downloads");
    config.download.max_concurrent_downloads = 4;
    config.logging.log_dir = dir.join("logs");
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config.disk_space.min_free_space = 0;
    config
}

/// Helper to create a test CourseDownloader rooted in a fresh temp dir.
/// Returns the downloader and the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader(
    fetcher: Arc<ScriptedFetcher>,
) -> (CourseDownloader, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let downloader = CourseDownloader::new(config, fetcher).await.unwrap();
    (downloader, temp_dir)
}

/// Files with the given extension anywhere under `dir`
pub(crate) fn files_with_extension(dir: &Path, extension: &str) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == extension))
        .collect()
}

/// Like [`create_test_downloader`], with a chance to adjust the configuration first
pub(crate) async fn create_test_downloader_with(
    fetcher: Arc<ScriptedFetcher>,
    configure: impl FnOnce(&mut Config),
) -> (CourseDownloader, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    configure(&mut config);
    let downloader = CourseDownloader::new(config, fetcher).await.unwrap();
    (downloader, temp_dir)
}
