//! Fetcher seam between the engine and the authenticated platform session
//!
//! The engine never talks to the network directly. It asks a [`Fetcher`] for the
//! bytes behind a descriptor's opaque `source_ref`; the session layer supplies one
//! (normally an [`HttpFetcher`] built with the session's cookies), and tests supply
//! fakes.

use crate::config::FetchConfig;
use crate::error::{Result, TransportError};
use crate::types::{AssetKind, TaskId};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{CONTENT_TYPE, HeaderMap};

/// Placeholder in a `source_ref` that [`HttpFetcher`] replaces with the resolution hint
pub const RESOLUTION_PLACEHOLDER: &str = "{resolution}";

/// Body of a fetched resource, as a stream of chunks
pub type ByteStream = BoxStream<'static, std::result::Result<Vec<u8>, TransportError>>;

/// One request for the bytes behind an asset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Task making the request
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Opaque locator from the descriptor
    pub source_ref: String,
    /// Asset kind
    pub kind: AssetKind,
    /// Resolved resolution preference (descriptor hint, else configured default)
    pub resolution_hint: Option<String>,
}

/// Response to a [`FetchRequest`]
pub struct FetchResponse {
    /// Announced body length, if the server sent one
    pub content_length: Option<u64>,
    /// Announced content type, if the server sent one
    pub content_type: Option<String>,
    /// The body
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Capability to open a byte stream for an asset
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Open the resource; errors here and in the body stream are retried by the pool
    async fn fetch(
        &self,
        request: &FetchRequest,
    ) -> std::result::Result<FetchResponse, TransportError>;
}

/// [`Fetcher`] that treats `source_ref` as an HTTP(S) URL
///
/// A `{resolution}` placeholder in the URL is replaced with the request's resolution
/// hint (or removed when there is none).
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client from the fetch settings
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Self::with_headers(config, HeaderMap::new())
    }

    /// Build a client that sends `headers` (e.g. the session cookie) with every request
    ///
    /// Only the connect phase is bounded here. The engine bounds the wait for response
    /// headers and for each body chunk, so a long video is never cut off by a total
    /// deadline.
    pub fn with_headers(config: &FetchConfig, headers: HeaderMap) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn resolve(request: &FetchRequest) -> std::result::Result<url::Url, TransportError> {
        let raw = if request.source_ref.contains(RESOLUTION_PLACEHOLDER) {
            request.source_ref.replace(
                RESOLUTION_PLACEHOLDER,
                request.resolution_hint.as_deref().unwrap_or_default(),
            )
        } else {
            request.source_ref.clone()
        };
        let url = url::Url::parse(&raw)
            .map_err(|e| TransportError::Unresolvable(format!("{}: {}", request.source_ref, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(TransportError::Unresolvable(format!(
                "{}: unsupported scheme {}",
                request.source_ref, other
            ))),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
    ) -> std::result::Result<FetchResponse, TransportError> {
        let url = Self::resolve(request)?;
        tracing::debug!(task_id = %request.task_id, attempt = request.attempt, url = %url, "Fetching");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                source_ref: request.source_ref.clone(),
            });
        }

        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(body_error))
            .boxed();

        Ok(FetchResponse {
            content_length,
            content_type,
            body,
        })
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

fn body_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        // The transfer loop fills in how many bytes arrived
        TransportError::Interrupted {
            received: 0,
            reason: e.to_string(),
        }
    }
}
