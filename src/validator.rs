//! Transfer validator
//!
//! Decides whether a finished temporary file may be promoted to its final path.
//! Checks run in this order:
//!
//! 1. truncation against the announced content length
//! 2. HTML detection (content type, then leading bytes after BOM/whitespace)
//! 3. minimum size
//! 4. format signature for PDF kinds, when strict signatures are enabled
//!
//! A rejection is an ordinary outcome: the worker pool retries it like a transport
//! failure.

use crate::config::ValidationConfig;
use crate::error::{RejectReason, Result};
use crate::types::AssetKind;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Leading bytes of an HTML document, compared case-insensitively
const HTML_MARKERS: &[&[u8]] = &[b"<!doctype html", b"<html", b"<head", b"<body", b"<script"];

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Outcome of validating one payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The payload may be promoted
    Accept,
    /// The payload must be discarded
    Reject(RejectReason),
}

impl Verdict {
    /// Whether the payload was accepted
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// What the transfer learned about a payload besides its bytes
#[derive(Clone, Debug, Default)]
pub struct PayloadInfo {
    /// Bytes written to the temporary file
    pub size: u64,
    /// Length announced by the server, if any
    pub expected_len: Option<u64>,
    /// Content type announced by the server, if any
    pub content_type: Option<String>,
}

/// Checks downloaded payloads before they reach the output tree
#[derive(Clone, Debug)]
pub struct TransferValidator {
    config: ValidationConfig,
}

impl TransferValidator {
    /// Create a validator with the given policy
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate a temporary file
    ///
    /// Only I/O failures while reading the file are errors; content problems are
    /// reported as [`Verdict::Reject`].
    pub async fn validate(
        &self,
        temp_file: &Path,
        expected_kind: AssetKind,
        info: &PayloadInfo,
    ) -> Result<Verdict> {
        let head = read_head(temp_file, self.config.sniff_bytes).await?;
        let verdict = self.inspect(&head, expected_kind, info);
        if let Verdict::Reject(reason) = &verdict {
            tracing::debug!(
                path = %temp_file.display(),
                kind = %expected_kind,
                reason = %reason,
                "Payload rejected"
            );
        }
        Ok(verdict)
    }

    /// Validate from the leading bytes and transfer metadata alone
    pub fn inspect(&self, head: &[u8], expected_kind: AssetKind, info: &PayloadInfo) -> Verdict {
        if let Some(expected) = info.expected_len
            && info.size < expected
        {
            return Verdict::Reject(RejectReason::Truncated {
                expected,
                received: info.size,
            });
        }

        let html_content_type = self.config.reject_html_content_type
            && info
                .content_type
                .as_deref()
                .is_some_and(is_html_content_type);
        if html_content_type || looks_like_html(head) {
            return Verdict::Reject(RejectReason::HtmlMasqueradingAsMedia {
                expected: expected_kind.extension().to_string(),
            });
        }

        if info.size < self.config.min_size_bytes {
            return Verdict::Reject(RejectReason::TooSmall {
                size: info.size,
                minimum: self.config.min_size_bytes,
            });
        }

        if self.config.strict_signatures
            && expected_kind.extension() == "pdf"
            && !head.starts_with(PDF_SIGNATURE)
        {
            return Verdict::Reject(RejectReason::SignatureMismatch {
                expected: String::from_utf8_lossy(PDF_SIGNATURE).into_owned(),
            });
        }

        Verdict::Accept
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    mime.eq_ignore_ascii_case("text/html") || mime.eq_ignore_ascii_case("application/xhtml+xml")
}

/// Whether the leading bytes are the start of an HTML document
pub fn looks_like_html(head: &[u8]) -> bool {
    let head = head.strip_prefix(UTF8_BOM).unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let head = &head[start..];
    HTML_MARKERS.iter().any(|marker| {
        head.len() >= marker.len() && head[..marker.len()].eq_ignore_ascii_case(marker)
    })
}

async fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(limit);
    file.take(limit as u64).read_to_end(&mut head).await?;
    Ok(head)
}
