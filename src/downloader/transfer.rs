//! Streaming one attempt of a task into its temporary file.
//!
//! The body is written to `<root>/.incomplete/<hash>-<attempt>.part`, never to the final
//! path. Cancellation is checked at every chunk boundary, a stalled stream fails after
//! `read_timeout`, and the temporary file is removed whenever the attempt fails.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result, TransportError};
use crate::fetcher::{FetchRequest, FetchResponse};
use crate::types::DownloadTask;
use crate::utils::{get_available_space, short_hash, to_hex};

use super::context::TaskContext;

/// A fully received payload waiting for validation
#[derive(Debug)]
pub(crate) struct Transferred {
    pub(crate) temp_path: PathBuf,
    pub(crate) size: u64,
    pub(crate) expected_len: Option<u64>,
    pub(crate) content_type: Option<String>,
    pub(crate) sha256: String,
}

/// Temporary file used by one attempt of `task`
pub(crate) fn temp_path_for(temp_dir: &Path, task: &DownloadTask) -> PathBuf {
    let key = short_hash(&task.destination_path.to_string_lossy());
    temp_dir.join(format!("{}-{}.part", key, task.attempt_count))
}

/// Fetch and stream the current attempt of `task`
pub(crate) async fn stream_to_temp(ctx: &TaskContext, task: &DownloadTask) -> Result<Transferred> {
    tokio::fs::create_dir_all(&ctx.temp_dir).await?;
    let temp_path = temp_path_for(&ctx.temp_dir, task);

    let result = stream_inner(ctx, task, &temp_path).await;
    if result.is_err() {
        remove_temp(&temp_path).await;
    }
    result
}

async fn stream_inner(
    ctx: &TaskContext,
    task: &DownloadTask,
    temp_path: &Path,
) -> Result<Transferred> {
    let size_hint = task.descriptor.size_hint;
    if let Some(expected) = size_hint {
        ensure_space(ctx, expected)?;
    }

    let request = FetchRequest {
        task_id: task.id,
        attempt: task.attempt_count,
        source_ref: task.descriptor.source_ref.clone(),
        kind: task.descriptor.kind,
        resolution_hint: ctx.resolution_for(task),
    };

    let response = open(ctx, &request).await?;
    let FetchResponse {
        content_length,
        content_type,
        mut body,
    } = response;

    if let Some(announced) = content_length {
        ctx.progress.on_size_discovered(task.id, announced);
        if size_hint.is_none_or(|hint| announced > hint) {
            ensure_space(ctx, announced)?;
        }
    }

    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;
    let read_timeout = ctx.config.fetch.read_timeout;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return Err(Error::Cancelled),
            next = tokio::time::timeout(read_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "no data for {}s after {} bytes",
                    read_timeout.as_secs(),
                    received
                ))
                .into());
            }
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(TransportError::Interrupted { reason, .. }))) => {
                return Err(TransportError::Interrupted { received, reason }.into());
            }
            Ok(Some(Err(e))) => return Err(e.into()),
        };

        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        let len = chunk.len() as u64;
        received += len;
        ctx.progress.on_bytes(len);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tracing::debug!(
        task_id = %task.id,
        attempt = task.attempt_count,
        bytes = received,
        temp = %temp_path.display(),
        "Transfer finished"
    );

    Ok(Transferred {
        temp_path: temp_path.to_path_buf(),
        size: received,
        expected_len: content_length,
        content_type,
        sha256: to_hex(&hasher.finalize()),
    })
}

async fn open(ctx: &TaskContext, request: &FetchRequest) -> Result<FetchResponse> {
    let timeout = ctx.config.fetch.request_timeout;
    tokio::select! {
        biased;
        _ = ctx.cancel_token.cancelled() => Err(Error::Cancelled),
        response = tokio::time::timeout(timeout, ctx.fetcher.fetch(request)) => match response {
            Ok(response) => Ok(response?),
            Err(_) => Err(TransportError::Timeout(format!(
                "no response within {}s",
                timeout.as_secs()
            ))
            .into()),
        },
    }
}

/// Fail with [`Error::InsufficientSpace`] when `expected` bytes plus the margin do not fit
fn ensure_space(ctx: &TaskContext, expected: u64) -> Result<()> {
    let settings = &ctx.config.disk_space;
    if !settings.enabled {
        return Ok(());
    }
    let required = expected.saturating_add(settings.min_free_space);
    match get_available_space(&ctx.temp_dir) {
        Ok(available) if available < required => {
            Err(Error::InsufficientSpace {
                required,
                available,
            })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            // Unknown free space must not block the transfer
            tracing::debug!(
                path = %ctx.temp_dir.display(),
                error = %e,
                "Free space query failed, skipping check"
            );
            Ok(())
        }
    }
}

/// Remove a temporary file, ignoring a file that is already gone
pub(crate) async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
    }
}
