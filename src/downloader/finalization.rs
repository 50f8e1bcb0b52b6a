//! Finalization: validate the temporary file, promote it, and record completion.

use chrono::Utc;

use crate::error::{Error, Result};
use crate::types::{CompletionRecord, Component, DownloadTask, Fingerprint, Severity, TaskStatus};
use crate::validator::{PayloadInfo, Verdict};

use super::context::TaskContext;
use super::transfer::{Transferred, remove_temp};

/// Whether the completion record of a promoted file reached the state store
pub(crate) type Recorded = bool;

/// Validate `transferred` and, on approval, move it to the task's final path.
///
/// A rejected payload is deleted and surfaces as [`Error::Rejected`] so the pool retries
/// it like a transport failure. Once the rename succeeded the task is complete even if
/// its record cannot be persisted; that case returns `Ok(false)`.
pub(crate) async fn finalize(
    ctx: &TaskContext,
    task: &mut DownloadTask,
    transferred: Transferred,
) -> Result<Recorded> {
    task.status = TaskStatus::Validating;

    let info = PayloadInfo {
        size: transferred.size,
        expected_len: transferred.expected_len,
        content_type: transferred.content_type.clone(),
    };
    let verdict = match ctx
        .validator
        .validate(&transferred.temp_path, task.descriptor.kind, &info)
        .await
    {
        Ok(verdict) => verdict,
        Err(e) => {
            remove_temp(&transferred.temp_path).await;
            return Err(e);
        }
    };

    if let Verdict::Reject(reason) = verdict {
        remove_temp(&transferred.temp_path).await;
        ctx.log_sink.log_task(
            Severity::Warn,
            Component::Validator,
            task.id,
            format!("Rejected '{}': {}", task.title(), reason),
        );
        return Err(Error::Rejected(reason));
    }

    if let Err(e) = promote(&transferred, task).await {
        remove_temp(&transferred.temp_path).await;
        return Err(e);
    }

    let record = CompletionRecord {
        destination_path: task.destination_path.clone(),
        fingerprint: Fingerprint {
            size: transferred.size,
            sha256: transferred.sha256,
        },
        kind: task.descriptor.kind,
        completed_at: Utc::now(),
    };

    match ctx.state_store.append(&record).await {
        Ok(()) => Ok(true),
        Err(e) => {
            ctx.log_sink.log_task(
                Severity::Error,
                Component::StateStore,
                task.id,
                format!("Completion not recorded, it will be downloaded again next run: {e}"),
            );
            Ok(false)
        }
    }
}

async fn promote(transferred: &Transferred, task: &DownloadTask) -> Result<()> {
    if let Some(parent) = task.destination_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Same filesystem as the temp dir, so the rename is atomic
    tokio::fs::rename(&transferred.temp_path, &task.destination_path).await?;
    tracing::debug!(
        task_id = %task.id,
        destination = %task.destination_path.display(),
        "File promoted"
    );
    Ok(())
}
