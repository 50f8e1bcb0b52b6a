//! Worker pool: bounded-concurrency execution of a plan with per-task retry.
//!
//! Every pending task gets its own driver in a [`JoinSet`]. A driver holds a semaphore
//! permit only while an attempt is streaming or validating; backoff sleeps happen
//! without a slot so other tasks keep the pool busy.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Error;
use crate::retry::{IsRetryable, backoff_delay};
use crate::types::{Component, DownloadTask, FailedTask, RunResult, Severity, TaskStatus};

use super::CourseDownloader;
use super::context::TaskContext;
use super::finalization::{Recorded, finalize};
use super::transfer::stream_to_temp;

/// How a driver left its task
#[derive(Debug)]
struct TaskOutcome {
    task: DownloadTask,
    recorded: Recorded,
}

enum AttemptFailure {
    Cancelled,
    Error(Error),
}

impl CourseDownloader {
    pub(super) async fn execute(&self, tasks: Vec<DownloadTask>, concurrency_limit: usize) -> RunResult {
        let started = Instant::now();
        let ctx = self.task_context();

        self.progress.reset();
        self.progress.register_tasks(tasks.iter().map(|task| {
            let expected = match task.status {
                TaskStatus::Skipped => Some(0),
                _ => task.descriptor.size_hint,
            };
            (task.id, expected)
        }));

        let slots = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let mut drivers = JoinSet::new();
        let mut finished: Vec<TaskOutcome> = Vec::with_capacity(tasks.len());

        for task in tasks {
            if task.status != TaskStatus::Pending {
                if task.status == TaskStatus::Skipped {
                    self.progress.on_task_skipped(task.id);
                }
                finished.push(TaskOutcome {
                    task,
                    recorded: true,
                });
                continue;
            }
            let ctx = ctx.clone();
            let slots = Arc::clone(&slots);
            drivers.spawn(guarded_drive(ctx, task, slots));
        }

        while let Some(joined) = drivers.join_next().await {
            match joined {
                Ok(outcome) => finished.push(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Task driver aborted");
                }
            }
        }

        let mut result = RunResult {
            was_cancelled: self.cancel_token.is_cancelled(),
            elapsed: started.elapsed(),
            ..Default::default()
        };
        finished.sort_by_key(|o| o.task.id);
        for TaskOutcome { task, recorded } in finished {
            match task.status {
                TaskStatus::Completed => {
                    result.completed += 1;
                    if !recorded {
                        result.unrecorded += 1;
                    }
                }
                TaskStatus::Failed => {
                    result.failed += 1;
                    result.failures.push(FailedTask {
                        id: task.id,
                        title: task.title().to_string(),
                        destination_path: task.destination_path.clone(),
                        attempts: task.attempt_count,
                        reason: task.last_error.clone().unwrap_or_default(),
                    });
                }
                TaskStatus::Skipped => result.skipped += 1,
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Validating => {
                    result.cancelled += 1;
                }
            }
            result.tasks.push(task);
        }
        result
    }
}

/// Run a driver, turning a panic into a failed task instead of losing it
async fn guarded_drive(ctx: TaskContext, task: DownloadTask, slots: Arc<Semaphore>) -> TaskOutcome {
    let mut fallback = task.clone();
    let progress = Arc::clone(&ctx.progress);
    let log_sink = Arc::clone(&ctx.log_sink);

    match AssertUnwindSafe(drive(ctx, task, slots)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            fallback.status = TaskStatus::Failed;
            fallback.last_error = Some("worker panicked".to_string());
            progress.on_task_failed(fallback.id);
            log_sink.log_task(
                Severity::Error,
                Component::WorkerPool,
                fallback.id,
                format!("Worker for '{}' panicked", fallback.title()),
            );
            TaskOutcome {
                task: fallback,
                recorded: false,
            }
        }
    }
}

/// Retry state machine for one task
///
/// `Pending -> InProgress -> Validating -> Completed`, falling back to `Pending` after a
/// retryable failure below the ceiling and to `Failed` otherwise. Cancellation leaves the
/// task `Pending`.
async fn drive(ctx: TaskContext, mut task: DownloadTask, slots: Arc<Semaphore>) -> TaskOutcome {
    let ceiling = ctx.config.retry.retry_ceiling.max(1);

    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return cancelled(task),
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return cancelled(task),
            },
        };

        task.attempt_count += 1;
        task.status = TaskStatus::InProgress;
        ctx.progress.on_task_started(task.id, task.title());
        tracing::debug!(
            task_id = %task.id,
            attempt = task.attempt_count,
            ceiling,
            "Attempt started"
        );

        let outcome = run_attempt(&ctx, &mut task).await;
        drop(permit);

        let error = match outcome {
            Ok(recorded) => {
                task.status = TaskStatus::Completed;
                task.last_error = None;
                ctx.progress.on_task_completed(task.id);
                ctx.log(
                    Severity::Info,
                    &task,
                    format!("Downloaded '{}'", task.title()),
                );
                return TaskOutcome { task, recorded };
            }
            Err(AttemptFailure::Cancelled) => {
                ctx.progress.on_task_paused(task.id);
                return cancelled(task);
            }
            Err(AttemptFailure::Error(e)) => e,
        };

        task.last_error = Some(error.to_string());

        if !error.is_retryable() || task.attempt_count >= ceiling {
            task.status = TaskStatus::Failed;
            ctx.progress.on_task_failed(task.id);
            ctx.log(
                Severity::Error,
                &task,
                format!(
                    "Failed '{}' after {} attempt(s): {}",
                    task.title(),
                    task.attempt_count,
                    error
                ),
            );
            return TaskOutcome {
                task,
                recorded: false,
            };
        }

        task.status = TaskStatus::Pending;
        ctx.progress.on_task_paused(task.id);
        let delay = backoff_delay(&ctx.config.retry, task.attempt_count);
        ctx.log(
            Severity::Warn,
            &task,
            format!(
                "Attempt {}/{} failed ({}), retrying in {}",
                task.attempt_count,
                ceiling,
                error,
                format_delay(delay)
            ),
        );

        tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return cancelled(task),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt(ctx: &TaskContext, task: &mut DownloadTask) -> Result<Recorded, AttemptFailure> {
    let transferred = stream_to_temp(ctx, task).await.map_err(classify)?;
    finalize(ctx, task, transferred).await.map_err(classify)
}

fn classify(error: Error) -> AttemptFailure {
    match error {
        Error::Cancelled => AttemptFailure::Cancelled,
        other => AttemptFailure::Error(other),
    }
}

fn cancelled(mut task: DownloadTask) -> TaskOutcome {
    task.status = TaskStatus::Pending;
    tracing::debug!(task_id = %task.id, attempts = task.attempt_count, "Task cancelled");
    TaskOutcome {
        task,
        recorded: false,
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.as_secs() >= 1 {
        format!("{:.1}s", delay.as_secs_f64())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
