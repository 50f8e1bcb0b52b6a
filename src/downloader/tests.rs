use super::test_helpers::*;
use super::*;
use crate::config::{DownloadType, PdfType};
use crate::error::TransportError;
use crate::types::{AssetKind, RunOutcome, TaskStatus};
use std::time::Duration;

// --- Plain runs ---

#[tokio::test]
async fn run_downloads_every_pending_task() {
    let fetcher = ScriptedFetcher::serving_pdfs();
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;

    let result = downloader.run(&pdf_descriptors(5)).await.unwrap();

    assert_eq!(result.completed, 5);
    assert_eq!(result.failed, 0);
    assert_eq!(result.outcome(), RunOutcome::Success);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(fetcher.request_count(), 5);

    let root = downloader.config().destination_root().to_path_buf();
    let pdfs = files_with_extension(&root, "pdf");
    assert_eq!(pdfs.len(), 5);
    assert!(
        root.join("Direito Constitucional/Aula 03/Aula 03 - Original.pdf")
            .exists()
    );

    for task in &result.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(std::fs::read(&task.destination_path).unwrap(), pdf_bytes(2048));
    }

    let records = downloader.state_store().load().await.unwrap();
    assert_eq!(records.len(), 5);
    assert!(records.values().all(|r| r.fingerprint.size == 2048));
}

#[tokio::test]
async fn no_lost_updates_under_concurrency() {
    for _ in 0..3 {
        let fetcher = ScriptedFetcher::serving_pdfs();
        let (downloader, _dir) = create_test_downloader_with(fetcher, |config| {
            config.download.max_concurrent_downloads = 16;
        })
        .await;

        let result = downloader.run(&pdf_descriptors(64)).await.unwrap();
        assert_eq!(result.completed, 64);

        let snap = downloader.snapshot();
        assert_eq!(snap.total_tasks, 64);
        assert_eq!(snap.completed_tasks, 64);
        assert_eq!(snap.active_tasks, 0);
        assert_eq!(snap.bytes_transferred, 64 * 2048);
        assert_eq!(snap.total_bytes_estimate, Some(64 * 2048));
        assert_eq!(downloader.state_store().load().await.unwrap().len(), 64);
    }
}

#[tokio::test]
async fn duplicate_descriptors_download_once() {
    let fetcher = ScriptedFetcher::serving_pdfs();
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;

    let mut descriptors = pdf_descriptors(3);
    descriptors.push(descriptors[0].clone());

    let result = downloader.run(&descriptors).await.unwrap();
    assert_eq!(result.tasks.len(), 3);
    assert_eq!(result.completed, 3);
    assert_eq!(fetcher.request_count(), 3);
}

// --- Retry ---

#[tokio::test]
async fn bounded_retries_stop_at_ceiling() {
    let fetcher = ScriptedFetcher::always_failing();
    let (downloader, _dir) = create_test_downloader_with(Arc::clone(&fetcher), |config| {
        config.retry.retry_ceiling = 3;
    })
    .await;

    let result = downloader.run(&pdf_descriptors(1)).await.unwrap();

    assert_eq!(fetcher.request_count(), 3);
    assert_eq!(result.failed, 1);
    assert_eq!(result.outcome(), RunOutcome::Partial);
    assert_eq!(result.exit_code(), 1);

    let failure = &result.failures[0];
    assert_eq!(failure.attempts, 3);
    assert!(failure.reason.contains("connection reset"), "{}", failure.reason);

    let attempts: Vec<u32> = fetcher.requests().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(downloader.snapshot().failed_tasks, 1);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.attempt == 1 {
            Reply::Fail(TransportError::Status {
                status: 503,
                source_ref: request.source_ref.clone(),
            })
        } else {
            Reply::bytes(pdf_bytes(2048))
        }
    });
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;

    let result = downloader.run(&pdf_descriptors(2)).await.unwrap();

    assert_eq!(result.completed, 2);
    assert_eq!(fetcher.request_count(), 4);
    assert!(result.tasks.iter().all(|t| t.attempt_count == 2));
    assert!(result.tasks.iter().all(|t| t.last_error.is_none()));
}

#[tokio::test]
async fn backoff_releases_the_slot() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.source_ref.contains("/l-1/") && request.attempt == 1 {
            Reply::Fail(TransportError::Timeout("read timed out".into()))
        } else {
            Reply::bytes(pdf_bytes(2048))
        }
    });
    let (downloader, _dir) = create_test_downloader_with(Arc::clone(&fetcher), |config| {
        config.download.max_concurrent_downloads = 1;
        config.retry.initial_delay = Duration::from_millis(300);
        config.retry.max_delay = Duration::from_secs(1);
    })
    .await;

    let result = downloader.run(&pdf_descriptors(2)).await.unwrap();
    assert_eq!(result.completed, 2);

    let requests = fetcher.requests();
    let second_task = requests
        .iter()
        .position(|r| r.source_ref.contains("/l-2/"))
        .unwrap();
    let retry = requests
        .iter()
        .position(|r| r.source_ref.contains("/l-1/") && r.attempt == 2)
        .unwrap();
    assert!(
        second_task < retry,
        "the other task should use the slot during the backoff"
    );
}

#[tokio::test]
async fn insufficient_space_is_not_retried() {
    let fetcher = ScriptedFetcher::serving_pdfs();
    let (downloader, _dir) = create_test_downloader_with(Arc::clone(&fetcher), |config| {
        config.disk_space.min_free_space = u64::MAX;
    })
    .await;

    let mut descriptors = pdf_descriptors(1);
    descriptors[0].size_hint = Some(2048);

    let result = downloader.run(&descriptors).await.unwrap();

    assert_eq!(fetcher.request_count(), 0);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failures[0].attempts, 1);
    assert!(result.failures[0].reason.contains("insufficient disk space"));
}

// --- Validation ---

#[tokio::test]
async fn html_payload_never_reaches_final_path() {
    let fetcher = ScriptedFetcher::new(|_| Reply::bytes(html_page()));
    let (downloader, _dir) = create_test_downloader_with(Arc::clone(&fetcher), |config| {
        config.retry.retry_ceiling = 2;
    })
    .await;

    let result = downloader.run(&pdf_descriptors(1)).await.unwrap();

    assert_eq!(fetcher.request_count(), 2);
    assert_eq!(result.failed, 1);
    let task = &result.tasks[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(!task.destination_path.exists());
    assert!(task.last_error.as_deref().unwrap().contains("HTML"));

    let root = downloader.config().destination_root().to_path_buf();
    assert!(files_with_extension(&root, "part").is_empty());
    assert!(files_with_extension(&root, "pdf").is_empty());
    assert!(downloader.state_store().load().await.unwrap().is_empty());
}

#[tokio::test]
async fn html_content_type_is_rejected_even_with_pdf_bytes() {
    let fetcher = ScriptedFetcher::new(|_| Reply::Body {
        chunks: vec![pdf_bytes(2048)],
        content_length: Some(2048),
        content_type: Some("text/html; charset=utf-8".into()),
    });
    let (downloader, _dir) = create_test_downloader_with(fetcher, |config| {
        config.retry.retry_ceiling = 1;
    })
    .await;

    let result = downloader.run(&pdf_descriptors(1)).await.unwrap();
    assert_eq!(result.failed, 1);
    assert!(!result.tasks[0].destination_path.exists());
}

#[tokio::test]
async fn rejection_then_valid_payload_completes() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.attempt == 1 {
            Reply::bytes(html_page())
        } else {
            Reply::bytes(pdf_bytes(4096))
        }
    });
    let (downloader, _dir) = create_test_downloader(fetcher).await;

    let result = downloader.run(&pdf_descriptors(1)).await.unwrap();

    assert_eq!(result.completed, 1);
    let task = &result.tasks[0];
    assert_eq!(task.attempt_count, 2);
    assert_eq!(std::fs::read(&task.destination_path).unwrap(), pdf_bytes(4096));
}

#[tokio::test]
async fn truncated_body_is_rejected() {
    let fetcher = ScriptedFetcher::new(|_| Reply::Body {
        chunks: vec![pdf_bytes(2048)],
        content_length: Some(8192),
        content_type: None,
    });
    let (downloader, _dir) = create_test_downloader_with(fetcher, |config| {
        config.retry.retry_ceiling = 1;
    })
    .await;

    let result = downloader.run(&pdf_descriptors(1)).await.unwrap();
    assert_eq!(result.failed, 1);
    assert!(result.failures[0].reason.contains("truncated"));
}

// --- Cancellation ---

#[tokio::test]
async fn cancel_mid_stream_leaves_no_final_file() {
    let fetcher = ScriptedFetcher::new(|_| Reply::Stall(vec![pdf_bytes(1500)]));
    let (downloader, _dir) = create_test_downloader(fetcher).await;

    let runner = downloader.clone();
    let descriptors = pdf_descriptors(1);
    let handle = tokio::spawn(async move { runner.run(&descriptors).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while downloader.snapshot().bytes_transferred == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transfer should start");

    downloader.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should stop after cancellation")
        .unwrap()
        .unwrap();

    assert!(result.was_cancelled);
    assert_eq!(result.cancelled, 1);
    assert_eq!(result.outcome(), RunOutcome::Cancelled);
    assert_eq!(result.exit_code(), 130);

    let task = &result.tasks[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!task.destination_path.exists());

    let root = downloader.config().destination_root().to_path_buf();
    assert!(files_with_extension(&root, "part").is_empty());
    assert_eq!(downloader.snapshot().active_tasks, 0);
}

#[tokio::test]
async fn cancelled_downloader_starts_nothing() {
    let fetcher = ScriptedFetcher::serving_pdfs();
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;

    downloader.cancel();
    let result = downloader.run(&pdf_descriptors(3)).await.unwrap();

    assert_eq!(fetcher.request_count(), 0);
    assert_eq!(result.cancelled, 3);
    assert!(result.tasks.iter().all(|t| t.attempt_count == 0));
}

// --- Resume ---

#[tokio::test]
async fn crash_then_resume_skips_recorded_assets() {
    let dir = tempfile::tempdir().unwrap();
    let descriptors = pdf_descriptors(10);

    let first = CourseDownloader::new(test_config(dir.path()), ScriptedFetcher::serving_pdfs())
        .await
        .unwrap();
    let partial = first.run(&descriptors[..4]).await.unwrap();
    assert_eq!(partial.completed, 4);
    first.shutdown().await.unwrap();

    let fetcher = ScriptedFetcher::serving_pdfs();
    let second = CourseDownloader::new(test_config(dir.path()), Arc::clone(&fetcher) as Arc<dyn Fetcher>)
        .await
        .unwrap();
    let result = second.run(&descriptors).await.unwrap();

    assert_eq!(fetcher.request_count(), 6);
    assert_eq!(result.skipped, 4);
    assert_eq!(result.completed, 6);
    assert_eq!(result.outcome(), RunOutcome::Success);
    assert_eq!(second.snapshot().skipped_tasks, 4);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn planning_after_a_full_run_skips_everything() {
    let (downloader, _dir) = create_test_downloader(ScriptedFetcher::serving_pdfs()).await;
    let descriptors = pdf_descriptors(4);

    let before = downloader.plan(&descriptors).await.unwrap();
    assert_eq!(before.pending(), 4);
    downloader.run(&descriptors).await.unwrap();

    let after = downloader.plan(&descriptors).await.unwrap();
    assert_eq!(after.skipped(), 4);
    let paths_before: Vec<_> = before.tasks.iter().map(|t| &t.destination_path).collect();
    let paths_after: Vec<_> = after.tasks.iter().map(|t| &t.destination_path).collect();
    assert_eq!(paths_before, paths_after);
}

#[tokio::test(flavor = "current_thread")]
async fn hash_verified_resume_plans_on_a_blocking_thread() {
    let (downloader, _dir) = create_test_downloader_with(ScriptedFetcher::serving_pdfs(), |config| {
        config.persistence.verify_hash_on_resume = true;
    })
    .await;
    let descriptors = pdf_descriptors(4);
    let result = downloader.run(&descriptors).await.unwrap();

    // Same size, different content: only a re-hash notices
    let tampered = &result.tasks[0].destination_path;
    let len = std::fs::metadata(tampered).unwrap().len() as usize;
    std::fs::write(tampered, pdf_bytes(len).iter().map(|b| b ^ 1).collect::<Vec<_>>()).unwrap();

    let plan = downloader.plan(&descriptors).await.unwrap();
    assert_eq!(plan.skipped(), 3);
    assert_eq!(plan.pending(), 1);
    assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
}

#[tokio::test]
async fn deleted_file_is_downloaded_again() {
    let fetcher = ScriptedFetcher::serving_pdfs();
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;
    let descriptors = pdf_descriptors(2);

    let result = downloader.run(&descriptors).await.unwrap();
    std::fs::remove_file(&result.tasks[0].destination_path).unwrap();

    let rerun = downloader.run(&descriptors).await.unwrap();
    assert_eq!(rerun.completed, 1);
    assert_eq!(rerun.skipped, 1);
    assert_eq!(fetcher.request_count(), 3);
}

#[tokio::test]
async fn unrecorded_completion_still_counts_as_completed() {
    let (downloader, _dir) = create_test_downloader(ScriptedFetcher::serving_pdfs()).await;
    // A directory where the state file should be makes every append fail
    std::fs::create_dir_all(downloader.config().state_file_path()).unwrap();

    let result = downloader.run(&pdf_descriptors(2)).await.unwrap();

    assert_eq!(result.completed, 2);
    assert_eq!(result.unrecorded, 2);
    assert_eq!(result.outcome(), RunOutcome::Success);
    assert!(result.tasks.iter().all(|t| t.destination_path.exists()));
}

#[tokio::test]
async fn stale_partial_files_are_removed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let incomplete = config.incomplete_dir();
    std::fs::create_dir_all(&incomplete).unwrap();
    std::fs::write(incomplete.join("0badc0de-1.part"), b"half").unwrap();
    std::fs::write(incomplete.join("notes.txt"), b"keep").unwrap();

    let _downloader = CourseDownloader::new(config, ScriptedFetcher::serving_pdfs())
        .await
        .unwrap();

    assert!(!incomplete.join("0badc0de-1.part").exists());
    assert!(incomplete.join("notes.txt").exists());
}

// --- Plan errors ---

#[tokio::test]
async fn unwritable_root_is_a_plan_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = test_config(dir.path());
    config.download.destination_root = blocker.join("downloads");
    let fetcher = ScriptedFetcher::serving_pdfs();
    let downloader = CourseDownloader::new(config, Arc::clone(&fetcher) as Arc<dyn Fetcher>)
        .await
        .unwrap();

    let err = downloader.run(&pdf_descriptors(1)).await.unwrap_err();
    assert!(matches!(err, Error::Plan(_)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(fetcher.request_count(), 0);
}

// --- Selection & fetch requests ---

#[tokio::test]
async fn selection_filters_descriptors_before_planning() {
    let (downloader, _dir) = create_test_downloader_with(ScriptedFetcher::serving_pdfs(), |config| {
        config.selection.download_type = DownloadType::Pdf;
        config.selection.pdf_type = PdfType::Original;
        config.selection.download_extras = false;
    })
    .await;

    let descriptors = vec![
        descriptor(1, AssetKind::Video),
        descriptor(1, AssetKind::PdfOriginal),
        descriptor(1, AssetKind::PdfMarked),
        descriptor(1, AssetKind::MindMap),
    ];
    let plan = downloader.plan(&descriptors).await.unwrap();

    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].descriptor.kind, AssetKind::PdfOriginal);
}

#[tokio::test]
async fn resolution_hint_defaults_to_configured_value() {
    let fetcher = ScriptedFetcher::new(|_| Reply::bytes(vec![0u8; 4096]));
    let (downloader, _dir) = create_test_downloader(Arc::clone(&fetcher)).await;

    let mut hinted = descriptor(2, AssetKind::Video);
    hinted.resolution_hint = Some("1080p".into());
    let descriptors = vec![
        descriptor(1, AssetKind::Video),
        hinted,
        descriptor(3, AssetKind::PdfOriginal),
    ];
    let result = downloader.run(&descriptors).await.unwrap();
    assert_eq!(result.completed, 2, "the zero-filled PDF lacks a signature");

    let hint_for = |lesson: &str| {
        fetcher
            .requests()
            .into_iter()
            .find(|r| r.source_ref.contains(lesson))
            .unwrap()
            .resolution_hint
    };
    assert_eq!(hint_for("/l-1/").as_deref(), Some("720p"));
    assert_eq!(hint_for("/l-2/").as_deref(), Some("1080p"));
    assert_eq!(hint_for("/l-3/"), None);
}

// --- Reporting ---

#[tokio::test]
async fn run_summary_reaches_the_log_file() {
    let fetcher = ScriptedFetcher::new(|request| {
        if request.source_ref.contains("/l-2/") {
            Reply::Fail(TransportError::Status {
                status: 404,
                source_ref: request.source_ref.clone(),
            })
        } else {
            Reply::bytes(pdf_bytes(2048))
        }
    });
    let (downloader, _dir) = create_test_downloader(fetcher).await;

    let result = downloader.run(&pdf_descriptors(2)).await.unwrap();
    assert_eq!(result.outcome(), RunOutcome::Partial);
    let log_path = downloader.log_sink().active_path().to_path_buf();
    downloader.shutdown().await.unwrap();

    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("Run finished"), "{log}");
    assert!(log.contains("1 completed"), "{log}");
    assert!(log.contains("partial, exit code 1"), "{log}");
    assert!(log.contains("HTTP status 404"), "{log}");
    assert!(log.contains("Shutdown complete"), "{log}");
}

#[tokio::test]
async fn log_subscribers_see_task_events() {
    let (downloader, _dir) = create_test_downloader(ScriptedFetcher::serving_pdfs()).await;
    let mut events = downloader.subscribe();

    downloader.run(&pdf_descriptors(2)).await.unwrap();

    let mut downloaded = 0;
    while let Ok(event) = events.try_recv() {
        if event.component == Component::WorkerPool && event.message.starts_with("Downloaded") {
            assert!(event.task_id.is_some());
            downloaded += 1;
        }
    }
    assert_eq!(downloaded, 2);
}

#[tokio::test]
async fn progress_updates_end_with_final_state() {
    let (downloader, _dir) = create_test_downloader(ScriptedFetcher::serving_pdfs()).await;
    let updates = downloader.progress_updates();

    downloader.run(&pdf_descriptors(3)).await.unwrap();
    downloader.shutdown().await.unwrap();

    let last = updates.borrow().clone();
    assert_eq!(last.completed_tasks, 3);
    assert_eq!(last.finished_tasks(), last.total_tasks);
}
