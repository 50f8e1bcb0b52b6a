//! End-to-end runs against a mock HTTP server
//!
//! These tests drive the public API only: an [`HttpFetcher`] talks to a wiremock server,
//! and assertions are made on the output tree, the state file and the run report.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{asset, config_in, login_page, pdf_bytes, tree};
use course_dl::{AssetKind, CourseDownloader, HttpFetcher, RunOutcome, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn course_is_downloaded_validated_and_resumed() {
    let server = MockServer::start().await;
    let base = server.uri();

    mount(
        &server,
        "/aula-01/video/720p",
        ResponseTemplate::new(200)
            .insert_header("content-type", "video/mp4")
            .set_body_bytes(vec![0x42u8; 64 * 1024]),
    )
    .await;
    mount(
        &server,
        "/aula-01/pdf",
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/pdf")
            .set_body_bytes(pdf_bytes(8 * 1024)),
    )
    .await;
    mount(
        &server,
        "/aula-02/pdf",
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/octet-stream")
            .set_body_string(login_page()),
    )
    .await;
    mount(&server, "/aula-02/mapa", ResponseTemplate::new(404)).await;

    let dir = tempfile::tempdir().unwrap();
    let descriptors = vec![
        asset(&base, 1, AssetKind::Video, "/aula-01/video/{resolution}"),
        asset(&base, 1, AssetKind::PdfOriginal, "/aula-01/pdf"),
        asset(&base, 2, AssetKind::PdfOriginal, "/aula-02/pdf"),
        asset(&base, 2, AssetKind::MindMap, "/aula-02/mapa"),
    ];

    let config = config_in(dir.path());
    let root = config.destination_root().to_path_buf();
    let downloader = CourseDownloader::with_http_fetcher(config).await.unwrap();
    let result = downloader.run(&descriptors).await.unwrap();

    assert_eq!(result.completed, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.outcome(), RunOutcome::Partial);

    let rejected = result
        .failures
        .iter()
        .find(|f| f.title == "Aula 02" && f.reason.contains("HTML"))
        .expect("the login page should be rejected");
    assert_eq!(rejected.attempts, 2);

    let files = tree(&root);
    let course = PathBuf::from("Direito Penal_ Parte Geral");
    assert_eq!(
        files,
        vec![
            PathBuf::from(".course-dl-state.jsonl"),
            course.join("Aula 01 - Teoria do Crime/Aula 01 - Original.pdf"),
            course.join("Aula 01 - Teoria do Crime/Aula 01.mp4"),
        ]
    );
    assert_eq!(
        std::fs::read(root.join(course.join("Aula 01 - Teoria do Crime/Aula 01.mp4")))
            .unwrap()
            .len(),
        64 * 1024
    );
    downloader.shutdown().await.unwrap();

    // A second run only retries what is missing
    let again = CourseDownloader::with_http_fetcher(config_in(dir.path()))
        .await
        .unwrap();
    let rerun = again.run(&descriptors).await.unwrap();
    assert_eq!(rerun.skipped, 2);
    assert_eq!(rerun.failed, 2);
    assert!(
        rerun
            .tasks
            .iter()
            .filter(|t| t.descriptor.lesson_id == "1")
            .all(|t| t.status == TaskStatus::Skipped)
    );
    again.shutdown().await.unwrap();
}

#[tokio::test]
async fn session_headers_reach_every_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(wiremock::matchers::header("cookie", "PHPSESSID=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pdf_bytes(4096)))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(reqwest::header::COOKIE, "PHPSESSID=abc123".parse().unwrap());
    let fetcher = HttpFetcher::with_headers(&config.fetch, headers).unwrap();
    let downloader = CourseDownloader::new(config, Arc::new(fetcher)).await.unwrap();

    let base = server.uri();
    let descriptors: Vec<_> = (1..=3)
        .map(|lesson| asset(&base, lesson, AssetKind::PdfSimplified, &format!("/{lesson}.pdf")))
        .collect();
    let result = downloader.run(&descriptors).await.unwrap();

    assert_eq!(result.completed, 3);
    assert_eq!(result.exit_code(), 0);
    downloader.shutdown().await.unwrap();
}
