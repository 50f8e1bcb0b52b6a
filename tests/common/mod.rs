//! Common test utilities for course-dl integration tests

use course_dl::{AssetDescriptor, AssetKind, Config};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A PDF-looking payload of `len` bytes
pub fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut body = b"%PDF-1.5\n%\xe2\xe3\xcf\xd3\n".to_vec();
    body.resize(len.max(body.len()), b'x');
    body
}

/// The page a platform serves when the session expired
pub fn login_page() -> String {
    format!(
        "<!doctype html>\n<html><head><title>Entrar</title></head><body>{}</body></html>",
        "<p>Sua sessao expirou.</p>".repeat(80)
    )
}

/// Configuration rooted in `dir` with fast retries
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.destination_root = dir.join("downloads");
    config.logging.log_dir = dir.join("logs");
    config.retry.retry_ceiling = 2;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config.disk_space.min_free_space = 0;
    config
}

/// Descriptor for an asset of the "Direito Penal" course served under `base`
pub fn asset(base: &str, lesson: u32, kind: AssetKind, path: &str) -> AssetDescriptor {
    AssetDescriptor {
        course_id: "4521".into(),
        course_title: "Direito Penal: Parte Geral".into(),
        lesson_id: lesson.to_string(),
        lesson_title: format!("Aula {lesson:02} - Teoria do Crime"),
        kind,
        source_ref: format!("{base}{path}"),
        display_title: format!("Aula {lesson:02}"),
        resolution_hint: None,
        size_hint: None,
    }
}

/// Every regular file under `root`, relative to it, sorted
pub fn tree(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}
