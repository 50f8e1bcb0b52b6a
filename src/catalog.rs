//! Course catalog
//!
//! The list of course URLs a user queued for download, persisted as pretty JSON.
//! Older files stored plain URL strings; they are read transparently and rewritten as
//! `{url, title}` objects on load.

use crate::error::{Error, Result};
use crate::utils::{with_suffix, write_atomic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Host that course URLs must belong to unless configured otherwise
pub const DEFAULT_ALLOWED_HOST: &str = "estrategiaconcursos.com.br";

/// Title used when a URL carries no recognizable slug
pub const UNKNOWN_COURSE_TITLE: &str = "Unknown Course";

static TRAILING_ID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s\d+$").ok());

/// One queued course
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseEntry {
    /// Course lesson-list URL
    pub url: String,
    /// Readable title derived from the URL slug
    pub title: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Legacy(String),
    Entry(CourseEntry),
}

/// Persistent list of course URLs
#[derive(Debug)]
pub struct CourseCatalog {
    path: PathBuf,
    allowed_host: String,
    entries: Vec<CourseEntry>,
}

impl CourseCatalog {
    /// Open the catalog stored at `path`
    ///
    /// A missing file is an empty catalog. A corrupt file is moved aside as
    /// `<name>.<unix-timestamp>.bak` and an empty catalog is returned.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut catalog = Self {
            path,
            allowed_host: DEFAULT_ALLOWED_HOST.to_string(),
            entries: Vec::new(),
        };

        let raw = match std::fs::read_to_string(&catalog.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(catalog),
            Err(e) => return Err(Error::Io(e)),
        };

        let stored: Vec<StoredEntry> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                let backup = with_suffix(
                    &catalog.path,
                    &format!(".{}.bak", chrono::Utc::now().timestamp()),
                );
                tracing::error!(
                    path = %catalog.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Course catalog is corrupt, moving it aside"
                );
                std::fs::rename(&catalog.path, &backup)?;
                return Ok(catalog);
            }
        };

        let mut migrated = false;
        for item in stored {
            match item {
                StoredEntry::Legacy(url) => {
                    migrated = true;
                    catalog.entries.push(CourseEntry {
                        title: title_from_url(&url),
                        url,
                    });
                }
                StoredEntry::Entry(entry) => catalog.entries.push(entry),
            }
        }
        if migrated {
            tracing::info!(path = %catalog.path.display(), "Migrating course catalog to titled entries");
            catalog.save()?;
        }

        tracing::info!(courses = catalog.entries.len(), "Course catalog loaded");
        Ok(catalog)
    }

    /// Accept URLs from a different host
    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_host = host.into();
        self
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queued courses, in insertion order
    pub fn entries(&self) -> &[CourseEntry] {
        &self.entries
    }

    /// Whether no course is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that `url` points at a course lesson list on the allowed host
    pub fn validate_url(&self, url: &str) -> Result<url::Url> {
        let invalid = |reason: &str| Error::InvalidCourseUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = url::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        let allowed = self.allowed_host.to_ascii_lowercase();
        if host != allowed && !host.ends_with(&format!(".{allowed}")) {
            return Err(invalid(&format!("host must be {}", self.allowed_host)));
        }
        if !parsed.path().contains("/cursos/") {
            return Err(invalid("path must contain /cursos/"));
        }
        if !parsed.path().ends_with("/aulas") {
            return Err(invalid("path must end with /aulas"));
        }
        Ok(parsed)
    }

    /// Validate and queue a course URL
    pub fn add(&mut self, url: &str) -> Result<&CourseEntry> {
        let url = url.trim();
        self.validate_url(url)?;
        if self.entries.iter().any(|e| e.url == url) {
            return Err(Error::InvalidCourseUrl {
                url: url.to_string(),
                reason: "already in the catalog".to_string(),
            });
        }

        let entry = CourseEntry {
            url: url.to_string(),
            title: title_from_url(url),
        };
        tracing::info!(title = %entry.title, "Course added");
        self.entries.push(entry);
        self.save()?;
        let index = self.entries.len() - 1;
        Ok(&self.entries[index])
    }

    /// Remove a course; returns whether it was present
    pub fn remove(&mut self, url: &str) -> Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|e| e.url != url);
        if self.entries.len() == before {
            tracing::warn!(url, "Course not found in catalog");
            return Ok(false);
        }
        self.save()?;
        tracing::info!(url, "Course removed");
        Ok(true)
    }

    /// Remove every course
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()?;
        tracing::info!("Course catalog cleared");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        write_atomic(&self.path, json.as_bytes())?;
        tracing::debug!(courses = self.entries.len(), "Course catalog saved");
        Ok(())
    }
}

/// Readable course title from its URL slug
///
/// Uses the segment before `aulas`, or else the last hyphenated segment longer than
/// five characters. A trailing numeric id is dropped.
///
/// ```
/// use course_dl::catalog::title_from_url;
///
/// assert_eq!(
///     title_from_url("https://www.estrategiaconcursos.com.br/app/dashboard/cursos/curso-de-python-avancado-123/aulas"),
///     "Curso De Python Avancado"
/// );
/// ```
pub fn title_from_url(url: &str) -> String {
    let parts: Vec<&str> = url.split('/').filter(|p| !p.is_empty()).collect();

    let slug = match parts.iter().position(|p| *p == "aulas") {
        Some(idx) if idx > 0 => Some(parts[idx - 1]),
        Some(_) => None,
        None => parts
            .iter()
            .rev()
            .find(|p| p.contains('-') && p.chars().count() > 5)
            .copied(),
    };
    let Some(slug) = slug else {
        return UNKNOWN_COURSE_TITLE.to_string();
    };

    let title = slug
        .split('-')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");

    let title = match TRAILING_ID.as_ref() {
        Some(re) => re.replace(&title, "").into_owned(),
        None => title,
    };
    if title.is_empty() {
        UNKNOWN_COURSE_TITLE.to_string()
    } else {
        title
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
