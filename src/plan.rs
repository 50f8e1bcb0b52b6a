//! Asset queue and download plan
//!
//! Turns the scraper's descriptors into [`DownloadTask`]s: duplicates are dropped,
//! every task gets a deterministic destination under the root, and assets that an
//! earlier run already validated are marked [`TaskStatus::Skipped`].
//!
//! Layout: `root/<course title>/<lesson title>/<asset title>[ - <label>].<ext>`.

use crate::error::PlanError;
use crate::types::{AssetDescriptor, AssetKey, CompletionRecord, DownloadTask, TaskId, TaskStatus};
use crate::utils::{
    MAX_COMPONENT_BYTES, fingerprint_file, sanitize_component, sanitize_component_within,
    short_hash,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A built plan
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// One task per distinct asset, in first-seen order
    pub tasks: Vec<DownloadTask>,
    /// Descriptors dropped because an identical asset was already queued
    pub duplicates: usize,
}

impl Plan {
    /// Tasks that still need a transfer
    pub fn pending(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    /// Tasks already present on disk
    pub fn skipped(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Build the download plan
///
/// Fails only when `root` cannot be created or written to, since no task could succeed.
/// `verify_hash` re-hashes files that have a completion record instead of trusting
/// their size alone.
pub fn build(
    root: &Path,
    descriptors: &[AssetDescriptor],
    existing: &HashMap<PathBuf, CompletionRecord>,
    verify_hash: bool,
) -> Result<Plan, PlanError> {
    ensure_writable(root)?;

    let mut seen: HashSet<AssetKey> = HashSet::with_capacity(descriptors.len());
    let mut unique: Vec<&AssetDescriptor> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if seen.insert(descriptor.key()) {
            unique.push(descriptor);
        }
    }
    let duplicates = descriptors.len() - unique.len();

    let paths = assign_destinations(root, &unique);

    let tasks: Vec<DownloadTask> = unique
        .into_iter()
        .zip(paths)
        .enumerate()
        .map(|(index, (descriptor, destination_path))| {
            let status = if is_already_complete(&destination_path, existing, verify_hash) {
                TaskStatus::Skipped
            } else {
                TaskStatus::Pending
            };
            DownloadTask {
                id: TaskId::new(index as u64 + 1),
                descriptor: descriptor.clone(),
                destination_path,
                attempt_count: 0,
                status,
                last_error: None,
            }
        })
        .collect();

    let plan = Plan { tasks, duplicates };
    tracing::debug!(
        tasks = plan.tasks.len(),
        pending = plan.pending(),
        skipped = plan.skipped(),
        duplicates,
        "Download plan built"
    );
    Ok(plan)
}

/// Destination of a single descriptor, ignoring collisions with other descriptors
///
/// A pure function of the descriptor's fields and the root.
pub fn destination_path(root: &Path, descriptor: &AssetDescriptor) -> PathBuf {
    root.join(sanitize_component(&descriptor.course_title))
        .join(sanitize_component(&descriptor.lesson_title))
        .join(file_name(descriptor, None))
}

/// File name for a descriptor, optionally disambiguated with a suffix
///
/// Only the title is truncated; the label, the suffix and the extension always
/// survive, and the whole name stays within [`MAX_COMPONENT_BYTES`].
pub fn file_name(descriptor: &AssetDescriptor, disambiguator: Option<&str>) -> String {
    let extension = descriptor.kind.extension();
    let title = descriptor.display_title.trim();
    let suffix = disambiguator
        .map(|s| format!(" [{}]", sanitize_component(s)))
        .unwrap_or_default();

    let stem = match descriptor.kind.label() {
        Some(label) if title.is_empty() => format!("{label}{suffix}"),
        label => {
            let label = label.map(|l| format!(" - {l}")).unwrap_or_default();
            let budget = MAX_COMPONENT_BYTES
                .saturating_sub(label.len() + suffix.len() + extension.len() + 1);
            format!("{}{label}{suffix}", sanitize_component_within(title, budget))
        }
    };
    format!("{stem}.{extension}")
}

/// Destinations for a deduplicated descriptor list
///
/// Descriptors whose final paths would collide (compared case-insensitively, as on
/// Windows and macOS) all receive a short hash of their identity, so the outcome does
/// not depend on input order. A suffixed name that still clashes gets a counter.
fn assign_destinations(root: &Path, descriptors: &[&AssetDescriptor]) -> Vec<PathBuf> {
    let base: Vec<PathBuf> = descriptors
        .iter()
        .map(|d| destination_path(root, d))
        .collect();

    let mut occupancy: HashMap<String, usize> = HashMap::new();
    for path in &base {
        *occupancy.entry(collision_key(path)).or_default() += 1;
    }

    let mut taken: HashSet<String> = HashSet::with_capacity(base.len());
    descriptors
        .iter()
        .zip(base)
        .map(|(descriptor, path)| {
            let hash = short_hash(&identity_string(descriptor));
            let mut path = if occupancy.get(&collision_key(&path)).copied().unwrap_or(0) > 1 {
                path.with_file_name(file_name(descriptor, Some(&hash)))
            } else {
                path
            };
            let mut round = 1;
            while !taken.insert(collision_key(&path)) {
                round += 1;
                let suffix = format!("{hash}-{round}");
                path = path.with_file_name(file_name(descriptor, Some(&suffix)));
            }
            path
        })
        .collect()
}

fn collision_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn identity_string(descriptor: &AssetDescriptor) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        descriptor.course_id, descriptor.lesson_id, descriptor.kind, descriptor.source_ref
    )
}

fn is_already_complete(
    path: &Path,
    existing: &HashMap<PathBuf, CompletionRecord>,
    verify_hash: bool,
) -> bool {
    let Some(record) = existing.get(path) else {
        return false;
    };
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() || meta.len() != record.fingerprint.size {
        return false;
    }
    if verify_hash {
        return match fingerprint_file(path) {
            Ok(fp) => fp == record.fingerprint,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not re-hash completed file");
                false
            }
        };
    }
    true
}

/// Create the root if needed and prove it accepts writes
pub fn ensure_writable(root: &Path) -> Result<(), PlanError> {
    let not_writable = |reason: String| PlanError::DestinationNotWritable {
        path: root.to_path_buf(),
        reason,
    };

    std::fs::create_dir_all(root).map_err(|e| not_writable(e.to_string()))?;
    let probe = root.join(format!(".course-dl-probe-{}", std::process::id()));
    std::fs::write(&probe, b"probe").map_err(|e| not_writable(e.to_string()))?;
    if let Err(e) = std::fs::remove_file(&probe) {
        tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
    }
    Ok(())
}
