//! Resume/state store
//!
//! One append-only JSON-lines file per destination root, one [`CompletionRecord`] per
//! line. Every append is flushed and synced before it returns, so a crash loses at most
//! the record being written. A torn trailing line from such a crash is skipped on load
//! and fenced off with a newline before the next append.

use crate::error::StateStoreError;
use crate::types::CompletionRecord;
use crate::utils::with_suffix;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Completion records keyed by destination path, latest record winning
pub type CompletionIndex = HashMap<PathBuf, CompletionRecord>;

/// Summary of the state file contents
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateStats {
    /// Well-formed records in the file
    pub records: usize,
    /// Distinct destination paths among them
    pub distinct_paths: usize,
    /// Lines that could not be parsed (torn writes, manual edits)
    pub malformed_lines: usize,
    /// Sum of the sizes of the latest record per path
    pub total_bytes: u64,
}

struct Parsed {
    records: Vec<CompletionRecord>,
    malformed_lines: usize,
}

/// Durable record of validated downloads
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    // Serializes every writer; the handle is opened lazily on first append
    writer: Mutex<Option<tokio::fs::File>>,
}

impl StateStore {
    /// Store backed by the file at `path` (created on first append)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record; a missing file is an empty store
    pub async fn load(&self) -> Result<CompletionIndex, StateStoreError> {
        let parsed = self.read_all().await?;
        if parsed.malformed_lines > 0 {
            tracing::warn!(
                path = %self.path.display(),
                malformed = parsed.malformed_lines,
                "Skipped malformed lines in state file"
            );
        }
        let index: CompletionIndex = parsed
            .records
            .into_iter()
            .map(|r| (r.destination_path.clone(), r))
            .collect();
        tracing::debug!(path = %self.path.display(), records = index.len(), "State loaded");
        Ok(index)
    }

    /// Persist one record
    ///
    /// Safe to call from many tasks at once; returns only after the line is synced.
    pub async fn append(&self, record: &CompletionRecord) -> Result<(), StateStoreError> {
        let append_error = |reason: String| StateStoreError::Append {
            destination: record.destination_path.clone(),
            reason,
        };

        let mut line =
            serde_json::to_vec(record).map_err(|e| append_error(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            *guard = Some(
                self.open_for_append()
                    .await
                    .map_err(|e| append_error(e.to_string()))?,
            );
        }
        let Some(file) = guard.as_mut() else {
            return Err(append_error("state file handle unavailable".into()));
        };

        let result = async {
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = result {
            // Reopen next time so a half-written line gets fenced off
            *guard = None;
            return Err(append_error(e.to_string()));
        }
        Ok(())
    }

    /// Rewrite the file keeping only the latest record per path
    ///
    /// The new file is written next to the old one and renamed over it. Returns the
    /// number of records kept.
    pub async fn compact(&self) -> Result<usize, StateStoreError> {
        let mut guard = self.writer.lock().await;
        let rewrite_error = |reason: String| StateStoreError::Rewrite {
            path: self.path.clone(),
            reason,
        };

        let parsed = self.read_all().await?;
        let mut latest: Vec<CompletionRecord> = Vec::new();
        let mut position: HashMap<PathBuf, usize> = HashMap::new();
        for record in parsed.records {
            match position.get(&record.destination_path) {
                Some(&i) => latest[i] = record,
                None => {
                    position.insert(record.destination_path.clone(), latest.len());
                    latest.push(record);
                }
            }
        }

        let mut contents = Vec::new();
        for record in &latest {
            let line = serde_json::to_vec(record).map_err(|e| rewrite_error(e.to_string()))?;
            contents.extend_from_slice(&line);
            contents.push(b'\n');
        }

        // Drop the append handle before the rename replaces the file under it
        *guard = None;
        write_synced(&self.path, &contents)
            .await
            .map_err(|e| rewrite_error(e.to_string()))?;

        tracing::info!(path = %self.path.display(), kept = latest.len(), "State file compacted");
        Ok(latest.len())
    }

    /// Forget every record
    pub async fn clear(&self) -> Result<(), StateStoreError> {
        let mut guard = self.writer.lock().await;
        *guard = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateStoreError::Rewrite {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
        tracing::info!(path = %self.path.display(), "State cleared");
        Ok(())
    }

    /// Count records in the file
    pub async fn stats(&self) -> Result<StateStats, StateStoreError> {
        let _guard = self.writer.lock().await;
        let parsed = self.read_all().await?;
        let records = parsed.records.len();
        let latest: CompletionIndex = parsed
            .records
            .into_iter()
            .map(|r| (r.destination_path.clone(), r))
            .collect();
        Ok(StateStats {
            records,
            distinct_paths: latest.len(),
            malformed_lines: parsed.malformed_lines,
            total_bytes: latest.values().map(|r| r.fingerprint.size).sum(),
        })
    }

    async fn read_all(&self) -> Result<Parsed, StateStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StateStoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        let mut malformed_lines = 0;
        for line in bytes.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<CompletionRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) => malformed_lines += 1,
            }
        }
        Ok(Parsed {
            records,
            malformed_lines,
        })
    }

    async fn open_for_append(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        let len = file.metadata().await?.len();
        if len > 0 {
            file.seek(std::io::SeekFrom::Start(len - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                file.write_all(b"\n").await?;
            }
        }
        Ok(file)
    }
}

async fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = with_suffix(path, ".tmp");
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await
}
