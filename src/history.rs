// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Journal of organize operations, with undo support

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::storage::StorageProvider;
use crate::tagstore::TagStore;
use crate::{OrganizerError, Result};

/// One organized copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub source_name: String,
    /// ID of the copy created in the destination
    pub uploaded_id: String,
    pub folder: String,
    pub file_name: String,
    pub category: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub undone: bool,
}

/// Outcome of an undo run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UndoReport {
    pub undone: usize,
    pub failed: usize,
}

/// JSONL journal at a fixed path
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append an entry to the journal
    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Read all entries, oldest first
    pub fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Failed to parse history entry: {}", e),
            }
        }

        Ok(entries)
    }

    /// The most recent `count` entries (newest first)
    pub fn get_recent(&self, count: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        entries.truncate(count);
        Ok(entries)
    }

    /// Entries not yet undone, newest first
    pub fn get_undoable(&self) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<_> = self.read_all()?.into_iter().filter(|e| !e.undone).collect();
        entries.reverse();
        Ok(entries)
    }

    /// Mark an entry as undone, rewriting the journal
    pub fn mark_undone(&self, id: &str) -> Result<()> {
        let entries = self.read_all()?;
        if !entries.iter().any(|e| e.id == id) {
            return Err(OrganizerError::NotFound(format!("History entry {}", id)));
        }

        let mut writer = std::io::BufWriter::new(File::create(&self.path)?);
        for mut entry in entries {
            if entry.id == id {
                entry.undone = true;
            }
            writeln!(writer, "{}", serde_json::to_string(&entry)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the uploaded copies of the last `count` entries (0 for all)
    ///
    /// Tag store records pointing at a removed copy are dropped too, so the
    /// source image is organized again on the next run.
    pub async fn undo(
        &self,
        storage: &dyn StorageProvider,
        tag_store: Option<&TagStore>,
        count: usize,
        dry_run: bool,
    ) -> Result<UndoReport> {
        let mut entries = self.get_undoable()?;
        if count > 0 {
            entries.truncate(count);
        }

        let mut report = UndoReport::default();
        for entry in entries {
            if dry_run {
                info!("Would delete {}/{} ({})", entry.folder, entry.file_name, entry.uploaded_id);
                continue;
            }

            match storage.delete_file(&entry.uploaded_id).await {
                Ok(()) | Err(OrganizerError::NotFound(_)) => {
                    self.mark_undone(&entry.id)?;
                    if let Some(store) = tag_store {
                        forget_upload(store, &entry)?;
                    }
                    info!("Removed {}/{}", entry.folder, entry.file_name);
                    report.undone += 1;
                }
                Err(e) => {
                    warn!("Could not remove {}/{}: {}", entry.folder, entry.file_name, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Remove the tag store record of `entry`'s source if it still describes this copy
fn forget_upload(store: &TagStore, entry: &HistoryEntry) -> Result<()> {
    let Some(record) = store.get_image_metadata(&entry.source_id)? else {
        return Ok(());
    };
    let uploaded = record.metadata.get("uploaded_id").and_then(|v| v.as_str());
    if uploaded.map_or(true, |id| id == entry.uploaded_id) {
        store.delete_image(&entry.source_id)?;
    }
    Ok(())
}

/// Create a new journal entry
pub fn create_entry(
    source_id: &str,
    source_name: &str,
    uploaded_id: &str,
    folder: &str,
    file_name: &str,
    category: &str,
    labels: Vec<String>,
    content_hash: Option<String>,
) -> HistoryEntry {
    HistoryEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        source_id: source_id.to_string(),
        source_name: source_name.to_string(),
        uploaded_id: uploaded_id.to_string(),
        folder: folder.to_string(),
        file_name: file_name.to_string(),
        category: category.to_string(),
        labels,
        content_hash,
        undone: false,
    }
}
