// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Local directory tree storage provider
//!
//! Mirrors the Drive model on a plain directory: file and folder IDs are
//! root-relative paths, the root folder has ID `.`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{
    guess_mime, is_root_path, matches_extension, path_components, ByteStream, RemoteFile, StorageProvider,
    FOLDER_ID_PREFIX, FOLDER_MIME_TYPE,
};
use crate::{OrganizerError, Result};

const ROOT_ID: &str = ".";
const CHUNK_SIZE: usize = 1024 * 1024;

/// Storage provider backed by a local directory
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an ID to an absolute path, refusing escapes from the root
    fn resolve_id(&self, id: &str) -> Result<PathBuf> {
        if id == ROOT_ID || id.is_empty() {
            return Ok(self.root.clone());
        }
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(OrganizerError::Validation(format!("Invalid file id: {}", id)));
        }
        Ok(self.root.join(relative))
    }

    fn id_for(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ROOT_ID.to_string(),
            Ok(rel) => rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.to_string_lossy().to_string(),
        }
    }

    async fn describe(&self, path: &Path) -> Result<RemoteFile> {
        let meta = tokio::fs::metadata(path).await?;
        let created = meta.created().or_else(|_| meta.modified()).ok().map(DateTime::<Utc>::from);
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        let id = self.id_for(path);
        let parents = match path.parent() {
            Some(parent) if path != self.root => vec![self.id_for(parent)],
            _ => Vec::new(),
        };
        let name = if id == ROOT_ID {
            "My Drive".to_string()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };

        Ok(RemoteFile {
            id,
            name,
            mime_type: if meta.is_dir() {
                FOLDER_MIME_TYPE.to_string()
            } else {
                guess_mime(&path.to_string_lossy()).to_string()
            },
            created_time: created,
            modified_time: modified,
            parents,
            size: if meta.is_dir() { None } else { Some(meta.len()) },
        })
    }

    /// Resolve a folder reference (path or `folder:` ID) to a directory
    async fn folder_dir(&self, folder: &str, create_if_missing: bool) -> Result<Option<PathBuf>> {
        if let Some(id) = folder.strip_prefix(FOLDER_ID_PREFIX) {
            let dir = self.resolve_id(id)?;
            return Ok(dir.is_dir().then_some(dir));
        }
        Ok(self
            .get_folder(folder, create_if_missing)
            .await?
            .map(|f| self.root.join(if f.id == ROOT_ID { "" } else { f.id.as_str() })))
    }
}

/// Pick a name in `dir` that does not collide with an existing entry
fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn authenticate(&self) -> Result<bool> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(self.root.is_dir())
    }

    async fn list_files(&self, folder_path: &str, extensions: &[&str]) -> Result<Vec<RemoteFile>> {
        let dir = match self.folder_dir(folder_path, false).await? {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if matches_extension(&name, extensions) {
                files.push(self.describe(&path).await?);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, file_id: &str, destination: &Path) -> Result<PathBuf> {
        let source = self.resolve_id(file_id)?;
        if !source.is_file() {
            return Err(OrganizerError::NotFound(format!("File not found: {}", file_id)));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, destination).await?;
        Ok(destination.to_path_buf())
    }

    async fn upload_file(
        &self,
        source: &Path,
        destination_folder: &str,
        new_name: Option<&str>,
    ) -> Result<RemoteFile> {
        let dir = self
            .folder_dir(destination_folder, true)
            .await?
            .ok_or_else(|| {
                OrganizerError::NotFound(format!("Destination folder not found: {}", destination_folder))
            })?;

        let name = match new_name {
            Some(n) => n.to_string(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| OrganizerError::Validation(format!("No file name in {:?}", source)))?,
        };

        let target = unique_target(&dir, &name);
        tokio::fs::copy(source, &target).await?;
        debug!("Stored {:?} as {:?}", source, target);
        self.describe(&target).await
    }

    async fn create_folder(&self, folder_name: &str, parent: Option<&str>) -> Result<RemoteFile> {
        let parent_dir = match parent {
            Some(p) => self.folder_dir(p, true).await?.ok_or_else(|| {
                OrganizerError::NotFound(format!("Parent folder not found: {}", p))
            })?,
            None => self.root.clone(),
        };
        let dir = parent_dir.join(folder_name);
        tokio::fs::create_dir_all(&dir).await?;
        self.describe(&dir).await
    }

    async fn get_folder(&self, folder_path: &str, create_if_missing: bool) -> Result<Option<RemoteFile>> {
        if is_root_path(folder_path) {
            tokio::fs::create_dir_all(&self.root).await?;
            return self.describe(&self.root).await.map(Some);
        }

        let mut current = self.root.clone();
        for part in path_components(folder_path) {
            if matches!(part, "." | "..") {
                return Err(OrganizerError::Validation(format!("Invalid folder path: {}", folder_path)));
            }
            current = current.join(part);
            if !current.is_dir() {
                if create_if_missing {
                    tokio::fs::create_dir_all(&current).await?;
                } else {
                    debug!("Folder not found: {}", folder_path);
                    return Ok(None);
                }
            }
        }

        self.describe(&current).await.map(Some)
    }

    async fn download_stream(&self, file_id: &str) -> Result<ByteStream> {
        let path = self.resolve_id(file_id)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrganizerError::NotFound(format!("File not found: {}", file_id)),
            _ => e.into(),
        })?;

        let chunks = stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<_, OrganizerError>(buf), Some(file)))
                }
                Err(e) => Some((Err(OrganizerError::from(e)), None)),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let path = self.resolve_id(file_id)?;
        if path == self.root {
            return Err(OrganizerError::Validation("Refusing to delete the root folder".to_string()));
        }
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrganizerError::NotFound(format!("File not found: {}", file_id)),
            _ => e.into(),
        })
    }
}
