// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Cloud storage providers
//!
//! A provider exposes a drive as folders addressed by `/`-separated paths
//! starting at the drive root. A reference prefixed with `folder:` is a raw
//! folder ID and skips path resolution.

pub mod google_drive;
pub mod local;
pub mod oauth;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::{OrganizerError, Result};

/// MIME type Drive uses for folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Prefix marking a folder reference as an ID rather than a path
pub const FOLDER_ID_PREFIX: &str = "folder:";

/// Chunked file content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Metadata of a file or folder in remote storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default, with = "size_string")]
    pub size: Option<u64>,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Lowercased extension including the leading dot, or empty
    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default()
    }
}

// Drive encodes `size` as a decimal string
mod size_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Option::<Raw>::deserialize(d)? {
            Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
            Some(Raw::Num(n)) => Ok(Some(n)),
            None => Ok(None),
        }
    }
}

/// Trait for cloud storage backends
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Name of this provider
    fn name(&self) -> &'static str;

    /// Authenticate with the backend; `Ok(false)` when credentials are unusable
    async fn authenticate(&self) -> Result<bool>;

    /// List files directly inside a folder, optionally filtered by extension
    ///
    /// A folder that does not exist yields an empty list.
    async fn list_files(&self, folder_path: &str, extensions: &[&str]) -> Result<Vec<RemoteFile>>;

    /// Download a file to a local destination
    async fn download_file(&self, file_id: &str, destination: &Path) -> Result<PathBuf>;

    /// Upload a local file into a folder, creating the folder if missing
    async fn upload_file(
        &self,
        source: &Path,
        destination_folder: &str,
        new_name: Option<&str>,
    ) -> Result<RemoteFile>;

    /// Create a folder, under `parent` when given or under the root otherwise
    async fn create_folder(&self, folder_name: &str, parent: Option<&str>) -> Result<RemoteFile>;

    /// Resolve a folder path, optionally creating missing components
    async fn get_folder(&self, folder_path: &str, create_if_missing: bool) -> Result<Option<RemoteFile>>;

    /// Stream a file's content in chunks
    async fn download_stream(&self, file_id: &str) -> Result<ByteStream>;

    /// Delete a file
    async fn delete_file(&self, file_id: &str) -> Result<()>;

    /// Release any held resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Whether a filename ends with one of the given extensions
///
/// Extensions may be given with or without the leading dot.
pub fn matches_extension(name: &str, extensions: &[&str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let lower = name.to_lowercase();
    extensions.iter().any(|ext| {
        let ext = ext.trim_start_matches('.').to_lowercase();
        lower.ends_with(&format!(".{}", ext))
    })
}

/// MIME type for a file name, by extension
pub fn guess_mime(name: &str) -> &'static str {
    mime_guess::from_path(name).first_raw().unwrap_or("application/octet-stream")
}

/// Split a folder path into its non-empty components
pub fn path_components(folder_path: &str) -> Vec<&str> {
    folder_path
        .split('/')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Whether a path names the drive root
pub fn is_root_path(folder_path: &str) -> bool {
    let trimmed = folder_path.trim().trim_matches('/');
    trimmed.is_empty() || trimmed == "root" || trimmed == "My Drive"
}

/// Create the configured storage provider
pub fn get_storage_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    match config.provider.to_lowercase().as_str() {
        "google_drive" => {
            info!("Creating Google Drive storage provider");
            Ok(Arc::new(google_drive::GoogleDriveProvider::new(&config.google_drive)?))
        }
        "local" => {
            info!("Creating local storage provider at {}", config.local.root);
            Ok(Arc::new(local::LocalProvider::new(&config.local.root)))
        }
        other => Err(OrganizerError::UnsupportedProvider(format!(
            "storage provider '{}'. Supported providers are: 'google_drive', 'local'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("IMG_001.JPG"), "image/jpeg");
        assert_eq!(guess_mime("Sorted/cat.png"), "image/png");
        assert_eq!(guess_mime("sticker.webp"), "image/webp");
        assert_eq!(guess_mime("no_extension"), "application/octet-stream");
    }

    #[test]
    fn test_matches_extension() {
        assert!(matches_extension("IMG_001.JPG", &["jpg"]));
        assert!(matches_extension("photo.png", &[".png", "gif"]));
        assert!(!matches_extension("notes.txt", &["jpg", "png"]));
        assert!(!matches_extension("jpg", &["jpg"]));
        assert!(matches_extension("anything", &[]));
    }

    #[test]
    fn test_path_components() {
        assert_eq!(path_components("Photos/2024/ Trip /"), vec!["Photos", "2024", "Trip"]);
        assert!(path_components("/").is_empty());
    }

    #[test]
    fn test_root_paths() {
        assert!(is_root_path("root"));
        assert!(is_root_path("My Drive"));
        assert!(is_root_path("/"));
        assert!(!is_root_path("Photos"));
    }

    #[test]
    fn test_remote_file_from_drive_json() {
        let json = serde_json::json!({
            "id": "abc",
            "name": "Beach.JPEG",
            "mimeType": "image/jpeg",
            "createdTime": "2023-07-14T10:00:00.000Z",
            "parents": ["p1"],
            "size": "2048"
        });
        let file: RemoteFile = serde_json::from_value(json).unwrap();
        assert_eq!(file.size, Some(2048));
        assert_eq!(file.extension(), ".jpeg");
        assert!(!file.is_folder());
        assert_eq!(file.created_time.unwrap().format("%Y").to_string(), "2023");
    }

    #[test]
    fn test_unknown_provider() {
        let config = StorageConfig {
            provider: "dropbox".to_string(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            get_storage_provider(&config),
            Err(OrganizerError::UnsupportedProvider(_))
        ));
    }
}
