// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Google Drive storage provider (Drive v3 REST API)

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::oauth::{OAuthClient, StoredToken};
use super::{
    guess_mime, is_root_path, path_components, ByteStream, RemoteFile, StorageProvider,
    FOLDER_ID_PREFIX, FOLDER_MIME_TYPE,
};
use crate::config::GoogleDriveConfig;
use crate::{OrganizerError, Result};

const FILE_FIELDS: &str = "id,name,mimeType,createdTime,modifiedTime,parents,size";
const LIST_FIELDS: &str =
    "nextPageToken, files(id, name, mimeType, createdTime, modifiedTime, parents, size)";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps";
const UPLOAD_BOUNDARY: &str = "drive_organizer_upload_boundary";

/// Storage provider for Google Drive
pub struct GoogleDriveProvider {
    http: Client,
    config: GoogleDriveConfig,
    token: RwLock<Option<StoredToken>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl GoogleDriveProvider {
    /// Create a provider; authentication happens in [`StorageProvider::authenticate`]
    pub fn new(config: &GoogleDriveConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
            token: RwLock::new(None),
        })
    }

    /// Create a provider with an already issued access token
    pub fn with_access_token(config: &GoogleDriveConfig, access_token: &str) -> Result<Self> {
        let provider = Self::new(config)?;
        provider.token.try_write().map(|mut slot| {
            *slot = Some(StoredToken {
                access_token: access_token.to_string(),
                refresh_token: None,
                expires_at: None,
                scopes: Vec::new(),
            })
        }).map_err(|_| OrganizerError::Config("Token lock unavailable".to_string()))?;
        Ok(provider)
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Current bearer token, refreshed when expired
    async fn bearer(&self) -> Result<String> {
        let current = self.token.read().await.clone();
        match current {
            Some(token) if !token.is_expired() => Ok(token.access_token),
            Some(token) => {
                debug!("Access token expired, refreshing");
                let oauth = OAuthClient::from_config(self.http.clone(), &self.config)?;
                let fresh = oauth.refresh(&token).await?;
                oauth.save_token(&fresh)?;
                let access = fresh.access_token.clone();
                *self.token.write().await = Some(fresh);
                Ok(access)
            }
            None => Err(OrganizerError::Authentication(
                "Not authenticated. Call authenticate() first.".to_string(),
            )),
        }
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.bearer().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Map non-success responses onto error variants
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED => OrganizerError::Authentication(body),
            StatusCode::FORBIDDEN => OrganizerError::Forbidden(body),
            StatusCode::NOT_FOUND => OrganizerError::NotFound(body),
            _ => OrganizerError::GoogleApi(format!("Drive returned {}: {}", status, body)),
        })
    }

    async fn get_file(&self, file_id: &str, fields: &str) -> Result<RemoteFile> {
        let url = self.api(&format!("/files/{}", file_id));
        let response = self
            .request(Method::GET, &url)
            .await?
            .query(&[("fields", fields)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Run a `files.list` query, following page tokens
    async fn query_files(&self, query: &str, page_size: u32, all_pages: bool) -> Result<Vec<RemoteFile>> {
        let url = self.api("/files");
        let page_size = page_size.to_string();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.to_string()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", page_size.clone()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let response = self.request(Method::GET, &url).await?.query(&params).send().await?;
            let page: FileList = Self::check(response).await?.json().await?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if all_pages => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    /// Resolve a folder reference to an ID
    async fn folder_id(&self, folder: &str, create_if_missing: bool) -> Result<Option<String>> {
        if let Some(id) = folder.strip_prefix(FOLDER_ID_PREFIX) {
            return Ok(Some(id.to_string()));
        }
        Ok(self.get_folder(folder, create_if_missing).await?.map(|f| f.id))
    }
}

/// Escape a value for use inside a single-quoted Drive query string
pub fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build the `files.list` query for a folder's contents
pub fn list_query(folder_id: &str, extensions: &[&str]) -> String {
    let mut query = format!("'{}' in parents and trashed = false", escape_query_value(folder_id));

    let conditions: Vec<String> = extensions
        .iter()
        .map(|ext| {
            let ext = if ext.starts_with('.') { ext.to_string() } else { format!(".{}", ext) };
            format!("name contains '{}'", escape_query_value(&ext))
        })
        .collect();

    if !conditions.is_empty() {
        query.push_str(&format!(" and ({})", conditions.join(" or ")));
    }
    query
}

fn folder_query(name: &str, parent_id: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
        escape_query_value(name),
        escape_query_value(parent_id),
        FOLDER_MIME_TYPE
    )
}

/// Export format for Google-native documents, or `None` for binary files
pub fn export_mime_type(mime_type: &str) -> Option<&'static str> {
    if !mime_type.starts_with(GOOGLE_APPS_PREFIX) || mime_type == FOLDER_MIME_TYPE {
        return None;
    }
    Some(match mime_type {
        "application/vnd.google-apps.spreadsheet" => {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        }
        "application/vnd.google-apps.presentation" => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        "application/vnd.google-apps.drawing" => "image/png",
        _ => "application/pdf",
    })
}

/// Assemble a `multipart/related` upload body
fn multipart_related(metadata: &serde_json::Value, mime_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", UPLOAD_BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn name(&self) -> &'static str {
        "google_drive"
    }

    async fn authenticate(&self) -> Result<bool> {
        if let Some(token) = self.token.read().await.as_ref() {
            if !token.is_expired() {
                return Ok(true);
            }
        }

        let oauth = match OAuthClient::from_config(self.http.clone(), &self.config) {
            Ok(client) => client,
            Err(e) => {
                error!("{}", e);
                return Ok(false);
            }
        };

        match oauth.obtain_token().await {
            Ok(token) => {
                *self.token.write().await = Some(token);
                info!("Authenticated with Google Drive");
                Ok(true)
            }
            Err(OrganizerError::Authentication(msg)) => {
                error!("Google authentication failed: {}", msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self, folder_path: &str, extensions: &[&str]) -> Result<Vec<RemoteFile>> {
        let folder_id = match self.folder_id(folder_path, false).await? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };

        let files = self.query_files(&list_query(&folder_id, extensions), 1000, true).await?;
        // `name contains` also matches the extension mid-name
        Ok(files
            .into_iter()
            .filter(|f| !f.is_folder() && super::matches_extension(&f.name, extensions))
            .collect())
    }

    async fn download_file(&self, file_id: &str, destination: &Path) -> Result<PathBuf> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let meta = self.get_file(file_id, "name,mimeType").await?;
        let request = match export_mime_type(&meta.mime_type) {
            Some(export) => self
                .request(Method::GET, &self.api(&format!("/files/{}/export", file_id)))
                .await?
                .query(&[("mimeType", export)]),
            None => self
                .request(Method::GET, &self.api(&format!("/files/{}", file_id)))
                .await?
                .query(&[("alt", "media")]),
        };

        let response = Self::check(request.send().await?).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(destination.to_path_buf())
    }

    async fn upload_file(
        &self,
        source: &Path,
        destination_folder: &str,
        new_name: Option<&str>,
    ) -> Result<RemoteFile> {
        let folder_id = self
            .folder_id(destination_folder, true)
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

        let content = tokio::fs::read(source).await?;
        let metadata = serde_json::json!({ "name": name, "parents": [folder_id] });
        let body = multipart_related(&metadata, guess_mime(&name), &content);

        let url = format!("{}/files", self.config.upload_base.trim_end_matches('/'));
        let response = self
            .request(Method::POST, &url)
            .await?
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", UPLOAD_BOUNDARY),
            )
            .body(body)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_folder(&self, folder_name: &str, parent: Option<&str>) -> Result<RemoteFile> {
        let parent_id = match parent {
            Some(p) => self.folder_id(p, true).await?,
            None => None,
        };

        let mut metadata = serde_json::json!({
            "name": folder_name,
            "mimeType": FOLDER_MIME_TYPE,
        });
        if let Some(id) = parent_id {
            metadata["parents"] = serde_json::json!([id]);
        }

        let response = self
            .request(Method::POST, &self.api("/files"))
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await?;

        let folder: RemoteFile = Self::check(response).await?.json().await?;
        debug!("Created folder '{}' ({})", folder.name, folder.id);
        Ok(folder)
    }

    async fn get_folder(&self, folder_path: &str, create_if_missing: bool) -> Result<Option<RemoteFile>> {
        if is_root_path(folder_path) {
            return self.get_file("root", FILE_FIELDS).await.map(Some);
        }

        let mut current_id = "root".to_string();
        let mut walked: Vec<&str> = Vec::new();

        for part in path_components(folder_path) {
            walked.push(part);
            let found = self.query_files(&folder_query(part, &current_id), 1, false).await?;

            current_id = match found.into_iter().next() {
                Some(folder) => folder.id,
                None if create_if_missing => {
                    let parent_ref = format!("{}{}", FOLDER_ID_PREFIX, current_id);
                    self.create_folder(part, Some(&parent_ref)).await?.id
                }
                None => {
                    warn!("Folder not found: {}", walked.join("/"));
                    return Ok(None);
                }
            };
        }

        self.get_file(&current_id, FILE_FIELDS).await.map(Some)
    }

    async fn download_stream(&self, file_id: &str) -> Result<ByteStream> {
        let meta = self.get_file(file_id, "name,mimeType").await?;
        if export_mime_type(&meta.mime_type).is_some() {
            return Err(OrganizerError::Validation(
                "Streaming download not supported for Google Docs formats".to_string(),
            ));
        }

        let response = self
            .request(Method::GET, &self.api(&format!("/files/{}", file_id)))
            .await?
            .query(&[("alt", "media")])
            .send()
            .await?;
        let response = Self::check(response).await?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(OrganizerError::from));
        Ok(Box::pin(chunks))
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &self.api(&format!("/files/{}", file_id)))
            .await?
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
