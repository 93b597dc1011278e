// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for Drive Organizer

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Image recognition settings
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Cloud storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Folder layout and batching rules
    #[serde(default)]
    pub organization: OrganizationConfig,

    /// Ordered category rules; the first matching category wins
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryRule>,

    /// API server settings
    #[serde(default)]
    pub web: WebConfig,

    /// Tag store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Organize journal settings
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecognitionConfig {
    /// `gemini`, `ollama` or `aws`
    #[serde(default = "default_recognition_provider")]
    pub provider: String,
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
    /// Maximum number of images analyzed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub aws: AwsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_url")]
    pub base_url: String,
    #[serde(default = "default_label_prompt")]
    pub prompt: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_label_prompt")]
    pub prompt: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AwsConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// `google_drive` or `local`
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    #[serde(default)]
    pub google_drive: GoogleDriveConfig,
    #[serde(default)]
    pub local: LocalStorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_drive_api")]
    pub api_base: String,
    #[serde(default = "default_upload_api")]
    pub upload_base: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_root")]
    pub root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrganizationConfig {
    #[serde(default = "default_true")]
    pub include_year: bool,
    #[serde(default)]
    pub include_month: bool,
    #[serde(default)]
    pub use_original_filenames: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Skip images whose content hash is already in the tag store
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,
}

/// A category and the labels that select it
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CategoryRule {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: String,
}

// Default value functions
fn default_recognition_provider() -> String { "gemini".to_string() }
fn default_storage_provider() -> String { "google_drive".to_string() }
fn default_max_labels() -> usize { 20 }
fn default_concurrency() -> usize { 4 }
fn default_timeout() -> u64 { 120 }
fn default_retries() -> u32 { 2 }
fn default_gemini_model() -> String { "gemini-2.0-flash".to_string() }
fn default_gemini_url() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_ollama_model() -> String { "moondream".to_string() }
fn default_redirect_uri() -> String { "http://localhost:8080".to_string() }
fn default_token_path() -> String { "token.json".to_string() }
fn default_credentials_path() -> String { "credentials.json".to_string() }
fn default_drive_api() -> String { "https://www.googleapis.com/drive/v3".to_string() }
fn default_upload_api() -> String { "https://www.googleapis.com/upload/drive/v3".to_string() }
fn default_local_root() -> String { "./drive".to_string() }
fn default_true() -> bool { true }
fn default_batch_size() -> usize { 10 }
fn default_web_host() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8000 }
fn default_api_prefix() -> String { "/api".to_string() }
fn default_db_path() -> String { "drive-organizer.db".to_string() }
fn default_history_path() -> String { "drive-organizer-history.jsonl".to_string() }

fn default_temp_dir() -> String {
    std::env::temp_dir()
        .join("drive-organizer")
        .to_string_lossy()
        .to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:8000".to_string(),
    ]
}

fn default_label_prompt() -> String {
    "List the objects, scenes and subjects visible in this image as a JSON array \
     of short lowercase labels, most prominent first. Return ONLY the JSON array."
        .to_string()
}

fn rule(name: &str, keywords: &[&str]) -> CategoryRule {
    CategoryRule {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

/// Category rules used when the config names none
pub fn default_categories() -> Vec<CategoryRule> {
    vec![
        rule("Landscapes", &["mountain", "ocean", "sunset", "beach", "forest", "river", "waterfall", "lake"]),
        rule("People", &["person", "face", "group", "crowd", "portrait", "selfie", "family"]),
        rule("Food", &["meal", "dish", "restaurant", "cooking", "dinner", "lunch", "breakfast", "food"]),
        rule("Animals", &["dog", "cat", "bird", "pet", "wildlife", "zoo", "farm", "animal"]),
        rule("Buildings", &["building", "architecture", "house", "skyscraper", "monument", "church", "temple"]),
        rule("Transportation", &["car", "vehicle", "bicycle", "motorcycle", "bus", "train", "airplane", "boat"]),
        rule("Events", &["wedding", "party", "concert", "festival", "ceremony", "celebration", "conference"]),
        rule("Documents", &["document", "text", "paper", "receipt", "certificate", "letter", "contract"]),
        rule("Screenshots", &["screenshot", "screen", "display", "monitor", "computer", "interface", "app"]),
        rule(FALLBACK_CATEGORY, &[]),
    ]
}

/// Category assigned when no rule matches
pub const FALLBACK_CATEGORY: &str = "Other";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recognition: RecognitionConfig::default(),
            storage: StorageConfig::default(),
            organization: OrganizationConfig::default(),
            categories: default_categories(),
            web: WebConfig::default(),
            database: DatabaseConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: default_recognition_provider(),
            max_labels: default_max_labels(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout(),
            retries: default_retries(),
            gemini: GeminiConfig::default(),
            ollama: OllamaConfig::default(),
            aws: AwsConfig::default(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            base_url: default_gemini_url(),
            prompt: default_label_prompt(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_ollama_model(),
            prompt: default_label_prompt(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            google_drive: GoogleDriveConfig::default(),
            local: LocalStorageConfig::default(),
        }
    }
}

impl Default for GoogleDriveConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            token_path: default_token_path(),
            credentials_path: default_credentials_path(),
            api_base: default_drive_api(),
            upload_base: default_upload_api(),
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self { root: default_local_root() }
    }
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            include_year: true,
            include_month: false,
            use_original_filenames: false,
            batch_size: default_batch_size(),
            temp_dir: default_temp_dir(),
            skip_duplicates: true,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            api_prefix: default_api_prefix(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { path: default_history_path() }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::OrganizerError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let drive = &mut self.storage.google_drive;
        if let Some(v) = lookup("GOOGLE_CLIENT_ID") { drive.client_id = v; }
        if let Some(v) = lookup("GOOGLE_CLIENT_SECRET") { drive.client_secret = v; }
        if let Some(v) = lookup("GOOGLE_REDIRECT_URI") { drive.redirect_uri = v; }
        if let Some(v) = lookup("GOOGLE_TOKEN_PATH") { drive.token_path = v; }
        if let Some(v) = lookup("GOOGLE_CREDENTIALS_PATH") { drive.credentials_path = v; }

        if let Some(v) = lookup("GEMINI_API_KEY") { self.recognition.gemini.api_key = v; }
        if let Some(v) = lookup("GEMINI_MODEL") { self.recognition.gemini.model = v; }

        let aws = &mut self.recognition.aws;
        if let Some(v) = lookup("AWS_REGION") { aws.region = Some(v); }
        if let Some(v) = lookup("AWS_ACCESS_KEY_ID") { aws.access_key_id = Some(v); }
        if let Some(v) = lookup("AWS_SECRET_ACCESS_KEY") { aws.secret_access_key = Some(v); }

        if let Some(v) = lookup("TEMP_DIR") { self.organization.temp_dir = v; }
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        use crate::OrganizerError::Validation;

        if self.organization.batch_size == 0 {
            return Err(Validation("organization.batch_size must be at least 1".to_string()));
        }
        if self.recognition.concurrency == 0 {
            return Err(Validation("recognition.concurrency must be at least 1".to_string()));
        }

        let prefix = self.web.api_prefix.trim_end_matches('/');
        if !prefix.starts_with('/') {
            return Err(Validation(format!(
                "web.api_prefix must start with '/' and name a path, got {:?}",
                self.web.api_prefix
            )));
        }

        let mut seen = HashSet::new();
        for rule in &self.categories {
            if rule.name.trim().is_empty() {
                return Err(Validation("category names must not be empty".to_string()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(Validation(format!("duplicate category '{}'", rule.name)));
            }
        }
        if !seen.contains(FALLBACK_CATEGORY) {
            return Err(Validation(format!(
                "categories must include the fallback '{}'",
                FALLBACK_CATEGORY
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.recognition.provider, "gemini");
        assert_eq!(config.organization.batch_size, 10);
        assert!(config.organization.include_year);
        assert!(!config.organization.include_month);
        assert_eq!(config.categories.last().unwrap().name, "Other");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.web.api_prefix, "/api");
    }

    #[test]
    fn test_save_and_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"organization": {"include_month": true, "batch_size": 3}}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert!(config.organization.include_month);
        assert!(config.organization.include_year);
        assert_eq!(config.organization.batch_size, 3);
        assert_eq!(config.categories.len(), 10);

        config.save(&path).unwrap();
        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.organization.batch_size, 3);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(crate::OrganizerError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GOOGLE_CLIENT_ID", "cid"),
            ("GEMINI_API_KEY", "key"),
            ("AWS_REGION", "eu-west-1"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.google_drive.client_id, "cid");
        assert_eq!(config.recognition.gemini.api_key, "key");
        assert_eq!(config.recognition.aws.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.storage.google_drive.token_path, "token.json");
    }

    #[test]
    fn test_validate_rejects_bad_categories() {
        let mut config = AppConfig::default();
        config.categories.pop();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.categories.push(rule("People", &[]));
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.organization.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.web.api_prefix = "/".to_string();
        assert!(config.validate().is_err());
    }
}
