// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Image recognition providers
//!
//! A recognizer turns an image into a list of labels and a category. Labels
//! come from a vision service; the category comes from matching those labels
//! against the configured [`CategoryRule`]s.

pub mod gemini;
pub mod ollama;
#[cfg(feature = "aws")]
pub mod rekognition;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use crate::config::{CategoryRule, FALLBACK_CATEGORY};
use crate::storage::guess_mime;
use crate::{AppConfig, OrganizerError, Result};

/// Longest side, in pixels, of an image sent for recognition
pub const MAX_IMAGE_DIMENSION: u32 = 1024;

/// Outcome of analyzing one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub category: String,
    pub labels: Vec<String>,
}

/// Ordered category rules
#[derive(Debug, Clone)]
pub struct CategoryMap {
    rules: Vec<(String, HashSet<String>)>,
}

impl CategoryMap {
    pub fn new(rules: &[CategoryRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| {
                    let keywords = r.keywords.iter().map(|k| k.trim().to_lowercase()).collect();
                    (r.name.clone(), keywords)
                })
                .collect(),
        }
    }

    /// First category, in configured order, with a keyword equal to any label
    pub fn categorize(&self, labels: &[String]) -> String {
        self.rules
            .iter()
            .find(|(_, keywords)| labels.iter().any(|l| keywords.contains(&l.to_lowercase())))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
    }

    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Label normalization and categorization shared by every provider
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    pub categories: CategoryMap,
    pub max_labels: usize,
}

impl LabelPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            categories: CategoryMap::new(&config.categories),
            max_labels: config.recognition.max_labels,
        }
    }

    pub fn recognition(&self, raw_labels: Vec<String>) -> Recognition {
        let labels = normalize_labels(raw_labels, self.max_labels);
        let category = self.categories.categorize(&labels);
        Recognition { category, labels }
    }
}

/// Trait for image recognition backends
#[async_trait]
pub trait ImageRecognizer: Send + Sync {
    /// Name of this provider
    fn name(&self) -> &'static str;

    /// Analyze a single local image
    async fn analyze_image(&self, path: &Path) -> Result<Recognition>;

    /// Maximum number of images analyzed at once by [`analyze_batch`](Self::analyze_batch)
    fn concurrency(&self) -> usize {
        4
    }

    /// Analyze several images; results keep the input order
    async fn analyze_batch(&self, paths: &[PathBuf]) -> Vec<Result<Recognition>> {
        let pending: Vec<_> = paths.iter().map(|path| self.analyze_image(path)).collect();
        stream::iter(pending)
            .buffered(self.concurrency().max(1))
            .collect()
            .await
    }

    /// Category names this recognizer can assign
    fn supported_categories(&self) -> Vec<String>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Lowercase, trim, dedupe and cap a label list, keeping first-seen order
pub fn normalize_labels<I, S>(labels: I, max_labels: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .map(|l| l.as_ref().trim().to_lowercase())
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .take(max_labels)
        .collect()
}

/// Extract labels from a model's free-text answer
///
/// Accepts a JSON array (optionally inside a code fence or surrounded by
/// prose) or a comma/newline separated list.
pub fn parse_labels(text: &str) -> Vec<String> {
    let trimmed = text.trim();

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(labels) = serde_json::from_str::<Vec<String>>(&trimmed[start..=end]) {
                return labels;
            }
        }
    }

    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .flat_map(|line| line.split(','))
        .map(|item| {
            item.trim()
                .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
                .trim()
                .trim_matches(|c: char| c == '"' || c == '\'' || c == '[' || c == ']')
                .to_string()
        })
        .filter(|item| !item.is_empty())
        .collect()
}

/// Resize large images for faster processing
pub fn prepare_image(path: &Path) -> Result<Vec<u8>> {
    let img = image::open(path)?;

    let img = if img.width() > MAX_IMAGE_DIMENSION || img.height() > MAX_IMAGE_DIMENSION {
        img.resize(MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    // JPEG has no alpha channel
    let img = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buffer = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;

    Ok(buffer)
}

/// Image bytes ready for upload with their MIME type
pub fn load_image(path: &Path) -> Result<(Vec<u8>, &'static str)> {
    match prepare_image(path) {
        Ok(data) => Ok((data, "image/jpeg")),
        Err(e) => {
            debug!("Sending {:?} unmodified: {}", path, e);
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            Ok((std::fs::read(path)?, guess_mime(&name)))
        }
    }
}

/// Base64 image payload for vision model APIs
pub fn encode_image(path: &Path) -> Result<(String, &'static str)> {
    let (data, mime) = load_image(path)?;
    Ok((general_purpose::STANDARD.encode(&data), mime))
}

/// Run an operation, retrying up to `retries` times with jittered exponential backoff
pub async fn with_retry<T, F, Fut>(what: &str, retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // 1s, 2s, 4s, ... before jitter
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(500)
        .map(jitter)
        .take(retries as usize);

    let mut attempt = 0u32;
    Retry::spawn(strategy, || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if current <= retries {
                    warn!("{} failed: {} (attempt {} of {})", what, e, current, retries + 1);
                }
                e
            })
        }
    })
    .await
}

/// Create the configured recognizer
pub async fn get_recognizer(config: &AppConfig) -> Result<Arc<dyn ImageRecognizer>> {
    let provider = config.recognition.provider.to_lowercase();
    info!("Creating {} recognizer", provider);

    match provider.as_str() {
        "gemini" => Ok(Arc::new(gemini::GeminiRecognizer::new(config)?)),
        "ollama" => Ok(Arc::new(ollama::OllamaRecognizer::new(config)?)),
        #[cfg(feature = "aws")]
        "aws" => Ok(Arc::new(rekognition::RekognitionRecognizer::new(config).await?)),
        #[cfg(not(feature = "aws"))]
        "aws" => Err(OrganizerError::UnsupportedProvider(
            "recognition provider 'aws' requires the `aws` feature".to_string(),
        )),
        other => Err(OrganizerError::UnsupportedProvider(format!(
            "recognition provider '{}'. Supported providers are: 'gemini', 'ollama', 'aws'",
            other
        ))),
    }
}
