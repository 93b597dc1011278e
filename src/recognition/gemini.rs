// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Google Gemini vision recognizer

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{encode_image, parse_labels, with_retry, ImageRecognizer, LabelPolicy, Recognition};
use crate::config::GeminiConfig;
use crate::{AppConfig, OrganizerError, Result};

/// Recognizer backed by the Gemini `generateContent` API
pub struct GeminiRecognizer {
    client: Client,
    config: GeminiConfig,
    policy: LabelPolicy,
    retries: u32,
    concurrency: usize,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Image { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Deserialize)]
struct TextPart {
    text: Option<String>,
}

impl GeminiRecognizer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let gemini = &config.recognition.gemini;
        if gemini.api_key.trim().is_empty() {
            return Err(OrganizerError::Config(
                "Gemini API key is not set (GEMINI_API_KEY)".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.recognition.timeout_secs))
            .build()?;

        info!("Gemini recognizer using model {}", gemini.model);
        Ok(Self {
            client,
            config: gemini.clone(),
            policy: LabelPolicy::from_config(config),
            retries: config.recognition.retries,
            concurrency: config.recognition.concurrency,
        })
    }

    /// Send one image and return the model's text answer
    async fn generate(&self, image_base64: &str, mime_type: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text { text: &self.config.prompt },
                    Part::Image { inline_data: InlineData { mime_type, data: image_base64 } },
                ],
            }],
        };

        debug!("Sending vision request to Gemini: model={}", self.config.model);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrganizerError::Recognition(format!(
                "Gemini returned status {}: {}",
                status, body
            )));
        }

        let result: GenerateResponse = response.json().await?;
        let text: String = result
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(OrganizerError::Recognition("Gemini returned no text".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl ImageRecognizer for GeminiRecognizer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn analyze_image(&self, path: &Path) -> Result<Recognition> {
        let (image_base64, mime_type) = encode_image(path)?;
        let text = with_retry("Gemini request", self.retries, || {
            self.generate(&image_base64, mime_type)
        })
        .await?;

        let recognition = self.policy.recognition(parse_labels(&text));
        debug!("{:?} -> {} {:?}", path, recognition.category, recognition.labels);
        Ok(recognition)
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn supported_categories(&self) -> Vec<String> {
        self.policy.categories.names()
    }
}
