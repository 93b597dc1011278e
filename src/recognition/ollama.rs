// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ollama API client for local vision inference

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{encode_image, parse_labels, with_retry, ImageRecognizer, LabelPolicy, Recognition};
use crate::{AppConfig, OrganizerError, Result};

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    images: Vec<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        // Accept endpoint URLs as well as the bare server URL
        let base_url = base_url
            .trim_end_matches('/')
            .replace("/api/generate", "")
            .replace("/api/chat", "");

        Ok(Self { client, base_url })
    }

    /// Check if Ollama is reachable
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        self.client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                OrganizerError::Recognition(format!(
                    "Cannot connect to Ollama at {}: {}",
                    self.base_url, e
                ))
            })?;
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let tags: TagsResponse = self.client.get(&url).send().await?.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn model_available(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models
            .iter()
            .any(|m| m.starts_with(model) || m == &format!("{}:latest", model)))
    }

    /// Generate with image (for vision models)
    pub async fn generate_with_image(&self, model: &str, prompt: &str, image_base64: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            images: vec![image_base64],
        };

        debug!("Sending vision request to Ollama: model={}", model);

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(OrganizerError::Recognition(format!(
                "Ollama returned status {}",
                response.status()
            )));
        }

        let result: GenerateResponse = response.json().await?;
        Ok(result.response)
    }
}

/// Recognizer backed by a local Ollama vision model
pub struct OllamaRecognizer {
    client: OllamaClient,
    model: String,
    prompt: String,
    policy: LabelPolicy,
    retries: u32,
    concurrency: usize,
}

impl OllamaRecognizer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let ollama = &config.recognition.ollama;
        Ok(Self {
            client: OllamaClient::new(&ollama.url, Duration::from_secs(config.recognition.timeout_secs))?,
            model: ollama.model.clone(),
            prompt: ollama.prompt.clone(),
            policy: LabelPolicy::from_config(config),
            retries: config.recognition.retries,
            concurrency: config.recognition.concurrency,
        })
    }

    pub fn client(&self) -> &OllamaClient {
        &self.client
    }
}

#[async_trait]
impl ImageRecognizer for OllamaRecognizer {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn analyze_image(&self, path: &Path) -> Result<Recognition> {
        let (image_base64, _) = encode_image(path)?;
        let text = with_retry("Ollama request", self.retries, || {
            self.client.generate_with_image(&self.model, &self.prompt, &image_base64)
        })
        .await?;

        Ok(self.policy.recognition(parse_labels(&text)))
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn supported_categories(&self) -> Vec<String> {
        self.policy.categories.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::tests::write_png;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_url_normalization() {
        let client = OllamaClient::new("http://localhost:11434/api/generate/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_model_available() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(json!({
                "models": [{"name": "moondream:latest"}, {"name": "llava:7b"}]
            }));
        });

        let client = OllamaClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        client.health_check().await.unwrap();
        assert!(client.model_available("moondream").await.unwrap());
        assert!(!client.model_available("bakllava").await.unwrap());
    }

    #[tokio::test]
    async fn test_analyze_image() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"model": "moondream", "stream": false}"#);
            then.status(200).json_body(json!({ "response": "car, road, Car" }));
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("street.png");
        write_png(&path, 16, 16);

        let mut config = AppConfig::default();
        config.recognition.ollama.url = server.base_url();
        let recognizer = OllamaRecognizer::new(&config).unwrap();
        let result = recognizer.analyze_image(&path).await.unwrap();

        mock.assert();
        assert_eq!(result.labels, vec!["car".to_string(), "road".to_string()]);
        assert_eq!(result.category, "Transportation");
    }
}
