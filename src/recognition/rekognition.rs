// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! AWS Rekognition recognizer

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_rekognition::config::Credentials;
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::Image;
use aws_sdk_rekognition::Client;
use std::path::Path;
use tracing::{debug, info};

use super::{load_image, with_retry, ImageRecognizer, LabelPolicy, Recognition};
use crate::{AppConfig, OrganizerError, Result};

/// Upper bound Rekognition applies to `DetectLabels`
const DETECT_MAX_LABELS: i32 = 20;

pub struct RekognitionRecognizer {
    client: Client,
    policy: LabelPolicy,
    retries: u32,
    concurrency: usize,
}

impl RekognitionRecognizer {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let aws = &config.recognition.aws;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &aws.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(key), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "drive-organizer",
            ));
        }
        let shared = loader.load().await;

        info!("Rekognition recognizer in region {:?}", shared.region());
        Ok(Self {
            client: Client::new(&shared),
            policy: LabelPolicy::from_config(config),
            retries: config.recognition.retries,
            concurrency: config.recognition.concurrency,
        })
    }

    async fn detect_labels(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let output = self
            .client
            .detect_labels()
            .image(Image::builder().bytes(Blob::new(bytes.to_vec())).build())
            .max_labels(DETECT_MAX_LABELS)
            .send()
            .await
            .map_err(|e| OrganizerError::Recognition(format!("Rekognition: {}", e)))?;

        Ok(output
            .labels()
            .iter()
            .filter_map(|label| label.name().map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl ImageRecognizer for RekognitionRecognizer {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn analyze_image(&self, path: &Path) -> Result<Recognition> {
        let (bytes, _) = load_image(path)?;
        let labels = with_retry("Rekognition request", self.retries, || self.detect_labels(&bytes)).await?;
        debug!("{:?} -> {:?}", path, labels);
        Ok(self.policy.recognition(labels))
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn supported_categories(&self) -> Vec<String> {
        self.policy.categories.names()
    }
}
