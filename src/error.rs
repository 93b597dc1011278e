// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for Drive Organizer

use thiserror::Error;

/// Result type alias for Drive Organizer operations
pub type Result<T> = std::result::Result<T, OrganizerError>;

/// Drive Organizer error types
#[derive(Error, Debug)]
pub enum OrganizerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Google API error: {0}")]
    GoogleApi(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Tag store error: {0}")]
    TagStore(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl OrganizerError {
    /// HTTP status code used when this error reaches the API surface
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authentication(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Validation(_) => 422,
            Self::GoogleApi(_) | Self::Recognition(_) | Self::Api(_) => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(OrganizerError::Authentication("x".into()).status_code(), 401);
        assert_eq!(OrganizerError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(OrganizerError::NotFound("x".into()).status_code(), 404);
        assert_eq!(OrganizerError::Validation("x".into()).status_code(), 422);
        assert_eq!(OrganizerError::GoogleApi("x".into()).status_code(), 502);
        assert_eq!(OrganizerError::Recognition("x".into()).status_code(), 502);
        assert_eq!(OrganizerError::Config("x".into()).status_code(), 500);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = OrganizerError::NotFound("image abc".to_string());
        assert_eq!(err.to_string(), "Not found: image abc");
    }
}
