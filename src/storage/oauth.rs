// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Google OAuth 2.0 for installed applications
//!
//! Tokens are persisted to a JSON file. An expired token is refreshed with its
//! refresh token; without one, the consent flow runs against a loopback
//! redirect listener.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GoogleDriveConfig;
use crate::{OrganizerError, Result};

/// Scope granting full Drive access
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Seconds before expiry at which a token is treated as expired
const EXPIRY_SKEW_SECS: i64 = 60;

/// A persisted access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at - Duration::seconds(EXPIRY_SKEW_SECS) <= Utc::now(),
            None => false,
        }
    }
}

/// Client secrets in Google's "installed application" layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecrets {
    pub installed: InstalledApp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String { DEFAULT_AUTH_URI.to_string() }
fn default_token_uri() -> String { DEFAULT_TOKEN_URI.to_string() }

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth client for one application and token file
pub struct OAuthClient {
    http: Client,
    app: InstalledApp,
    token_path: PathBuf,
}

impl OAuthClient {
    pub fn new(http: Client, app: InstalledApp, token_path: impl Into<PathBuf>) -> Self {
        Self {
            http,
            app,
            token_path: token_path.into(),
        }
    }

    /// Build a client from config, writing the secrets file when only an ID and
    /// secret are configured
    pub fn from_config(http: Client, config: &GoogleDriveConfig) -> Result<Self> {
        let app = load_or_create_secrets(config)?;
        Ok(Self::new(http, app, &config.token_path))
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Read the persisted token, if any
    pub fn load_token(&self) -> Result<Option<StoredToken>> {
        if !self.token_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.token_path)?;
        match serde_json::from_str(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("Ignoring unreadable token file {:?}: {}", self.token_path, e);
                Ok(None)
            }
        }
    }

    pub fn save_token(&self, token: &StoredToken) -> Result<()> {
        let content = serde_json::to_string_pretty(token)?;
        std::fs::write(&self.token_path, content)?;
        Ok(())
    }

    /// Return a usable token: the stored one, a refreshed one, or a new one
    /// from the consent flow
    pub async fn obtain_token(&self) -> Result<StoredToken> {
        if let Some(token) = self.load_token()? {
            if !token.is_expired() {
                return Ok(token);
            }
            if token.refresh_token.is_some() {
                let refreshed = self.refresh(&token).await?;
                self.save_token(&refreshed)?;
                return Ok(refreshed);
            }
        }

        let token = self.run_consent_flow().await?;
        self.save_token(&token)?;
        Ok(token)
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, token: &StoredToken) -> Result<StoredToken> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            OrganizerError::Authentication("No refresh token available".to_string())
        })?;

        debug!("Refreshing access token");
        let response = self
            .http
            .post(&self.app.token_uri)
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let fresh = Self::parse_token_response(response).await?;
        Ok(StoredToken {
            refresh_token: fresh.refresh_token.or_else(|| token.refresh_token.clone()),
            scopes: if fresh.scopes.is_empty() { token.scopes.clone() } else { fresh.scopes },
            ..fresh
        })
    }

    /// Consent page URL for the given redirect and CSRF state
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<Url> {
        let mut url = Url::parse(&self.app.auth_uri)
            .map_err(|e| OrganizerError::Config(format!("Invalid auth_uri: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", DRIVE_SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        Ok(url)
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<StoredToken> {
        let response = self
            .http
            .post(&self.app.token_uri)
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        Self::parse_token_response(response).await
    }

    async fn parse_token_response(response: reqwest::Response) -> Result<StoredToken> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrganizerError::Authentication(format!(
                "Token endpoint returned {}: {}",
                status, body
            )));
        }
        let body: TokenResponse = response.json().await?;
        Ok(StoredToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            scopes: body
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        })
    }

    /// Run the consent flow against a loopback redirect listener
    async fn run_consent_flow(&self) -> Result<StoredToken> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
        let state = uuid::Uuid::new_v4().to_string();
        let url = self.authorization_url(&redirect_uri, &state)?;

        info!("Open this URL in a browser to authorize Drive access:");
        eprintln!("\n  {}\n", url);

        let code = receive_code(listener, &state).await?;
        self.exchange_code(&code, &redirect_uri).await
    }
}

#[derive(Clone)]
struct RedirectState {
    expected_state: Arc<str>,
    outcome: mpsc::Sender<Result<String>>,
}

/// Serve the redirect target until a request carrying `expected_state` arrives
///
/// Other requests (favicon, preconnects, stale redirects) are answered and
/// ignored.
pub async fn receive_code(listener: TcpListener, expected_state: &str) -> Result<String> {
    let (outcome_tx, mut outcome_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/", get(redirect_target))
        .with_state(RedirectState {
            expected_state: Arc::from(expected_state),
            outcome: outcome_tx,
        });
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let outcome = outcome_rx
        .recv()
        .await
        .unwrap_or_else(|| Err(OrganizerError::Authentication("Redirect listener stopped".to_string())));

    let _ = stop_tx.send(());
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut server).await.is_err() {
        debug!("Redirect listener still had open connections at shutdown");
        server.abort();
    }
    outcome
}

async fn redirect_target(
    State(state): State<RedirectState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    match read_redirect(&params, &state.expected_state) {
        Some(outcome) => {
            let body = match &outcome {
                Ok(_) => "Authorization complete. You can close this window.",
                Err(_) => "Authorization failed. Return to the terminal for details.",
            };
            let _ = state.outcome.try_send(outcome);
            (StatusCode::OK, body)
        }
        None => (StatusCode::BAD_REQUEST, "Not an authorization redirect for this session."),
    }
}

/// Authorization code from redirect parameters; `None` unless the state matches
fn read_redirect(params: &HashMap<String, String>, expected_state: &str) -> Option<Result<String>> {
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return None;
    }
    if let Some(error) = params.get("error") {
        return Some(Err(OrganizerError::Authentication(format!("Consent denied: {}", error))));
    }
    Some(
        params
            .get("code")
            .cloned()
            .ok_or_else(|| OrganizerError::Authentication("No authorization code in redirect".to_string())),
    )
}

/// Read the client secrets file, creating it from the configured ID and secret
/// when absent
pub fn load_or_create_secrets(config: &GoogleDriveConfig) -> Result<InstalledApp> {
    let path = Path::new(&config.credentials_path);
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let secrets: ClientSecrets = serde_json::from_str(&content)
            .map_err(|e| OrganizerError::Config(format!("Invalid credentials file {:?}: {}", path, e)))?;
        return Ok(secrets.installed);
    }

    if config.client_id.is_empty() || config.client_secret.is_empty() {
        return Err(OrganizerError::Authentication(
            "No credentials file found and no client ID/secret provided".to_string(),
        ));
    }

    let secrets = ClientSecrets {
        installed: InstalledApp {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            redirect_uris: vec![config.redirect_uri.clone(), "urn:ietf:wg:oauth:2.0:oob".to_string()],
        },
    };
    std::fs::write(path, serde_json::to_string_pretty(&secrets)?)?;
    info!("Wrote client secrets to {:?}", path);
    Ok(secrets.installed)
}
