//! One-shot token client for the `request` subcommand
//!
//! Loads a JSON secrets file and performs a single resource-owner-password
//! token fetch against the configured endpoint. This is a convenience tool
//! for smoke-testing a provider or the proxy itself; it shares no state with
//! the proxy service.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Secrets file wrapper; credentials sit under the `api` key
#[derive(Debug, Deserialize)]
struct SecretsFile {
    api: ClientSettings,
}

/// Credentials and endpoint for a one-shot token request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Token endpoint URL
    #[serde(rename = "tokenURL")]
    pub token_url: String,

    /// Resource owner user name
    pub username: String,

    /// Resource owner password
    pub password: String,

    /// OAuth2 client identifier
    #[serde(rename = "clientid")]
    pub client_id: String,

    /// OAuth2 client secret
    #[serde(rename = "clientsecret")]
    pub client_secret: String,

    /// Optional requested permissions
    pub scopes: Vec<String>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The issued access token
    pub access_token: String,
    /// Token type; servers commonly omit it for bearer tokens
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Token type with the conventional bearer default
    #[must_use]
    pub fn token_type(&self) -> &str {
        match self.token_type.as_deref() {
            Some(token_type) if !token_type.is_empty() => token_type,
            _ => "Bearer",
        }
    }
}

/// Load client settings from a JSON secrets file
///
/// # Errors
///
/// Returns an error when the file cannot be read or does not hold the
/// expected `{"api": {...}}` document.
pub fn load_secrets(path: &Path) -> Result<ClientSettings> {
    let raw = std::fs::read(path)?;
    let secrets: SecretsFile = serde_json::from_slice(&raw)?;
    Ok(secrets.api)
}

/// Request a single token using the password grant
///
/// # Errors
///
/// Returns an error when the request fails, the server answers with a
/// non-success status, or the response is not a token document.
pub async fn request_token(secrets: &ClientSettings) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "password".to_string()),
        ("username", secrets.username.clone()),
        ("password", secrets.password.clone()),
    ];

    if !secrets.scopes.is_empty() {
        form.push(("scope", secrets.scopes.join(" ")));
    }

    let client = reqwest::Client::new();
    let response = client
        .post(&secrets.token_url)
        .basic_auth(&secrets.client_id, Some(&secrets.client_secret))
        .form(&form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Transport(format!(
            "token request failed with status {status}"
        )));
    }

    Ok(response.json().await?)
}
