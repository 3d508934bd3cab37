//! Token request admission and the cache key it produces
//!
//! A [`Fingerprint`] is the full credential tuple of a password-grant token
//! request. Two requests with the same tuple are the same cache entry; the
//! placement of the client credentials (Basic header vs form body) is part
//! of the tuple because the upstream may treat the two differently.

use std::fmt;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header, Method};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::error;

use super::reply;
use super::MAX_BODY_BYTES;

/// Where the client credentials arrived on the inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// Credentials taken from the HTTP Basic authorization header
    InHeader,
    /// Credentials taken from `client_id` / `client_secret` form fields
    InBody,
}

/// The credential tuple identifying a token request; the cache key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Request path as received
    pub path: String,
    /// OAuth2 client identifier
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Resource owner user name
    pub username: String,
    /// Resource owner password
    pub password: String,
    /// Requested scopes, space separated as received after form decoding
    pub scopes: String,
    /// Where the client credentials arrived
    pub auth_mode: AuthMode,
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprint")
            .field("path", &self.path)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("auth_mode", &self.auth_mode)
            .finish()
    }
}

impl Fingerprint {
    /// Admit an inbound request and extract its fingerprint
    ///
    /// Routing and validation happen in order: non-POST and paths without a
    /// `/token` suffix are rejected with 404; an unparseable form body or a
    /// grant type other than `password` with 400. The error side of the
    /// result is the finished HTTP reply, so callers return it as-is.
    pub(crate) async fn admit(req: Request) -> Result<Fingerprint, Response> {
        let path = req.uri().path().to_string();

        // Basic routing, only interested in token requests
        if req.method() != Method::POST || !path.ends_with("/token") {
            return Err(reply::not_found());
        }

        let basic = basic_credentials(&req);

        let form = match parse_form(req).await {
            Ok(form) => form,
            Err(err) => {
                error!("parse request error: {err}");
                return Err(reply::invalid());
            }
        };

        // Only the password flow is supported
        let grant_type = form_value(&form, "grant_type");
        if grant_type != "password" {
            error!("invalid grant type: {grant_type}");
            return Err(reply::invalid());
        }

        let (client_id, client_secret, auth_mode) = match basic {
            Some((id, secret)) => (id, secret, AuthMode::InHeader),
            None => (
                form_value(&form, "client_id").to_string(),
                form_value(&form, "client_secret").to_string(),
                AuthMode::InBody,
            ),
        };

        Ok(Fingerprint {
            path,
            client_id,
            client_secret,
            username: form_value(&form, "username").to_string(),
            password: form_value(&form, "password").to_string(),
            scopes: form_value(&form, "scope").to_string(),
            auth_mode,
        })
    }

    /// Encode the upstream form body reconstructed from this fingerprint
    ///
    /// Client credentials are embedded only when they arrived in the body;
    /// header credentials go out through [`Fingerprint::basic_authorization`]
    /// instead.
    #[must_use]
    pub fn upstream_form(&self) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());

        if self.auth_mode == AuthMode::InBody {
            form.append_pair("client_id", &self.client_id);
            form.append_pair("client_secret", &self.client_secret);
        }

        form.append_pair("grant_type", "password");
        form.append_pair("password", &self.password);

        if !self.scopes.is_empty() {
            form.append_pair("scope", &self.scopes);
        }

        form.append_pair("username", &self.username);
        form.finish()
    }

    /// Basic authorization header value for header-mode credentials
    #[must_use]
    pub fn basic_authorization(&self) -> Option<String> {
        if self.auth_mode != AuthMode::InHeader {
            return None;
        }

        let encoded = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        Some(format!("Basic {encoded}"))
    }
}

/// Extract HTTP Basic credentials, if present and well formed
fn basic_credentials(req: &Request) -> Option<(String, String)> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;

    let (scheme, payload) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Decode the urlencoded form body, first value wins on duplicate keys
async fn parse_form(req: Request) -> Result<Vec<(String, String)>, String> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if media_type != "application/x-www-form-urlencoded" {
        return Err(format!("unexpected content type {content_type:?}"));
    }

    let body: Body = req.into_body();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| e.to_string())?;

    Ok(url::form_urlencoded::parse(&bytes).into_owned().collect())
}

/// First value for a form key, or the empty string when absent
fn form_value<'a>(form: &'a [(String, String)], key: &str) -> &'a str {
    form.iter()
        .find(|(k, _)| k == key)
        .map_or("", |(_, v)| v.as_str())
}
