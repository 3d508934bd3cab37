//! Upstream token endpoint client
//!
//! The worker pool talks to the authorization server through the
//! [`UpstreamCaller`] trait so tests can substitute a deterministic
//! responder for the HTTP round-trip.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, StatusCode};
use reqwest::Client;
use tracing::debug;

use super::{AuthMode, Fingerprint, MAX_BODY_BYTES};
use crate::{Error, Result};

/// A captured upstream response: status, headers and a bounded body
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    /// Upstream status code
    pub status: StatusCode,
    /// Upstream headers, single valued with last-wins on duplicates
    pub headers: HeaderMap,
    /// Response body, truncated at 1 MiB
    pub body: Bytes,
}

/// The upstream round-trip, pluggable for testing
#[async_trait]
pub trait UpstreamCaller: Send + Sync {
    /// Request a token for the fingerprint from the upstream server
    async fn call(&self, fingerprint: &Fingerprint) -> Result<UpstreamReply>;
}

/// Production [`UpstreamCaller`] issuing a single HTTP POST per token request
pub struct HttpUpstream {
    client: Client,
    endpoint: String,
}

impl HttpUpstream {
    /// Create an upstream client for `endpoint`
    ///
    /// The fingerprint path is appended to the endpoint when building the
    /// request URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the underlying client cannot be
    /// constructed.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl UpstreamCaller for HttpUpstream {
    async fn call(&self, fingerprint: &Fingerprint) -> Result<UpstreamReply> {
        let url = format!("{}{}", self.endpoint, fingerprint.path);
        debug!(url = %url, "upstream request");

        let mut request = self
            .client
            .post(&url)
            .header(
                header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(fingerprint.upstream_form());

        // Header-mode credentials ride the authorization header; the inbound
        // header itself is never forwarded
        if fingerprint.auth_mode == AuthMode::InHeader {
            request = request.basic_auth(&fingerprint.client_id, Some(&fingerprint.client_secret));
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            headers.insert(name, value.clone());
        }

        // Bounded read; anything past the cap is dropped, not an error
        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
        {
            let remaining = MAX_BODY_BYTES - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(UpstreamReply {
            status,
            headers,
            body: body.freeze(),
        })
    }
}
