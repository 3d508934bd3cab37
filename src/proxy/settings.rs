//! Proxy service settings and validation

use std::time::Duration;

use crate::{Error, Result};

/// Smallest time permitted for cached tokens
pub const CACHE_TTL_MIN_VALUE: Duration = Duration::from_secs(10 * 60);

/// Smallest time permitted for upstream request timeouts
pub const REQUEST_TIMEOUT_MIN_VALUE: Duration = Duration::from_secs(10);

/// Smallest period the service can be configured to wait for a graceful exit
pub const SHUTDOWN_GRACE_MIN_VALUE: Duration = Duration::from_secs(5);

/// Settings for the proxy service
#[derive(Debug, Clone)]
pub struct Settings {
    /// How long an item remains valid in the cache
    pub cache_ttl: Duration,

    /// Timeout for an upstream token request
    pub request_timeout: Duration,

    /// How long to wait for in-flight connections during shutdown
    pub shutdown_grace: Duration,

    /// Address and port to listen on
    pub listen_addr: String,

    /// Upstream endpoint the token request path is appended to
    pub endpoint: String,

    /// Number of workers servicing upstream requests
    pub pool_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(20 * 60),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: SHUTDOWN_GRACE_MIN_VALUE,
            listen_addr: "127.0.0.1:8090".to_string(),
            endpoint: String::new(),
            pool_size: 2,
        }
    }
}

impl Settings {
    /// Return settings with the upstream endpoint set, leaving it unchanged
    /// when `endpoint` is empty
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        if !endpoint.is_empty() {
            self.endpoint = endpoint.to_string();
        }
        self
    }

    /// Validate the settings, reporting every violation at once
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing all violated constraints.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        if self.cache_ttl < CACHE_TTL_MIN_VALUE {
            violations.push(format!(
                "cache TTL must be at least {} minutes",
                CACHE_TTL_MIN_VALUE.as_secs() / 60
            ));
        }

        if self.request_timeout < REQUEST_TIMEOUT_MIN_VALUE {
            violations.push(format!(
                "request timeout must be at least {} seconds",
                REQUEST_TIMEOUT_MIN_VALUE.as_secs()
            ));
        }

        if self.shutdown_grace < SHUTDOWN_GRACE_MIN_VALUE {
            violations.push(format!(
                "shutdown grace period must be at least {} seconds",
                SHUTDOWN_GRACE_MIN_VALUE.as_secs()
            ));
        }

        if self.listen_addr.is_empty() {
            violations.push("no listen address provided".to_string());
        }

        if self.endpoint.is_empty() {
            violations.push("endpoint cannot be blank".to_string());
        }

        if self.pool_size < 1 {
            violations.push("pool size must be at least 1".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(violations.join("; ")))
        }
    }
}
