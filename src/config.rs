//! Configuration management
//!
//! Configuration is layered: built-in defaults, then a YAML file, then
//! `OAP_`-prefixed environment variables, then command-line flags. Later
//! layers win.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::proxy::Settings;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Proxy server configuration
    pub serve: ServeConfig,
}

/// Proxy server configuration (the `serve` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServeConfig {
    /// Upstream authorization server URL; the request path is appended
    pub downstream: String,

    /// TCP port to listen on
    pub port: u16,

    /// How long cached tokens stay valid, in minutes
    #[serde(rename = "cacheTTL", alias = "cachettl", alias = "cache_ttl")]
    pub cache_ttl: u64,

    /// Upstream request timeout, in seconds
    pub timeout: u64,

    /// Graceful-shutdown grace period, in seconds
    pub shutdown: u64,

    /// Number of workers servicing upstream requests
    #[serde(alias = "poolsize", alias = "pool_size")]
    pub pool_size: usize,

    /// Suppress all log output
    pub silent: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            downstream: String::new(),
            port: 8090,
            cache_ttl: 15,
            timeout: 30,
            shutdown: 10,
            pool_size: 2,
            silent: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an explicitly named config file does
    /// not exist or any layer fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OAP_ prefix, __ separates sections)
        figment = figment.merge(Env::prefixed("OAP_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_cli_overrides(
        &mut self,
        downstream: Option<&str>,
        port: Option<u16>,
        silent: bool,
    ) {
        if let Some(downstream) = downstream {
            self.serve.downstream = downstream.to_string();
        }
        if let Some(port) = port {
            self.serve.port = port;
        }
        if silent {
            self.serve.silent = true;
        }
    }

    /// Convert the configuration into runtime [`Settings`]
    #[must_use]
    pub fn to_settings(&self) -> Settings {
        Settings {
            cache_ttl: Duration::from_secs(self.serve.cache_ttl * 60),
            request_timeout: Duration::from_secs(self.serve.timeout),
            shutdown_grace: Duration::from_secs(self.serve.shutdown),
            listen_addr: format!("127.0.0.1:{}", self.serve.port),
            endpoint: self.serve.downstream.clone(),
            pool_size: self.serve.pool_size,
        }
    }
}
