//! Command-line interface definitions for `oauth-proxy`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the [`Command`]
//! subcommand enum that drives the binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth2 token proxy - caching reverse proxy for password-grant token requests
///
/// Sits between clients and an upstream authorization server, forwards token
/// requests, and caches the responses keyed by the full credential tuple to
/// reduce load on the provider.
#[derive(Parser, Debug)]
#[command(name = "oauth-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the proxy configuration file (YAML)
    #[arg(short, long, env = "OAP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the oauth2 token proxy server
    #[command(about = "Run the oauth2 token proxy server")]
    Serve {
        /// Downstream authorization server URL the request path is appended to
        #[arg(long, env = "OAP_SERVE__DOWNSTREAM")]
        downstream: Option<String>,

        /// Port the proxy listens on (overrides config file)
        #[arg(long, env = "OAP_SERVE__PORT")]
        port: Option<u16>,

        /// Silence all output logging
        #[arg(long)]
        silent: bool,
    },

    /// Request a single oauth2 token from a server
    #[command(about = "Request an oauth2 token using a secrets file")]
    Request {
        /// Path to a JSON secrets file holding the token endpoint and credentials
        #[arg(required = true)]
        secrets_file: PathBuf,
    },
}
