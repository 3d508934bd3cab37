//! Caching OAuth2 token proxy
//!
//! A reverse proxy specialized to the OAuth2 resource-owner-password token
//! endpoint. Token responses are cached against the full credential tuple so
//! repeated identical requests are answered without contacting the upstream
//! authorization server.
//!
//! # Features
//!
//! - **Credential-keyed cache**: responses cached per (path, client, user,
//!   scope, auth placement) tuple with TTL expiry
//! - **Fixed worker pool**: upstream requests serialized through a bounded
//!   pool to shield the authorization server from load spikes
//! - **Graceful shutdown**: in-flight requests drain before exit
//! - **One-shot client**: a `request` subcommand for fetching a single token

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod proxy;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
