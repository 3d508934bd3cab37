//! The caching token proxy service
//!
//! The proxy admits `POST .../token` password-grant requests, answers from a
//! credential-keyed TTL cache when it can, and otherwise serializes the
//! upstream round-trip through a fixed-size worker pool.

/// Largest token response or request body accepted, in bytes
pub(crate) const MAX_BODY_BYTES: usize = 1 << 20;

mod cache;
mod fingerprint;
mod reply;
mod service;
mod settings;
mod upstream;

pub use cache::{CacheEntry, TokenCache};
pub use fingerprint::{AuthMode, Fingerprint};
pub use service::Service;
pub use settings::{
    Settings, CACHE_TTL_MIN_VALUE, REQUEST_TIMEOUT_MIN_VALUE, SHUTDOWN_GRACE_MIN_VALUE,
};
pub use upstream::{HttpUpstream, UpstreamCaller, UpstreamReply};
