use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup; the resolution engine never sees a
/// half-validated config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("illegal value for transport {0:?}")]
    InvalidTransport(String),

    #[error("invalid duration {0:?}")]
    InvalidTimeout(String),

    #[error("zone name must not be empty")]
    MissingZone,

    #[error("listen host must not be empty")]
    MissingListenHost,

    #[error("at least one nameserver is required")]
    NoNameservers,
}

/// Errors from a single upstream exchange.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("exchange with {nameserver} timed out after {wait:?}")]
    Timeout { nameserver: SocketAddr, wait: Duration },

    #[error("IO error talking to {nameserver}: {message}")]
    Io { nameserver: SocketAddr, message: String },

    #[error("failed to encode query: {0}")]
    Encode(String),

    #[error("undecodable response from {nameserver}: {message}")]
    Decode { nameserver: SocketAddr, message: String },
}
