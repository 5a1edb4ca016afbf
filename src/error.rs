//! Proxy error types

use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proxy engine.
///
/// Most failures are absorbed at the edge they occur on (a failed upstream
/// dial becomes a `502` response, a failed tunnel closes the hijacked
/// connection). Only construction-time failures reach the embedding program.
#[derive(Debug, Error)]
pub enum Error {
    /// Root CA material could not be decoded or has an unsupported key type
    #[error("invalid root CA configuration: {0}")]
    Config(String),

    /// The connection does not expose the raw byte stream
    #[error("connection hijacking not supported")]
    HijackUnsupported,

    /// TCP or TLS connection to the origin failed
    #[error("upstream dial failed for {host}: {reason}")]
    UpstreamDial { host: String, reason: String },

    /// Transport failure after the upstream exchange started
    #[error("upstream read failed: {0}")]
    UpstreamRead(String),

    /// Raw tunnel dial failure during CONNECT
    #[error("tunnel to {host} failed: {reason}")]
    Tunnel { host: String, reason: String },

    /// Leaf certificate synthesis or signing failure
    #[error("certificate issuance failed for {server_name}: {reason}")]
    CertIssuance { server_name: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an upstream dial error
    pub(crate) fn upstream_dial(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamDial {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a tunnel error
    pub(crate) fn tunnel(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a certificate issuance error
    pub(crate) fn cert_issuance(server_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertIssuance {
            server_name: server_name.into(),
            reason: msg.into(),
        }
    }
}
