// ABOUTME: Error types for the egress proxy
// ABOUTME: Covers registry persistence, certificate minting, TLS, and malformed proxy requests

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// VM registry conflict or corruption
    #[error("Registry error: {0}")]
    Registry(String),

    /// Request could not be parsed as a proxy request
    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    /// Upstream name did not resolve
    #[error("Could not resolve {0}")]
    Resolve(String),

    /// Upstream could not be reached in time
    #[error("Upstream connection to {0} timed out")]
    UpstreamTimeout(String),
}

/// Type alias for Results that return ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
