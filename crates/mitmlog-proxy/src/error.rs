//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Upstream round trip failed.
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Malformed CONNECT target.
    #[error("Invalid CONNECT target '{target}': {reason}")]
    InvalidTarget {
        /// The authority as received.
        target: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Invalid routing pattern.
    #[error("Invalid route pattern: {0}")]
    Route(#[from] regex::Error),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate a certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to build a TLS server configuration.
    #[error("Failed to build TLS config: {0}")]
    Tls(String),
}

impl From<rcgen::Error> for CaManagerError {
    fn from(err: rcgen::Error) -> Self {
        CaManagerError::Generation(err.to_string())
    }
}

impl From<rustls::Error> for CaManagerError {
    fn from(err: rustls::Error) -> Self {
        CaManagerError::Tls(err.to_string())
    }
}

/// Errors raised while framing HTTP/1.1 messages on a plaintext tunnel.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket read or write failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message head could not be parsed.
    #[error("Malformed message head: {0}")]
    Parse(#[from] httparse::Error),

    /// Peer closed in the middle of a message.
    #[error("Message truncated")]
    Truncated,

    /// Upstream closed before sending a response.
    #[error("Upstream closed before responding")]
    NoResponse,

    /// Message head exceeded the size limit.
    #[error("Message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// Content-Length missing a valid value or given twice with different values.
    #[error("Invalid Content-Length")]
    InvalidContentLength,

    /// Request used a transfer coding other than chunked.
    #[error("Unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,

    /// Chunk size line or chunk terminator was malformed.
    #[error("Invalid chunk framing")]
    InvalidChunk,
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Whether `err` only says the client went away: an EOF mid-message, or a
/// write or shutdown on a connection the peer already closed.
pub(crate) fn is_disconnect(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_canceled() {
        return true;
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}
