//! Error types for the proxy.

use thiserror::Error;

use sluice_storage::StoreError;

use crate::context::ContextError;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP message construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// HTTP connection error.
    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Outbound client error.
    #[error("Client error: {0}")]
    Client(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request scratch store error.
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// The response sink cannot hand over its connection.
    #[error("response sink does not support hijacking")]
    HijackUnsupported,

    /// The client went away; not worth logging.
    #[error("end of stream")]
    EndOfStream,

    /// A tunnel frame could not be decoded.
    #[error("malformed tunnel frame: {0}")]
    MalformedFrame(String),

    /// The compressed header block does not fit the 16-bit length prefix.
    #[error("tunnel header block too large: {0} bytes")]
    HeaderBlockTooLarge(usize),

    /// The sink already carries a response or a hijack.
    #[error("request already answered")]
    AlreadyAnswered,

    /// The handler produced neither a response nor a hijack.
    #[error("request aborted")]
    Aborted,
}

impl From<rustls::Error> for ProxyError {
    fn from(e: rustls::Error) -> Self {
        ProxyError::Tls(e.to_string())
    }
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate root material or a leaf certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to parse stored root material.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Key size does not name a supported algorithm.
    #[error("Unsupported key size: {0} bits")]
    InvalidKeySize(u32),

    /// Only one half of the root key pair is present.
    #[error("CA material incomplete: {0}")]
    Incomplete(String),

    /// Failed to read or write root material.
    #[error("CA storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Generation(e.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
