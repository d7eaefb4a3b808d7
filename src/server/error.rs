//! Error types for the HTTP server.

use std::net::SocketAddr;

use thiserror::Error;

use crate::cancel::CancelError;
use crate::parser::Error as ParserError;

/// Errors that can occur during HTTP server operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error parsing an HTTP request.
    #[error("Parse error: {0}")]
    ParseError(#[from] ParserError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The configuration was rejected before anything opened.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The listening socket could not be opened.
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// The server was stopped while the operation was under way.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// HTTP/2 protocol failure.
    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Invalid server options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("http2 requires the secure protocol")]
    Http2RequiresSecure,

    #[error("certificate and private key must be provided together")]
    IncompleteCertificate,

    #[error("force_port needs a fixed port, not 0")]
    ForcePortWithoutPort,

    #[error("invalid ip address: {0}")]
    InvalidIp(String),

    #[error("unusable certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure to open the listening socket.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("permission denied to bind {0}")]
    PermissionDenied(SocketAddr),

    #[error("cannot bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl BindError {
    /// Classify an I/O error raised while binding `addr`.
    pub fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AddrInUse => BindError::AddressInUse(addr),
            std::io::ErrorKind::PermissionDenied => BindError::PermissionDenied(addr),
            _ => BindError::Io { addr, source },
        }
    }
}

/// A request handler failed. The server answers 500.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    /// The handler gave up because its request was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handler panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// A handler error carrying `message`.
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }

    /// Wrap any error type.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HandlerError::Other(Box::new(error))
    }

    /// Whether the handler stopped because its request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled(_))
    }
}
