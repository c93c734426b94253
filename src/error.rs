use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::proxy::socks5::reply;

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Upstream errors
    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream response timed out")]
    UpstreamTimeout,

    // Client errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Lifecycle errors
    #[error("Drain exceeded {secs}s, {remaining} sessions force-closed")]
    ShutdownTimeout { secs: u64, remaining: usize },

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 504 Gateway Timeout
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 502 Bad Gateway, including connect timeouts
            ProxyError::Dial(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            ProxyError::ShutdownTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ProxyError::InvalidConfig(_) | ProxyError::MissingEnvVar(_) | ProxyError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Clients only ever see the canonical reason phrase.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = status.canonical_reason().unwrap_or("Error");
        (status, body).into_response()
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

/// Failure to establish an upstream connection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialError {
    #[error("connect timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("target could not be resolved")]
    Unresolvable,

    #[error("target denied by policy")]
    PolicyDenied,

    #[error("network or host unreachable")]
    Unreachable,

    #[error("connect failed")]
    Failed,
}

impl DialError {
    /// Classify a connect error by its kind
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => DialError::Refused,
            ErrorKind::TimedOut => DialError::Timeout,
            ErrorKind::PermissionDenied => DialError::PolicyDenied,
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable => DialError::Unreachable,
            _ => DialError::Failed,
        }
    }

    /// SOCKS5 reply code reported to the client for this failure
    pub fn reply_code(&self) -> u8 {
        match self {
            DialError::Timeout => reply::TTL_EXPIRED,
            DialError::Refused => reply::CONNECTION_REFUSED,
            DialError::Unresolvable => reply::HOST_UNREACHABLE,
            DialError::PolicyDenied => reply::NOT_ALLOWED,
            DialError::Unreachable => reply::NETWORK_UNREACHABLE,
            DialError::Failed => reply::GENERAL_FAILURE,
        }
    }
}

/// Malformed or unsupported client protocol framing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("client closed the connection during handshake")]
    UnexpectedEof,

    #[error("handshake timed out")]
    Timeout,
}

impl HandshakeError {
    /// SOCKS5 reply to send before closing, if the protocol allows one
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            HandshakeError::UnsupportedCommand(_) | HandshakeError::Malformed(_) => {
                Some(reply::COMMAND_NOT_SUPPORTED)
            }
            HandshakeError::UnsupportedAddressType(_) => Some(reply::ADDRESS_TYPE_NOT_SUPPORTED),
            // The method reply (0xFF) is sent by the negotiation step itself.
            HandshakeError::NoAcceptableMethod
            | HandshakeError::UnsupportedVersion(_)
            | HandshakeError::UnexpectedEof
            | HandshakeError::Timeout => None,
        }
    }
}
