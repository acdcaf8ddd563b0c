use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::proxy::socks5::Reply;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Client protocol violations
    #[error("Invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid SOCKS version in request: {0}")]
    InvalidRequestVersion(u8),

    #[error("Unsupported SOCKS command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain name in request")]
    InvalidDomain,

    #[error("Client handshake timed out")]
    ClientTimeout,

    #[error("Client I/O error: {0}")]
    ClientIo(#[source] std::io::Error),

    // Upstream failures
    #[error("No upstream proxy selected")]
    NoActiveProxy,

    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    #[error("Upstream connect failed with status {0:#04x}")]
    UpstreamConnect(u8),

    #[error("Upstream {phase} timed out")]
    UpstreamTimeout { phase: &'static str },

    #[error("Upstream I/O error: {0}")]
    UpstreamIo(#[source] std::io::Error),

    // Feed refresh failures
    #[error("Failed to fetch proxy list: {0}")]
    FeedFetch(String),

    #[error("Malformed proxy list: {0}")]
    FeedFormat(String),

    #[error("No proxies left after filtering ({total} fetched)")]
    NoCandidates { total: usize },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Where an error originated, used to decide how far it escalates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported client request; stays inside the session
    Protocol,
    /// Upstream proxy failed to establish a connection; feeds the pool policy
    Upstream,
    /// Proxy list refresh failed; previous candidates are kept
    Feed,
    Config,
    Internal,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InvalidVersion(_)
            | RelayError::InvalidRequestVersion(_)
            | RelayError::UnsupportedCommand(_)
            | RelayError::UnsupportedAddressType(_)
            | RelayError::InvalidRequestVersion(_)
            | RelayError::InvalidDomain
            | RelayError::ClientTimeout
            | RelayError::ClientIo(_) => ErrorKind::Protocol,

            RelayError::UpstreamHandshake(_)
            | RelayError::UpstreamConnect(_)
            | RelayError::UpstreamTimeout { .. }
            | RelayError::UpstreamIo(_) => ErrorKind::Upstream,

            RelayError::FeedFetch(_)
            | RelayError::FeedFormat(_)
            | RelayError::NoCandidates { .. } => ErrorKind::Feed,

            RelayError::InvalidConfig(_) => ErrorKind::Config,

            RelayError::NoActiveProxy
            | RelayError::NotFound(_)
            | RelayError::Io(_)
            | RelayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error counts against the active proxy's reliability
    pub fn is_upstream_failure(&self) -> bool {
        self.kind() == ErrorKind::Upstream
    }

    /// SOCKS5 reply to send to the client before closing, if any.
    ///
    /// Greeting violations, client timeouts and client I/O failures are
    /// dropped silently.
    pub fn reply_code(&self) -> Option<Reply> {
        match self {
            RelayError::InvalidVersion(_) | RelayError::ClientTimeout | RelayError::ClientIo(_) => {
                None
            }
            RelayError::InvalidRequestVersion(_) | RelayError::UnsupportedCommand(_) => {
                Some(Reply::CommandNotSupported)
            }
            RelayError::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
            RelayError::Io(_) => None,
            _ => Some(Reply::GeneralFailure),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::NoActiveProxy | RelayError::NoCandidates { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UpstreamHandshake(_)
            | RelayError::UpstreamConnect(_)
            | RelayError::UpstreamIo(_)
            | RelayError::FeedFetch(_)
            | RelayError::FeedFormat(_) => StatusCode::BAD_GATEWAY,
            RelayError::InvalidVersion(_)
            | RelayError::InvalidRequestVersion(_)
            | RelayError::UnsupportedCommand(_)
            | RelayError::UnsupportedAddressType(_)
            | RelayError::InvalidDomain
            | RelayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            RelayError::ClientTimeout => StatusCode::REQUEST_TIMEOUT,
            RelayError::ClientIo(_) | RelayError::Io(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidConfig(err.to_string())
    }
}
