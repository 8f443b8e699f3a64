//! Error types for client operations.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rpcwire_core::{ExtractionError, RemoteError};
use rpcwire_protocol::{DecodeError, ProtocolError};
use thiserror::Error;

/// The category of an [`RpcError`].
///
/// Used for retry decisions and for reporting errors without matching on
/// every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCode {
    /// Connection failed, timed out, or was reset.
    NetworkError,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// Any other non-success HTTP status.
    HttpError,
    /// The response body broke off after part of it was read.
    PartialBody,
    /// The envelope could not be encoded.
    EncodeFailed,
    /// The response framing could not be decoded.
    DecodeFailed,
    /// The service flagged a call as failed.
    RemoteCallFailed,
    /// The session is no longer valid.
    AuthExpired,
    /// A payload could not be recovered from a call result.
    ExtractionFailed,
    /// A usage quota is exhausted.
    QuotaExceeded,
    /// Missing or invalid configuration.
    ConfigurationError,
    /// The client has been disposed.
    Shutdown,
}

impl RpcErrorCode {
    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RateLimited | Self::ServerError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::HttpError => "http_error",
            Self::PartialBody => "partial_body",
            Self::EncodeFailed => "encode_failed",
            Self::DecodeFailed => "decode_failed",
            Self::RemoteCallFailed => "remote_call_failed",
            Self::AuthExpired => "auth_expired",
            Self::ExtractionFailed => "extraction_failed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ConfigurationError => "configuration_error",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP-level failure of one exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or no response arrived.
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status}{}", retry_hint(.retry_after))]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// The body stream failed after some of it had been consumed.
    #[error("response interrupted after {consumed} bytes: {source}")]
    PartialBody {
        consumed: usize,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    pub fn code(&self) -> RpcErrorCode {
        match self {
            Self::Network(_) => RpcErrorCode::NetworkError,
            Self::Status { status: 429, .. } => RpcErrorCode::RateLimited,
            Self::Status { status, .. } if *status >= 500 => RpcErrorCode::ServerError,
            Self::Status { .. } => RpcErrorCode::HttpError,
            Self::PartialBody { .. } => RpcErrorCode::PartialBody,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// An error surfaced by the client.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] ProtocolError),

    #[error("failed to decode response: {0}")]
    Decode(#[from] DecodeError),

    /// The service answered but flagged this call as failed.
    #[error("call {id} failed: {}", describe_remote(.code, .message))]
    RemoteCall {
        id: String,
        code: Option<i64>,
        message: String,
    },

    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Raised before any network traffic.
    #[error("quota exceeded for {kind}: limit {limit}{}", reset_hint(.resets_at))]
    QuotaExceeded {
        kind: String,
        limit: u64,
        resets_at: Option<DateTime<Utc>>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("client is shut down")]
    Shutdown,
}

impl RpcError {
    /// Creates a [`RpcError::RemoteCall`] from a call's remote error.
    pub fn remote(id: impl Into<String>, error: RemoteError) -> Self {
        Self::RemoteCall {
            id: id.into(),
            code: error.code,
            message: error.message,
        }
    }

    pub fn code(&self) -> RpcErrorCode {
        match self {
            Self::Transport(e) => e.code(),
            Self::Encode(_) => RpcErrorCode::EncodeFailed,
            Self::Decode(_) => RpcErrorCode::DecodeFailed,
            Self::RemoteCall { .. } => RpcErrorCode::RemoteCallFailed,
            Self::AuthExpired(_) => RpcErrorCode::AuthExpired,
            Self::Extraction(_) => RpcErrorCode::ExtractionFailed,
            Self::QuotaExceeded { .. } => RpcErrorCode::QuotaExceeded,
            Self::Config(_) => RpcErrorCode::ConfigurationError,
            Self::Shutdown => RpcErrorCode::Shutdown,
        }
    }

    /// Returns true if this error is transient and may be retried.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

fn describe_remote(code: &Option<i64>, message: &str) -> String {
    RemoteError::new(*code, message).to_string()
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {}s", d.as_secs()))
        .unwrap_or_default()
}

fn reset_hint(resets_at: &Option<DateTime<Utc>>) -> String {
    resets_at
        .map(|t| format!(", resets at {}", t.to_rfc3339()))
        .unwrap_or_default()
}

/// A specialized Result type for client operations.
pub type RpcResult<T> = Result<T, RpcError>;
