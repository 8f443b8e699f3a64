//! Protocol error types.

use thiserror::Error;

/// Result type for envelope encoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for response decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors that can occur while building an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An envelope must carry at least one call.
    #[error("envelope has no calls")]
    EmptyEnvelope,

    /// Calls with different routing contexts cannot share an envelope.
    #[error("calls target different contexts: {first} and {other}")]
    MixedContext { first: String, other: String },

    /// Failed to serialize call arguments.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that make a whole response undecodable.
///
/// Problems confined to one call are not reported here; they become that
/// call's error result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A chunk length line is not a decimal number.
    #[error("invalid chunk length line: {line:?}")]
    InvalidLength { line: String },

    /// A chunk declares a size above the limit.
    #[error("chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: usize, max: usize },

    /// The stream ended before a declared chunk was complete.
    #[error("truncated chunk: expected {expected} bytes, got {available}")]
    Truncated { expected: usize, available: usize },

    /// A chunk body is not a JSON array.
    #[error("malformed chunk: {reason}")]
    MalformedChunk { reason: String },

    /// No reply correlates with a submitted call.
    #[error("no result for call #{index} ({id})")]
    MissingResult { index: usize, id: String },
}
