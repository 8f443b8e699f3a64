//! Logical calls and their decoded results.
//!
//! A [`Call`] names one remote endpoint plus its positional arguments. Calls
//! are grouped into a wire envelope by the protocol crate and come back as
//! one [`CallResult`] each, correlated by position.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Routing context used when a call does not specify one.
pub const DEFAULT_CONTEXT: &str = "/";

/// One logical remote operation.
///
/// Calls are immutable once built; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    id: String,
    args: Vec<Value>,
    context: Option<String>,
}

impl Call {
    /// Creates a call to the endpoint `id` with positional `args`.
    pub fn new(id: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            args,
            context: None,
        }
    }

    /// Builder: scope the call to a routing context (e.g. `/notebook/<uuid>`).
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the opaque endpoint identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Returns the explicit routing context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the routing context, falling back to [`DEFAULT_CONTEXT`].
    pub fn routing_context(&self) -> &str {
        self.context.as_deref().unwrap_or(DEFAULT_CONTEXT)
    }
}

/// An error the remote service attached to one specific call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RemoteError {
    /// Remote status code, when the service reported one.
    pub code: Option<i64>,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "remote error {}: {}", code, self.message),
            None => write!(f, "remote error: {}", self.message),
        }
    }
}

/// Decoded outcome of one [`Call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Zero-based position of the originating call in the submitted batch.
    pub index: usize,
    /// Endpoint identifier echoed back by the service.
    pub id: String,
    /// The call's data, or the error the service flagged it with.
    pub outcome: Result<Value, RemoteError>,
}

impl CallResult {
    /// Creates a successful result.
    pub fn ok(index: usize, id: impl Into<String>, data: Value) -> Self {
        Self {
            index,
            id: id.into(),
            outcome: Ok(data),
        }
    }

    /// Creates a failed result.
    pub fn err(index: usize, id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            index,
            id: id.into(),
            outcome: Err(error),
        }
    }

    /// Returns true if the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Returns the data of a successful call.
    pub fn data(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    /// Returns the remote error of a failed call.
    pub fn error(&self) -> Option<&RemoteError> {
        self.outcome.as_ref().err()
    }

    /// Consumes the result, returning the outcome.
    pub fn into_outcome(self) -> Result<Value, RemoteError> {
        self.outcome
    }
}
