//! Extraction error types.

use thiserror::Error;

/// Result type for payload extraction.
pub type ExtractResult<T> = Result<T, ExtractionError>;

/// Maximum number of characters kept in an error preview.
pub const PREVIEW_LIMIT: usize = 200;

/// Errors raised when a hidden payload cannot be recovered.
///
/// Every variant carries a bounded preview of the structure that was
/// searched, never the full blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// No value within the depth bound mentioned the target.
    #[error("no candidate for `{target}` within {depth} levels: {preview}")]
    NotFound {
        target: String,
        depth: usize,
        preview: String,
    },

    /// A candidate was found but every strategy failed to recover it.
    #[error("all extraction strategies failed for `{target}`: {preview}")]
    Exhausted { target: String, preview: String },

    /// The recovered value does not have the expected shape.
    #[error("`{target}` is not {expected}: {preview}")]
    UnexpectedShape {
        target: String,
        expected: &'static str,
        preview: String,
    },
}

impl ExtractionError {
    /// Returns the target marker the extraction was looking for.
    pub fn target(&self) -> &str {
        match self {
            Self::NotFound { target, .. }
            | Self::Exhausted { target, .. }
            | Self::UnexpectedShape { target, .. } => target,
        }
    }

    /// Returns the bounded preview attached to the error.
    pub fn preview(&self) -> &str {
        match self {
            Self::NotFound { preview, .. }
            | Self::Exhausted { preview, .. }
            | Self::UnexpectedShape { preview, .. } => preview,
        }
    }
}

/// Truncates `text` to [`PREVIEW_LIMIT`] characters for diagnostics.
pub fn preview(text: &str) -> String {
    let total = text.chars().count();
    if total <= PREVIEW_LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_LIMIT).collect();
    format!("{}… ({} chars total)", head, total)
}
