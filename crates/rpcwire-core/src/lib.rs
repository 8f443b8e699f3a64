//! Core types for the batch RPC client.
//!
//! - [`Call`] / [`CallResult`] - one logical remote operation and its outcome
//! - [`Credential`] - session material plus the per-session request counter
//! - [`extract`] - recovery of payloads hidden inside embedded HTML documents
//! - [`tracing`] - subscriber setup for binaries embedding the client

pub mod call;
pub mod credential;
pub mod error;
pub mod extract;
pub mod tracing;

pub use call::{Call, CallResult, DEFAULT_CONTEXT, RemoteError};
pub use credential::{Credential, REQUEST_ID_STEP, RequestCounter, estimate_expiry};
pub use error::{ExtractResult, ExtractionError, PREVIEW_LIMIT};
pub use extract::content::{Flashcard, QuizOption, QuizQuestion, flashcards, quiz_questions};
pub use extract::{ExtractedPayload, MAX_SEARCH_DEPTH, Search, Strategy, extract_payload};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
