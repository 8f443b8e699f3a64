//! Wire codec for the batch RPC endpoint.
//!
//! # Requests
//!
//! Calls sharing a routing context are packed into one [`Envelope`]. The
//! envelope is sent as a form field named `f.req` holding a JSON array of
//! tuples:
//!
//! ```text
//! [[["<endpoint id>", "<JSON-encoded args>", null, "generic"], ...]]
//! ```
//!
//! together with the anti-CSRF token, session query parameters, a
//! per-request counter and a signature header.
//!
//! # Responses
//!
//! The response is a stream of length-prefixed JSON chunks (see
//! [`framing`]). Chunks hold tagged elements; RPC replies carry their
//! payload as a JSON-encoded string. [`ResponseDecoder`] turns the stream
//! into exactly one [`CallResult`](rpcwire_core::CallResult) per call, in
//! call order.
//!
//! # Example
//!
//! ```rust
//! use rpcwire_core::{Call, Credential};
//! use rpcwire_protocol::{Envelope, SessionParams, Sha256SignatureV1, decode_response, encode_chunk};
//!
//! let calls = vec![Call::new("wXbhsf", vec![])];
//! let envelope = Envelope::new(calls.clone()).unwrap();
//! let credential = Credential::new("token", "SID=1", "-42");
//! let request = envelope
//!     .encode(&credential, &SessionParams::default(), &Sha256SignatureV1)
//!     .unwrap();
//! assert_eq!(request.query_param("rpcids"), Some("wXbhsf"));
//!
//! let body = encode_chunk(r#"[["wrb.fr","wXbhsf","[1]",null,null,null,"generic"]]"#);
//! let decoded = decode_response(body.as_bytes(), &calls).unwrap();
//! assert!(decoded.results()[0].is_ok());
//! ```

mod decode;
mod envelope;
mod error;
pub mod framing;
mod signature;
mod types;

pub use decode::{DecodedResponse, ResponseDecoder, decode_response};
pub use envelope::{EncodedRequest, Envelope, FORM_CONTENT_TYPE, SessionParams, batch_path};
pub use error::{DecodeError, DecodeResult, ProtocolError, ProtocolResult};
pub use framing::{ChunkDecoder, XSSI_PREFIX, encode_chunk};
pub use signature::{SIGNATURE_HEADER, SignatureScheme, Sha256SignatureV1};
pub use types::{
    ErrorElement, GENERIC_INDEX, HTTP_UNAUTHORIZED, Reply, ReplyBody, ResponseElement,
    UNAUTHENTICATED_CODE,
};

/// Maximum declared size of one response chunk (64 MiB).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;
