//! Typed response elements.
//!
//! Every element of a decoded chunk is an array whose first entry names its
//! kind. Each known kind maps to one variant here; anything else is kept as
//! [`ResponseElement::Unknown`] so new element kinds never break decoding.

use rpcwire_core::RemoteError;
use serde_json::Value;

/// Discriminant of an RPC reply.
pub const REPLY_TAG: &str = "wrb.fr";

/// Discriminant of an error element.
pub const ERROR_TAG: &str = "er";

/// Discriminants of framing and keepalive elements.
pub const FRAMING_TAGS: &[&str] = &["di", "af.httprm", "e"];

/// Index marker used when the service does not number replies.
pub const GENERIC_INDEX: &str = "generic";

/// Remote status code for an unauthenticated session.
pub const UNAUTHENTICATED_CODE: i64 = 16;

/// HTTP status carried by error elements for an expired session.
pub const HTTP_UNAUTHORIZED: i64 = 401;

/// One element of a response chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseElement {
    /// An RPC reply.
    Reply(Reply),
    /// An error element.
    Error(ErrorElement),
    /// Framing or keepalive data.
    Framing(String),
    /// An element of unknown kind, or a known kind with an unusable shape.
    Unknown(String),
}

/// Body of an RPC reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// JSON-encoded payload string.
    Payload(String),
    /// The remote service flagged the call as failed.
    Failed(RemoteError),
    /// Neither payload nor error.
    Empty,
}

/// A `wrb.fr` element.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: String,
    /// 1-based position of the call, when the service numbered it.
    pub index: Option<usize>,
    pub body: ReplyBody,
}

/// An `er` element.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorElement {
    /// Endpoint the error belongs to; `None` when it covers the envelope.
    pub id: Option<String>,
    pub index: Option<usize>,
    pub error: RemoteError,
}

impl ResponseElement {
    /// Classifies one element array.
    pub fn parse(element: &Value) -> Self {
        let Some(items) = element.as_array() else {
            return Self::Unknown(String::new());
        };
        let Some(tag) = items.first().and_then(Value::as_str) else {
            return Self::Unknown(String::new());
        };

        match tag {
            REPLY_TAG => match parse_reply(items) {
                Some(reply) => Self::Reply(reply),
                None => Self::Unknown(tag.to_string()),
            },
            ERROR_TAG => Self::Error(parse_error(items)),
            t if FRAMING_TAGS.contains(&t) => Self::Framing(t.to_string()),
            t => Self::Unknown(t.to_string()),
        }
    }

    /// Classifies every element of a chunk.
    ///
    /// A chunk normally holds a list of elements; a chunk that is itself a
    /// single element is accepted too.
    pub fn from_chunk(chunk: &Value) -> Vec<Self> {
        let Some(items) = chunk.as_array() else {
            return Vec::new();
        };
        if items.first().is_some_and(Value::is_string) {
            return vec![Self::parse(chunk)];
        }
        items.iter().map(Self::parse).collect()
    }

    /// Whether this element reports an expired session.
    pub fn signals_auth_expired(&self) -> bool {
        match self {
            Self::Reply(Reply {
                body: ReplyBody::Failed(error),
                ..
            }) => error.code == Some(UNAUTHENTICATED_CODE),
            Self::Error(element) => matches!(
                element.error.code,
                Some(UNAUTHENTICATED_CODE) | Some(HTTP_UNAUTHORIZED)
            ),
            _ => false,
        }
    }
}

// ["wrb.fr", id, payload | null, null, null, [code, message?] | null, index]
fn parse_reply(items: &[Value]) -> Option<Reply> {
    let id = items.get(1)?.as_str()?.to_string();

    let body = match items.get(2) {
        Some(Value::String(payload)) => ReplyBody::Payload(payload.clone()),
        _ => match items.get(5).and_then(status_error) {
            Some(error) => ReplyBody::Failed(error),
            None => ReplyBody::Empty,
        },
    };

    Some(Reply {
        id,
        index: items.last().and_then(index_field),
        body,
    })
}

fn parse_error(items: &[Value]) -> ErrorElement {
    let id = items.get(1).and_then(Value::as_str).map(str::to_string);
    let rest = items.get(2..).unwrap_or_default();

    let code = rest.iter().find_map(Value::as_i64);
    let message = rest
        .iter()
        .filter_map(Value::as_str)
        .find(|s| *s != GENERIC_INDEX && s.parse::<usize>().is_err())
        .unwrap_or("remote error");

    ErrorElement {
        id,
        index: items.last().and_then(index_field),
        error: RemoteError::new(code, message),
    }
}

fn status_error(status: &Value) -> Option<RemoteError> {
    let fields = status.as_array()?;
    let code = fields.first()?.as_i64()?;
    let message = fields
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("call failed");
    Some(RemoteError::new(Some(code), message))
}

fn index_field(value: &Value) -> Option<usize> {
    value
        .as_str()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|index| *index > 0)
}
