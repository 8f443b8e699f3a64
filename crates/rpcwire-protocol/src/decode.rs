//! Response decoding and call correlation.

use rpcwire_core::{Call, CallResult, RemoteError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DecodeError, DecodeResult};
use crate::framing::ChunkDecoder;
use crate::types::{ErrorElement, Reply, ReplyBody, ResponseElement};

/// Decoded response of one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    results: Vec<CallResult>,
    auth_expired: bool,
}

impl DecodedResponse {
    /// One result per call, in call order.
    pub fn results(&self) -> &[CallResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<CallResult> {
        self.results
    }

    /// Whether the service reported the session as expired.
    pub fn auth_expired(&self) -> bool {
        self.auth_expired
    }
}

/// Streaming decoder for one envelope's response.
///
/// Feed body bytes as they arrive, then call [`finish`](Self::finish) with
/// the calls that were sent.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    chunks: ChunkDecoder,
    elements: Vec<ResponseElement>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more body bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> DecodeResult<()> {
        for chunk in self.chunks.feed(bytes)? {
            self.elements.extend(ResponseElement::from_chunk(&chunk));
        }
        Ok(())
    }

    /// Total bytes fed so far.
    pub fn bytes_fed(&self) -> usize {
        self.chunks.bytes_fed()
    }

    /// Ends the stream and correlates replies with `calls`.
    pub fn finish(mut self, calls: &[Call]) -> DecodeResult<DecodedResponse> {
        for chunk in self.chunks.finish()? {
            self.elements.extend(ResponseElement::from_chunk(&chunk));
        }
        correlate(self.elements, calls)
    }
}

/// Decodes a fully buffered response body.
pub fn decode_response(body: &[u8], calls: &[Call]) -> DecodeResult<DecodedResponse> {
    let mut decoder = ResponseDecoder::new();
    decoder.feed(body)?;
    decoder.finish(calls)
}

fn correlate(elements: Vec<ResponseElement>, calls: &[Call]) -> DecodeResult<DecodedResponse> {
    let mut slots: Vec<Option<CallResult>> = vec![None; calls.len()];
    let mut envelope_error: Option<RemoteError> = None;
    let mut auth_expired = false;

    for element in elements {
        auth_expired |= element.signals_auth_expired();

        match element {
            ResponseElement::Reply(Reply { id, index, body }) => {
                let Some(slot) = find_slot(&slots, calls, &id, index) else {
                    warn!(id = %id, ?index, "ignoring reply with no matching call");
                    continue;
                };
                slots[slot] = Some(reply_result(slot, id, body));
            }
            ResponseElement::Error(ErrorElement {
                id: Some(id),
                index,
                error,
            }) => match find_slot(&slots, calls, &id, index) {
                Some(slot) => slots[slot] = Some(CallResult::err(slot, id, error)),
                None => warn!(id = %id, ?index, "ignoring error with no matching call"),
            },
            ResponseElement::Error(ErrorElement { id: None, error, .. }) => {
                debug!(%error, "envelope-level error");
                envelope_error.get_or_insert(error);
            }
            ResponseElement::Framing(_) => {}
            ResponseElement::Unknown(tag) => {
                debug!(tag = %tag, "skipping unrecognized element");
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| match (slot, &envelope_error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Ok(CallResult::err(index, calls[index].id(), error.clone())),
            (None, None) => Err(DecodeError::MissingResult {
                index,
                id: calls[index].id().to_string(),
            }),
        })
        .collect::<DecodeResult<Vec<_>>>()
        .map(|results| DecodedResponse {
            results,
            auth_expired,
        })
}

/// Numbered replies go to their position when the id agrees; otherwise the
/// first unresolved call with the same id takes it.
fn find_slot(
    slots: &[Option<CallResult>],
    calls: &[Call],
    id: &str,
    index: Option<usize>,
) -> Option<usize> {
    if let Some(position) = index.map(|i| i - 1) {
        if calls.get(position).is_some_and(|c| c.id() == id) {
            if slots[position].is_none() {
                return Some(position);
            }
            warn!(id, index = position + 1, "duplicate reply");
            return None;
        }
    }

    calls
        .iter()
        .zip(slots)
        .position(|(call, slot)| slot.is_none() && call.id() == id)
}

fn reply_result(index: usize, id: String, body: ReplyBody) -> CallResult {
    match body {
        ReplyBody::Payload(payload) => match serde_json::from_str::<Value>(&payload) {
            Ok(data) => CallResult::ok(index, id, data),
            Err(e) => {
                warn!(id = %id, error = %e, "reply payload is not JSON");
                CallResult::err(index, id, RemoteError::new(None, format!("undecodable payload: {e}")))
            }
        },
        ReplyBody::Failed(error) => CallResult::err(index, id, error),
        ReplyBody::Empty => CallResult::ok(index, id, Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{XSSI_PREFIX, encode_chunk};
    use serde_json::json;

    fn response(chunks: &[Value]) -> Vec<u8> {
        let mut out = format!("{XSSI_PREFIX}\n\n");
        for chunk in chunks {
            out.push_str(&encode_chunk(&chunk.to_string()));
        }
        out.push_str("garbage after the end");
        out.into_bytes()
    }

    fn reply(id: &str, payload: &Value) -> Value {
        json!(["wrb.fr", id, payload.to_string(), null, null, null, "generic"])
    }

    fn calls(ids: &[&str]) -> Vec<Call> {
        ids.iter().map(|id| Call::new(*id, vec![])).collect()
    }

    #[test]
    fn ok_error_ok() {
        let calls = calls(&["a", "b", "c"]);
        let body = response(&[
            json!([reply("a", &json!({"n": 1}))]),
            json!([["wrb.fr", "b", null, null, null, [5, "not found"], "generic"]]),
            json!([reply("c", &json!([3])), ["di", 12], ["af.httprm", 11, "-1", 4]]),
            json!([["e", 4, null, null, 321]]),
        ]);

        let decoded = decode_response(&body, &calls).unwrap();
        let results = decoded.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], CallResult::ok(0, "a", json!({"n": 1})));
        assert_eq!(
            results[1],
            CallResult::err(1, "b", RemoteError::new(Some(5), "not found"))
        );
        assert_eq!(results[2], CallResult::ok(2, "c", json!([3])));
        assert!(!decoded.auth_expired());
    }

    #[test]
    fn order_follows_calls_not_replies() {
        let calls = calls(&["a", "b"]);
        let body = response(&[json!([reply("b", &json!(2)), reply("a", &json!(1))])]);

        let results = decode_response(&body, &calls).unwrap().into_results();
        assert_eq!(results[0], CallResult::ok(0, "a", json!(1)));
        assert_eq!(results[1], CallResult::ok(1, "b", json!(2)));
    }

    #[test]
    fn repeated_ids_resolve_in_order() {
        let calls = calls(&["a", "a"]);
        let body = response(&[json!([reply("a", &json!("first")), reply("a", &json!("second"))])]);

        let results = decode_response(&body, &calls).unwrap().into_results();
        assert_eq!(results[0].data(), Some(&json!("first")));
        assert_eq!(results[1].data(), Some(&json!("second")));
    }

    #[test]
    fn numbered_replies_use_index() {
        let calls = calls(&["a", "a"]);
        let body = response(&[json!([
            ["wrb.fr", "a", "\"second\"", null, null, null, "2"],
            ["wrb.fr", "a", "\"first\"", null, null, null, "1"],
        ])]);

        let results = decode_response(&body, &calls).unwrap().into_results();
        assert_eq!(results[0].data(), Some(&json!("first")));
        assert_eq!(results[1].data(), Some(&json!("second")));
    }

    #[test]
    fn bad_payload_does_not_affect_siblings() {
        let calls = calls(&["a", "b"]);
        let body = response(&[json!([
            ["wrb.fr", "a", "{not json", null, null, null, "generic"],
            reply("b", &json!(true)),
        ])]);

        let results = decode_response(&body, &calls).unwrap().into_results();
        assert!(results[0].error().unwrap().message.starts_with("undecodable payload"));
        assert_eq!(results[1].data(), Some(&json!(true)));
    }

    #[test]
    fn missing_reply_is_decode_error() {
        let calls = calls(&["a", "b"]);
        let body = response(&[json!([reply("a", &json!(1))])]);

        let err = decode_response(&body, &calls).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MissingResult {
                index: 1,
                id: "b".into()
            }
        );
    }

    #[test]
    fn unmatched_and_duplicate_replies_are_ignored() {
        let calls = calls(&["a"]);
        let body = response(&[json!([
            reply("a", &json!(1)),
            reply("zzz", &json!(2)),
            ["wrb.fr", "a", "3", null, null, null, "1"],
        ])]);

        let results = decode_response(&body, &calls).unwrap().into_results();
        assert_eq!(results, vec![CallResult::ok(0, "a", json!(1))]);
    }

    #[test]
    fn envelope_error_fills_unresolved_calls() {
        let calls = calls(&["a", "b"]);
        let body = response(&[json!([
            reply("a", &json!(1)),
            ["er", null, null, null, null, 401, "generic"],
        ])]);

        let decoded = decode_response(&body, &calls).unwrap();
        assert!(decoded.auth_expired());
        assert_eq!(decoded.results()[0].data(), Some(&json!(1)));
        assert_eq!(decoded.results()[1].error().unwrap().code, Some(401));
    }

    #[test]
    fn unauthenticated_reply_flags_auth_expired() {
        let calls = calls(&["a"]);
        let body = response(&[json!([["wrb.fr", "a", null, null, null, [16], "generic"]])]);

        let decoded = decode_response(&body, &calls).unwrap();
        assert!(decoded.auth_expired());
        assert!(!decoded.results()[0].is_ok());
    }

    #[test]
    fn truncated_response_is_decode_error() {
        let calls = calls(&["a"]);
        let mut body = format!("{XSSI_PREFIX}\n120\n").into_bytes();
        body.extend(std::iter::repeat_n(b' ', 80));

        let err = decode_response(&body, &calls).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                expected: 120,
                available: 80
            }
        );
    }

    #[test]
    fn boundary_insensitive() {
        let calls = calls(&["a", "b", "c"]);
        let body = response(&[
            json!([reply("a", &json!({"text": "multi\nline \"quoted\" ünïcode"}))]),
            json!([["wrb.fr", "b", null, null, null, [3], "generic"], ["di", 40]]),
            json!([reply("c", &json!([[1, 2], [3, [4, 5]]]))]),
        ]);
        let expected = decode_response(&body, &calls).unwrap();

        for split in 0..=body.len() {
            let mut decoder = ResponseDecoder::new();
            decoder.feed(&body[..split]).unwrap();
            decoder.feed(&body[split..]).unwrap();
            assert_eq!(decoder.bytes_fed(), body.len());
            assert_eq!(decoder.finish(&calls).unwrap(), expected, "split at {split}");
        }
    }
}
