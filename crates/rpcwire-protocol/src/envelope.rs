//! Request envelope encoding.

use rpcwire_core::{Call, Credential};
use serde_json::{Value, json};
use url::form_urlencoded;

use crate::error::{ProtocolError, ProtocolResult};
use crate::signature::{SIGNATURE_HEADER, SignatureScheme};
use crate::types::GENERIC_INDEX;

/// Content type of the form-encoded request body.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";

/// Path of the batch endpoint for an application.
pub fn batch_path(app: &str) -> String {
    format!("/_/{app}/data/batchexecute")
}

/// Per-deployment request parameters that do not change between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Opaque build label (`bl`).
    pub build_label: String,
    /// Interface language (`hl`).
    pub locale: String,
    /// Signed-in account index (`authuser`), omitted when zero.
    pub user_index: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            build_label: String::new(),
            locale: "en".to_string(),
            user_index: 0,
        }
    }
}

/// A batch of calls sharing one routing context.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    calls: Vec<Call>,
    context: String,
}

impl Envelope {
    /// Groups `calls` into an envelope.
    ///
    /// # Errors
    ///
    /// Fails when `calls` is empty or the calls route to different contexts.
    pub fn new(calls: Vec<Call>) -> ProtocolResult<Self> {
        let first = calls.first().ok_or(ProtocolError::EmptyEnvelope)?;
        let context = first.routing_context().to_string();

        if let Some(other) = calls.iter().find(|c| c.routing_context() != context) {
            return Err(ProtocolError::MixedContext {
                first: context,
                other: other.routing_context().to_string(),
            });
        }

        Ok(Self { calls, context })
    }

    /// The calls, in submission order.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Routing context shared by every call.
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Distinct endpoint ids, comma-joined in first-seen order.
    pub fn rpc_ids(&self) -> String {
        let mut ids: Vec<&str> = Vec::with_capacity(self.calls.len());
        for call in &self.calls {
            if !ids.contains(&call.id()) {
                ids.push(call.id());
            }
        }
        ids.join(",")
    }

    /// Serializes the calls into the `f.req` field.
    pub fn f_req(&self) -> ProtocolResult<String> {
        let tuples = self
            .calls
            .iter()
            .map(|call| {
                let args = serde_json::to_string(call.args())?;
                Ok(json!([call.id(), args, Value::Null, GENERIC_INDEX]))
            })
            .collect::<ProtocolResult<Vec<Value>>>()?;

        Ok(serde_json::to_string(&json!([tuples]))?)
    }

    /// Encodes the envelope for `credential`, consuming one request id.
    pub fn encode(
        &self,
        credential: &Credential,
        params: &SessionParams,
        signer: &dyn SignatureScheme,
    ) -> ProtocolResult<EncodedRequest> {
        let f_req = self.f_req()?;
        let request_id = credential.next_request_id();

        let mut body = form_urlencoded::Serializer::new(String::new())
            .append_pair("f.req", &f_req)
            .append_pair("at", &credential.token)
            .finish();
        body.push('&');

        let mut query = vec![
            ("rpcids", self.rpc_ids()),
            ("source-path", self.context.clone()),
            ("bl", params.build_label.clone()),
            ("f.sid", credential.session_id.clone()),
            ("hl", params.locale.clone()),
            ("_reqid", request_id.to_string()),
            ("rt", "c".to_string()),
        ];
        if params.user_index != 0 {
            query.push(("authuser", params.user_index.to_string()));
        }

        let headers = vec![
            ("Cookie", credential.cookies.clone()),
            ("Content-Type", FORM_CONTENT_TYPE.to_string()),
            ("X-Same-Domain", "1".to_string()),
            (SIGNATURE_HEADER, signer.sign(&credential.session_id, &f_req)),
        ];

        Ok(EncodedRequest {
            request_id,
            f_req,
            body,
            query,
            headers,
        })
    }
}

/// Wire form of one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    /// Counter value sent as `_reqid`.
    pub request_id: u64,
    /// Unencoded `f.req` payload.
    pub f_req: String,
    /// Form-encoded request body.
    pub body: String,
    pub query: Vec<(&'static str, String)>,
    pub headers: Vec<(&'static str, String)>,
}

impl EncodedRequest {
    /// Looks up a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
