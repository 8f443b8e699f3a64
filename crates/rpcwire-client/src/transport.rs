//! HTTP exchange for one envelope.
//!
//! The transport retries transient failures (connection errors, HTTP 429,
//! HTTP 5xx) with exponential backoff, honouring `Retry-After` on rate
//! limits. Once any response body has been read it stops retrying: the
//! service may already have acted on the calls.
//!
//! When the service rejects the session, the transport asks the
//! [`CredentialManager`] for a fresh credential and resends exactly once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use rpcwire_core::{CallResult, Credential};
use rpcwire_protocol::{
    DecodedResponse, Envelope, ResponseDecoder, SessionParams, Sha256SignatureV1, SignatureScheme,
};
use tracing::{debug, warn};
use url::Url;

use crate::auth::CredentialManager;
use crate::config::{ClientConfig, RetryConfig, describe_backoff};
use crate::error::{RpcError, RpcResult, TransportError};

/// Sends envelopes to the batch endpoint.
#[derive(Debug, Clone)]
pub struct RetryingTransport {
    http_client: reqwest::Client,
    endpoint: Url,
    params: SessionParams,
    retry: RetryConfig,
    signer: Arc<dyn SignatureScheme>,
}

impl RetryingTransport {
    /// Creates a transport for the endpoint described by `config`.
    pub fn new(config: &ClientConfig) -> RpcResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| RpcError::Config(format!("failed to create HTTP client: {}", e)))?;
        let endpoint = config.batch_url()?;

        debug!(
            endpoint = %endpoint,
            max_attempts = config.retry.max_attempts,
            backoff = %describe_backoff(&config.retry),
            "transport configured"
        );

        Ok(Self {
            http_client,
            endpoint,
            params: config.session_params(),
            retry: config.retry.clone(),
            signer: Arc::new(Sha256SignatureV1),
        })
    }

    /// Builder: replace the request signature scheme.
    pub fn with_signer(mut self, signer: Arc<dyn SignatureScheme>) -> Self {
        self.signer = signer;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends `envelope` and returns one result per call, in call order.
    pub async fn execute(
        &self,
        envelope: &Envelope,
        credentials: &CredentialManager,
    ) -> RpcResult<Vec<CallResult>> {
        let credential = credentials.credential().await?;

        let (used, outcome) = self.send_with_retry(envelope, credentials, credential).await;
        match outcome {
            Ok(decoded) if !decoded.auth_expired() => return Ok(decoded.into_results()),
            Ok(_) => debug!(rpcids = %envelope.rpc_ids(), "response signalled expired session"),
            Err(e) if is_unauthorized(&e) => debug!(rpcids = %envelope.rpc_ids(), "request unauthorized"),
            Err(e) => return Err(e),
        }

        let fresh = credentials.refresh(&used).await?;
        let (_, outcome) = self.send_with_retry(envelope, credentials, fresh).await;
        match outcome {
            Ok(decoded) if !decoded.auth_expired() => Ok(decoded.into_results()),
            Ok(_) => Err(RpcError::AuthExpired(
                "session still rejected after refreshing credentials".into(),
            )),
            Err(e) if is_unauthorized(&e) => Err(RpcError::AuthExpired(
                "request still unauthorized after refreshing credentials".into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Sends with retries. Returns the outcome together with the credential
    /// the last attempt was sent with.
    ///
    /// Each retry picks up a credential committed by a refresh during the
    /// backoff.
    async fn send_with_retry(
        &self,
        envelope: &Envelope,
        credentials: &CredentialManager,
        mut credential: Arc<Credential>,
    ) -> (Arc<Credential>, RpcResult<DecodedResponse>) {
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                if let Some(latest) = credentials.current().filter(|c| !Arc::ptr_eq(c, &credential)) {
                    debug!(attempt, "retrying with refreshed credential");
                    credential = latest;
                }
            }
            match self.send_once(envelope, &credential).await {
                Err(RpcError::Transport(e)) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, e.retry_after());
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying envelope"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return (credential, result),
            }
        }
    }

    async fn send_once(
        &self,
        envelope: &Envelope,
        credential: &Credential,
    ) -> RpcResult<DecodedResponse> {
        let request = envelope.encode(credential, &self.params, self.signer.as_ref())?;
        debug!(
            rpcids = %envelope.rpc_ids(),
            calls = envelope.len(),
            reqid = request.request_id,
            "sending envelope"
        );

        let mut builder = self
            .http_client
            .post(self.endpoint.clone())
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }

        let mut response = builder.body(request.body).send().await.map_err(|e| {
            if e.is_builder() {
                RpcError::Config(format!("invalid request: {}", e))
            } else {
                TransportError::Network(e).into()
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                retry_after: retry_after(status, response.headers()),
            }
            .into());
        }

        let mut decoder = ResponseDecoder::new();
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => decoder.feed(&bytes)?,
                Ok(None) => break,
                Err(e) if decoder.bytes_fed() == 0 => return Err(TransportError::Network(e).into()),
                Err(source) => {
                    return Err(TransportError::PartialBody {
                        consumed: decoder.bytes_fed(),
                        source,
                    }
                    .into());
                }
            }
        }

        debug!(bytes = decoder.bytes_fed(), "response received");
        Ok(decoder.finish(envelope.calls())?)
    }
}

fn is_unauthorized(error: &RpcError) -> bool {
    matches!(
        error,
        RpcError::Transport(TransportError::Status { status: 401, .. })
    )
}

/// Parses `Retry-After` as whole seconds on rate-limit and server errors.
fn retry_after(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
        return None;
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(retry_after: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static(retry_after));
        headers
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            retry_after(StatusCode::TOO_MANY_REQUESTS, &headers("7")),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            retry_after(StatusCode::SERVICE_UNAVAILABLE, &headers(" 2 ")),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn retry_after_ignored() {
        // HTTP dates are not supported.
        assert_eq!(
            retry_after(
                StatusCode::TOO_MANY_REQUESTS,
                &headers("Wed, 21 Oct 2015 07:28:00 GMT")
            ),
            None
        );
        assert_eq!(retry_after(StatusCode::BAD_REQUEST, &headers("5")), None);
        assert_eq!(retry_after(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new()), None);
    }

    #[test]
    fn endpoint_from_config() {
        let config = ClientConfig::new("https://example.com").with_app("SomeApp");
        let transport = RetryingTransport::new(&config).unwrap();
        assert_eq!(
            transport.endpoint().as_str(),
            "https://example.com/_/SomeApp/data/batchexecute"
        );
    }

    #[test]
    fn unauthorized_detection() {
        let unauthorized: RpcError = TransportError::Status {
            status: 401,
            retry_after: None,
        }
        .into();
        assert!(is_unauthorized(&unauthorized));

        let forbidden: RpcError = TransportError::Status {
            status: 403,
            retry_after: None,
        }
        .into();
        assert!(!is_unauthorized(&forbidden));
        assert!(!is_unauthorized(&RpcError::AuthExpired("x".into())));
    }
}
