//! End-to-end tests for `RpcClient` against a mock batch endpoint.
//!
//! Coverage:
//! - request layout: query parameters, headers, form body
//! - retries: 5xx and 429 retried, other 4xx, decode failures and
//!   interrupted bodies not
//! - auth: 401 and in-body session expiry trigger one refresh and one resend
//! - routing contexts split into separate envelopes, results stay in order
//! - quotas fail before any traffic

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rpcwire_client::{
    Call, ClientConfig, Credential, QuotaRule, QuotaWindow, RefreshConfig, RefreshMode,
    RetryConfig, RpcClient, RpcError, RpcErrorCode, TransportError,
};
use rpcwire_protocol::{DecodeError, XSSI_PREFIX, encode_chunk};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BATCH_PATH: &str = "/_/LabsTailwindUi/data/batchexecute";

const HOMEPAGE: &str = r#"<html><script>window.WIZ_global_data = {"FdrFJe":"-99","SNlM0e":"fresh-token","qwAQke":"LabsTailwindUi"};</script></html>"#;

// ============================================================================
// Helpers
// ============================================================================

fn config(server: &MockServer) -> ClientConfig {
    config_at(server.uri())
}

fn config_at(base_url: impl Into<String>) -> ClientConfig {
    ClientConfig::new(base_url)
        .with_build_label("boq_test")
        .with_retry(
            RetryConfig::new(3).with_backoff(
                Duration::from_millis(1),
                Duration::from_millis(10),
                2.0,
            ),
        )
        .with_refresh(RefreshConfig {
            mode: RefreshMode::Disabled,
            ..Default::default()
        })
}

fn client(server: &MockServer) -> RpcClient {
    let credential = Credential::new("stale-token", "SID=abc", "-42");
    RpcClient::new(config(server), credential).unwrap()
}

fn reply(id: &str, payload: Value) -> Value {
    json!(["wrb.fr", id, payload.to_string(), null, null, null, "generic"])
}

fn failed(id: &str, code: i64, message: &str) -> Value {
    json!(["wrb.fr", id, null, null, null, [code, message], "generic"])
}

fn body(elements: &[Value]) -> String {
    let mut out = format!("{XSSI_PREFIX}\n\n");
    for element in elements {
        out.push_str(&encode_chunk(&json!([element]).to_string()));
    }
    out.push_str(&encode_chunk(r#"[["di",42],["af.httprm",41,"-1",7]]"#));
    out
}

fn ok(elements: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(body(elements))
}

async fn mount_homepage(server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOMEPAGE))
        .expect(expected_calls)
        .mount(server)
        .await;
}

// ============================================================================
// Request layout and decoding
// ============================================================================

#[tokio::test]
async fn submit_sends_envelope_and_returns_ordered_results() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(query_param("rpcids", "wXbhsf,CCqFvf"))
        .and(query_param("source-path", "/"))
        .and(query_param("bl", "boq_test"))
        .and(query_param("f.sid", "-42"))
        .and(query_param("hl", "en"))
        .and(query_param("rt", "c"))
        .and(header("X-Same-Domain", "1"))
        .and(header("Cookie", "SID=abc"))
        .and(body_string_contains("at=stale-token"))
        .and(body_string_contains("f.req="))
        .respond_with(ok(&[
            reply("wXbhsf", json!([["notebook", 1]])),
            failed("CCqFvf", 5, "not found"),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let results = client
        .submit(vec![
            Call::new("wXbhsf", vec![Value::Null, json!(1)]),
            Call::new("CCqFvf", vec![json!("title")]),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].index, 0);
    assert_eq!(results[0].data(), Some(&json!([["notebook", 1]])));
    assert_eq!(results[1].index, 1);
    let error = results[1].error().unwrap();
    assert_eq!(error.code, Some(5));
    assert_eq!(error.message, "not found");
}

#[tokio::test]
async fn call_maps_remote_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[failed("CCqFvf", 3, "invalid argument")]))
        .mount(&server)
        .await;

    let err = client(&server)
        .call(Call::new("CCqFvf", vec![]))
        .await
        .unwrap_err();

    assert_eq!(err.code(), RpcErrorCode::RemoteCallFailed);
    assert!(matches!(err, RpcError::RemoteCall { ref id, code: Some(3), .. } if id == "CCqFvf"));
}

#[tokio::test]
async fn request_counter_advances_per_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(2)
        .mount(&server)
        .await;

    let credential = Credential::new("stale-token", "SID=abc", "-42").with_request_seed(1234);
    let client = RpcClient::new(config(&server), credential).unwrap();
    client.call(Call::new("a", vec![])).await.unwrap();
    client.call(Call::new("a", vec![])).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let reqids: Vec<String> = requests
        .iter()
        .map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "_reqid")
                .map(|(_, v)| v.into_owned())
                .unwrap()
        })
        .collect();
    assert_eq!(reqids, vec!["1234", "101234"]);
}

#[tokio::test]
async fn contexts_travel_in_separate_envelopes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(query_param("source-path", "/"))
        .respond_with(ok(&[reply("a", json!("first")), reply("c", json!("third"))]))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(query_param("source-path", "/notebook/7"))
        .respond_with(ok(&[reply("b", json!("second"))]))
        .expect(1)
        .mount(&server)
        .await;

    let results = client(&server)
        .submit(vec![
            Call::new("a", vec![]),
            Call::new("b", vec![]).with_context("/notebook/7"),
            Call::new("c", vec![]),
        ])
        .await
        .unwrap();

    let data: Vec<_> = results.iter().map(|r| r.data().cloned().unwrap()).collect();
    assert_eq!(data, vec![json!("first"), json!("second"), json!("third")]);
    let indexes: Vec<_> = results.iter().map(|r| r.index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(true))]))
        .expect(1)
        .mount(&server)
        .await;

    let value = client(&server).call(Call::new("a", vec![])).await.unwrap();
    assert_eq!(value, json!(true));
}

#[tokio::test]
async fn rate_limit_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(
        client(&server).call(Call::new("a", vec![])).await.unwrap(),
        json!(1)
    );
}

#[tokio::test]
async fn retry_uses_credential_refreshed_during_backoff() {
    let server = MockServer::start().await;
    mount_homepage(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=stale-token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=fresh-token"))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server).with_retry(
        RetryConfig::new(3)
            .with_backoff(Duration::from_millis(300), Duration::from_millis(300), 2.0)
            .with_jitter(0.0),
    );
    let credential = Credential::new("stale-token", "SID=abc", "-42");
    let client = Arc::new(RpcClient::new(config, credential).unwrap());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call(Call::new("a", vec![])).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stale = client.credential().unwrap();
    let fresh = client.credentials().refresh(&stale).await.unwrap();
    assert_eq!(fresh.token, "fresh-token");

    assert_eq!(pending.await.unwrap().unwrap(), json!(1));
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).call(Call::new("a", vec![])).await.unwrap_err();
    assert_eq!(err.code(), RpcErrorCode::ServerError);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).call(Call::new("a", vec![])).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportError::Status { status: 400, .. })
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn truncated_response_is_a_decode_error() {
    let server = MockServer::start().await;

    let mut truncated = format!("{XSSI_PREFIX}\n\n120\n");
    truncated.push_str(&"x".repeat(80));

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(truncated))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).call(Call::new("a", vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::Decode(DecodeError::Truncated { .. })));
    assert_eq!(err.code(), RpcErrorCode::DecodeFailed);
}

/// Serves every connection a chunked 200 response that stops after
/// `partial` and closes without the terminating chunk.
async fn serve_interrupted_body(partial: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = requests.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let head = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransfer-encoding: chunked\r\n\r\n";
                let chunk = format!("{:x}\r\n{}\r\n", partial.len(), partial);
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(chunk.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        }
    });

    (format!("http://{addr}"), requests)
}

/// Reads one request: headers, then `content-length` bytes of body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    loop {
        let n = socket.read(&mut scratch).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&scratch[..n]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + length {
            return;
        }
    }
}

#[tokio::test]
async fn interrupted_body_is_not_retried() {
    let partial = concat!(")]}'\n\n", "120\n[[\"wrb.fr\",\"a\",");
    let (base_url, requests) = serve_interrupted_body(partial).await;

    let credential = Credential::new("stale-token", "SID=abc", "-42");
    let client = RpcClient::new(config_at(base_url), credential).unwrap();

    let err = client.call(Call::new("a", vec![])).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportError::PartialBody { consumed, .. }) if consumed > 0
    ));
    assert_eq!(err.code(), RpcErrorCode::PartialBody);
    assert!(!err.is_retryable());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_reply_is_a_decode_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(1))]))
        .mount(&server)
        .await;

    let err = client(&server)
        .submit(vec![Call::new("a", vec![]), Call::new("b", vec![])])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Decode(DecodeError::MissingResult { index: 1, ref id }) if id == "b"
    ));
}

// ============================================================================
// Credential refresh
// ============================================================================

#[tokio::test]
async fn unauthorized_triggers_one_refresh() {
    let server = MockServer::start().await;
    mount_homepage(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=stale-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=fresh-token"))
        .and(query_param("f.sid", "-99"))
        .respond_with(ok(&[reply("a", json!("after refresh"))]))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let value = client.call(Call::new("a", vec![])).await.unwrap();

    assert_eq!(value, json!("after refresh"));
    assert_eq!(client.credentials().refresher_calls(), 1);
    assert_eq!(client.credential().unwrap().token, "fresh-token");
}

#[tokio::test]
async fn expired_session_in_body_triggers_refresh() {
    let server = MockServer::start().await;
    mount_homepage(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=stale-token"))
        .respond_with(ok(&[failed("a", 16, "unauthenticated")]))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=fresh-token"))
        .respond_with(ok(&[reply("a", json!(7))]))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(
        client(&server).call(Call::new("a", vec![])).await.unwrap(),
        json!(7)
    );
}

#[tokio::test]
async fn persistent_unauthorized_surfaces_auth_expired() {
    let server = MockServer::start().await;
    mount_homepage(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call(Call::new("a", vec![])).await.unwrap_err();

    assert!(matches!(err, RpcError::AuthExpired(_)));
    assert_eq!(client.credentials().refresher_calls(), 1);
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(HOMEPAGE)
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=stale-token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=fresh-token"))
        .respond_with(ok(&[reply("a", json!("ok"))]))
        .expect(5)
        .mount(&server)
        .await;

    let client = Arc::new(client(&server));
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call(Call::new("a", vec![])).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), json!("ok"));
    }
    assert_eq!(client.credentials().refresher_calls(), 1);
}

#[tokio::test]
async fn sign_in_redirect_means_cookies_expired() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{}/ServiceLogin?continue=x", server.uri())),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ServiceLogin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>Sign in</html>"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(0)
        .mount(&server)
        .await;

    let client = RpcClient::from_config(config(&server).with_cookies("SID=old")).unwrap();
    let err = client.call(Call::new("a", vec![])).await.unwrap_err();

    assert!(matches!(err, RpcError::AuthExpired(ref m) if m.contains("re-export")));
    assert!(client.credential().is_none());
}

#[tokio::test]
async fn start_obtains_initial_credential() {
    let server = MockServer::start().await;
    mount_homepage(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(body_string_contains("at=fresh-token"))
        .and(header("Cookie", "SID=from-config"))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(1)
        .mount(&server)
        .await;

    let client = RpcClient::from_config(config(&server).with_cookies("SID=from-config")).unwrap();
    assert!(client.credential().is_none());

    client.start().await.unwrap();
    assert_eq!(client.credential().unwrap().session_id, "-99");

    client.call(Call::new("a", vec![])).await.unwrap();
    client.dispose().await;
    assert!(matches!(
        client.call(Call::new("a", vec![])).await,
        Err(RpcError::Shutdown)
    ));
}

// ============================================================================
// Quotas
// ============================================================================

#[tokio::test]
async fn exhausted_quota_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ok(&[reply("a", json!(1))]))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server).with_quota(QuotaRule::new("audio", 1, QuotaWindow::Daily));
    let client = RpcClient::new(config, Credential::new("stale-token", "SID=abc", "-42")).unwrap();

    client
        .submit_metered("audio", vec![Call::new("a", vec![])])
        .await
        .unwrap();

    let err = client
        .submit_metered("audio", vec![Call::new("a", vec![])])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::QuotaExceeded { ref kind, limit: 1, resets_at: Some(_) } if kind == "audio"
    ));

    let usage = client.quota_usage("audio").unwrap();
    assert_eq!(usage.used, 1);
    assert_eq!(usage.remaining(), 0);
}
