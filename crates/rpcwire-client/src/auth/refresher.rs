//! Credential refresh sources.

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use rpcwire_core::{Credential, estimate_expiry};
use tracing::debug;
use url::Url;

use crate::error::{RpcError, RpcResult, TransportError};

/// A boxed future for async trait methods.
///
/// Keeps [`CredentialRefresher`] object-safe so the manager can hold any
/// implementation behind an `Arc<dyn _>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces a fresh [`Credential`] from the long-lived session cookies.
pub trait CredentialRefresher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Obtains a new credential for `cookies`.
    ///
    /// Must fail with [`RpcError::AuthExpired`] when the cookies themselves
    /// are no longer accepted, since retrying cannot fix that.
    fn refresh<'a>(&'a self, cookies: &'a str) -> BoxFuture<'a, RpcResult<Credential>>;
}

/// Host the service redirects to when cookies are no longer valid.
pub const SIGN_IN_HOST: &str = "accounts.google.com";

static CSRF_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""SNlM0e"\s*:\s*"([^"]+)""#).expect("Invalid CSRF token regex"));

static SESSION_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""FdrFJe"\s*:\s*"([^"]+)""#).expect("Invalid session id regex"));

/// Tokens embedded in the application homepage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTokens {
    pub csrf_token: String,
    pub session_id: String,
}

/// Extracts the anti-CSRF token and session id from homepage HTML.
pub fn parse_page_tokens(html: &str) -> Option<PageTokens> {
    let csrf_token = CSRF_TOKEN_REGEX.captures(html)?.get(1)?.as_str();
    let session_id = SESSION_ID_REGEX.captures(html)?.get(1)?.as_str();
    Some(PageTokens {
        csrf_token: csrf_token.to_string(),
        session_id: session_id.to_string(),
    })
}

/// Refreshes by loading the application homepage with the session cookies
/// and reading the tokens the page embeds for its own scripts.
#[derive(Debug, Clone)]
pub struct HomepageRefresher {
    http_client: reqwest::Client,
    homepage: Url,
    session_ttl: chrono::Duration,
}

impl HomepageRefresher {
    /// Creates a refresher for the application at `homepage`.
    pub fn new(homepage: Url, timeout: Duration) -> RpcResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            homepage,
            session_ttl: chrono::Duration::hours(1),
        })
    }

    /// Builder: set the assumed session lifetime.
    pub fn with_session_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    async fn fetch(&self, cookies: &str) -> RpcResult<Credential> {
        debug!(url = %self.homepage, "fetching homepage for fresh tokens");

        let response = self
            .http_client
            .get(self.homepage.clone())
            .header(reqwest::header::COOKIE, cookies)
            .send()
            .await
            .map_err(TransportError::Network)?;

        if is_sign_in(response.url()) {
            return Err(RpcError::AuthExpired(
                "redirected to sign-in; cookies expired, re-export required".into(),
            ));
        }

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::AuthExpired(format!(
                "homepage returned {}; cookies expired, re-export required",
                status
            )));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                retry_after: None,
            }
            .into());
        }

        let html = response.text().await.map_err(TransportError::Network)?;
        let tokens = parse_page_tokens(&html).ok_or_else(|| {
            RpcError::AuthExpired(
                "session tokens not found on homepage; cookies expired, re-export required".into(),
            )
        })?;

        let obtained_at = Utc::now();
        let expires_at = estimate_expiry(&tokens.session_id, obtained_at, self.session_ttl);
        Ok(
            Credential::new(tokens.csrf_token, cookies, tokens.session_id)
                .with_obtained_at(obtained_at)
                .with_expiry(expires_at),
        )
    }
}

impl CredentialRefresher for HomepageRefresher {
    fn name(&self) -> &str {
        "homepage"
    }

    fn refresh<'a>(&'a self, cookies: &'a str) -> BoxFuture<'a, RpcResult<Credential>> {
        Box::pin(self.fetch(cookies))
    }
}

fn is_sign_in(url: &Url) -> bool {
    url.host_str() == Some(SIGN_IN_HOST)
        || url.path().contains("ServiceLogin")
        || url.path().starts_with("/signin")
}
