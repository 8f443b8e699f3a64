//! Session credentials for the batch endpoint.
//!
//! A [`Credential`] bundles everything a request needs to prove session
//! identity: the cookie header, the anti-CSRF token (`at`) and the session id
//! (`f.sid`). It also owns the request counter (`_reqid`), which must grow
//! monotonically for as long as the credential set is live.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use rand::Rng as _;

/// Amount the request counter advances per request.
pub const REQUEST_ID_STEP: u64 = 100_000;

/// Monotonic per-credential request counter.
#[derive(Debug)]
pub struct RequestCounter {
    next: AtomicU64,
}

impl RequestCounter {
    /// Creates a counter starting at `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Creates a counter from a random four-digit seed, like a browser tab.
    pub fn random() -> Self {
        Self::new(rand::rng().random_range(1_000..10_000))
    }

    /// Returns the next request id. Never returns the same value twice.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(REQUEST_ID_STEP, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next_id`](Self::next_id) will produce.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// One set of session credentials.
pub struct Credential {
    /// Anti-CSRF token sent as the `at` form field.
    pub token: String,
    /// Cookie header value carrying the session identity.
    pub cookies: String,
    /// Session id sent as the `f.sid` query parameter.
    pub session_id: String,
    /// When this credential set was obtained.
    pub obtained_at: DateTime<Utc>,
    /// Strategy-specific expiry estimate, if one is known.
    pub expires_at: Option<DateTime<Utc>>,
    counter: RequestCounter,
}

impl Credential {
    /// Creates a credential obtained now, with no expiry estimate.
    pub fn new(
        token: impl Into<String>,
        cookies: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            cookies: cookies.into(),
            session_id: session_id.into(),
            obtained_at: Utc::now(),
            expires_at: None,
            counter: RequestCounter::random(),
        }
    }

    /// Builder: set the expiry estimate.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Builder: set when the credential was obtained.
    pub fn with_obtained_at(mut self, obtained_at: DateTime<Utc>) -> Self {
        self.obtained_at = obtained_at;
        self
    }

    /// Builder: seed the request counter (tests and replays).
    pub fn with_request_seed(mut self, seed: u64) -> Self {
        self.counter = RequestCounter::new(seed);
        self
    }

    /// Returns the next request id for an envelope sent with this credential.
    pub fn next_request_id(&self) -> u64 {
        self.counter.next_id()
    }

    /// Returns the request counter.
    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }

    /// Returns true once the expiry estimate has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Returns the time left until the expiry estimate, if known.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }

    /// Returns how long ago the credential was obtained.
    pub fn age(&self) -> Duration {
        Utc::now() - self.obtained_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &redact(&self.token))
            .field("cookies", &redact(&self.cookies))
            .field("session_id", &self.session_id)
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .field("next_request_id", &self.counter.peek())
            .finish()
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("<{} bytes>", secret.len())
    }
}

/// Estimates when a session expires.
///
/// The session id is an opaque server value with no embedded timestamp, so
/// the estimate is `obtained_at + ttl`. An empty session id means the page
/// did not hand out a session at all, which is treated as already expired.
pub fn estimate_expiry(session_id: &str, obtained_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    if session_id.trim().is_empty() {
        obtained_at
    } else {
        obtained_at + ttl
    }
}
