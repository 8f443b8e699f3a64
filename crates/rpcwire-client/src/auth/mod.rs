//! Credential lifecycle.
//!
//! The [`CredentialManager`] owns the current [`Credential`] and replaces it
//! when it goes stale. Readers take cheap `Arc` snapshots and never wait on
//! a refresh in progress; requests already in flight keep the snapshot they
//! started with.
//!
//! ```text
//! Uninitialized ──► Refreshing ──► Active ◄──┐
//!                       │            │       │
//!                       ▼            ▼       │
//!                    Failed ──► Refreshing ──┘
//! ```
//!
//! Refreshes are single-flight: callers that ask for a refresh while one is
//! running wait for it and share its outcome instead of starting another.

mod refresher;
mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rpcwire_core::Credential;
use tracing::{error, info, warn};

pub use refresher::{
    BoxFuture, CredentialRefresher, HomepageRefresher, PageTokens, SIGN_IN_HOST,
    parse_page_tokens,
};
pub use task::{RefreshStrategy, RefreshTask};

use crate::error::{RpcError, RpcResult};

/// Lifecycle state of the managed credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialState {
    /// No credential has been obtained yet.
    #[default]
    Uninitialized,
    /// A credential is in use.
    Active,
    /// A refresh is running; the previous credential, if any, stays in use.
    Refreshing,
    /// The last refresh failed; the previous credential, if any, stays in use.
    Failed,
}

/// Refresh bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    pub state: CredentialState,
    /// Completed refresh attempts, successful or not.
    pub attempts: u64,
    pub consecutive_failures: u32,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RefreshStatus {
    fn record_start(&mut self) {
        self.state = CredentialState::Refreshing;
    }

    fn record_success(&mut self) {
        self.state = CredentialState::Active;
        self.attempts += 1;
        self.consecutive_failures = 0;
        self.last_refresh = Some(Utc::now());
        self.last_error = None;
    }

    fn record_failure(&mut self, error: impl Into<String>) {
        self.state = CredentialState::Failed;
        self.attempts += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
    }
}

/// What triggered a refresh, for logs.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Initial,
    OnDemand,
    Scheduled,
}

/// Owns the current credential and refreshes it.
pub struct CredentialManager {
    current: RwLock<Option<Arc<Credential>>>,
    cookies: RwLock<String>,
    status: Mutex<RefreshStatus>,
    refresher: Arc<dyn CredentialRefresher>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresher_calls: AtomicU64,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("refresher", &self.refresher.name())
            .field("status", &self.status())
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Creates a manager that will obtain its first credential from
    /// `cookies` on first use.
    pub fn new(cookies: impl Into<String>, refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            current: RwLock::new(None),
            cookies: RwLock::new(cookies.into()),
            status: Mutex::new(RefreshStatus::default()),
            refresher,
            refresh_lock: tokio::sync::Mutex::new(()),
            refresher_calls: AtomicU64::new(0),
        }
    }

    /// Creates a manager that starts with `credential`.
    pub fn with_credential(credential: Credential, refresher: Arc<dyn CredentialRefresher>) -> Self {
        let manager = Self::new(credential.cookies.clone(), refresher);
        *manager.write_current() = Some(Arc::new(credential));
        manager.lock_status().state = CredentialState::Active;
        manager
    }

    /// Current credential snapshot, without waiting.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> CredentialState {
        self.lock_status().state
    }

    pub fn status(&self) -> RefreshStatus {
        self.lock_status().clone()
    }

    /// Number of times the refresher has been invoked.
    pub fn refresher_calls(&self) -> u64 {
        self.refresher_calls.load(Ordering::Relaxed)
    }

    /// Current credential, obtaining the first one if needed.
    pub async fn credential(&self) -> RpcResult<Arc<Credential>> {
        if let Some(credential) = self.current() {
            return Ok(credential);
        }
        self.single_flight(None, Trigger::Initial).await
    }

    /// Replaces `stale` after the service rejected it.
    ///
    /// Returns the newer credential without refreshing if another caller
    /// already replaced `stale`.
    pub async fn refresh(&self, stale: &Arc<Credential>) -> RpcResult<Arc<Credential>> {
        self.single_flight(Some(stale), Trigger::OnDemand).await
    }

    /// Refresh run by the background task.
    pub(crate) async fn refresh_scheduled(&self) -> RpcResult<Arc<Credential>> {
        self.single_flight(None, Trigger::Scheduled).await
    }

    async fn single_flight(
        &self,
        stale: Option<&Arc<Credential>>,
        trigger: Trigger,
    ) -> RpcResult<Arc<Credential>> {
        let seen_attempts = self.lock_status().attempts;
        let _guard = self.refresh_lock.lock().await;

        // A refresh completed while this caller waited: share its outcome.
        let status = self.status();
        if status.attempts != seen_attempts {
            return match (status.state, self.current()) {
                (CredentialState::Active, Some(credential)) => Ok(credential),
                _ => Err(RpcError::AuthExpired(format!(
                    "credential refresh failed: {}",
                    status.last_error.unwrap_or_default()
                ))),
            };
        }

        let current = self.current();
        if let (Some(stale), Some(current)) = (stale, &current) {
            if !Arc::ptr_eq(stale, current) {
                return Ok(current.clone());
            }
        }
        if matches!(trigger, Trigger::Initial) {
            if let Some(current) = current {
                return Ok(current);
            }
        }

        self.run_refresh(trigger).await
    }

    async fn run_refresh(&self, trigger: Trigger) -> RpcResult<Arc<Credential>> {
        let cookies = self
            .cookies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.lock_status().record_start();
        self.refresher_calls.fetch_add(1, Ordering::Relaxed);
        info!(?trigger, refresher = self.refresher.name(), "refreshing credentials");

        match self.refresher.refresh(&cookies).await {
            Ok(credential) => {
                let credential = Arc::new(credential);
                *self.cookies.write().unwrap_or_else(PoisonError::into_inner) =
                    credential.cookies.clone();
                *self.write_current() = Some(credential.clone());
                self.lock_status().record_success();
                info!(
                    ?trigger,
                    expires_at = ?credential.expires_at,
                    "credentials refreshed"
                );
                Ok(credential)
            }
            Err(e) => {
                let mut status = self.lock_status();
                status.record_failure(e.to_string());
                let keeps_previous = self.current().is_some();
                if matches!(trigger, Trigger::Scheduled) && keeps_previous {
                    warn!(
                        ?trigger,
                        error = %e,
                        failures = status.consecutive_failures,
                        "credential refresh failed, keeping previous credential"
                    );
                } else {
                    error!(
                        ?trigger,
                        error = %e,
                        failures = status.consecutive_failures,
                        keeps_previous,
                        "credential refresh failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn write_current(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Credential>>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, RefreshStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
