//! Background credential refresh.
//!
//! A [`RefreshTask`] keeps the credential fresh ahead of expiry so request
//! paths rarely hit the on-demand refresh. It shares the manager's
//! single-flight lock, so a background refresh and an on-demand one never
//! run at the same time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rpcwire_core::{Credential, estimate_expiry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CredentialManager;
use crate::config::RetryConfig;

/// How long [`RefreshTask::stop`] waits before aborting the task.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// When the background task refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Refresh unconditionally every `interval`.
    TimeBased { interval: Duration },
    /// Refresh `margin` before the estimated expiry, checking every
    /// `check_interval`. Credentials without an expiry are assumed to live
    /// `session_ttl` from when they were obtained.
    ExpirationBased {
        margin: Duration,
        check_interval: Duration,
        session_ttl: chrono::Duration,
    },
}

impl RefreshStrategy {
    /// Whether `credential` should be replaced now.
    pub fn is_due(&self, credential: Option<&Credential>) -> bool {
        let Some(credential) = credential else {
            return true;
        };
        match *self {
            Self::TimeBased { interval } => credential.age().to_std().unwrap_or_default() >= interval,
            Self::ExpirationBased {
                margin,
                session_ttl,
                ..
            } => time_until_refresh(credential, margin, session_ttl).is_zero(),
        }
    }

    /// How long to sleep before the next check.
    pub fn next_delay(&self, credential: Option<&Credential>) -> Duration {
        match (*self, credential) {
            (_, None) => Duration::ZERO,
            (Self::TimeBased { interval }, Some(credential)) => {
                let age = credential.age().to_std().unwrap_or_default();
                interval.saturating_sub(age)
            }
            (
                Self::ExpirationBased {
                    margin,
                    check_interval,
                    session_ttl,
                },
                Some(credential),
            ) => time_until_refresh(credential, margin, session_ttl).min(check_interval),
        }
    }
}

fn time_until_refresh(credential: &Credential, margin: Duration, ttl: chrono::Duration) -> Duration {
    let expires_at = credential
        .expires_at
        .unwrap_or_else(|| estimate_expiry(&credential.session_id, credential.obtained_at, ttl));
    let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
    (expires_at - margin - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Handle to a running background refresh loop.
#[derive(Debug)]
pub struct RefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Spawns the refresh loop on the current runtime.
    ///
    /// Failed refreshes are logged and retried with `backoff`; the previous
    /// credential stays in use meanwhile.
    pub fn spawn(
        manager: Arc<CredentialManager>,
        strategy: RefreshStrategy,
        backoff: RetryConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(manager, strategy, backoff, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the loop, aborting it if a refresh does not finish promptly.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut self.handle).await.is_err() {
            warn!("credential refresh task did not stop in time, aborting");
            self.handle.abort();
        }
    }
}

/// A dropped handle never leaves the loop running detached.
impl Drop for RefreshTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!("refresh task handle dropped, aborting loop");
            self.handle.abort();
        }
    }
}

async fn run(
    manager: Arc<CredentialManager>,
    strategy: RefreshStrategy,
    backoff: RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(?strategy, "credential refresh task started");

    loop {
        let failures = manager.status().consecutive_failures;
        let delay = if failures > 0 {
            let retry = backoff.jittered_delay(failures);
            debug!(failures, delay_ms = retry.as_millis() as u64, "backing off after failed refresh");
            retry
        } else {
            strategy.next_delay(manager.current().as_deref())
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if failures == 0 && !strategy.is_due(manager.current().as_deref()) {
                    continue;
                }
                if let Err(e) = manager.refresh_scheduled().await {
                    warn!(error = %e, failures = failures + 1, "background credential refresh failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("credential refresh task stopped");
}
