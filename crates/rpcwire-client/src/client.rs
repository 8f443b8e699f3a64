//! The [`RpcClient`] facade.
//!
//! Owns the transport, the credential manager, the quota tracker and the
//! background refresh task. Calls are grouped by routing context, each
//! group is sent as one envelope, and results come back in the order the
//! calls were submitted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::try_join_all;
use rpcwire_core::{Call, CallResult, Credential};
use rpcwire_protocol::{DecodeError, Envelope, SignatureScheme};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::{CredentialManager, CredentialRefresher, HomepageRefresher, RefreshTask};
use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::quota::{QuotaTracker, QuotaUsage};
use crate::transport::RetryingTransport;

/// Batch RPC client.
pub struct RpcClient {
    config: ClientConfig,
    transport: RetryingTransport,
    credentials: Arc<CredentialManager>,
    quotas: QuotaTracker,
    refresh_task: Mutex<Option<RefreshTask>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.transport.endpoint().as_str())
            .field("credentials", &self.credentials)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Creates a client that starts with `credential` and refreshes it from
    /// the application homepage.
    pub fn new(config: ClientConfig, credential: Credential) -> RpcResult<Self> {
        let refresher = homepage_refresher(&config)?;
        let credentials = CredentialManager::with_credential(credential, refresher);
        Self::with_credentials(config, Arc::new(credentials))
    }

    /// Creates a client from configured cookies only. The first credential
    /// is obtained on [`start`](Self::start) or on the first request.
    pub fn from_config(config: ClientConfig) -> RpcResult<Self> {
        let cookies = config.resolve_cookies()?;
        let refresher = homepage_refresher(&config)?;
        let credentials = CredentialManager::new(cookies, refresher);
        Self::with_credentials(config, Arc::new(credentials))
    }

    /// Creates a client around an existing credential manager.
    pub fn with_credentials(
        config: ClientConfig,
        credentials: Arc<CredentialManager>,
    ) -> RpcResult<Self> {
        config.validate()?;
        let transport = RetryingTransport::new(&config)?;
        let quotas = QuotaTracker::new(&config.quotas);

        Ok(Self {
            config,
            transport,
            credentials,
            quotas,
            refresh_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Builder: replace the request signature scheme.
    pub fn with_signer(mut self, signer: Arc<dyn SignatureScheme>) -> Self {
        self.transport = self.transport.with_signer(signer);
        self
    }

    /// Obtains a credential if needed and starts background refresh.
    ///
    /// Calling it again while the refresh task is running has no effect.
    /// Fails with [`RpcError::Shutdown`] if the client is disposed before
    /// the task could be started.
    pub async fn start(&self) -> RpcResult<()> {
        self.ensure_running()?;
        self.credentials.credential().await?;

        let Some(strategy) = self.config.refresh.strategy() else {
            debug!("background credential refresh disabled");
            return Ok(());
        };

        // `dispose` flips the flag under this lock, so no task is spawned
        // after it has run.
        let mut task = self.refresh_task.lock().await;
        self.ensure_running()?;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(RefreshTask::spawn(
            self.credentials.clone(),
            strategy,
            self.config.retry.clone(),
        ));
        info!(endpoint = %self.transport.endpoint(), "client started");
        Ok(())
    }

    /// Stops background work. Later requests fail with [`RpcError::Shutdown`].
    ///
    /// Dropping the client without disposing it aborts the refresh task.
    pub async fn dispose(&self) {
        let mut task = self.refresh_task.lock().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = task.take() {
            task.stop().await;
        }
        info!("client disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Submits `calls` and returns one result per call, in submission order.
    ///
    /// Calls with different routing contexts travel in separate envelopes,
    /// sent concurrently. Any transport, decode or auth failure fails the
    /// whole batch; per-call remote errors are returned in the results.
    pub async fn submit(&self, calls: Vec<Call>) -> RpcResult<Vec<CallResult>> {
        self.ensure_running()?;
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = calls.iter().map(|c| c.id().to_string()).collect();
        let groups = group_by_context(calls)?;
        debug!(calls = ids.len(), envelopes = groups.len(), "submitting batch");

        let replies = try_join_all(
            groups
                .iter()
                .map(|(_, envelope)| self.transport.execute(envelope, &self.credentials)),
        )
        .await?;

        let mut slots: Vec<Option<CallResult>> = (0..ids.len()).map(|_| None).collect();
        for ((positions, _), results) in groups.iter().zip(replies) {
            for (&position, mut result) in positions.iter().zip(results) {
                result.index = position;
                slots[position] = Some(result);
            }
        }

        slots
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(index, (slot, id))| {
                slot.ok_or_else(|| RpcError::from(DecodeError::MissingResult { index, id }))
            })
            .collect()
    }

    /// Submits a single call and returns its data.
    pub async fn call(&self, call: Call) -> RpcResult<Value> {
        let id = call.id().to_string();
        let result = self
            .submit(vec![call])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::from(DecodeError::MissingResult { index: 0, id: id.clone() }))?;
        result.into_outcome().map_err(|e| RpcError::remote(id, e))
    }

    /// Submits `calls` as one use of the quota `kind`.
    ///
    /// Fails with [`RpcError::QuotaExceeded`] before any network traffic
    /// when the quota is exhausted. The use is recorded only once the
    /// service has answered.
    pub async fn submit_metered(&self, kind: &str, calls: Vec<Call>) -> RpcResult<Vec<CallResult>> {
        self.ensure_running()?;
        self.quotas.check(kind)?;
        let results = self.submit(calls).await?;
        self.quotas.record(kind);
        Ok(results)
    }

    /// Current credential snapshot, if one has been obtained.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.credentials.current()
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Fails with [`RpcError::QuotaExceeded`] if `kind` is exhausted.
    pub fn check_quota(&self, kind: &str) -> RpcResult<()> {
        self.quotas.check(kind)
    }

    /// Records one use of `kind`.
    pub fn record_usage(&self, kind: &str) {
        self.quotas.record(kind);
    }

    pub fn quota_usage(&self, kind: &str) -> Option<QuotaUsage> {
        self.quotas.usage(kind)
    }

    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn ensure_running(&self) -> RpcResult<()> {
        if self.is_disposed() {
            Err(RpcError::Shutdown)
        } else {
            Ok(())
        }
    }
}

fn homepage_refresher(config: &ClientConfig) -> RpcResult<Arc<dyn CredentialRefresher>> {
    let refresher = HomepageRefresher::new(config.homepage_url()?, config.timeout_duration())?
        .with_session_ttl(config.refresh.session_ttl());
    Ok(Arc::new(refresher))
}

/// Splits calls into one envelope per routing context, in order of first
/// appearance, remembering each call's original position.
fn group_by_context(calls: Vec<Call>) -> RpcResult<Vec<(Vec<usize>, Envelope)>> {
    let mut groups: Vec<(String, Vec<usize>, Vec<Call>)> = Vec::new();
    for (position, call) in calls.into_iter().enumerate() {
        let context = call.routing_context();
        match groups.iter_mut().find(|(c, _, _)| c == context) {
            Some((_, positions, members)) => {
                positions.push(position);
                members.push(call);
            }
            None => groups.push((context.to_string(), vec![position], vec![call])),
        }
    }

    groups
        .into_iter()
        .map(|(_, positions, members)| Ok((positions, Envelope::new(members)?)))
        .collect()
}
