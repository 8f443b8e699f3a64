//! Batch RPC client.
//!
//! [`RpcClient`] submits typed [`Call`]s to a web application's batch
//! endpoint and returns one [`CallResult`] per call. Around the wire codec
//! from `rpcwire-protocol` it adds:
//!
//! - [`transport`] - retries with backoff, and one resend after refreshing
//!   credentials the service rejected
//! - [`auth`] - the credential lifecycle: single-flight refresh, background
//!   refresh task, homepage token scraping
//! - [`quota`] - per-kind usage limits checked before any traffic
//! - [`config`] - TOML configuration with secret references for cookies
//!
//! ```rust,no_run
//! use rpcwire_client::{Call, ClientConfig, RpcClient};
//!
//! # async fn run() -> rpcwire_client::RpcResult<()> {
//! let config = ClientConfig::load()?;
//! let client = RpcClient::from_config(config)?;
//! client.start().await?;
//!
//! let notebooks = client.call(Call::new("wXbhsf", vec![])).await?;
//! println!("{notebooks}");
//!
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod client;
pub mod config;
pub mod error;
pub mod quota;
pub mod secret;
pub mod transport;

pub use auth::{
    CredentialManager, CredentialRefresher, CredentialState, HomepageRefresher, RefreshStatus,
    RefreshStrategy, RefreshTask,
};
pub use client::RpcClient;
pub use config::{ClientConfig, RefreshConfig, RefreshMode, RetryConfig};
pub use error::{RpcError, RpcErrorCode, RpcResult, TransportError};
pub use quota::{QuotaRule, QuotaTracker, QuotaUsage, QuotaWindow};
pub use transport::RetryingTransport;

pub use rpcwire_core::{Call, CallResult, Credential, RemoteError};
