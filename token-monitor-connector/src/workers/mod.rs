//! # Token Monitor & Background Workers
//!
//! This module defines the [`TokenMonitor`], which runs one independent
//! [`SubscriptionSupervisor`] per monitored target.
//!
//! ## Core Components
//!
//! - [`TokenMonitor`]: Holds the shared configuration, ledger client and handler, and
//!   spawns a supervisor task per [`MonitorTarget`].
//! - [`TokenMonitorHandle`]: Returned by [`TokenMonitor::start`]. Stops every session
//!   and collects the outcome of each supervisor.
//! - **Workers**:
//!   - `SubscriptionSupervisor`: Keeps the program log subscription alive with bounded,
//!     linearly backed-off retries.
//!   - `TransactionPipeline`: Fetches the transaction behind a log entry, diffs its token
//!     balances and delivers the transfers to the handler.
//!
//! Supervisors share no mutable state: each owns its [`MonitorSession`], and one
//! exhausting its retries does not affect the others.

mod pipeline;
mod supervisor;

pub use supervisor::SubscriptionSupervisor;

use crate::{
    client::LedgerClient, config::MonitorConfig, error::MonitorError, handler::TransferHandler,
    session::MonitorSession,
};
use futures::future::join_all;
use solana_sdk::pubkey::Pubkey;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;

/// What a single supervisor watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MonitorTarget {
    /// Transfers of every mint.
    AllMints,
    /// Transfers of one mint only.
    Mint(String),
}

impl MonitorTarget {
    /// Validates `address` as a base58 public key.
    pub fn mint(address: &str) -> Result<Self, MonitorError> {
        let address = address.trim();
        Pubkey::from_str(address).map_err(|_| MonitorError::InvalidMint(address.to_string()))?;
        Ok(Self::Mint(address.to_string()))
    }

    pub fn mint_filter(&self) -> Option<&str> {
        match self {
            MonitorTarget::AllMints => None,
            MonitorTarget::Mint(mint) => Some(mint),
        }
    }
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorTarget::AllMints => f.write_str("all mints"),
            MonitorTarget::Mint(mint) => f.write_str(mint),
        }
    }
}

/// Spawns and owns the supervisors of a monitoring run.
pub struct TokenMonitor {
    config: Arc<MonitorConfig>,
    client: Arc<dyn LedgerClient>,
    handler: Arc<dyn TransferHandler>,
}

impl TokenMonitor {
    /// # Arguments
    ///
    /// * `config` - The shared connector configuration.
    /// * `client` - The ledger used by every supervisor.
    /// * `handler` - Receives the transfers of every target.
    pub fn new(
        config: Arc<MonitorConfig>,
        client: Arc<dyn LedgerClient>,
        handler: Arc<dyn TransferHandler>,
    ) -> Self {
        Self {
            config,
            client,
            handler,
        }
    }

    /// Spawns one supervisor task per target. Must be called within a Tokio runtime.
    pub fn start(&self, targets: impl IntoIterator<Item = MonitorTarget>) -> TokenMonitorHandle {
        let monitors = targets
            .into_iter()
            .map(|target| {
                let session = Arc::new(MonitorSession::new(
                    target.mint_filter().map(str::to_string),
                ));
                let supervisor = SubscriptionSupervisor::new(&self.config, self.client.clone())
                    .with_handler(self.handler.clone());
                let task_session = session.clone();
                let task = tokio::spawn(async move { supervisor.run(&task_session).await });
                RunningMonitor {
                    target,
                    session,
                    task,
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(monitors = monitors.len(), "Token monitor started");
        TokenMonitorHandle { monitors }
    }
}

struct RunningMonitor {
    target: MonitorTarget,
    session: Arc<MonitorSession>,
    task: JoinHandle<Result<(), MonitorError>>,
}

/// Controls the supervisors spawned by [`TokenMonitor::start`].
pub struct TokenMonitorHandle {
    monitors: Vec<RunningMonitor>,
}

impl TokenMonitorHandle {
    /// Requests every session to stop. Idempotent.
    pub fn stop(&self) {
        for monitor in &self.monitors {
            monitor.session.stop();
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&MonitorTarget, &Arc<MonitorSession>)> {
        self.monitors.iter().map(|m| (&m.target, &m.session))
    }

    /// True while at least one supervisor is still running.
    pub fn is_running(&self) -> bool {
        self.monitors.iter().any(|m| !m.task.is_finished())
    }

    /// Resolves once every session has reached `Stopped`, whatever the reason.
    pub async fn stopped(&self) {
        join_all(self.monitors.iter().map(|m| m.session.stopped())).await;
    }

    /// Like [`join`](Self::join), but gives up after `grace`.
    ///
    /// A supervisor waits for its in-flight fetches before returning, and fetches carry no
    /// timeout of their own. `None` means at least one supervisor was still running; those
    /// tasks are left to the runtime.
    pub async fn join_within(
        self,
        grace: Duration,
    ) -> Option<Vec<(MonitorTarget, Result<(), MonitorError>)>> {
        match tokio::time::timeout(grace, self.join()).await {
            Ok(outcomes) => Some(outcomes),
            Err(_) => {
                tracing::warn!(grace = ?grace, "Supervisors did not finish in time");
                None
            }
        }
    }

    /// Waits for every supervisor to finish and returns each target's outcome.
    pub async fn join(self) -> Vec<(MonitorTarget, Result<(), MonitorError>)> {
        let mut outcomes = Vec::with_capacity(self.monitors.len());
        for monitor in self.monitors {
            let outcome = match monitor.task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(monitor = %monitor.target, "Supervisor task failed: {}", e);
                    Err(MonitorError::TaskFailed(e.to_string()))
                }
            };
            outcomes.push((monitor.target, outcome));
        }
        outcomes
    }
}
