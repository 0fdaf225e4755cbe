pub mod cli;
pub mod config;

use anyhow::Result;
use clap::Parser;
use crate::cli::Cli;
use crate::config::{load_config, resolve_targets, AppConfig, OutputFormat};
use std::{future::Future, io, sync::Arc, time::Duration};
use token_monitor_connector::{
    handler::{ConsoleHandler, JsonLinesHandler, TransferHandler},
    rpc::SolanaLedgerClient,
    workers::{MonitorTarget, TokenMonitor, TokenMonitorHandle},
};
use tokio::signal;

/// The main entry point of the `token-monitor` binary.
/// Handles `.env` loading, CLI parsing, configuration, logging and the monitor lifecycle.
pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    token_monitor_logger::init(&config.log)?;
    if let Some(path) = &cli.config {
        tracing::info!(path = %path, "Configuration file loaded");
    }
    tracing::debug!("Configuration loaded: {:#?}", &config);

    let targets = resolve_targets(cli.mint.as_deref(), &config.targets)?;
    run_monitor(config, targets).await
}

fn transfer_handler(output: OutputFormat) -> Arc<dyn TransferHandler> {
    match output {
        OutputFormat::Console => Arc::new(ConsoleHandler),
        OutputFormat::Json => Arc::new(JsonLinesHandler),
    }
}

/// How a monitoring run came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Ctrl+C was received.
    Interrupted,
    /// Every supervisor stopped on its own after exhausting its retries.
    MonitorsStopped,
}

/// Starts one supervisor per target and runs until Ctrl+C or until every supervisor
/// has given up.
async fn run_monitor(config: AppConfig, targets: Vec<MonitorTarget>) -> Result<()> {
    let client = Arc::new(SolanaLedgerClient::new(&config.connector));
    let grace = config.shutdown_timeout();
    let monitor = TokenMonitor::new(
        Arc::new(config.connector),
        client,
        transfer_handler(config.output),
    );
    let handle = monitor.start(targets);

    let reason = wait_for_shutdown(signal::ctrl_c(), &handle).await;
    finish(handle, reason, grace).await
}

/// Resolves on the first of `signal` or every session stopping.
///
/// A signal listener that fails to install is logged and ignored: the monitors keep
/// running until they stop on their own.
pub async fn wait_for_shutdown<S>(signal: S, handle: &TokenMonitorHandle) -> Shutdown
where
    S: Future<Output = io::Result<()>>,
{
    tokio::select! {
        signal = signal => match signal {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, stopping monitors...");
                Shutdown::Interrupted
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for shutdown signal.");
                handle.stopped().await;
                Shutdown::MonitorsStopped
            }
        },
        _ = handle.stopped() => Shutdown::MonitorsStopped,
    }
}

/// Stops every session and waits at most `grace` for the supervisors to wind down.
///
/// An interrupt always ends in `Ok`, even if dispatches are still in flight.
pub async fn finish(handle: TokenMonitorHandle, reason: Shutdown, grace: Duration) -> Result<()> {
    handle.stop();
    let outcomes = handle.join_within(grace).await;
    tracing::info!("Shutdown complete.");

    if reason == Shutdown::Interrupted {
        return Ok(());
    }
    match outcomes {
        Some(outcomes) => {
            let failed = outcomes.iter().filter(|(_, outcome)| outcome.is_err()).count();
            anyhow::bail!(
                "{failed} of {} monitors stopped after exhausting their retries",
                outcomes.len()
            )
        }
        None => anyhow::bail!("Monitors stopped after exhausting their retries"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
    use token_monitor_connector::{
        client::{FetchOptions, LedgerClient, LogStream, TransactionRecord},
        config::MonitorConfig,
        handler::ChannelHandler,
        session::{StopReason, SupervisorState},
    };

    /// Either refuses every subscription or hands out streams that never yield.
    struct QuietLedger {
        reachable: bool,
    }

    #[async_trait]
    impl LedgerClient for QuietLedger {
        async fn subscribe_program_logs(
            &self,
            _program_id: &Pubkey,
            _commitment: CommitmentLevel,
        ) -> anyhow::Result<LogStream> {
            if self.reachable {
                Ok(futures::stream::pending().boxed())
            } else {
                Err(anyhow::anyhow!("connection refused"))
            }
        }

        async fn fetch_transaction(
            &self,
            _signature: &str,
            _options: FetchOptions,
        ) -> anyhow::Result<Option<TransactionRecord>> {
            Ok(None)
        }
    }

    fn start(reachable: bool) -> TokenMonitorHandle {
        let mut config = MonitorConfig::default();
        config.supervisor.max_retries = 1;
        let monitor = TokenMonitor::new(
            Arc::new(config),
            Arc::new(QuietLedger { reachable }),
            Arc::new(ChannelHandler::new(1).0),
        );
        monitor.start([MonitorTarget::AllMints])
    }

    async fn broken_signal() -> io::Result<()> {
        Err(io::Error::other("signal handler unavailable"))
    }

    #[tokio::test(start_paused = true)]
    async fn broken_signal_listener_keeps_monitors_running() {
        let handle = start(true);

        let waited =
            tokio::time::timeout(Duration::from_secs(60), wait_for_shutdown(broken_signal(), &handle))
                .await;
        assert!(waited.is_err());
        assert!(handle.sessions().all(|(_, s)| s.state() == SupervisorState::Active));

        assert_eq!(
            wait_for_shutdown(std::future::ready(Ok(())), &handle).await,
            Shutdown::Interrupted
        );
        assert!(finish(handle, Shutdown::Interrupted, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn broken_signal_listener_still_notices_exhaustion() {
        let handle = start(false);

        assert_eq!(
            wait_for_shutdown(broken_signal(), &handle).await,
            Shutdown::MonitorsStopped
        );
        assert!(handle
            .sessions()
            .all(|(_, s)| s.state() == SupervisorState::Stopped(StopReason::RetriesExhausted)));
        assert!(finish(handle, Shutdown::MonitorsStopped, Duration::from_secs(1)).await.is_err());
    }
}
