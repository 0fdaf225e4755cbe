use crate::{
    client::{FetchOptions, LedgerClient, LogStream},
    config::{MonitorConfig, SupervisorConfig},
    error::MonitorError,
    handler::{ConsoleHandler, TransferHandler},
    session::{MonitorSession, StopReason, SupervisorState},
    workers::pipeline::TransactionPipeline,
};
use futures::StreamExt;
use solana_sdk::commitment_config::CommitmentLevel;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;

/// How an active subscription ended.
enum StreamEnd {
    StopRequested,
    Closed,
}

/// Keeps one program log subscription alive and feeds its entries to the transfer
/// pipeline.
///
/// A failed subscribe call and a stream that ends on its own are both transport
/// failures: the n-th consecutive failure waits `n * retry_delay` before the next
/// attempt, and reaching `max_retries` ends the session (with `max_retries = 0` no
/// attempt is made at all). A healthy subscription resets the counter. Failures while
/// fetching individual transactions never count.
pub struct SubscriptionSupervisor {
    config: SupervisorConfig,
    commitment: CommitmentLevel,
    client: Arc<dyn LedgerClient>,
    handler: Arc<dyn TransferHandler>,
}

impl SubscriptionSupervisor {
    /// Creates a supervisor that prints transfers with the [`ConsoleHandler`].
    pub fn new(config: &MonitorConfig, client: Arc<dyn LedgerClient>) -> Self {
        Self {
            config: config.supervisor.clone(),
            commitment: config.solana.commitment,
            client,
            handler: Arc::new(ConsoleHandler),
        }
    }

    /// Replaces the transfer handler.
    pub fn with_handler(mut self, handler: Arc<dyn TransferHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Runs the monitoring loop for `session` until it is stopped or the retry ceiling is
    /// reached.
    ///
    /// Returns `Ok(())` after a requested stop. In both cases every dispatch that was
    /// already in flight has completed when this returns.
    pub async fn run(&self, session: &MonitorSession) -> Result<(), MonitorError> {
        if !session.try_begin() {
            return Err(MonitorError::SessionAlreadyStarted);
        }
        tracing::info!(
            mint = session.target_label(),
            program = %self.config.program_id,
            "Starting token transfer monitor"
        );

        let dispatches = TaskTracker::new();
        let outcome = self.supervise(session, &dispatches).await;

        dispatches.close();
        if !dispatches.is_empty() {
            tracing::debug!(
                in_flight = dispatches.len(),
                "Waiting for in-flight transactions"
            );
        }
        dispatches.wait().await;

        match &outcome {
            Ok(()) => {
                session.set_state(SupervisorState::Stopped(StopReason::Requested));
                tracing::info!(mint = session.target_label(), "Monitor stopped");
            }
            Err(e) => {
                session.set_state(SupervisorState::Stopped(StopReason::RetriesExhausted));
                tracing::error!(
                    mint = session.target_label(),
                    "Max retries reached, monitor stopped: {}",
                    e
                );
            }
        }
        outcome
    }

    async fn supervise(
        &self,
        session: &MonitorSession,
        dispatches: &TaskTracker,
    ) -> Result<(), MonitorError> {
        let pipeline = TransactionPipeline {
            client: self.client.clone(),
            handler: self.handler.clone(),
            target_mint: session.target_mint().map(Arc::from),
            fetch: FetchOptions {
                commitment: self.commitment,
                max_supported_transaction_version: self.config.max_supported_transaction_version,
            },
        };

        if self.config.max_retries == 0 {
            return Err(MonitorError::RetriesExhausted {
                attempts: 0,
                last_error: "max_retries is 0, no subscription attempted".to_string(),
            });
        }

        loop {
            if session.is_stop_requested() {
                return Ok(());
            }
            session.set_state(SupervisorState::Subscribing);
            tracing::debug!(
                mint = session.target_label(),
                attempt = session.retry_count() + 1,
                "Subscribing to program logs"
            );

            let failure = match self
                .client
                .subscribe_program_logs(&self.config.program_id, self.commitment)
                .await
            {
                Ok(stream) => {
                    session.reset_retries();
                    session.set_state(SupervisorState::Active);
                    tracing::info!(mint = session.target_label(), "Subscribed to program logs");

                    match self.consume(stream, session, &pipeline, dispatches).await {
                        StreamEnd::StopRequested => return Ok(()),
                        StreamEnd::Closed => anyhow::anyhow!("log stream closed unexpectedly"),
                    }
                }
                Err(e) => e,
            };

            if session.is_stop_requested() {
                return Ok(());
            }

            let retries = session.record_failure();
            tracing::error!(
                mint = session.target_label(),
                attempt = retries,
                max_retries = self.config.max_retries,
                "Connection error: {:#}",
                failure
            );
            if retries >= self.config.max_retries {
                return Err(MonitorError::RetriesExhausted {
                    attempts: retries,
                    last_error: format!("{failure:#}"),
                });
            }

            let delay = self.config.backoff(retries);
            tracing::info!(
                mint = session.target_label(),
                delay = ?delay,
                "Retrying subscription"
            );
            tokio::select! {
                _ = sleep(delay) => {},
                _ = session.cancelled() => return Ok(()),
            }
        }
    }

    async fn consume(
        &self,
        mut stream: LogStream,
        session: &MonitorSession,
        pipeline: &TransactionPipeline,
        dispatches: &TaskTracker,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => return StreamEnd::StopRequested,
                next = stream.next() => match next {
                    Some(log) => {
                        dispatches.spawn(pipeline.clone().process(log));
                    }
                    None => return StreamEnd::Closed,
                },
            }
        }
    }
}
