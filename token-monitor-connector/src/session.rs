//! # Monitor Session
//!
//! A [`MonitorSession`] is the caller-owned state of one monitoring loop: which mint it
//! watches, whether a stop was requested, how many consecutive subscription attempts
//! failed, and where the supervisor currently is in its state machine.
//!
//! The session is shared by reference (usually behind an `Arc`) between the caller and
//! the [`SubscriptionSupervisor`](crate::workers::SubscriptionSupervisor). The caller
//! only ever requests a stop; the retry counter and the state are written by the
//! supervisor loop alone.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Where a supervisor loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Created, not yet started.
    Idle,
    /// Opening (or re-opening) the log subscription.
    Subscribing,
    /// Subscribed and dispatching log entries.
    Active,
    /// Terminal.
    Stopped(StopReason),
}

/// Why a supervisor loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called on the session.
    Requested,
    /// The retry ceiling was reached without a healthy subscription.
    RetriesExhausted,
}

#[derive(Debug)]
pub struct MonitorSession {
    target_mint: Option<String>,
    cancel: CancellationToken,
    retry_count: AtomicU32,
    state: watch::Sender<SupervisorState>,
}

impl MonitorSession {
    /// Creates an idle session. `None` monitors every mint.
    pub fn new(target_mint: Option<String>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            target_mint,
            cancel: CancellationToken::new(),
            retry_count: AtomicU32::new(0),
            state,
        }
    }

    pub fn target_mint(&self) -> Option<&str> {
        self.target_mint.as_deref()
    }

    /// Requests the supervisor to stop. Calling it again is a no-op.
    ///
    /// The loop observes the request at its next boundary: between log entries, before
    /// a subscription attempt, or while backing off. Transaction fetches that are
    /// already in flight run to completion.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(mint = self.target_label(), "Stopping monitor...");
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the loop is subscribing or subscribed and no stop was requested.
    pub fn is_active(&self) -> bool {
        !self.is_stop_requested()
            && matches!(
                self.state(),
                SupervisorState::Subscribing | SupervisorState::Active
            )
    }

    /// Consecutive failed subscription attempts since the last healthy subscription.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// A receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Waits until the session reaches its terminal state.
    pub async fn stopped(&self) -> StopReason {
        let mut states = self.watch_state();
        loop {
            if let SupervisorState::Stopped(reason) = *states.borrow_and_update() {
                return reason;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if states.changed().await.is_err() {
                return StopReason::Requested;
            }
        }
    }

    pub(crate) fn target_label(&self) -> &str {
        self.target_mint().unwrap_or("all")
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Moves an idle session to `Subscribing`. Returns false if it was already started.
    pub(crate) fn try_begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Idle {
                *state = SupervisorState::Subscribing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    /// Counts one failed attempt and returns the new consecutive total.
    pub(crate) fn record_failure(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }
}
