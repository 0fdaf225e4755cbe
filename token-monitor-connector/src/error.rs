use thiserror::Error;

/// Terminal failures of a monitoring session.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Every subscription attempt up to the configured ceiling failed.
    #[error("Gave up after {attempts} failed subscription attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("The monitor session was already started")]
    SessionAlreadyStarted,

    #[error("Invalid mint address '{0}'")]
    InvalidMint(String),

    #[error("Supervisor task failed: {0}")]
    TaskFailed(String),
}
