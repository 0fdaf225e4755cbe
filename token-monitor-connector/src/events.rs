#[cfg(feature = "serde")]
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::fmt;

/// Whether the account gained or lost tokens in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    Receive,
    Send,
}

impl Direction {
    /// `Receive` for a positive difference, `Send` otherwise.
    pub fn from_difference(difference: i128) -> Self {
        if difference > 0 {
            Direction::Receive
        } else {
            Direction::Send
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => f.write_str("receive"),
            Direction::Send => f.write_str("send"),
        }
    }
}

/// A single token balance change observed in a confirmed transaction.
///
/// `amount` is the signed raw difference `post - pre` for one `(account, mint)` pair.
/// Its sign always agrees with `direction`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TransferEvent {
    pub signature: String,
    pub mint: String,
    #[cfg_attr(feature = "serde", serde(serialize_with = "serde_display::serialize"))]
    pub account: Pubkey,
    #[cfg_attr(feature = "serde", serde(serialize_with = "serde_display::serialize"))]
    pub amount: i128,
    pub decimals: u8,
    pub ui_amount: f64,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub direction: Direction,
}

/// One notification from the program log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub signature: String,
    /// The transaction failed on-chain. Failed transactions move no tokens.
    pub failed: bool,
    /// The slot reported by the subscription context.
    pub slot: u64,
}

/// Subscription-level context handed to the transfer handler alongside each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LogContext {
    pub slot: u64,
}

impl From<&LogEvent> for LogContext {
    fn from(log: &LogEvent) -> Self {
        Self { slot: log.slot }
    }
}

#[cfg(feature = "serde")]
mod serde_display {
    use serde::Serializer;
    use std::fmt::Display;

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }
}
