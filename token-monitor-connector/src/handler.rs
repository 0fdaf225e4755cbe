//! # Transfer Handlers
//!
//! A [`TransferHandler`] consumes the transfers detected by a supervisor. Each
//! invocation is isolated: an error (or a panic) is logged by the supervisor and the
//! next transfer is still delivered.
//!
//! Provided implementations:
//!
//! *   [`ConsoleHandler`]: the default, a human-readable block per transfer on stdout.
//! *   [`ChannelHandler`]: forwards transfers into a bounded channel owned by the caller.
//! *   [`FnHandler`]: adapts an async closure.
//! *   `JsonLinesHandler` (feature `serde`): one JSON document per line on stdout.

use crate::events::{Direction, LogContext, TransferEvent};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::future::Future;
use tokio::sync::mpsc;

/// Something that can consume a [`TransferEvent`].
#[async_trait]
pub trait TransferHandler: Send + Sync {
    async fn on_transfer(&self, transfer: &TransferEvent, context: &LogContext) -> Result<()>;
}

/// Prints every transfer as a multi-line block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleHandler;

#[async_trait]
impl TransferHandler for ConsoleHandler {
    async fn on_transfer(&self, transfer: &TransferEvent, _context: &LogContext) -> Result<()> {
        println!("{}", format_transfer(transfer));
        Ok(())
    }
}

/// Renders the block printed by [`ConsoleHandler`].
pub fn format_transfer(transfer: &TransferEvent) -> String {
    let timestamp = transfer
        .block_time
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "unknown time".to_string());
    let direction = match transfer.direction {
        Direction::Receive => "Receive",
        Direction::Send => "Send",
    };

    format!(
        "\n=== Token Transfer ===\n\
         Time: {}\n\
         Type: {}\n\
         Account: {}\n\
         Mint: {}\n\
         Amount: {}\n\
         Signature: {}\n\
         Slot: {}\n\
         ======================",
        timestamp,
        direction,
        transfer.account,
        transfer.mint,
        format_token_amount(transfer.amount, transfer.decimals),
        transfer.signature,
        transfer.slot,
    )
}

/// Formats the absolute value of a raw amount with exactly `decimals` fractional digits.
///
/// Works on the decimal digits directly, so no precision is lost for large amounts.
pub fn format_token_amount(amount: i128, decimals: u8) -> String {
    let digits = amount.unsigned_abs().to_string();
    let decimals = usize::from(decimals);
    if decimals == 0 {
        return digits;
    }

    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    format!("{whole}.{fraction}")
}

/// A transfer together with the subscription context it was observed in.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferNotification {
    pub transfer: TransferEvent,
    pub context: LogContext,
}

/// Delivers transfers into a bounded channel.
///
/// A full channel applies backpressure to the dispatch task that produced the transfer,
/// not to the subscription. A dropped receiver turns every delivery into an error.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<TransferNotification>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransferNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TransferHandler for ChannelHandler {
    async fn on_transfer(&self, transfer: &TransferEvent, context: &LogContext) -> Result<()> {
        self.tx
            .send(TransferNotification {
                transfer: transfer.clone(),
                context: *context,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Transfer receiver was dropped"))
    }
}

/// Wraps an async closure as a handler.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(TransferEvent, LogContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TransferHandler for FnHandler<F>
where
    F: Fn(TransferEvent, LogContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_transfer(&self, transfer: &TransferEvent, context: &LogContext) -> Result<()> {
        (self.0)(transfer.clone(), *context).await
    }
}

#[cfg(feature = "serde")]
pub use json::JsonLinesHandler;

#[cfg(feature = "serde")]
mod json {
    use super::*;

    /// Prints one JSON document per transfer. `amount` is a decimal string and
    /// `account` is base58.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct JsonLinesHandler;

    impl JsonLinesHandler {
        pub fn render(transfer: &TransferEvent, context: &LogContext) -> Result<String> {
            let line = serde_json::json!({
                "transfer": transfer,
                "context": context,
            });
            Ok(serde_json::to_string(&line)?)
        }
    }

    #[async_trait]
    impl TransferHandler for JsonLinesHandler {
        async fn on_transfer(&self, transfer: &TransferEvent, context: &LogContext) -> Result<()> {
            println!("{}", Self::render(transfer, context)?);
            Ok(())
        }
    }
}
