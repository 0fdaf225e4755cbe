//! # Ledger Client Abstraction
//!
//! The supervisor only needs two things from the ledger: a push stream of program
//! log notifications and a way to fetch a confirmed transaction by signature. The
//! [`LedgerClient`] trait captures exactly that, so the live Solana implementation
//! ([`crate::rpc::SolanaLedgerClient`]) and in-memory mocks used by tests are
//! interchangeable.

use crate::{balances::BalanceMeta, events::LogEvent};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};

/// A stream of log notifications. It ends when the underlying transport closes.
pub type LogStream = BoxStream<'static, LogEvent>;

/// Options forwarded to every transaction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub commitment: CommitmentLevel,
    pub max_supported_transaction_version: Option<u8>,
}

/// The parts of a confirmed transaction the balance diff engine reads.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub slot: u64,
    /// Unix timestamp in seconds, when the cluster recorded one.
    pub block_time: Option<i64>,
    pub signatures: Vec<String>,
    /// Static account keys followed by the addresses loaded from lookup tables
    /// (writable, then read-only), matching the indexing of token balances.
    pub account_keys: Vec<Pubkey>,
    /// `None` when the transaction carries no status metadata.
    pub balances: Option<BalanceMeta>,
}

/// A trait abstracting over the ledger functionality used by the monitor.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Opens a subscription to the logs of every transaction mentioning `program_id`.
    ///
    /// Fails if the transport cannot establish the subscription.
    async fn subscribe_program_logs(
        &self,
        program_id: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<LogStream>;

    /// Fetches a transaction by signature. `Ok(None)` means the ledger does not know it
    /// (not yet confirmed at the requested commitment, or already pruned).
    async fn fetch_transaction(
        &self,
        signature: &str,
        options: FetchOptions,
    ) -> Result<Option<TransactionRecord>>;
}
