//! A Rust library for watching SPL token transfers on Solana.
//!
//! The connector subscribes to the logs of the token program, fetches every
//! transaction that shows up, and reconciles its pre- and post-execution token
//! balances into signed transfer records.
//!
//! # Key Components
//!
//! *   [`balances`]: The pure balance diff engine.
//! *   [`workers::SubscriptionSupervisor`]: The reconnecting subscription loop for one
//!     [`session::MonitorSession`].
//! *   [`workers::TokenMonitor`]: Runs one independent supervisor per monitored mint.
//! *   [`handler`]: Where detected transfers go (console, channel, closure, JSON lines).
//! *   [`client`]: The [`client::LedgerClient`] seam, implemented for a live cluster by
//!     [`rpc::SolanaLedgerClient`].
pub mod balances;
pub mod client;
/// Defines configuration structures for the connector.
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
/// The Solana JSON-RPC / PubSub implementation of the ledger client.
pub mod rpc;
pub mod session;
/// The supervisor workers and the multi-mint monitor.
pub mod workers;

pub use error::MonitorError;
