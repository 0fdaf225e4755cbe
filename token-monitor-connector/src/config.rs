#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::time::Duration;

/// The SPL Token program. Every fungible token transfer on mainnet goes through it.
pub const SPL_TOKEN_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWQBbF8Ss623VQ5DA");

/// The top-level configuration for the `token-monitor-connector` library.
///
/// This struct aggregates the Solana endpoints, the supervisor's retry behavior and
/// internal channel sizes. It is typically deserialized from a configuration file
/// and shared (`Arc`) between every supervisor spawned by a `TokenMonitor`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitorConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub solana: Solana,
    #[cfg_attr(feature = "serde", serde(default))]
    pub supervisor: SupervisorConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub channels: ChannelConfig,
}

/// Defines the connection settings for the Solana cluster.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Solana {
    pub rpc_url: String,
    pub ws_url: String,
    #[cfg_attr(feature = "serde", serde(with = "serde_str"))]
    pub commitment: CommitmentLevel,
}

/// Defines the behavior of the `SubscriptionSupervisor`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SupervisorConfig {
    /// The program whose logs are subscribed to.
    #[cfg_attr(feature = "serde", serde(with = "serde_str"))]
    pub program_id: Pubkey,
    /// How many consecutive failed subscription attempts end the session.
    pub max_retries: u32,
    /// Base backoff. The n-th consecutive failure waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
    /// Highest transaction version requested when fetching transactions.
    pub max_supported_transaction_version: Option<u8>,
}

/// Defines capacities for the MPSC channels within the connector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChannelConfig {
    /// The buffer capacity between the WebSocket reader task and the supervisor.
    pub log_stream_buffer: usize,
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The wait after the n-th consecutive failure: `failures * retry_delay`, saturating.
    pub fn backoff(&self, failures: u32) -> Duration {
        self.retry_delay().saturating_mul(failures)
    }
}

impl Default for Solana {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            ws_url: "wss://api.mainnet-beta.solana.com".to_string(),
            commitment: CommitmentLevel::Confirmed,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program_id: SPL_TOKEN_PROGRAM_ID,
            max_retries: 5,
            retry_delay_ms: 1000,
            max_supported_transaction_version: Some(0),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            log_stream_buffer: 1024,
        }
    }
}

/// (De)serializes a field through its `Display` and `FromStr` impls, e.g. a base58
/// pubkey or a lowercase commitment level.
#[cfg(feature = "serde")]
mod serde_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::{fmt::Display, str::FromStr};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid value '{s}': {e}")))
    }
}
