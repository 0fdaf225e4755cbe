//! The live [`LedgerClient`] backed by Solana's JSON-RPC and PubSub endpoints.

use crate::{
    balances::{BalanceMeta, TokenBalanceSnapshot},
    client::{FetchOptions, LedgerClient, LogStream, TransactionRecord},
    config::MonitorConfig,
    events::LogEvent,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_config::{RpcTransactionConfig, RpcTransactionLogsConfig, RpcTransactionLogsFilter},
    rpc_response::{Response, RpcLogsResponse},
};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    pubkey::Pubkey,
    signature::Signature,
};
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, UiLoadedAddresses, UiTransactionEncoding,
    UiTransactionTokenBalance,
};
use std::{str::FromStr, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Talks to a Solana cluster: WebSocket `logsSubscribe` for notifications and HTTP
/// `getTransaction` for the full records.
#[derive(Clone)]
pub struct SolanaLedgerClient {
    rpc_client: Arc<RpcClient>,
    ws_url: String,
    stream_buffer: usize,
}

impl SolanaLedgerClient {
    pub fn new(config: &MonitorConfig) -> Self {
        let rpc_client = RpcClient::new_with_commitment(
            config.solana.rpc_url.clone(),
            CommitmentConfig {
                commitment: config.solana.commitment,
            },
        );
        Self::with_rpc_client(
            Arc::new(rpc_client),
            config.solana.ws_url.clone(),
            config.channels.log_stream_buffer,
        )
    }

    /// Builds a client around an existing RPC client, e.g. one shared with other services.
    pub fn with_rpc_client(rpc_client: Arc<RpcClient>, ws_url: impl Into<String>, stream_buffer: usize) -> Self {
        Self {
            rpc_client,
            ws_url: ws_url.into(),
            stream_buffer: stream_buffer.max(1),
        }
    }
}

#[async_trait]
impl LedgerClient for SolanaLedgerClient {
    async fn subscribe_program_logs(
        &self,
        program_id: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<LogStream> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .with_context(|| format!("Failed to connect to {}", self.ws_url))?;

        let filter = RpcTransactionLogsFilter::Mentions(vec![program_id.to_string()]);
        let logs_config = RpcTransactionLogsConfig {
            commitment: Some(CommitmentConfig { commitment }),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (log_tx, log_rx) = mpsc::channel(self.stream_buffer);

        // The PubSub stream borrows its client, so both live in a reader task that
        // forwards notifications until either side goes away.
        tokio::spawn(async move {
            let (mut stream, unsubscribe) = match client.logs_subscribe(filter, logs_config).await {
                Ok(subscription) => {
                    let _ = ready_tx.send(Ok(()));
                    subscription
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            loop {
                tokio::select! {
                    notification = stream.next() => match notification {
                        Some(response) => {
                            if log_tx.send(log_event(response)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::warn!("Log subscription closed by the server.");
                            break;
                        }
                    },
                    _ = log_tx.closed() => break,
                }
            }

            drop(stream);
            unsubscribe().await;
            if let Err(e) = client.shutdown().await {
                tracing::debug!("PubSub client shutdown failed: {}", e);
            }
        });

        ready_rx
            .await
            .context("Log subscription task ended before subscribing")?
            .context("logsSubscribe request failed")?;

        Ok(ReceiverStream::new(log_rx).boxed())
    }

    async fn fetch_transaction(
        &self,
        signature: &str,
        options: FetchOptions,
    ) -> Result<Option<TransactionRecord>> {
        let sig = Signature::from_str(signature)
            .with_context(|| format!("Invalid transaction signature '{signature}'"))?;
        let tx_config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig {
                commitment: options.commitment,
            }),
            max_supported_transaction_version: options.max_supported_transaction_version,
        };

        match self.rpc_client.get_transaction_with_config(&sig, tx_config).await {
            Ok(tx) => transaction_record(tx).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("getTransaction failed for {signature}")),
        }
    }
}

fn log_event(response: Response<RpcLogsResponse>) -> LogEvent {
    let Response { context, value } = response;
    LogEvent {
        signature: value.signature,
        failed: value.err.is_some(),
        slot: context.slot,
    }
}

/// `getTransaction` answers `null` for unknown signatures, which the client surfaces as
/// a deserialization error. Any other deserialization error is a real schema mismatch.
fn is_not_found(error: &ClientError) -> bool {
    match error.kind() {
        ClientErrorKind::SerdeJson(e) => e.to_string().starts_with("invalid type: null"),
        _ => false,
    }
}

/// Converts an RPC transaction into the record consumed by the balance diff engine.
pub fn transaction_record(tx: EncodedConfirmedTransactionWithStatusMeta) -> Result<TransactionRecord> {
    let EncodedConfirmedTransactionWithStatusMeta {
        slot,
        transaction,
        block_time,
    } = tx;
    let versioned = transaction
        .transaction
        .decode()
        .context("Transaction payload could not be decoded")?;

    let mut account_keys = versioned.message.static_account_keys().to_vec();
    let mut balances = None;

    if let Some(meta) = transaction.meta {
        let loaded: Option<UiLoadedAddresses> = meta.loaded_addresses.into();
        if let Some(loaded) = loaded {
            for address in loaded.writable.iter().chain(loaded.readonly.iter()) {
                account_keys.push(
                    Pubkey::from_str(address)
                        .with_context(|| format!("Invalid loaded address '{address}'"))?,
                );
            }
        }

        let pre: Option<Vec<UiTransactionTokenBalance>> = meta.pre_token_balances.into();
        let post: Option<Vec<UiTransactionTokenBalance>> = meta.post_token_balances.into();
        if let (Some(pre), Some(post)) = (pre, post) {
            balances = Some(BalanceMeta {
                pre: pre.iter().map(token_balance_snapshot).collect::<Result<_>>()?,
                post: post.iter().map(token_balance_snapshot).collect::<Result<_>>()?,
            });
        }
    }

    Ok(TransactionRecord {
        slot,
        block_time,
        signatures: versioned.signatures.iter().map(ToString::to_string).collect(),
        account_keys,
        balances,
    })
}

/// SPL token amounts are `u64` on-chain. Anything else makes the whole record unusable:
/// dropping one side of a pair would turn it into a phantom transfer.
fn token_balance_snapshot(balance: &UiTransactionTokenBalance) -> Result<TokenBalanceSnapshot> {
    let amount = &balance.ui_token_amount;
    let raw_amount = amount.amount.parse::<u64>().with_context(|| {
        format!(
            "Unparsable token amount '{}' for mint {} at account index {}",
            amount.amount, balance.mint, balance.account_index
        )
    })?;
    Ok(TokenBalanceSnapshot {
        account_index: balance.account_index,
        mint: balance.mint.clone(),
        raw_amount,
        decimals: amount.decimals,
        ui_amount: amount.ui_amount,
    })
}
