use crate::{
    balances::extract_transfers,
    client::{FetchOptions, LedgerClient},
    events::{LogContext, LogEvent},
    handler::TransferHandler,
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};

/// Everything a dispatch task needs to turn one log notification into transfers.
///
/// Cloned into every task; all fields are read-only.
#[derive(Clone)]
pub(crate) struct TransactionPipeline {
    pub client: Arc<dyn LedgerClient>,
    pub handler: Arc<dyn TransferHandler>,
    pub target_mint: Option<Arc<str>>,
    pub fetch: FetchOptions,
}

impl TransactionPipeline {
    /// Fetches the transaction behind `log`, diffs its balances and hands every transfer
    /// to the handler. Never fails: every problem is logged and confined to this entry.
    pub async fn process(self, log: LogEvent) {
        if log.failed {
            tracing::trace!(signature = %log.signature, "Skipping failed transaction");
            return;
        }

        let record = match self.client.fetch_transaction(&log.signature, self.fetch).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(signature = %log.signature, "Transaction not found, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(signature = %log.signature, "Failed to fetch transaction: {:#}", e);
                return;
            }
        };

        let transfers = extract_transfers(&record, self.target_mint.as_deref());
        if transfers.is_empty() {
            return;
        }
        tracing::debug!(
            signature = %log.signature,
            count = transfers.len(),
            "Detected token transfers"
        );

        let context = LogContext::from(&log);
        for transfer in &transfers {
            let delivery = AssertUnwindSafe(self.handler.on_transfer(transfer, &context))
                .catch_unwind()
                .await;
            match delivery {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        signature = %transfer.signature,
                        account = %transfer.account,
                        "Transfer handler failed: {:#}",
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        signature = %transfer.signature,
                        account = %transfer.account,
                        "Transfer handler panicked"
                    );
                }
            }
        }
    }
}
