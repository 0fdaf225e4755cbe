//! # Balance Diff Engine
//!
//! Reconciles the pre- and post-execution token balance snapshots of a transaction
//! into signed transfer records.
//!
//! Snapshots are joined on `(account_index, mint)`. Every key whose raw amount changed
//! yields exactly one record, in the order the keys were first seen: pre-balances
//! first, then keys that only exist after execution (freshly created token accounts).
//! Differences are computed in `i128`, which is exact for any pair of `u64` raw
//! amounts, so large balances never lose precision or sign.

use crate::{
    client::TransactionRecord,
    events::{Direction, TransferEvent},
};
use std::collections::{hash_map::Entry, HashMap};

/// A token account balance captured before or after a transaction executed.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBalanceSnapshot {
    /// Index into the transaction's account key list.
    pub account_index: u8,
    pub mint: String,
    /// Amount in the token's smallest unit.
    pub raw_amount: u64,
    pub decimals: u8,
    pub ui_amount: Option<f64>,
}

/// The identity used to join pre- and post-snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub account_index: u8,
    pub mint: String,
}

impl From<&TokenBalanceSnapshot> for BalanceKey {
    fn from(snapshot: &TokenBalanceSnapshot) -> Self {
        Self {
            account_index: snapshot.account_index,
            mint: snapshot.mint.clone(),
        }
    }
}

/// The pre- and post-snapshot for one key. At least one side is always present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancePair<'a> {
    pub pre: Option<&'a TokenBalanceSnapshot>,
    pub post: Option<&'a TokenBalanceSnapshot>,
}

impl BalancePair<'_> {
    pub fn mint(&self) -> &str {
        self.pre
            .or(self.post)
            .map(|s| s.mint.as_str())
            .unwrap_or_default()
    }

    /// Prefers the pre-snapshot when both sides disagree.
    pub fn account_index(&self) -> u8 {
        self.pre
            .or(self.post)
            .map(|s| s.account_index)
            .unwrap_or_default()
    }

    pub fn pre_amount(&self) -> i128 {
        self.pre.map_or(0, |s| i128::from(s.raw_amount))
    }

    pub fn post_amount(&self) -> i128 {
        self.post.map_or(0, |s| i128::from(s.raw_amount))
    }

    pub fn difference(&self) -> i128 {
        self.post_amount() - self.pre_amount()
    }

    pub fn decimals(&self) -> u8 {
        self.pre.or(self.post).map_or(0, |s| s.decimals)
    }

    pub fn ui_amount(&self) -> f64 {
        self.pre
            .and_then(|s| s.ui_amount)
            .or_else(|| self.post.and_then(|s| s.ui_amount))
            .unwrap_or(0.0)
    }
}

/// A non-zero change of one `(account_index, mint)` balance.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub account_index: u8,
    pub mint: String,
    /// `post - pre` in raw units.
    pub amount: i128,
    pub decimals: u8,
    pub ui_amount: f64,
}

impl BalanceChange {
    pub fn direction(&self) -> Direction {
        Direction::from_difference(self.amount)
    }
}

/// The token balance metadata of a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceMeta {
    pub pre: Vec<TokenBalanceSnapshot>,
    pub post: Vec<TokenBalanceSnapshot>,
}

/// Joins pre- and post-snapshots on their [`BalanceKey`].
///
/// Keys keep first-seen order: every pre key in input order, then post-only keys in
/// input order. A duplicated key on the same side keeps the last snapshot.
pub fn merge_balances<'a>(
    pre: &'a [TokenBalanceSnapshot],
    post: &'a [TokenBalanceSnapshot],
) -> Vec<(BalanceKey, BalancePair<'a>)> {
    let mut positions: HashMap<BalanceKey, usize> = HashMap::with_capacity(pre.len() + post.len());
    let mut merged: Vec<(BalanceKey, BalancePair<'a>)> = Vec::with_capacity(pre.len() + post.len());

    for snapshot in pre {
        match positions.entry(BalanceKey::from(snapshot)) {
            Entry::Occupied(slot) => merged[*slot.get()].1.pre = Some(snapshot),
            Entry::Vacant(slot) => {
                merged.push((
                    slot.key().clone(),
                    BalancePair {
                        pre: Some(snapshot),
                        post: None,
                    },
                ));
                slot.insert(merged.len() - 1);
            }
        }
    }

    for snapshot in post {
        match positions.entry(BalanceKey::from(snapshot)) {
            Entry::Occupied(slot) => merged[*slot.get()].1.post = Some(snapshot),
            Entry::Vacant(slot) => {
                merged.push((
                    slot.key().clone(),
                    BalancePair {
                        pre: None,
                        post: Some(snapshot),
                    },
                ));
                slot.insert(merged.len() - 1);
            }
        }
    }

    merged
}

/// Computes every non-zero balance change, optionally restricted to one mint.
///
/// Unchanged balances and balances of other mints produce nothing.
pub fn diff_balances(
    pre: &[TokenBalanceSnapshot],
    post: &[TokenBalanceSnapshot],
    mint_filter: Option<&str>,
) -> Vec<BalanceChange> {
    merge_balances(pre, post)
        .into_iter()
        .filter_map(|(_, pair)| {
            let mint = pair.mint();
            if mint_filter.is_some_and(|target| target != mint) {
                return None;
            }
            let amount = pair.difference();
            if amount == 0 {
                return None;
            }
            Some(BalanceChange {
                account_index: pair.account_index(),
                mint: mint.to_string(),
                amount,
                decimals: pair.decimals(),
                ui_amount: pair.ui_amount(),
            })
        })
        .collect()
}

/// Extracts the transfer events of a fetched transaction.
///
/// A record without balance metadata yields no events. A change whose account index
/// points outside the record's account keys is malformed and is skipped.
pub fn extract_transfers(record: &TransactionRecord, mint_filter: Option<&str>) -> Vec<TransferEvent> {
    let Some(meta) = record.balances.as_ref() else {
        return Vec::new();
    };
    let signature = record.signatures.first().cloned().unwrap_or_default();

    diff_balances(&meta.pre, &meta.post, mint_filter)
        .into_iter()
        .filter_map(|change| {
            let Some(account) = record.account_keys.get(usize::from(change.account_index)) else {
                tracing::warn!(
                    signature = %signature,
                    account_index = change.account_index,
                    "Token balance references an account outside the transaction's account keys"
                );
                return None;
            };
            Some(TransferEvent {
                signature: signature.clone(),
                direction: change.direction(),
                mint: change.mint,
                account: *account,
                amount: change.amount,
                decimals: change.decimals,
                ui_amount: change.ui_amount,
                slot: record.slot,
                block_time: record.block_time,
            })
        })
        .collect()
}
