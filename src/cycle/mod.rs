//! Distribution and buy-and-burn pipelines.
//!
//! A cycle only starts with a [`RunGuard`] in hand and gives it back by
//! dropping it, so the lock is released on every way out of [`CycleRunner::run`].
//! Every stage appends a full history row under the cycle's id; a failed
//! append is logged and never stops the cycle or the cache update.

use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::DataCache;
use crate::clock::Clock;
use crate::config::{CycleConfig, RetryPolicies};
use crate::history::HistoryStore;
use crate::run_lock::{RunGuard, RunOwner};
use crate::services::{ChainClient, SwapClient};
use crate::types::{HistoryRecord, HolderSnapshot, Payout};

mod burn;
mod distribution;
mod launcher;
pub mod progress;
mod settle;

pub use self::launcher::{CycleLauncher, TriggerOutcome};
pub use self::progress::{CycleProgress, ProgressTracker, Stage};

const BPS_DENOMINATOR: u128 = 10_000;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Funds moved but the pipeline did not finish cleanly.
    Partial(String),
    /// Nothing left the treasury.
    Failed(String),
}

impl CycleOutcome {
    pub fn moved_funds(&self) -> bool {
        !matches!(self, CycleOutcome::Failed(_))
    }
}

/// Splits `balance` into the share spent by a cycle and the share retained,
/// rounding the spent share down.
pub fn split(balance: u64, bps: u16) -> (u64, u64) {
    let spent = (balance as u128 * bps.min(10_000) as u128 / BPS_DENOMINATOR) as u64;
    (spent, balance - spent)
}

/// Pro-rata allocation of `total` over the snapshot's holders. Amounts round
/// down; holders whose share rounds to zero are left out.
pub fn allocate(total: u64, holders: &HolderSnapshot) -> Vec<Payout> {
    if holders.total_held == 0 {
        return Vec::new();
    }
    holders
        .all_holders
        .iter()
        .filter_map(|h| {
            let lamports = (total as u128 * h.balance as u128 / holders.total_held) as u64;
            (lamports > 0).then_some(Payout {
                recipient: h.address,
                lamports,
            })
        })
        .collect()
}

pub struct CycleRunner {
    store: Arc<dyn HistoryStore>,
    chain: Arc<dyn ChainClient>,
    swap: Arc<dyn SwapClient>,
    cache: Arc<DataCache>,
    progress: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
    token_mint: Pubkey,
    cycles: CycleConfig,
    retry: RetryPolicies,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn HistoryStore>,
        chain: Arc<dyn ChainClient>,
        swap: Arc<dyn SwapClient>,
        cache: Arc<DataCache>,
        progress: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
        token_mint: Pubkey,
        cycles: CycleConfig,
        retry: RetryPolicies,
    ) -> Self {
        Self {
            store,
            chain,
            swap,
            cache,
            progress,
            clock,
            token_mint,
            cycles,
            retry,
        }
    }

    /// Runs the cycle the guard was taken for, then releases the guard.
    pub async fn run(&self, guard: RunGuard) -> CycleOutcome {
        let owner = guard.owner();
        let started = self.clock.now();
        self.progress.begin(owner, started);
        info!(cycle = %owner, "[Cycle] starting");

        let outcome = match owner {
            RunOwner::Distribution => self.run_distribution().await,
            RunOwner::Burn => self.run_burn().await,
        };

        match &outcome {
            CycleOutcome::Completed => info!(cycle = %owner, "[Cycle] completed"),
            CycleOutcome::Partial(e) => warn!(cycle = %owner, error = %e, "[Cycle] finished partially"),
            CycleOutcome::Failed(e) => warn!(cycle = %owner, error = %e, "[Cycle] failed"),
        }
        if outcome.moved_funds() {
            self.cache.record_cycle_completed(owner, self.clock.now());
        }
        self.progress.finish();
        drop(guard);
        outcome
    }

    /// Marks the cycle failed before its terminal record is written.
    fn enter_failure(&self, error: &str) {
        self.progress.fail(error);
        self.progress.advance(Stage::Committing);
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn persist(&self, record: HistoryRecord) {
        let id = record.id();
        let status = record.status_str();
        if let Err(e) = self.store.append(record).await {
            warn!(id = %id, status, error = %e, "[Cycle] failed to persist history row, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HolderTiers, TokenHolder};

    const SOL: u64 = 1_000_000_000;

    #[test]
    fn default_split_keeps_five_percent() {
        assert_eq!(split(10 * SOL, 9_500), (9_500_000_000, 500_000_000));
        assert_eq!(split(0, 9_500), (0, 0));
        assert_eq!(split(u64::MAX, 10_000), (u64::MAX, 0));
        assert_eq!(split(7, 9_500), (6, 1));
    }

    #[test]
    fn allocation_is_pro_rata_and_never_overspends() {
        let holders: Vec<TokenHolder> = [600, 300, 100, 0]
            .into_iter()
            .map(|balance| TokenHolder {
                address: Pubkey::new_unique(),
                balance,
            })
            .collect();
        let snapshot = HolderSnapshot::build(holders, &Pubkey::new_unique(), &HolderTiers::default(), Utc::now());

        let payouts = allocate(1_001, &snapshot);
        let amounts: Vec<u64> = payouts.iter().map(|p| p.lamports).collect();
        assert_eq!(amounts, vec![600, 300, 100]);
        assert!(amounts.iter().sum::<u64>() <= 1_001);

        assert!(allocate(1, &snapshot).is_empty(), "dust shares are dropped");
        assert!(allocate(1_000, &HolderSnapshot::default()).is_empty());
    }
}
