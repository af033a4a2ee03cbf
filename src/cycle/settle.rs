//! Getting signed transactions onto the chain and finding out what became
//! of them.

use solana_sdk::signature::Signature;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::CycleRunner;
use crate::cache::{RefreshOutcome, SliceKind};
use crate::error::{Error, Result};
use crate::retry::{self, RetryPolicy};
use crate::services::SignedTx;
use crate::types::TxStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Landing {
    Confirmed,
    /// Executed and failed; nothing moved.
    Rejected(String),
    /// Still not confirmed when the budget ran out. Funds may have moved.
    Unknown(String),
}

impl CycleRunner {
    /// Treasury balance for a cycle snapshot, read from the cache. A balance
    /// that is stale, or was expired by a completed cycle, goes through the
    /// cache's refresh first.
    pub(super) async fn snapshot_balance(&self) -> Result<u64> {
        if self.cache.is_stale(SliceKind::TreasuryBalance) {
            match self.cache.refresh(SliceKind::TreasuryBalance).await {
                RefreshOutcome::Refreshed => {}
                RefreshOutcome::AlreadyRefreshing => {
                    return Err(Error::TransientNetwork(
                        "treasury balance is outdated and a refresh is still in flight".into(),
                    ));
                }
                RefreshOutcome::Failed(e) => return Err(e),
            }
        }
        Ok(self.cache.treasury_balance())
    }

    /// Sends `tx` under `policy`. Every attempt re-sends the same signed
    /// bytes, and every retry first asks the chain whether an earlier attempt
    /// already landed.
    pub(super) async fn submit_signed<F, Fut>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        tx: &SignedTx,
        send: F,
    ) -> Result<Signature>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Signature>>,
    {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let send = &send;
        let result = retry::call(label, policy, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                match self.chain.get_transaction_status(&tx.signature).await? {
                    TxStatus::Confirmed => {
                        debug!(call = label, signature = %tx.signature, "[Cycle] earlier attempt landed, not re-sending");
                        return Ok(tx.signature);
                    }
                    TxStatus::Failed(reason) => {
                        return Err(Error::Validation(format!("{} failed on chain: {reason}", tx.signature)));
                    }
                    TxStatus::Pending => {}
                }
            }
            send().await
        })
        .await;

        match result {
            // The last reply may have been lost too.
            Err(e) if e.is_exhausted() => match self.chain.get_transaction_status(&tx.signature).await {
                Ok(TxStatus::Confirmed) => Ok(tx.signature),
                _ => Err(e),
            },
            other => other,
        }
    }

    /// Polls `signature` until it is confirmed or rejected, for at most
    /// `confirm_timeout`.
    pub(super) async fn await_landing(&self, signature: &Signature) -> Landing {
        let deadline = Instant::now() + self.cycles.confirm_timeout;
        loop {
            let status = retry::call("get_transaction_status", &self.retry.rpc, || {
                self.chain.get_transaction_status(signature)
            })
            .await;
            match status {
                Ok(TxStatus::Confirmed) => return Landing::Confirmed,
                Ok(TxStatus::Failed(reason)) => return Landing::Rejected(reason),
                Ok(TxStatus::Pending) if Instant::now() < deadline => {
                    sleep(self.cycles.confirm_poll_interval).await;
                }
                Ok(TxStatus::Pending) => {
                    return Landing::Unknown(format!(
                        "still unconfirmed after {}s",
                        self.cycles.confirm_timeout.as_secs()
                    ));
                }
                Err(e) => return Landing::Unknown(format!("status unknown: {e}")),
            }
        }
    }
}
