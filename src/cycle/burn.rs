use solana_sdk::signature::Signature;
use tracing::{error, info};
use uuid::Uuid;

use super::settle::Landing;
use super::{split, CycleOutcome, CycleRunner, Stage};
use crate::error::{Error, Result};
use crate::retry;
use crate::types::{BurnRecord, BurnStatus, HistoryRecord};

impl CycleRunner {
    pub(super) async fn run_burn(&self) -> CycleOutcome {
        let mut record = BurnRecord {
            id: Uuid::new_v4(),
            timestamp: self.now(),
            sol_amount: 0,
            tokens_burned: 0,
            buy_signature: None,
            burn_signature: None,
            status: BurnStatus::Pending,
            error: None,
        };

        let balance = match self.snapshot_balance().await {
            Ok(balance) => balance,
            Err(e) => return self.fail_burn(record, format!("treasury balance unavailable: {e}")).await,
        };

        self.progress.advance(Stage::Computing);
        if balance <= self.cycles.minimum_balance {
            let err = Error::InsufficientFunds(format!(
                "treasury holds {balance} lamports, minimum is {}",
                self.cycles.minimum_balance
            ));
            return self.fail_burn(record, err.to_string()).await;
        }
        let (sol_amount, retained) = split(balance, self.cycles.burn_bps);
        record.sol_amount = sol_amount;
        self.persist(HistoryRecord::Burn(record.clone())).await;
        info!(id = %record.id, balance, sol_amount, retained, "[Cycle] burn computed");

        // Buy. Until the swap lands nothing has left the treasury.
        self.progress.advance(Stage::Executing);
        let quote = match retry::call("swap_quote", &self.retry.swap, || self.swap.quote(sol_amount)).await {
            Ok(q) if q.amount_out == 0 => {
                return self
                    .fail_burn(record, Error::Validation("quote returned zero tokens".into()).to_string())
                    .await;
            }
            Ok(q) => q,
            Err(e) => return self.fail_burn(record, e.to_string()).await,
        };
        let tokens_before = match self.token_balance().await {
            Ok(amount) => amount,
            Err(e) => return self.fail_burn(record, format!("token balance unavailable: {e}")).await,
        };
        let signed = match retry::call("swap_prepare", &self.retry.swap, || self.swap.prepare(&quote)).await {
            Ok(signed) => signed,
            Err(e) => return self.fail_burn(record, e.to_string()).await,
        };
        let signed = &signed;
        let buy_signature = match self
            .submit_signed("swap_execute", &self.retry.swap, signed, || self.swap.execute(signed))
            .await
        {
            Ok(sig) => sig,
            Err(e) => return self.fail_burn(record, e.to_string()).await,
        };
        match self.await_landing(&buy_signature).await {
            Landing::Confirmed => {}
            Landing::Rejected(reason) => {
                return self.fail_burn(record, format!("swap {buy_signature} failed on chain: {reason}")).await;
            }
            Landing::Unknown(reason) => {
                record.buy_signature = Some(buy_signature.to_string());
                return self.stop_after_buy(record, format!("swap {buy_signature}: {reason}")).await;
            }
        }
        record.buy_signature = Some(buy_signature.to_string());

        // Only what actually arrived is burned; the quote is an estimate.
        let received = match self.token_balance().await {
            Ok(after) => after.saturating_sub(tokens_before),
            Err(e) => return self.stop_after_buy(record, format!("token balance unavailable after swap: {e}")).await,
        };
        record.timestamp = self.now();
        record.status = BurnStatus::Bought;
        record.tokens_burned = received;
        self.persist(HistoryRecord::Burn(record.clone())).await;
        info!(id = %record.id, %buy_signature, quoted = quote.amount_out, received, "[Cycle] tokens bought");
        if received == 0 {
            return self.stop_after_buy(record, "swap landed but no tokens arrived".to_string()).await;
        }

        // Burn. Funds are committed from here on.
        self.progress.advance(Stage::Finalizing);
        let burned = match self.burn(received).await {
            Ok(burn_signature) => burn_signature,
            Err(reason) => return self.stop_after_buy(record, format!("burn failed after buy: {reason}")).await,
        };

        self.progress.advance(Stage::Committing);
        debug_assert!(record.status.can_advance_to(BurnStatus::Burned));
        record.timestamp = self.now();
        record.status = BurnStatus::Burned;
        record.burn_signature = Some(burned.to_string());
        self.persist(HistoryRecord::Burn(record)).await;
        CycleOutcome::Completed
    }

    async fn token_balance(&self) -> Result<u64> {
        retry::call("get_token_balance", &self.retry.rpc, || {
            self.chain.get_token_balance(&self.token_mint)
        })
        .await
    }

    async fn burn(&self, amount: u64) -> std::result::Result<Signature, String> {
        let signed = retry::call("sign_burn", &self.retry.burn, || self.chain.sign_burn(&self.token_mint, amount))
            .await
            .map_err(|e| e.to_string())?;
        let signed = &signed;
        let signature = self
            .submit_signed("burn_tokens", &self.retry.burn, signed, || self.chain.submit(signed))
            .await
            .map_err(|e| e.to_string())?;
        match self.await_landing(&signature).await {
            Landing::Confirmed => Ok(signature),
            Landing::Rejected(reason) => Err(format!("{signature} failed on chain: {reason}")),
            Landing::Unknown(reason) => Err(format!("{signature}: {reason}")),
        }
    }

    /// Ends a cycle whose buy went through but whose tokens were not burned.
    /// The record stays `bought` for manual remediation.
    async fn stop_after_buy(&self, mut record: BurnRecord, reason: String) -> CycleOutcome {
        error!(
            id = %record.id,
            buy_signature = record.buy_signature.as_deref().unwrap_or("-"),
            tokens = record.tokens_burned,
            error = %reason,
            "[Cycle] bought tokens were not burned; manual remediation required"
        );
        self.progress.fail(&reason);
        self.progress.advance(Stage::Committing);
        record.timestamp = self.now();
        record.status = BurnStatus::Bought;
        record.error = Some(reason.clone());
        self.persist(HistoryRecord::Burn(record)).await;
        CycleOutcome::Partial(reason)
    }

    async fn fail_burn(&self, mut record: BurnRecord, reason: String) -> CycleOutcome {
        self.enter_failure(&reason);
        record.timestamp = self.now();
        record.status = BurnStatus::Failed;
        record.error = Some(reason.clone());
        self.persist(HistoryRecord::Burn(record)).await;
        CycleOutcome::Failed(reason)
    }
}
