use solana_sdk::signature::Signature;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::settle::Landing;
use super::{allocate, split, CycleOutcome, CycleRunner, Stage};
use crate::error::Error;
use crate::retry;
use crate::types::{DistributionRecord, DistributionStatus, HistoryRecord, Payout};

struct SentBatch {
    signature: Signature,
    lamports: u64,
    recipients: u32,
}

#[derive(Default)]
struct Settlement {
    /// Everything sent, minus batches the chain rejected.
    sent_lamports: u64,
    sent_recipients: u32,
    confirmed_lamports: u64,
    confirmed_batches: usize,
    /// Sent but never confirmed either way; funds may have moved.
    uncertain_batches: usize,
    errors: Vec<String>,
}

impl CycleRunner {
    pub(super) async fn run_distribution(&self) -> CycleOutcome {
        let mut record = DistributionRecord {
            id: Uuid::new_v4(),
            timestamp: self.now(),
            total_distributed: 0,
            total_confirmed: 0,
            recipient_count: 0,
            source_tx_signature: None,
            status: DistributionStatus::Pending,
            error: None,
        };

        let balance = match self.snapshot_balance().await {
            Ok(balance) => balance,
            Err(e) => return self.fail_distribution(record, format!("treasury balance unavailable: {e}")).await,
        };
        let holders = self.cache.holders();

        self.progress.advance(Stage::Computing);
        if balance <= self.cycles.minimum_balance {
            let err = Error::InsufficientFunds(format!(
                "treasury holds {balance} lamports, minimum is {}",
                self.cycles.minimum_balance
            ));
            return self.fail_distribution(record, err.to_string()).await;
        }
        let (distributable, retained) = split(balance, self.cycles.distribution_bps);
        let payouts = allocate(distributable, &holders);
        if payouts.is_empty() {
            let err = Error::Validation(format!(
                "no eligible holders among {} scanned",
                holders.active_holders()
            ));
            return self.fail_distribution(record, err.to_string()).await;
        }

        record.total_distributed = payouts.iter().map(|p| p.lamports).sum();
        record.recipient_count = payouts.len() as u32;
        self.persist(HistoryRecord::Distribution(record.clone())).await;
        info!(
            id = %record.id,
            balance,
            distributable,
            retained,
            recipients = record.recipient_count,
            "[Cycle] distribution computed"
        );

        self.progress.advance(Stage::Executing);
        let batch_count = payouts.chunks(self.cycles.payout_batch_size).count();
        let (sent, mut errors) = self.send_batches(&record, &payouts).await;

        self.progress.advance(Stage::Finalizing);
        let mut settlement = self.confirm_batches(&sent).await;
        errors.append(&mut settlement.errors);

        let moved = settlement.confirmed_batches > 0 || settlement.uncertain_batches > 0;

        record.timestamp = self.now();
        record.total_distributed = settlement.sent_lamports;
        record.total_confirmed = settlement.confirmed_lamports;
        record.recipient_count = settlement.sent_recipients;
        record.source_tx_signature = sent.first().map(|b| b.signature.to_string());
        record.error = (!errors.is_empty()).then(|| errors.join("; "));

        if !moved {
            let reason = record.error.clone().unwrap_or_else(|| "no payout batch went through".to_string());
            record.total_distributed = 0;
            record.recipient_count = 0;
            return self.fail_distribution(record, reason).await;
        }

        self.progress.advance(Stage::Committing);
        let unconfirmed = batch_count - settlement.confirmed_batches;
        let outcome = if unconfirmed == 0 {
            record.status = DistributionStatus::Success;
            CycleOutcome::Completed
        } else {
            record.status = DistributionStatus::Partial;
            CycleOutcome::Partial(format!("{unconfirmed} of {batch_count} payout batches not confirmed"))
        };
        self.persist(HistoryRecord::Distribution(record)).await;
        outcome
    }

    /// Signs and sends every batch. Each batch that goes out is followed by a
    /// `partial` row carrying the running total, so a process that dies
    /// between batches leaves a record of the funds already sent.
    async fn send_batches(&self, record: &DistributionRecord, payouts: &[Payout]) -> (Vec<SentBatch>, Vec<String>) {
        let mut sent: Vec<SentBatch> = Vec::new();
        let mut errors = Vec::new();
        for (index, batch) in payouts.chunks(self.cycles.payout_batch_size).enumerate() {
            let signed = match retry::call("sign_payouts", &self.retry.payout, || self.chain.sign_payouts(batch)).await {
                Ok(signed) => signed,
                Err(e) => {
                    warn!(batch = index, error = %e, "[Cycle] payout batch could not be signed");
                    errors.push(format!("batch {index}: {e}"));
                    continue;
                }
            };
            let signed = &signed;
            let result = self
                .submit_signed("send_payouts", &self.retry.payout, signed, || self.chain.submit(signed))
                .await;
            match result {
                Ok(signature) => {
                    debug!(batch = index, %signature, recipients = batch.len(), "[Cycle] payout batch sent");
                    sent.push(SentBatch {
                        signature,
                        lamports: batch.iter().map(|p| p.lamports).sum(),
                        recipients: batch.len() as u32,
                    });
                    self.persist(HistoryRecord::Distribution(DistributionRecord {
                        timestamp: self.now(),
                        total_distributed: sent.iter().map(|b| b.lamports).sum(),
                        total_confirmed: 0,
                        recipient_count: sent.iter().map(|b| b.recipients).sum(),
                        source_tx_signature: Some(signature.to_string()),
                        status: DistributionStatus::Partial,
                        ..record.clone()
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(batch = index, error = %e, "[Cycle] payout batch failed");
                    errors.push(format!("batch {index}: {e}"));
                }
            }
        }
        (sent, errors)
    }

    async fn confirm_batches(&self, sent: &[SentBatch]) -> Settlement {
        let mut settlement = Settlement::default();
        for batch in sent {
            match self.await_landing(&batch.signature).await {
                Landing::Confirmed => {
                    settlement.sent_lamports += batch.lamports;
                    settlement.sent_recipients += batch.recipients;
                    settlement.confirmed_lamports += batch.lamports;
                    settlement.confirmed_batches += 1;
                }
                Landing::Rejected(reason) => {
                    settlement.errors.push(format!("{} failed on chain: {reason}", batch.signature));
                }
                Landing::Unknown(reason) => {
                    settlement.sent_lamports += batch.lamports;
                    settlement.sent_recipients += batch.recipients;
                    settlement.uncertain_batches += 1;
                    settlement.errors.push(format!("{}: {reason}", batch.signature));
                }
            }
        }
        settlement
    }

    async fn fail_distribution(&self, mut record: DistributionRecord, reason: String) -> CycleOutcome {
        self.enter_failure(&reason);
        record.timestamp = self.now();
        record.status = DistributionStatus::Failed;
        record.error = Some(reason.clone());
        self.persist(HistoryRecord::Distribution(record)).await;
        CycleOutcome::Failed(reason)
    }
}
