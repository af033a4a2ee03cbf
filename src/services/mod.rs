use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::VersionedTransaction};

use crate::error::Result;
use crate::types::{Payout, Quote, TokenHolder, TxStatus};

pub mod jupiter_swap;
pub mod solana_chain;

/// A transaction signed once and re-sent verbatim on every retry. Its
/// signature is known before the first send, so a lost reply can be
/// resolved with a status lookup instead of a second payment.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub signature: Signature,
    pub transaction: VersionedTransaction,
}

impl SignedTx {
    pub fn new(transaction: VersionedTransaction) -> Self {
        let signature = transaction.signatures.first().copied().unwrap_or_default();
        Self {
            signature,
            transaction,
        }
    }
}

/// Chain capabilities the coordinator needs. Implementations must report
/// network-class failures as `Error::TransientNetwork` and everything else
/// as a non-retryable class.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64>;

    /// Treasury's balance of `mint` in base units; 0 when it holds no account.
    async fn get_token_balance(&self, mint: &Pubkey) -> Result<u64>;

    /// `Pending` covers both "not landed yet" and "never seen".
    async fn get_transaction_status(&self, signature: &Signature) -> Result<TxStatus>;

    /// Full scan of token accounts for `mint`, aggregated per owner.
    async fn fetch_holders(&self, mint: &Pubkey) -> Result<Vec<TokenHolder>>;

    /// Signs one transaction paying every entry in `payouts` from the treasury.
    async fn sign_payouts(&self, payouts: &[Payout]) -> Result<SignedTx>;

    /// Signs a burn of `amount` base units of `mint` held by the treasury.
    async fn sign_burn(&self, mint: &Pubkey, amount: u64) -> Result<SignedTx>;

    /// Sends a signed transaction without waiting for confirmation. Sending
    /// one that already landed is not an error.
    async fn submit(&self, tx: &SignedTx) -> Result<Signature>;
}

#[async_trait]
pub trait SwapClient: Send + Sync {
    /// Quotes `amount_in` lamports of SOL into the reward token.
    async fn quote(&self, amount_in: u64) -> Result<Quote>;

    /// Builds and signs the swap transaction for `quote`.
    async fn prepare(&self, quote: &Quote) -> Result<SignedTx>;

    /// Sends a prepared swap without waiting for confirmation.
    async fn execute(&self, tx: &SignedTx) -> Result<Signature>;
}
