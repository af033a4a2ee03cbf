use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
    rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig},
    rpc_filter::{Memcmp, RpcFilterType},
    rpc_request::RpcError,
};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::{Transaction, TransactionError, VersionedTransaction},
};
use solana_system_interface::instruction as system_instruction;
use spl_associated_token_account::get_associated_token_address;
use spl_token::solana_program::program_pack::Pack;
use spl_token::state::Account as SplAccount;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ChainClient, SignedTx};
use crate::error::{Error, Result};
use crate::types::{Payout, TokenHolder, TxStatus};

// Node-side codes that mean "try again later".
const RPC_NODE_UNHEALTHY: i64 = -32005;
const RPC_BLOCK_NOT_AVAILABLE: i64 = -32004;
const RPC_SLOT_SKIPPED: i64 = -32007;

/// `ChainClient` over the nonblocking Solana RPC client.
///
/// The treasury signs payouts and burns; without a keypair the client is
/// read-only and every write fails validation.
pub struct SolanaChain {
    rpc: Arc<RpcClient>,
    treasury: Pubkey,
    signer: Option<Arc<Keypair>>,
}

impl SolanaChain {
    pub fn new(rpc_url: String, timeout: Duration, treasury: Pubkey, signer: Option<Arc<Keypair>>) -> Self {
        let rpc = RpcClient::new_with_timeout_and_commitment(rpc_url, timeout, CommitmentConfig::confirmed());
        Self {
            rpc: Arc::new(rpc),
            treasury,
            signer,
        }
    }

    fn signer(&self) -> Result<&Keypair> {
        self.signer
            .as_deref()
            .ok_or_else(|| Error::Validation("no treasury keypair configured; chain client is read-only".into()))
    }

    async fn sign(&self, instructions: &[Instruction]) -> Result<SignedTx> {
        let signer = self.signer()?;
        let blockhash = self.rpc.get_latest_blockhash().await.map_err(classify_client_error)?;
        let tx = Transaction::new_signed_with_payer(instructions, Some(&signer.pubkey()), &[signer], blockhash);
        Ok(SignedTx::new(VersionedTransaction::from(tx)))
    }
}

#[async_trait]
impl ChainClient for SolanaChain {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        self.rpc.get_balance(address).await.map_err(classify_client_error)
    }

    async fn get_token_balance(&self, mint: &Pubkey) -> Result<u64> {
        let token_account = get_associated_token_address(&self.treasury, mint);
        let account = self
            .rpc
            .get_account_with_commitment(&token_account, self.rpc.commitment())
            .await
            .map_err(classify_client_error)?
            .value;
        match account {
            None => Ok(0),
            Some(account) => SplAccount::unpack(&account.data)
                .map(|a| a.amount)
                .map_err(|e| Error::Validation(format!("treasury token account {token_account} did not decode: {e}"))),
        }
    }

    async fn get_transaction_status(&self, signature: &Signature) -> Result<TxStatus> {
        let status = self
            .rpc
            .get_signature_status(signature)
            .await
            .map_err(classify_client_error)?;
        Ok(match status {
            None => TxStatus::Pending,
            Some(Ok(())) => TxStatus::Confirmed,
            Some(Err(e)) => TxStatus::Failed(e.to_string()),
        })
    }

    async fn fetch_holders(&self, mint: &Pubkey) -> Result<Vec<TokenHolder>> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![
                RpcFilterType::DataSize(SplAccount::LEN as u64),
                RpcFilterType::Memcmp(Memcmp::new_base58_encoded(0, &mint.to_bytes())),
            ]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                ..Default::default()
            },
            ..Default::default()
        };

        let accounts = self
            .rpc
            .get_program_accounts_with_config(&spl_token::id(), config)
            .await
            .map_err(classify_client_error)?;

        let mut per_owner: HashMap<Pubkey, u64> = HashMap::new();
        for (address, account) in &accounts {
            match SplAccount::unpack(&account.data) {
                Ok(token_account) if token_account.amount > 0 => {
                    *per_owner.entry(token_account.owner).or_default() += token_account.amount;
                }
                Ok(_) => {}
                Err(e) => debug!(account = %address, error = %e, "[SolanaChain] skipping unparsable token account"),
            }
        }

        debug!(accounts = accounts.len(), owners = per_owner.len(), "[SolanaChain] holder scan complete");
        Ok(per_owner
            .into_iter()
            .map(|(address, balance)| TokenHolder { address, balance })
            .collect())
    }

    async fn sign_payouts(&self, payouts: &[Payout]) -> Result<SignedTx> {
        if payouts.is_empty() {
            return Err(Error::Validation("empty payout batch".into()));
        }
        let payer = self.signer()?.pubkey();
        if payer != self.treasury {
            return Err(Error::Validation(format!(
                "signer {payer} is not the treasury {}",
                self.treasury
            )));
        }
        let instructions: Vec<Instruction> = payouts
            .iter()
            .map(|p| system_instruction::transfer(&payer, &p.recipient, p.lamports))
            .collect();
        self.sign(&instructions).await
    }

    async fn sign_burn(&self, mint: &Pubkey, amount: u64) -> Result<SignedTx> {
        let owner = self.signer()?.pubkey();
        let token_account = get_associated_token_address(&owner, mint);
        let burn = spl_token::instruction::burn(&spl_token::id(), &token_account, mint, &owner, &[], amount)
            .map_err(|e| Error::Validation(format!("failed to build burn instruction: {e}")))?;
        self.sign(&[burn]).await
    }

    async fn submit(&self, tx: &SignedTx) -> Result<Signature> {
        match self.rpc.send_transaction(&tx.transaction).await {
            Ok(signature) => Ok(signature),
            Err(e) if matches!(e.get_transaction_error(), Some(TransactionError::AlreadyProcessed)) => {
                debug!(signature = %tx.signature, "[SolanaChain] transaction already landed");
                Ok(tx.signature)
            }
            Err(e) => Err(classify_client_error(e)),
        }
    }
}

/// Maps RPC client failures onto the coordinator's error classes.
pub fn classify_client_error(e: ClientError) -> Error {
    let message = e.to_string();
    match e.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) | ClientErrorKind::Middleware(_) => {
            Error::TransientNetwork(message)
        }
        ClientErrorKind::RpcError(RpcError::RpcRequestError(_)) => Error::TransientNetwork(message),
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, .. })
            if matches!(*code, RPC_NODE_UNHEALTHY | RPC_BLOCK_NOT_AVAILABLE | RPC_SLOT_SKIPPED | 429) =>
        {
            Error::TransientNetwork(message)
        }
        ClientErrorKind::TransactionError(tx_err) => classify_transaction_error(tx_err, message),
        _ if message.to_ascii_lowercase().contains("insufficient") => Error::InsufficientFunds(message),
        _ => Error::Validation(message),
    }
}

fn classify_transaction_error(err: &TransactionError, message: String) -> Error {
    match err {
        TransactionError::InsufficientFundsForFee | TransactionError::InsufficientFundsForRent { .. } => {
            Error::InsufficientFunds(message)
        }
        TransactionError::BlockhashNotFound | TransactionError::WouldExceedMaxBlockCostLimit => {
            Error::TransientNetwork(message)
        }
        _ => Error::Validation(message),
    }
}
