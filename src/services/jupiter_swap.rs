use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::VersionedTransaction,
};
use std::sync::Arc;
use std::time::Duration;

use super::{ChainClient, SignedTx, SwapClient};
use crate::error::{Error, Result};
use crate::types::Quote;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    out_amount: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
}

/// `SwapClient` over the Jupiter quote/swap HTTP API.
///
/// Quotes SOL into the reward mint; the returned swap transaction is signed
/// by the treasury and submitted through the chain client.
pub struct JupiterSwap {
    http: Client,
    api_url: String,
    output_mint: Pubkey,
    slippage_bps: u16,
    signer: Option<Arc<Keypair>>,
    chain: Arc<dyn ChainClient>,
}

impl JupiterSwap {
    pub fn new(
        api_url: String,
        output_mint: Pubkey,
        slippage_bps: u16,
        timeout: Duration,
        signer: Option<Arc<Keypair>>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            output_mint,
            slippage_bps,
            signer,
            chain,
        })
    }
}

#[async_trait]
impl SwapClient for JupiterSwap {
    async fn quote(&self, amount_in: u64) -> Result<Quote> {
        if amount_in == 0 {
            return Err(Error::Validation("cannot quote a zero amount".into()));
        }
        let url = format!("{}/quote", self.api_url);
        let route: serde_json::Value = self
            .http
            .get(&url)
            .query(&[
                ("inputMint", spl_token::native_mint::id().to_string()),
                ("outputMint", self.output_mint.to_string()),
                ("amount", amount_in.to_string()),
                ("slippageBps", self.slippage_bps.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let parsed: QuoteResponse = serde_json::from_value(route.clone())
            .map_err(|e| Error::Validation(format!("unexpected quote payload: {e}")))?;
        let amount_out = parsed
            .out_amount
            .parse::<u64>()
            .map_err(|e| Error::Validation(format!("bad outAmount '{}': {e}", parsed.out_amount)))?;

        Ok(Quote {
            amount_in,
            amount_out,
            route,
        })
    }

    async fn prepare(&self, quote: &Quote) -> Result<SignedTx> {
        let signer = self
            .signer
            .as_deref()
            .ok_or_else(|| Error::Validation("no treasury keypair configured; swaps are disabled".into()))?;
        let url = format!("{}/swap", self.api_url);
        let body = json!({
            "quoteResponse": quote.route,
            "userPublicKey": signer.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
        });
        let response: SwapResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let raw = STANDARD
            .decode(&response.swap_transaction)
            .map_err(|e| Error::Validation(format!("swap transaction is not base64: {e}")))?;
        let unsigned: VersionedTransaction = bincode::deserialize(&raw)
            .map_err(|e| Error::Validation(format!("swap transaction did not decode: {e}")))?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[signer])
            .map_err(|e| Error::Validation(format!("failed to sign swap transaction: {e}")))?;
        Ok(SignedTx::new(signed))
    }

    async fn execute(&self, tx: &SignedTx) -> Result<Signature> {
        self.chain.submit(tx).await
    }
}
