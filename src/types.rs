use chrono::{DateTime, TimeZone, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::run_lock::RunOwner;

// --- Holders ---

/// One owner's aggregated balance of the reward token, as returned by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHolder {
    pub address: Pubkey,
    pub balance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderCategory {
    TopHolder,
    DiamondHands,
    EarlyAdopter,
    Holder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedHolder {
    #[serde(serialize_with = "serialize_display")]
    pub address: Pubkey,
    pub balance: u64,
    /// 1-based, by descending balance.
    pub rank: u32,
    pub category: HolderCategory,
}

/// Rank cut-offs used to categorise holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderTiers {
    pub top_holders: u32,
    pub diamond_hands_rank: u32,
    pub early_adopters_rank: u32,
    /// Balances below this are not counted as holders at all.
    pub min_balance: u64,
}

impl Default for HolderTiers {
    fn default() -> Self {
        Self {
            top_holders: 10,
            diamond_hands_rank: 50,
            early_adopters_rank: 100,
            min_balance: 1,
        }
    }
}

impl HolderTiers {
    pub fn category_for(&self, rank: u32) -> HolderCategory {
        if rank <= self.top_holders {
            HolderCategory::TopHolder
        } else if rank <= self.diamond_hands_rank {
            HolderCategory::DiamondHands
        } else if rank <= self.early_adopters_rank {
            HolderCategory::EarlyAdopter
        } else {
            HolderCategory::Holder
        }
    }
}

/// Immutable result of one full holder scan. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HolderSnapshot {
    pub top_holders: Vec<RankedHolder>,
    pub early_adopters: Vec<RankedHolder>,
    pub diamond_hands: Vec<RankedHolder>,
    pub all_holders: Vec<RankedHolder>,
    pub total_held: u128,
    pub captured_at: Option<DateTime<Utc>>,
}

impl HolderSnapshot {
    /// Builds a snapshot from raw scan output. `exclude` is dropped (usually
    /// the treasury itself), as is anything below `tiers.min_balance`.
    pub fn build(
        holders: Vec<TokenHolder>,
        exclude: &Pubkey,
        tiers: &HolderTiers,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let mut holders: Vec<TokenHolder> = holders
            .into_iter()
            .filter(|h| &h.address != exclude && h.balance >= tiers.min_balance.max(1))
            .collect();
        holders.sort_by(|a, b| {
            b.balance
                .cmp(&a.balance)
                .then_with(|| a.address.to_string().cmp(&b.address.to_string()))
        });

        let all_holders: Vec<RankedHolder> = holders
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let rank = i as u32 + 1;
                RankedHolder {
                    address: h.address,
                    balance: h.balance,
                    rank,
                    category: tiers.category_for(rank),
                }
            })
            .collect();

        let pick = |category: HolderCategory| -> Vec<RankedHolder> {
            all_holders
                .iter()
                .filter(|h| h.category == category)
                .cloned()
                .collect()
        };

        Self {
            top_holders: pick(HolderCategory::TopHolder),
            diamond_hands: pick(HolderCategory::DiamondHands),
            early_adopters: pick(HolderCategory::EarlyAdopter),
            total_held: all_holders.iter().map(|h| h.balance as u128).sum(),
            all_holders,
            captured_at: Some(captured_at),
        }
    }

    pub fn active_holders(&self) -> usize {
        self.all_holders.len()
    }
}

pub type SharedHolders = Arc<HolderSnapshot>;

// --- External call payloads ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub recipient: Pubkey,
    pub lamports: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub amount_in: u64,
    pub amount_out: u64,
    /// Opaque aggregator route, handed back verbatim on execute.
    pub route: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed,
    Pending,
    Failed(String),
}

// --- Run history ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionStatus {
    Pending,
    Success,
    Partial,
    Failed,
}

impl DistributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributionStatus::Pending => "pending",
            DistributionStatus::Success => "success",
            DistributionStatus::Partial => "partial",
            DistributionStatus::Failed => "failed",
        }
    }

    /// `partial` is also written while batches are still going out, so only
    /// `pending` means "no batch was ever sent".
    pub fn is_terminal(self) -> bool {
        !matches!(self, DistributionStatus::Pending)
    }

    /// Funds left the treasury.
    pub fn moved_funds(self) -> bool {
        matches!(self, DistributionStatus::Success | DistributionStatus::Partial)
    }
}

impl FromStr for DistributionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DistributionStatus::Pending),
            "success" => Ok(DistributionStatus::Success),
            "partial" => Ok(DistributionStatus::Partial),
            "failed" => Ok(DistributionStatus::Failed),
            other => Err(Error::Validation(format!("unknown distribution status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BurnStatus {
    Pending,
    Bought,
    Burned,
    Failed,
}

impl BurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BurnStatus::Pending => "pending",
            BurnStatus::Bought => "bought",
            BurnStatus::Burned => "burned",
            BurnStatus::Failed => "failed",
        }
    }

    /// Forward-only. Once tokens are bought the record can only become
    /// `burned`; a failed burn after that is left for manual remediation.
    pub fn can_advance_to(self, next: BurnStatus) -> bool {
        matches!(
            (self, next),
            (BurnStatus::Pending, BurnStatus::Bought)
                | (BurnStatus::Pending, BurnStatus::Failed)
                | (BurnStatus::Bought, BurnStatus::Burned)
        )
    }

    pub fn moved_funds(self) -> bool {
        matches!(self, BurnStatus::Bought | BurnStatus::Burned)
    }
}

impl FromStr for BurnStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BurnStatus::Pending),
            "bought" => Ok(BurnStatus::Bought),
            "burned" => Ok(BurnStatus::Burned),
            "failed" => Ok(BurnStatus::Failed),
            other => Err(Error::Validation(format!("unknown burn status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Lamports in batches that were sent and not rejected on chain.
    pub total_distributed: u64,
    /// The confirmed part of `total_distributed`.
    pub total_confirmed: u64,
    pub recipient_count: u32,
    pub source_tx_signature: Option<String>,
    pub status: DistributionStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurnRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sol_amount: u64,
    pub tokens_burned: u64,
    pub buy_signature: Option<String>,
    pub burn_signature: Option<String>,
    pub status: BurnStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryRecord {
    Distribution(DistributionRecord),
    Burn(BurnRecord),
}

impl HistoryRecord {
    pub fn id(&self) -> Uuid {
        match self {
            HistoryRecord::Distribution(r) => r.id,
            HistoryRecord::Burn(r) => r.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryRecord::Distribution(r) => r.timestamp,
            HistoryRecord::Burn(r) => r.timestamp,
        }
    }

    pub fn owner(&self) -> RunOwner {
        match self {
            HistoryRecord::Distribution(_) => RunOwner::Distribution,
            HistoryRecord::Burn(_) => RunOwner::Burn,
        }
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            HistoryRecord::Distribution(r) => r.status.as_str(),
            HistoryRecord::Burn(r) => r.status.as_str(),
        }
    }

    /// True when this record means the cycle actually moved treasury funds.
    pub fn moved_funds(&self) -> bool {
        match self {
            HistoryRecord::Distribution(r) => r.status.moved_funds(),
            HistoryRecord::Burn(r) => r.status.moved_funds(),
        }
    }
}

/// Flat row layout used by the ClickHouse history table.
#[derive(Row, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub kind: String,
    pub id: String,
    pub timestamp: u32,
    pub status: String,
    pub amount_lamports: u64,
    pub confirmed_lamports: u64,
    pub token_amount: u64,
    pub recipient_count: u32,
    pub signature: Option<String>,
    pub burn_signature: Option<String>,
    pub error: Option<String>,
}

impl From<&HistoryRecord> for HistoryRow {
    fn from(record: &HistoryRecord) -> Self {
        match record {
            HistoryRecord::Distribution(r) => HistoryRow {
                kind: "distribution".to_string(),
                id: r.id.to_string(),
                timestamp: r.timestamp.timestamp().max(0) as u32,
                status: r.status.as_str().to_string(),
                amount_lamports: r.total_distributed,
                confirmed_lamports: r.total_confirmed,
                token_amount: 0,
                recipient_count: r.recipient_count,
                signature: r.source_tx_signature.clone(),
                burn_signature: None,
                error: r.error.clone(),
            },
            HistoryRecord::Burn(r) => HistoryRow {
                kind: "burn".to_string(),
                id: r.id.to_string(),
                timestamp: r.timestamp.timestamp().max(0) as u32,
                status: r.status.as_str().to_string(),
                amount_lamports: r.sol_amount,
                confirmed_lamports: 0,
                token_amount: r.tokens_burned,
                recipient_count: 0,
                signature: r.buy_signature.clone(),
                burn_signature: r.burn_signature.clone(),
                error: r.error.clone(),
            },
        }
    }
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = Error;

    fn try_from(row: HistoryRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Validation(format!("bad history id '{}': {e}", row.id)))?;
        let timestamp = Utc
            .timestamp_opt(row.timestamp as i64, 0)
            .single()
            .ok_or_else(|| Error::Validation(format!("bad history timestamp {}", row.timestamp)))?;

        match row.kind.as_str() {
            "distribution" => Ok(HistoryRecord::Distribution(DistributionRecord {
                id,
                timestamp,
                total_distributed: row.amount_lamports,
                total_confirmed: row.confirmed_lamports,
                recipient_count: row.recipient_count,
                source_tx_signature: row.signature,
                status: row.status.parse()?,
                error: row.error,
            })),
            "burn" => Ok(HistoryRecord::Burn(BurnRecord {
                id,
                timestamp,
                sol_amount: row.amount_lamports,
                tokens_burned: row.token_amount,
                buy_signature: row.signature,
                burn_signature: row.burn_signature,
                status: row.status.parse()?,
                error: row.error,
            })),
            other => Err(Error::Validation(format!("unknown history kind '{other}'"))),
        }
    }
}

fn serialize_display<S, T>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: std::fmt::Display,
{
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(balance: u64) -> TokenHolder {
        TokenHolder {
            address: Pubkey::new_unique(),
            balance,
        }
    }

    #[test]
    fn snapshot_ranks_and_categorises_by_balance() {
        let treasury = Pubkey::new_unique();
        let tiers = HolderTiers {
            top_holders: 1,
            diamond_hands_rank: 2,
            early_adopters_rank: 3,
            min_balance: 10,
        };
        let mut raw = vec![holder(50), holder(500), holder(5), holder(200), holder(100)];
        raw.push(TokenHolder {
            address: treasury,
            balance: 1_000_000,
        });

        let snapshot = HolderSnapshot::build(raw, &treasury, &tiers, Utc::now());

        let balances: Vec<u64> = snapshot.all_holders.iter().map(|h| h.balance).collect();
        assert_eq!(balances, vec![500, 200, 100, 50]);
        assert_eq!(snapshot.top_holders.len(), 1);
        assert_eq!(snapshot.top_holders[0].balance, 500);
        assert_eq!(snapshot.diamond_hands[0].rank, 2);
        assert_eq!(snapshot.early_adopters[0].balance, 100);
        assert_eq!(snapshot.all_holders[3].category, HolderCategory::Holder);
        assert_eq!(snapshot.total_held, 850);
    }

    #[test]
    fn burn_status_only_moves_forward() {
        assert!(BurnStatus::Pending.can_advance_to(BurnStatus::Bought));
        assert!(BurnStatus::Bought.can_advance_to(BurnStatus::Burned));
        assert!(!BurnStatus::Burned.can_advance_to(BurnStatus::Pending));
        assert!(!BurnStatus::Bought.can_advance_to(BurnStatus::Failed));
        assert!(!BurnStatus::Failed.can_advance_to(BurnStatus::Bought));
    }

    #[test]
    fn history_row_preserves_burn_fields() {
        let record = HistoryRecord::Burn(BurnRecord {
            id: Uuid::new_v4(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            sol_amount: 42,
            tokens_burned: 9_000,
            buy_signature: Some("buy".into()),
            burn_signature: None,
            status: BurnStatus::Bought,
            error: Some("burn rpc down".into()),
        });
        let row = HistoryRow::from(&record);
        assert_eq!(row.kind, "burn");
        assert_eq!(HistoryRecord::try_from(row).unwrap(), record);
    }

    #[test]
    fn unknown_row_kind_is_rejected() {
        let row = HistoryRow {
            kind: "airdrop".into(),
            id: Uuid::new_v4().to_string(),
            timestamp: 0,
            status: "success".into(),
            amount_lamports: 0,
            confirmed_lamports: 0,
            token_amount: 0,
            recipient_count: 0,
            signature: None,
            burn_signature: None,
            error: None,
        };
        assert!(matches!(HistoryRecord::try_from(row), Err(Error::Validation(_))));
    }
}
