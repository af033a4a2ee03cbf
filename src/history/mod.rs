//! Append-only run history.
//!
//! Every stage of a cycle appends a full row for its record id; nothing is
//! ever rewritten. The newest row per id is that record's current state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::run_lock::RunOwner;
use crate::types::{BurnStatus, DistributionStatus, HistoryRecord};

pub mod clickhouse_store;
pub mod memory;

pub use self::clickhouse_store::ClickHouseHistoryStore;
pub use self::memory::MemoryHistoryStore;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<()>;

    /// Newest rows first.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>>;

    /// Every row, oldest first.
    async fn all(&self) -> Result<Vec<HistoryRecord>>;
}

/// Collapses the row log into one record per id (its newest row), newest
/// record first. `rows` must be oldest first, as returned by `all()`.
pub fn latest_per_id(rows: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut latest: HashMap<Uuid, HistoryRecord> = HashMap::new();
    for row in rows {
        let id = row.id();
        if latest.insert(id, row).is_none() {
            order.push(id);
        }
    }
    let mut records: Vec<HistoryRecord> = order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect();
    records.sort_by_key(|r| std::cmp::Reverse(r.timestamp()));
    records
}

/// Time of the newest record of `owner` that moved funds.
pub fn last_completion(records: &[HistoryRecord], owner: RunOwner) -> Option<DateTime<Utc>> {
    records
        .iter()
        .filter(|r| r.owner() == owner && r.moved_funds())
        .map(HistoryRecord::timestamp)
        .max()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub interrupted: Vec<Uuid>,
    pub needs_remediation: Vec<Uuid>,
}

/// Closes out records a previous process left mid-pipeline.
///
/// A distribution writes `partial` after every batch it sends, so one whose
/// newest row is still `pending` never sent anything and is superseded by a
/// `failed` row. One left at an in-flight `partial` keeps it: those funds
/// moved and still count as a completed run. Burn records stuck at `bought`
/// did move funds; they are reported for manual remediation and left as
/// they are.
pub async fn reconcile_interrupted(
    store: &dyn HistoryStore,
    now: DateTime<Utc>,
) -> Result<ReconcileReport> {
    let records = latest_per_id(store.all().await?);
    let mut report = ReconcileReport::default();

    for record in records {
        match record {
            HistoryRecord::Distribution(mut r) if !r.status.is_terminal() => {
                report.interrupted.push(r.id);
                r.status = DistributionStatus::Failed;
                r.timestamp = now;
                r.error = Some("interrupted by restart before any payout batch was sent".to_string());
                store.append(HistoryRecord::Distribution(r)).await?;
            }
            HistoryRecord::Burn(mut r) if r.status == BurnStatus::Pending => {
                report.interrupted.push(r.id);
                r.status = BurnStatus::Failed;
                r.timestamp = now;
                r.error = Some("interrupted by restart before buy".to_string());
                store.append(HistoryRecord::Burn(r)).await?;
            }
            HistoryRecord::Burn(r) if r.status == BurnStatus::Bought => {
                warn!(
                    id = %r.id,
                    buy_signature = r.buy_signature.as_deref().unwrap_or("-"),
                    tokens = r.tokens_burned,
                    "[History] burn record bought but never burned; manual remediation required"
                );
                report.needs_remediation.push(r.id);
            }
            _ => {}
        }
    }

    if !report.interrupted.is_empty() {
        info!(count = report.interrupted.len(), "[History] closed out interrupted cycles");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BurnRecord, DistributionRecord};
    use chrono::TimeZone;

    fn distribution(id: Uuid, secs: i64, status: DistributionStatus) -> HistoryRecord {
        HistoryRecord::Distribution(DistributionRecord {
            id,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            total_distributed: 100,
            total_confirmed: 0,
            recipient_count: 2,
            source_tx_signature: None,
            status,
            error: None,
        })
    }

    fn burn(id: Uuid, secs: i64, status: BurnStatus) -> HistoryRecord {
        HistoryRecord::Burn(BurnRecord {
            id,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            sol_amount: 10,
            tokens_burned: 1_000,
            buy_signature: Some("buy".into()),
            burn_signature: None,
            status,
            error: None,
        })
    }

    #[test]
    fn newest_row_wins_per_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rows = vec![
            distribution(a, 10, DistributionStatus::Pending),
            distribution(b, 20, DistributionStatus::Pending),
            distribution(a, 30, DistributionStatus::Success),
        ];
        let records = latest_per_id(rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id(), a);
        assert_eq!(records[0].status_str(), "success");
        assert_eq!(records[1].status_str(), "pending");
    }

    #[test]
    fn last_completion_ignores_failures_and_other_kinds() {
        let records = vec![
            distribution(Uuid::new_v4(), 50, DistributionStatus::Failed),
            distribution(Uuid::new_v4(), 40, DistributionStatus::Partial),
            burn(Uuid::new_v4(), 60, BurnStatus::Burned),
        ];
        let last = last_completion(&records, RunOwner::Distribution).unwrap();
        assert_eq!(last.timestamp(), 40);
        assert_eq!(last_completion(&records, RunOwner::Burn).unwrap().timestamp(), 60);
    }

    #[tokio::test]
    async fn reconcile_fails_pending_and_flags_bought() {
        let store = MemoryHistoryStore::new();
        let pending = Uuid::new_v4();
        let bought = Uuid::new_v4();
        let done = Uuid::new_v4();
        store.append(distribution(pending, 10, DistributionStatus::Pending)).await.unwrap();
        store.append(burn(bought, 11, BurnStatus::Pending)).await.unwrap();
        store.append(burn(bought, 12, BurnStatus::Bought)).await.unwrap();
        store.append(distribution(done, 13, DistributionStatus::Pending)).await.unwrap();
        store.append(distribution(done, 14, DistributionStatus::Success)).await.unwrap();

        let now = Utc.timestamp_opt(100, 0).unwrap();
        let report = reconcile_interrupted(&store, now).await.unwrap();

        assert_eq!(report.interrupted, vec![pending]);
        assert_eq!(report.needs_remediation, vec![bought]);

        let latest = latest_per_id(store.all().await.unwrap());
        let closed = latest.iter().find(|r| r.id() == pending).unwrap();
        assert_eq!(closed.status_str(), "failed");
        assert_eq!(store.all().await.unwrap().len(), 6, "reconcile only appends");
    }

    #[tokio::test]
    async fn reconcile_keeps_a_distribution_cut_off_between_batches() {
        let store = MemoryHistoryStore::new();
        let cut_off = Uuid::new_v4();
        store.append(distribution(cut_off, 10, DistributionStatus::Pending)).await.unwrap();
        store.append(distribution(cut_off, 11, DistributionStatus::Partial)).await.unwrap();

        let report = reconcile_interrupted(&store, Utc.timestamp_opt(100, 0).unwrap()).await.unwrap();
        assert!(report.interrupted.is_empty());
        assert_eq!(store.all().await.unwrap().len(), 2);

        let records = latest_per_id(store.all().await.unwrap());
        assert_eq!(last_completion(&records, RunOwner::Distribution).unwrap().timestamp(), 11);
    }
}
