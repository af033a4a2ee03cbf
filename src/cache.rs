//! Last-known values for the expensive chain reads.
//!
//! Reads never touch the network and never wait on a refresh. Each slice
//! carries its own staleness threshold and an in-flight flag so that at most
//! one refresh per slice runs at a time; a second request while one is in
//! flight is dropped, not queued.

use chrono::{DateTime, Utc};
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::history::{self, HistoryStore};
use crate::retry::{self, RetryPolicy};
use crate::run_lock::RunOwner;
use crate::services::ChainClient;
use crate::types::{HolderSnapshot, HolderTiers, SharedHolders};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceKind {
    TreasuryBalance,
    Holders,
    LastDistribution,
    LastBurn,
}

impl SliceKind {
    pub const ALL: [SliceKind; 4] = [
        SliceKind::TreasuryBalance,
        SliceKind::Holders,
        SliceKind::LastDistribution,
        SliceKind::LastBurn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SliceKind::TreasuryBalance => "treasury_balance",
            SliceKind::Holders => "holders",
            SliceKind::LastDistribution => "last_distribution",
            SliceKind::LastBurn => "last_burn",
        }
    }

    fn completion_of(owner: RunOwner) -> Self {
        match owner {
            RunOwner::Distribution => SliceKind::LastDistribution,
            RunOwner::Burn => SliceKind::LastBurn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSlice<T> {
    value: T,
    last_updated_at: Option<DateTime<Utc>>,
    is_refreshing: bool,
    /// Set when the value is known to be outdated regardless of its age.
    expired: bool,
    /// `None` means the slice only goes stale while it was never populated.
    stale_after: Option<Duration>,
}

impl<T> CacheSlice<T> {
    pub fn new(initial: T, stale_after: Option<Duration>) -> Self {
        Self {
            value: initial,
            last_updated_at: None,
            is_refreshing: false,
            expired: false,
            stale_after,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated_at
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let Some(updated) = self.last_updated_at else {
            return true;
        };
        if self.expired {
            return true;
        }
        let Some(stale_after) = self.stale_after else {
            return false;
        };
        let age = now.signed_duration_since(updated);
        chrono::Duration::from_std(stale_after).map_or(false, |limit| age > limit)
    }

    /// Claims the in-flight flag. False when a refresh already holds it.
    fn begin_refresh(&mut self) -> bool {
        if self.is_refreshing {
            return false;
        }
        self.is_refreshing = true;
        true
    }

    fn commit(&mut self, value: T, at: DateTime<Utc>) {
        self.value = value;
        self.last_updated_at = Some(at);
        self.is_refreshing = false;
        self.expired = false;
    }

    /// Keeps serving the value but forces the next staleness check to fail.
    fn expire(&mut self) {
        self.expired = true;
    }
}

/// Point-in-time view of one slice's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SliceStatus {
    pub kind: SliceKind,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub is_refreshing: bool,
    pub is_stale: bool,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed,
    AlreadyRefreshing,
    Failed(Error),
}

impl RefreshOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed)
    }
}

/// Summary served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedData {
    pub treasury_balance: u64,
    pub active_holders: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_updating: bool,
}

/// Where refreshes get their data from.
pub struct CacheSources {
    pub chain: Arc<dyn ChainClient>,
    pub history: Arc<dyn HistoryStore>,
    pub treasury: Pubkey,
    pub token_mint: Pubkey,
    pub tiers: HolderTiers,
    pub rpc_retry: RetryPolicy,
}

pub struct DataCache {
    treasury_balance: RwLock<CacheSlice<u64>>,
    holders: RwLock<CacheSlice<SharedHolders>>,
    last_distribution: RwLock<CacheSlice<Option<DateTime<Utc>>>>,
    last_burn: RwLock<CacheSlice<Option<DateTime<Utc>>>>,
    sources: CacheSources,
    clock: Arc<dyn Clock>,
}

fn read_slot<T>(slot: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_slot<T>(slot: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag however the refresh future ends, including
/// cancellation.
struct InFlight<'a, T> {
    slot: &'a RwLock<CacheSlice<T>>,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        write_slot(self.slot).is_refreshing = false;
    }
}

impl DataCache {
    pub fn new(sources: CacheSources, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            treasury_balance: RwLock::new(CacheSlice::new(0, Some(config.balance_stale_after))),
            holders: RwLock::new(CacheSlice::new(
                Arc::new(HolderSnapshot::default()),
                Some(config.holders_stale_after),
            )),
            last_distribution: RwLock::new(CacheSlice::new(None, None)),
            last_burn: RwLock::new(CacheSlice::new(None, None)),
            sources,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- Reads ---

    /// Last known treasury balance in lamports; 0 before the first refresh.
    pub fn treasury_balance(&self) -> u64 {
        *read_slot(&self.treasury_balance).value()
    }

    /// Last holder snapshot; empty before the first refresh.
    pub fn holders(&self) -> SharedHolders {
        Arc::clone(read_slot(&self.holders).value())
    }

    /// Last time a cycle of `owner` moved funds, if any is known.
    pub fn last_completed(&self, owner: RunOwner) -> Option<DateTime<Utc>> {
        *read_slot(self.completion_slot(owner)).value()
    }

    /// Whether the completion time for `owner` has been loaded at all. An
    /// unloaded slice is not the same as "never ran".
    pub fn completion_known(&self, owner: RunOwner) -> bool {
        read_slot(self.completion_slot(owner)).last_updated_at().is_some()
    }

    pub fn is_stale(&self, kind: SliceKind) -> bool {
        self.status(kind).is_stale
    }

    pub fn status(&self, kind: SliceKind) -> SliceStatus {
        let now = self.clock.now();
        let (last_updated_at, is_refreshing, is_stale) = match kind {
            SliceKind::TreasuryBalance => Self::bookkeeping(&self.treasury_balance, now),
            SliceKind::Holders => Self::bookkeeping(&self.holders, now),
            SliceKind::LastDistribution => Self::bookkeeping(&self.last_distribution, now),
            SliceKind::LastBurn => Self::bookkeeping(&self.last_burn, now),
        };
        SliceStatus {
            kind,
            last_updated_at,
            is_refreshing,
            is_stale,
        }
    }

    pub fn cached_data(&self) -> CachedData {
        let balance = read_slot(&self.treasury_balance);
        let holders = read_slot(&self.holders);
        CachedData {
            treasury_balance: *balance.value(),
            active_holders: holders.value().active_holders(),
            last_updated: balance.last_updated_at().max(holders.last_updated_at()),
            is_updating: balance.is_refreshing() || holders.is_refreshing(),
        }
    }

    fn bookkeeping<T>(slot: &RwLock<CacheSlice<T>>, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, bool, bool) {
        let slice = read_slot(slot);
        (slice.last_updated_at(), slice.is_refreshing(), slice.is_stale(now))
    }

    fn completion_slot(&self, owner: RunOwner) -> &RwLock<CacheSlice<Option<DateTime<Utc>>>> {
        match SliceKind::completion_of(owner) {
            SliceKind::LastBurn => &self.last_burn,
            _ => &self.last_distribution,
        }
    }

    // --- Writes ---

    /// The only entry point through which cycles (or an external orchestrator)
    /// report a completed run. Never moves the time backwards.
    ///
    /// A completed run moved treasury funds, so the cached balance is expired
    /// as well: it is still served to readers, but the next cycle has to
    /// refresh it before spending from it.
    pub fn record_cycle_completed(&self, owner: RunOwner, at: DateTime<Utc>) {
        let now = self.clock.now();
        {
            let mut slice = write_slot(self.completion_slot(owner));
            let value = (*slice.value()).max(Some(at));
            let refreshing = slice.is_refreshing;
            slice.commit(value, now);
            // A hydration racing with this update still owns the flag.
            slice.is_refreshing = refreshing;
        }
        write_slot(&self.treasury_balance).expire();
        info!(cycle = %owner, at = %at, "[DataCache] recorded completed cycle");
    }

    /// Refreshes one slice. Returns immediately if that slice is already being
    /// refreshed. On failure the previous value and timestamp stay as they were.
    pub async fn refresh(&self, kind: SliceKind) -> RefreshOutcome {
        let policy = self.sources.rpc_retry;
        match kind {
            SliceKind::TreasuryBalance => {
                let chain = &self.sources.chain;
                let treasury = self.sources.treasury;
                self.refresh_slot(kind, &self.treasury_balance, |_, fresh| fresh, async move {
                    retry::call("get_balance", &policy, || chain.get_balance(&treasury)).await
                })
                .await
            }
            SliceKind::Holders => {
                let chain = &self.sources.chain;
                let mint = self.sources.token_mint;
                let treasury = self.sources.treasury;
                let tiers = self.sources.tiers;
                let clock = &self.clock;
                self.refresh_slot(kind, &self.holders, |_, fresh| fresh, async move {
                    let raw = retry::call("fetch_holders", &policy, || chain.fetch_holders(&mint)).await?;
                    Ok(Arc::new(HolderSnapshot::build(raw, &treasury, &tiers, clock.now())))
                })
                .await
            }
            SliceKind::LastDistribution => self.hydrate_completion(RunOwner::Distribution).await,
            SliceKind::LastBurn => self.hydrate_completion(RunOwner::Burn).await,
        }
    }

    async fn hydrate_completion(&self, owner: RunOwner) -> RefreshOutcome {
        let store = &self.sources.history;
        self.refresh_slot(
            SliceKind::completion_of(owner),
            self.completion_slot(owner),
            |current, fresh| (*current).max(fresh),
            async move {
                let records = history::latest_per_id(store.all().await?);
                Ok(history::last_completion(&records, owner))
            },
        )
        .await
    }

    async fn refresh_slot<T, M, Fut>(
        &self,
        kind: SliceKind,
        slot: &RwLock<CacheSlice<T>>,
        merge: M,
        fetch: Fut,
    ) -> RefreshOutcome
    where
        M: FnOnce(&T, T) -> T,
        Fut: Future<Output = Result<T>>,
    {
        if !write_slot(slot).begin_refresh() {
            debug!(slice = kind.name(), "[DataCache] refresh already in flight, skipping");
            return RefreshOutcome::AlreadyRefreshing;
        }
        let _in_flight = InFlight { slot };

        match fetch.await {
            Ok(fresh) => {
                let now = self.clock.now();
                let mut slice = write_slot(slot);
                let value = merge(slice.value(), fresh);
                slice.commit(value, now);
                debug!(slice = kind.name(), "[DataCache] refreshed");
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                warn!(slice = kind.name(), error = %e, "[DataCache] refresh failed, keeping last value");
                RefreshOutcome::Failed(e)
            }
        }
    }
}
