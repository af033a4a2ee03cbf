//! Read and trigger surface handed to the dashboard layer.
//!
//! Every read here is served from memory. Triggers start work on a
//! background task and return straight away.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheSources, CachedData, DataCache, SliceKind};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::cycle::{CycleLauncher, CycleOutcome, CycleProgress, CycleRunner, ProgressTracker, TriggerOutcome};
use crate::error::Result;
use crate::history::{self, HistoryStore, ReconcileReport};
use crate::run_lock::{RunLock, RunOwner};
use crate::scheduler::RefreshScheduler;
use crate::services::{ChainClient, SwapClient};
use crate::types::{HistoryRecord, SharedHolders};

/// Rows fetched per requested record on the first read. A distribution
/// leaves one row per sent batch, so the window widens until it covers
/// `limit` records.
const ROWS_PER_RECORD: usize = 4;

pub struct Coordinator {
    config: CoordinatorConfig,
    cache: Arc<DataCache>,
    store: Arc<dyn HistoryStore>,
    launcher: Arc<CycleLauncher>,
    progress: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        chain: Arc<dyn ChainClient>,
        swap: Arc<dyn SwapClient>,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(DataCache::new(
            CacheSources {
                chain: Arc::clone(&chain),
                history: Arc::clone(&store),
                treasury: config.treasury,
                token_mint: config.token_mint,
                tiers: config.tiers,
                rpc_retry: config.retry.rpc,
            },
            &config.cache,
            Arc::clone(&clock),
        ));
        let progress = Arc::new(ProgressTracker::new());
        let runner = Arc::new(CycleRunner::new(
            Arc::clone(&store),
            chain,
            swap,
            Arc::clone(&cache),
            Arc::clone(&progress),
            Arc::clone(&clock),
            config.token_mint,
            config.cycles.clone(),
            config.retry,
        ));
        let launcher = Arc::new(CycleLauncher::new(runner, Arc::new(RunLock::new())));

        Self {
            config,
            cache,
            store,
            launcher,
            progress,
            clock,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Closes out cycles a previous process left unfinished, then loads every
    /// slice once. Failures are logged; slices that could not be loaded stay
    /// stale and the cache timer keeps retrying them. Cycles are not
    /// scheduled until their last completion time has been loaded.
    pub async fn start_up(&self) -> ReconcileReport {
        let report = match history::reconcile_interrupted(self.store.as_ref(), self.clock.now()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "[Coordinator] could not reconcile history, continuing");
                ReconcileReport::default()
            }
        };
        if !report.needs_remediation.is_empty() {
            warn!(
                ids = ?report.needs_remediation,
                "[Coordinator] burns stuck after buy need manual remediation"
            );
        }

        for kind in SliceKind::ALL {
            if !self.cache.refresh(kind).await.is_refreshed() {
                warn!(slice = kind.name(), "[Coordinator] initial load failed, will retry on next tick");
            }
        }
        info!(
            balance = self.cache.treasury_balance(),
            holders = self.cache.holders().active_holders(),
            last_distribution = ?self.cache.last_completed(RunOwner::Distribution),
            "[Coordinator] ready"
        );
        report
    }

    pub fn scheduler(&self) -> RefreshScheduler {
        RefreshScheduler::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.launcher),
            &self.config.cache,
            &self.config.cycles,
        )
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    pub fn get_cached_data(&self) -> CachedData {
        self.cache.cached_data()
    }

    pub fn get_holder_cached_data(&self) -> SharedHolders {
        self.cache.holders()
    }

    pub fn get_progress(&self) -> CycleProgress {
        self.progress.snapshot()
    }

    /// True while any cycle holds the run lock.
    pub fn is_distribution_running(&self) -> bool {
        self.launcher.lock().holder().is_some()
    }

    pub fn running_cycle(&self) -> Option<RunOwner> {
        self.launcher.lock().holder()
    }

    /// Starts a distribution now, regardless of the interval.
    pub fn trigger_distribution(&self) -> TriggerOutcome {
        self.launcher.try_start(RunOwner::Distribution)
    }

    /// Starts a buy-and-burn now, regardless of the interval.
    pub fn trigger_burn(&self) -> TriggerOutcome {
        self.launcher.try_start(RunOwner::Burn)
    }

    /// Records a distribution completed outside this process, resetting the
    /// eligibility timer.
    pub fn update_last_distribution_time(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        self.cache.record_cycle_completed(RunOwner::Distribution, now);
        now
    }

    /// Current state of the newest `limit` records, newest first.
    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut window = limit.saturating_mul(ROWS_PER_RECORD).max(1);
        loop {
            let mut rows = self.store.recent(window).await?;
            let exhausted = rows.len() < window;
            rows.reverse();
            let mut records = history::latest_per_id(rows);
            if records.len() >= limit || exhausted {
                records.truncate(limit);
                return Ok(records);
            }
            window = window.saturating_mul(2);
        }
    }

    /// Waits for the cycle started last, if it is still being tracked.
    pub async fn wait_idle(&self) -> Option<CycleOutcome> {
        self.launcher.wait_idle().await
    }
}
