//! The two background timers.
//!
//! The cache timer refreshes every stale slice on its own task. The
//! eligibility timer starts a cycle when one is due and the run lock is free.
//! Neither timer waits on the other, and neither ever waits for the lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache::{DataCache, SliceKind};
use crate::config::{CacheConfig, CycleConfig};
use crate::cycle::{CycleLauncher, CycleOutcome, TriggerOutcome};
use crate::run_lock::RunOwner;

pub struct RefreshScheduler {
    cache: Arc<DataCache>,
    launcher: Arc<CycleLauncher>,
    cache_tick: Duration,
    eligibility_tick: Duration,
    distribution_interval: Duration,
    burn_interval: Option<Duration>,
}

impl RefreshScheduler {
    pub fn new(
        cache: Arc<DataCache>,
        launcher: Arc<CycleLauncher>,
        cache_config: &CacheConfig,
        cycles: &CycleConfig,
    ) -> Self {
        Self {
            cache,
            launcher,
            cache_tick: cache_config.tick,
            eligibility_tick: cycles.eligibility_tick,
            distribution_interval: cycles.distribution_interval,
            burn_interval: cycles.burn_interval,
        }
    }

    /// Runs both timers until `shutdown` flips to true (or its sender is
    /// dropped), then waits for a cycle that is still running.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Option<CycleOutcome> {
        info!(
            cache_tick_secs = self.cache_tick.as_secs(),
            eligibility_tick_secs = self.eligibility_tick.as_secs(),
            "[Scheduler] started"
        );
        tokio::join!(
            self.cache_loop(shutdown.clone()),
            self.eligibility_loop(shutdown)
        );
        info!("[Scheduler] timers stopped, waiting for in-flight cycle");
        let outcome = self.launcher.wait_idle().await;
        info!("[Scheduler] stopped");
        outcome
    }

    async fn cache_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cache_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refreshes = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.refresh_stale(&mut refreshes),
                Some(joined) = refreshes.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "[Scheduler] refresh task panicked");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        // Refreshes only read; their in-flight flags are cleared on drop.
        refreshes.abort_all();
    }

    fn refresh_stale(&self, refreshes: &mut JoinSet<()>) {
        for kind in SliceKind::ALL {
            let status = self.cache.status(kind);
            if !status.is_stale || status.is_refreshing {
                continue;
            }
            debug!(slice = kind.name(), "[Scheduler] slice stale, refreshing");
            let cache = Arc::clone(&self.cache);
            refreshes.spawn(async move {
                cache.refresh(kind).await;
            });
        }
    }

    async fn eligibility_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.eligibility_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_eligibility();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn interval_for(&self, owner: RunOwner) -> Option<Duration> {
        match owner {
            RunOwner::Distribution => Some(self.distribution_interval),
            RunOwner::Burn => self.burn_interval,
        }
    }

    /// One eligibility pass. Returns the cycle it started, if any.
    pub fn check_eligibility(&self) -> Option<RunOwner> {
        let now = self.cache.now();
        for owner in [RunOwner::Distribution, RunOwner::Burn] {
            let Some(every) = self.interval_for(owner) else {
                continue;
            };
            if !self.cache.completion_known(owner) {
                debug!(cycle = %owner, "[Scheduler] last run not loaded yet, skipping");
                continue;
            }
            let due = match self.cache.last_completed(owner) {
                None => true,
                Some(last) => chrono::Duration::from_std(every)
                    .map_or(false, |every| now.signed_duration_since(last) >= every),
            };
            if !due {
                continue;
            }
            match self.launcher.try_start(owner) {
                TriggerOutcome::Started => {
                    info!(cycle = %owner, "[Scheduler] cycle due, started");
                    return Some(owner);
                }
                TriggerOutcome::Busy(holder) => {
                    info!(cycle = %owner, running = %holder, "[Scheduler] cycle due but lock held, skipping");
                }
            }
        }
        None
    }
}
