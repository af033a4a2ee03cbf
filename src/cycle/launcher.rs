use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{CycleOutcome, CycleRunner};
use crate::error::{Error, Result};
use crate::run_lock::{RunLock, RunOwner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "running", rename_all = "lowercase")]
pub enum TriggerOutcome {
    Started,
    /// Another cycle holds the lock; the trigger was dropped.
    Busy(RunOwner),
}

impl TriggerOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            TriggerOutcome::Started => Ok(()),
            TriggerOutcome::Busy(holder) => Err(Error::LockContention(holder)),
        }
    }
}

/// Starts cycles on background tasks and keeps the handle of the last one so
/// shutdown can wait for it.
pub struct CycleLauncher {
    runner: Arc<CycleRunner>,
    lock: Arc<RunLock>,
    in_flight: Mutex<Option<JoinHandle<CycleOutcome>>>,
}

impl CycleLauncher {
    pub fn new(runner: Arc<CycleRunner>, lock: Arc<RunLock>) -> Self {
        Self {
            runner,
            lock,
            in_flight: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Takes the lock for `owner` and spawns the cycle. Never waits: if the
    /// lock is taken the trigger is dropped and the holder is reported.
    pub fn try_start(&self, owner: RunOwner) -> TriggerOutcome {
        let Some(guard) = self.lock.try_guard(owner) else {
            let holder = self.lock.holder().unwrap_or(owner);
            debug!(requested = %owner, running = %holder, "[Cycle] already running, trigger dropped");
            return TriggerOutcome::Busy(holder);
        };
        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(async move { runner.run(guard).await });
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        TriggerOutcome::Started
    }

    /// Waits for the most recently started cycle, if it has not been waited
    /// for yet.
    pub async fn wait_idle(&self) -> Option<CycleOutcome> {
        let handle = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "[Cycle] cycle task panicked");
                None
            }
        }
    }
}
