use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

use crate::run_lock::RunOwner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Snapshot,
    Computing,
    Executing,
    Finalizing,
    Committing,
    Failed,
}

impl Stage {
    pub fn is_active(self) -> bool {
        !matches!(self, Stage::Idle)
    }
}

/// What the running (or last) cycle is doing. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleProgress {
    pub kind: Option<RunOwner>,
    pub stage: Stage,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for CycleProgress {
    fn default() -> Self {
        Self {
            kind: None,
            stage: Stage::Idle,
            started_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    current: Mutex<CycleProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CycleProgress {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn begin(&self, kind: RunOwner, at: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = CycleProgress {
            kind: Some(kind),
            stage: Stage::Snapshot,
            started_at: Some(at),
            last_error: None,
        };
    }

    pub fn advance(&self, stage: Stage) {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).stage = stage;
    }

    pub fn fail(&self, error: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.stage = Stage::Failed;
        current.last_error = Some(error.to_string());
    }

    /// Back to idle. `kind`, `started_at` and `last_error` are kept so the
    /// dashboard can still show how the last run ended.
    pub fn finish(&self) {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).stage = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_remembered_after_finish() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.snapshot(), CycleProgress::default());

        let at = Utc::now();
        tracker.begin(RunOwner::Burn, at);
        tracker.advance(Stage::Executing);
        assert!(tracker.snapshot().stage.is_active());

        tracker.fail("quote: gave up");
        assert_eq!(tracker.snapshot().stage, Stage::Failed);
        tracker.finish();

        let last = tracker.snapshot();
        assert_eq!(last.stage, Stage::Idle);
        assert_eq!(last.kind, Some(RunOwner::Burn));
        assert_eq!(last.started_at, Some(at));
        assert_eq!(last.last_error.as_deref(), Some("quote: gave up"));
    }
}
