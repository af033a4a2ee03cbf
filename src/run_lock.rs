use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

const FREE: u8 = 0;

/// Which cycle type holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOwner {
    Distribution,
    Burn,
}

impl RunOwner {
    fn tag(self) -> u8 {
        match self {
            RunOwner::Distribution => 1,
            RunOwner::Burn => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RunOwner::Distribution),
            2 => Some(RunOwner::Burn),
            _ => None,
        }
    }
}

impl fmt::Display for RunOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOwner::Distribution => f.write_str("distribution"),
            RunOwner::Burn => f.write_str("burn"),
        }
    }
}

/// Process-wide exclusion between distribution and burn cycles.
///
/// Acquisition is a single compare-and-swap: a caller that loses the race is
/// expected to drop its trigger, never to wait for the holder.
#[derive(Debug, Default)]
pub struct RunLock {
    state: AtomicU8,
    releases: AtomicU64,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, owner: RunOwner) -> bool {
        self.state
            .compare_exchange(FREE, owner.tag(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the lock if `owner` holds it. Returns false when it did not.
    pub fn release(&self, owner: RunOwner) -> bool {
        let released = self
            .state
            .compare_exchange(owner.tag(), FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    pub fn holder(&self) -> Option<RunOwner> {
        RunOwner::from_tag(self.state.load(Ordering::Acquire))
    }

    pub fn is_held_by(&self, owner: RunOwner) -> bool {
        self.holder() == Some(owner)
    }

    /// Total successful releases over the lock's lifetime.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Scoped acquisition: the returned guard releases on drop, on every exit
    /// path of whatever owns it.
    pub fn try_guard(self: &Arc<Self>, owner: RunOwner) -> Option<RunGuard> {
        self.try_acquire(owner).then(|| RunGuard {
            lock: Arc::clone(self),
            owner,
        })
    }
}

#[derive(Debug)]
pub struct RunGuard {
    lock: Arc<RunLock>,
    owner: RunOwner,
}

impl RunGuard {
    pub fn owner(&self) -> RunOwner {
        self.owner
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.lock.release(self.owner) {
            tracing::error!(owner = %self.owner, "[RunLock] guard dropped but lock was not held by its owner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn second_acquire_fails_until_release() {
        let lock = RunLock::new();
        assert!(lock.try_acquire(RunOwner::Distribution));
        assert!(!lock.try_acquire(RunOwner::Burn));
        assert!(!lock.try_acquire(RunOwner::Distribution));
        assert_eq!(lock.holder(), Some(RunOwner::Distribution));

        assert!(!lock.release(RunOwner::Burn), "non-holder must not release");
        assert!(lock.release(RunOwner::Distribution));
        assert_eq!(lock.holder(), None);
        assert!(lock.try_acquire(RunOwner::Burn));
    }

    #[test]
    fn concurrent_acquire_has_exactly_one_winner() {
        for _ in 0..64 {
            let lock = Arc::new(RunLock::new());
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [RunOwner::Distribution, RunOwner::Burn]
                .into_iter()
                .map(|owner| {
                    let lock = Arc::clone(&lock);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        lock.try_acquire(owner)
                    })
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        }
    }

    #[test]
    fn guard_releases_once_on_drop() {
        let lock = Arc::new(RunLock::new());
        {
            let guard = lock.try_guard(RunOwner::Burn).expect("lock is free");
            assert_eq!(guard.owner(), RunOwner::Burn);
            assert!(lock.try_guard(RunOwner::Distribution).is_none());
        }
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.release_count(), 1);
    }
}
