//! Deadlock-detecting dual-core lock
//!
//! Both cores share memory with no protection between them, and there is
//! no preemption that could unwind a core stuck waiting on itself. A
//! plain blocking mutex therefore hangs forever the moment a core
//! re-acquires a lock it already holds. `CoreLock` detects that case
//! through the owner tag kept by [`RawCoreMutex`] and hands back a guard
//! that was never taken, so the caller can abort the operation instead
//! of wedging the core.
//!
//! Call sites check the guard:
//!
//! ```ignore
//! let guard = lock.acquire();
//! if !guard.is_acquired() {
//!     return Err(Error::Busy);
//! }
//! // ... exclusive section ...
//! ```

use crate::platform::{RawCoreMutex, Scheduler, TryLock};

/// Dual-core mutual exclusion with same-core re-entry detection.
///
/// Created once and shared by both cores for the life of the process.
pub struct CoreLock<M: RawCoreMutex> {
    raw: M,
}

impl<M: RawCoreMutex> CoreLock<M> {
    pub const fn new(raw: M) -> Self {
        Self { raw }
    }

    /// Take the lock, blocking while the *other* core holds it.
    ///
    /// If the calling core already holds the lock, this returns
    /// immediately with a guard whose `is_acquired()` is false rather
    /// than blocking: nothing would ever release the lock out from
    /// under the caller.
    ///
    /// Must not be called from interrupt context (it may spin); use
    /// [`try_acquire`](Self::try_acquire) there.
    pub fn acquire(&self) -> LockGuard<'_, M> {
        match self.raw.try_lock() {
            TryLock::Acquired => LockGuard {
                raw: Some(&self.raw),
            },
            TryLock::HeldByCaller => {
                // Would deadlock: same core, no way to unwind.
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "CoreLock re-entered on core {}",
                    self.raw.current_core()
                );
                LockGuard { raw: None }
            }
            TryLock::HeldByOther => {
                self.raw.lock_blocking();
                LockGuard {
                    raw: Some(&self.raw),
                }
            }
        }
    }

    /// Non-blocking attempt. Safe from interrupt context.
    ///
    /// Returns `None` both when the other core holds the lock and when
    /// the calling core does.
    pub fn try_acquire(&self) -> Option<LockGuard<'_, M>> {
        match self.raw.try_lock() {
            TryLock::Acquired => Some(LockGuard {
                raw: Some(&self.raw),
            }),
            _ => None,
        }
    }

    /// Blocking acquire that cooperates with a host task scheduler.
    ///
    /// Where [`acquire`](Self::acquire) busy-waits, this yields between
    /// attempts so a lower-priority task holding the lock can actually
    /// run and release it. Same-core re-entry still returns a
    /// never-acquired guard.
    pub fn acquire_yielding(&self, sched: &impl Scheduler) -> LockGuard<'_, M> {
        loop {
            match self.raw.try_lock() {
                TryLock::Acquired => {
                    return LockGuard {
                        raw: Some(&self.raw),
                    }
                }
                TryLock::HeldByCaller => return LockGuard { raw: None },
                TryLock::HeldByOther => sched.yield_now(),
            }
        }
    }
}

/// Guard releasing the lock on drop.
///
/// A guard that was never acquired (same-core re-entry) releases
/// nothing; dropping or [`release`](Self::release)-ing it is a no-op.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, M: RawCoreMutex> {
    raw: Option<&'a M>,
}

impl<M: RawCoreMutex> LockGuard<'_, M> {
    /// Whether the lock was actually taken.
    pub fn is_acquired(&self) -> bool {
        self.raw.is_some()
    }

    /// Release the lock explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl<M: RawCoreMutex> Drop for LockGuard<'_, M> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            raw.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{set_current_core, SimCoreMutex, SimScheduler};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reacquire_same_core_does_not_block() {
        set_current_core(0);
        let lock = CoreLock::new(SimCoreMutex::default());

        let first = lock.acquire();
        assert!(first.is_acquired());

        // Second acquire on the same core returns immediately,
        // not-acquired.
        let second = lock.acquire();
        assert!(!second.is_acquired());

        // Dropping the never-acquired guard must not release the lock.
        drop(second);
        assert!(lock.try_acquire().is_none());

        drop(first);
        let third = lock.acquire();
        assert!(third.is_acquired());
    }

    #[test]
    fn test_try_acquire_contended() {
        set_current_core(0);
        let lock = CoreLock::new(SimCoreMutex::default());
        let guard = lock.acquire();
        assert!(guard.is_acquired());

        set_current_core(1);
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_other_core_blocks_until_release() {
        set_current_core(0);
        let lock = Arc::new(CoreLock::new(SimCoreMutex::default()));
        let guard = lock.acquire();
        assert!(guard.is_acquired());

        let acquired = Arc::new(AtomicBool::new(false));
        let t = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                set_current_core(1);
                let g = lock.acquire();
                assert!(g.is_acquired());
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst), "core 1 acquired early");

        drop(guard);
        t.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(CoreLock::new(SimCoreMutex::default()));
        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for core in 0..2u8 {
            let lock = Arc::clone(&lock);
            let in_section = Arc::clone(&in_section);
            let entries = Arc::clone(&entries);
            handles.push(thread::spawn(move || {
                set_current_core(core);
                for _ in 0..200 {
                    let g = lock.acquire();
                    assert!(g.is_acquired());
                    assert!(!in_section.swap(true, Ordering::SeqCst));
                    entries.fetch_add(1, Ordering::SeqCst);
                    in_section.store(false, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 400);
    }

    #[test]
    fn test_acquire_yielding_waits_through_scheduler() {
        let lock = Arc::new(CoreLock::new(SimCoreMutex::default()));

        set_current_core(0);
        let guard = lock.acquire();
        assert!(guard.is_acquired());

        let waiter = thread::spawn({
            let lock = Arc::clone(&lock);
            move || {
                set_current_core(1);
                let sched = SimScheduler::default();
                let g = lock.acquire_yielding(&sched);
                assert!(g.is_acquired());
                assert!(sched.yields() > 0);
            }
        });

        thread::sleep(Duration::from_millis(30));
        drop(guard);
        waiter.join().unwrap();
    }

    mod interleavings {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Acquire(u8),
            Release(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..2u8).prop_map(Op::Acquire),
                (0..2u8).prop_map(Op::Release),
            ]
        }

        proptest! {
            // Randomized two-core schedules: at no point may both
            // cores hold the lock, and an attempt succeeds exactly
            // when the lock is free.
            #[test]
            fn prop_mutual_exclusion(ops in proptest::collection::vec(op(), 1..64)) {
                let lock = CoreLock::new(SimCoreMutex::default());
                let mut held: [Option<LockGuard<'_, SimCoreMutex>>; 2] = [None, None];

                for step in ops {
                    match step {
                        Op::Acquire(core) => {
                            set_current_core(core);
                            let got = lock.try_acquire();
                            let busy = held[0].is_some() || held[1].is_some();
                            if busy {
                                prop_assert!(got.is_none());
                            } else {
                                prop_assert!(got.is_some());
                                held[core as usize] = got;
                            }
                            prop_assert!(!(held[0].is_some() && held[1].is_some()));
                        }
                        Op::Release(core) => {
                            set_current_core(core);
                            held[core as usize] = None;
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_acquire_yielding_reentry_fails_fast() {
        set_current_core(0);
        let lock = CoreLock::new(SimCoreMutex::default());
        let sched = SimScheduler::default();

        let first = lock.acquire_yielding(&sched);
        assert!(first.is_acquired());
        let second = lock.acquire_yielding(&sched);
        assert!(!second.is_acquired());
        assert_eq!(sched.yields(), 0);
    }
}
