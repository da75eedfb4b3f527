//! Hardware seam traits
//!
//! The four components in this crate only ever touch hardware through
//! these traits. On target they are backed by SIO registers; on the host
//! the test `sim` module provides two simulated cores.

/// Identity of one of the two CPU cores.
///
/// Read from hardware (`SIO.CPUID`) on target. The value is a small
/// integer, 0 or 1 on every supported chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoreId(pub u8);

impl CoreId {
    /// Index usable for per-core arrays.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The other core.
    pub fn peer(self) -> CoreId {
        CoreId(self.0 ^ 1)
    }
}

/// Outcome of a non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TryLock {
    /// The lock was free and is now held by the calling core.
    Acquired,
    /// The calling core already holds the lock. Blocking here would
    /// deadlock forever: there is no preemption to unwind it.
    HeldByCaller,
    /// The other core holds the lock; a blocking acquire will succeed
    /// once it releases.
    HeldByOther,
}

/// A mutex shared by both cores that records its owning core.
///
/// `try_lock` must be atomic with respect to both cores, and the owner
/// tag is what lets [`crate::lock::CoreLock`] detect same-core
/// re-acquisition instead of hanging.
pub trait RawCoreMutex {
    /// The core this call is executing on.
    fn current_core(&self) -> CoreId;

    /// Attempt to take the lock without blocking.
    fn try_lock(&self) -> TryLock;

    /// Block (spin) until the lock is taken.
    ///
    /// Callers must have ruled out `HeldByCaller` first; this method is
    /// allowed to spin forever on a same-core re-acquisition.
    fn lock_blocking(&self);

    /// Release the lock. Only the owning core may call this.
    fn unlock(&self);
}

/// One core's view of the paired inter-core hardware FIFOs.
///
/// Pushes land in the peer's inbound FIFO; pops read this core's. The
/// same object is shared by both cores because the underlying registers
/// are banked per core.
pub trait FifoLink {
    /// The core this call is executing on.
    fn current_core(&self) -> CoreId;

    /// Push a word toward the peer. Returns false when the peer's
    /// inbound FIFO is full.
    fn try_push(&self, word: u32) -> bool;

    /// Pop a word from this core's inbound FIFO, if any.
    fn try_pop(&self) -> Option<u32>;
}

/// Hooks into an optional host task scheduler (FreeRTOS-style).
///
/// Bare-metal builds never need this; when a preemptive scheduler runs
/// on both cores, the blocking variants in `lock` and `control` use
/// these instead of raw spin loops to avoid priority inversion.
pub trait Scheduler {
    /// Give other tasks a chance to run while waiting.
    fn yield_now(&self);

    /// Park the calling task until the peer core releases it.
    fn park_current(&self);

    /// Make the peer core's parked task runnable again.
    fn unpark_peer(&self);
}
