//! Inter-core signalling channel with a freeze/resume protocol
//!
//! One `CrossCoreChannel` is shared by both cores. It carries two kinds
//! of traffic over the paired hardware FIFOs:
//!
//! - plain data words, drained by each core's FIFO interrupt into a
//!   small lock-free inbound ring and read out with `try_receive`;
//! - the reserved [`FREEZE_TOKEN`], which tells the receiving core to
//!   park itself in RAM-resident code with interrupts off.
//!
//! The freeze protocol exists for code-store maintenance: erasing or
//! writing the flash stalls instruction fetch for any core executing
//! from it, so the controller core must know the peer is running
//! nothing but a RAM-resident spin loop before it touches flash. The
//! controller clears the shared `idled` flag, pushes the token, and
//! spins until the peer's interrupt handler acknowledges by setting
//! `idled`; the peer then spins with interrupts masked until the
//! controller clears the flag again in `resume_peer`.
//!
//! `send` refuses to transmit the token value, so an application
//! payload can never be misread as a freeze request.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::platform::{FifoLink, RawCoreMutex, Scheduler, TryLock};

/// Reserved word meaning "park yourself". Never valid as payload.
pub const FREEZE_TOKEN: u32 = 0x6666_6666;

/// Words each core's inbound side buffers between interrupt drain and
/// `try_receive`.
pub const DATA_FIFO_DEPTH: usize = 8;

const NO_HOLDER: u8 = 0xFF;

/// Ring slots: depth plus the permanently empty slot.
const INBOUND_SLOTS: usize = DATA_FIFO_DEPTH + 1;

/// Failure modes of the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    /// The payload equals [`FREEZE_TOKEN`]; refusing it keeps data and
    /// freeze requests unambiguous on the shared FIFO.
    Reserved,
    /// The peer's inbound FIFO is full (non-blocking send only).
    Full,
}

/// Failure modes of the freeze plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FreezeError {
    /// This core already froze the peer; a nested freeze would spin on
    /// a mutex nothing will release.
    AlreadyFrozen,
}

/// Lock-free SPSC ring of words, one per core, filled by that core's
/// FIFO interrupt and emptied by its normal context. Same index and
/// barrier discipline as [`crate::ring::ByteRing`].
struct WordRing<const C: usize> {
    slots: [AtomicU32; C],
    write: AtomicUsize,
    read: AtomicUsize,
}

impl<const C: usize> WordRing<C> {
    const ZERO: AtomicU32 = AtomicU32::new(0);

    const fn new() -> Self {
        Self {
            slots: [Self::ZERO; C],
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    fn push(&self, word: u32) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        let next = if write + 1 == C { 0 } else { write + 1 };
        if next == self.read.load(Ordering::Acquire) {
            return false;
        }
        self.slots[write].store(word, Ordering::Relaxed);
        self.write.store(next, Ordering::Release);
        true
    }

    #[inline(always)]
    fn pop(&self) -> Option<u32> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        let word = self.slots[read].load(Ordering::Relaxed);
        let next = if read + 1 == C { 0 } else { read + 1 };
        self.read.store(next, Ordering::Release);
        Some(word)
    }

    fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + C - read) % C
    }
}

/// The inter-core channel. One instance, shared by both cores.
pub struct CrossCoreChannel<L: FifoLink, M: RawCoreMutex> {
    link: L,
    /// Re-entrancy guard for the freeze protocol; held from
    /// `freeze_peer` until `resume_peer`.
    freeze_mutex: M,
    /// Core currently holding a freeze, `NO_HOLDER` if none.
    freeze_holder: AtomicU8,
    /// Set by the frozen peer's handler, cleared by the controller.
    idled: AtomicBool,
    /// Per-core inbound data, indexed by the receiving core.
    inbound: [WordRing<INBOUND_SLOTS>; 2],
}

impl<L: FifoLink, M: RawCoreMutex> CrossCoreChannel<L, M> {
    pub const fn new(link: L, freeze_mutex: M) -> Self {
        Self {
            link,
            freeze_mutex,
            freeze_holder: AtomicU8::new(NO_HOLDER),
            idled: AtomicBool::new(false),
            inbound: [WordRing::new(), WordRing::new()],
        }
    }

    // --- data plane -----------------------------------------------------

    /// Push one word toward the peer without blocking.
    pub fn try_send(&self, word: u32) -> Result<(), SendError> {
        if word == FREEZE_TOKEN {
            return Err(SendError::Reserved);
        }
        if self.link.try_push(word) {
            Ok(())
        } else {
            Err(SendError::Full)
        }
    }

    /// Push one word toward the peer, spinning while its FIFO is full.
    ///
    /// Do not call while the peer is frozen: its interrupt handler is
    /// not draining, so a full FIFO stays full.
    pub fn send(&self, word: u32) -> Result<(), SendError> {
        if word == FREEZE_TOKEN {
            return Err(SendError::Reserved);
        }
        while !self.link.try_push(word) {
            spin_loop();
        }
        Ok(())
    }

    /// Pop the oldest word addressed to this core, if any.
    pub fn try_receive(&self) -> Option<u32> {
        self.inbound_ring().pop()
    }

    /// Pop the oldest word addressed to this core, spinning until one
    /// arrives.
    pub fn receive(&self) -> u32 {
        loop {
            if let Some(word) = self.try_receive() {
                return word;
            }
            spin_loop();
        }
    }

    /// Words queued for this core.
    pub fn available(&self) -> usize {
        self.inbound_ring().len()
    }

    /// Discard everything queued in both directions.
    ///
    /// Only meaningful while the peer is not producing, e.g. around a
    /// core-1 restart.
    pub fn drain(&self) {
        while self.link.try_pop().is_some() {}
        while self.inbound[0].pop().is_some() {}
        while self.inbound[1].pop().is_some() {}
    }

    #[inline(always)]
    fn inbound_ring(&self) -> &WordRing<INBOUND_SLOTS> {
        &self.inbound[self.link.current_core().index()]
    }

    // --- freeze plane ---------------------------------------------------

    /// Park the peer core in its RAM-resident handler.
    ///
    /// Blocks until the peer acknowledges; from that point until
    /// [`resume_peer`](Self::resume_peer) the peer executes no
    /// normal-context instructions. A nested freeze from the same core
    /// fails with [`FreezeError::AlreadyFrozen`] instead of spinning on
    /// a mutex nothing will release; a freeze racing one from the other
    /// core waits its turn.
    pub fn freeze_peer(&self) -> Result<(), FreezeError> {
        match self.freeze_mutex.try_lock() {
            TryLock::Acquired => {}
            TryLock::HeldByCaller => return Err(FreezeError::AlreadyFrozen),
            TryLock::HeldByOther => self.freeze_mutex.lock_blocking(),
        }
        self.freeze_holder
            .store(self.freeze_mutex.current_core().0, Ordering::SeqCst);
        self.idled.store(false, Ordering::SeqCst);
        while !self.link.try_push(FREEZE_TOKEN) {
            spin_loop();
        }
        while !self.idled.load(Ordering::SeqCst) {
            spin_loop();
        }
        Ok(())
    }

    /// Release a frozen peer. No-op when this core holds no freeze.
    pub fn resume_peer(&self) {
        self.resume_inner();
    }

    /// [`resume_peer`](Self::resume_peer) for a peer running under a
    /// preemptive scheduler: the peer parked itself through the
    /// scheduler rather than by spinning, so it additionally needs an
    /// explicit wake.
    pub fn resume_peer_with(&self, sched: &impl Scheduler) {
        if self.resume_inner() {
            sched.unpark_peer();
        }
    }

    fn resume_inner(&self) -> bool {
        let me = self.freeze_mutex.current_core().0;
        if self.freeze_holder.load(Ordering::SeqCst) != me {
            return false;
        }
        self.freeze_holder.store(NO_HOLDER, Ordering::SeqCst);
        self.freeze_mutex.unlock();
        // Clearing the flag is what actually releases the peer.
        self.idled.store(false, Ordering::SeqCst);
        true
    }

    /// Freeze the peer, run `f`, resume the peer.
    ///
    /// The shape every flash-maintenance call site wants.
    pub fn with_peer_frozen<R>(&self, f: impl FnOnce() -> R) -> Result<R, FreezeError> {
        self.freeze_peer()?;
        let out = f();
        self.resume_peer();
        Ok(out)
    }

    // --- peer plane -----------------------------------------------------

    /// Drain this core's inbound hardware FIFO.
    ///
    /// Called from the FIFO interrupt handler with interrupts already
    /// masked and the whole call path resident in RAM: a freeze request
    /// means flash may be unreadable until resume. On the token this
    /// busy-waits, acknowledging first; data words go to the inbound
    /// ring, and a word arriving with the ring full is dropped (the
    /// channel is a fixed-depth FIFO end to end).
    #[inline(always)]
    pub fn service_fifo_irq(&self) {
        while let Some(word) = self.link.try_pop() {
            if word == FREEZE_TOKEN {
                self.idled.store(true, Ordering::SeqCst);
                while self.idled.load(Ordering::SeqCst) {
                    spin_loop();
                }
            } else {
                let _ = self.inbound_ring().push(word);
            }
        }
    }

    /// [`service_fifo_irq`](Self::service_fifo_irq) for a core running
    /// under a preemptive scheduler: parks through the scheduler
    /// instead of burning the core, and is woken by
    /// [`resume_peer_with`](Self::resume_peer_with).
    pub fn service_fifo_irq_with(&self, sched: &impl Scheduler) {
        while let Some(word) = self.link.try_pop() {
            if word == FREEZE_TOKEN {
                self.idled.store(true, Ordering::SeqCst);
                while self.idled.load(Ordering::SeqCst) {
                    sched.park_current();
                }
            } else {
                let _ = self.inbound_ring().push(word);
            }
        }
    }
}
