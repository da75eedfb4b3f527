//! Simulated two-core hardware for host tests
//!
//! A thread (or a single-threaded proptest driver) declares which core
//! it is acting as with [`set_current_core`]; the simulated mutex, FIFO
//! link, and PIO blocks read that thread-local the way the real
//! implementations read `SIO.CPUID`.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::pio::{PioError, PioHw, ProgramImage, MICROCODE_SLOTS, STATE_MACHINES_PER_BLOCK};
use crate::platform::{CoreId, FifoLink, RawCoreMutex, Scheduler, TryLock};

thread_local! {
    static CURRENT_CORE: Cell<u8> = const { Cell::new(0) };
}

/// Declare which core the calling thread is acting as.
pub fn set_current_core(core: u8) {
    CURRENT_CORE.with(|c| c.set(core));
}

pub fn current_core() -> CoreId {
    CoreId(CURRENT_CORE.with(|c| c.get()))
}

// --- core mutex -----------------------------------------------------------

#[derive(Clone, Default)]
pub struct SimCoreMutex {
    inner: Arc<SimMutexInner>,
}

#[derive(Default)]
struct SimMutexInner {
    owner: Mutex<Option<u8>>,
    freed: Condvar,
}

impl RawCoreMutex for SimCoreMutex {
    fn current_core(&self) -> CoreId {
        current_core()
    }

    fn try_lock(&self) -> TryLock {
        let mut owner = self.inner.owner.lock().unwrap();
        match *owner {
            None => {
                *owner = Some(current_core().0);
                TryLock::Acquired
            }
            Some(core) if core == current_core().0 => TryLock::HeldByCaller,
            Some(_) => TryLock::HeldByOther,
        }
    }

    fn lock_blocking(&self) {
        let mut owner = self.inner.owner.lock().unwrap();
        while owner.is_some() {
            owner = self.inner.freed.wait(owner).unwrap();
        }
        *owner = Some(current_core().0);
    }

    fn unlock(&self) {
        let mut owner = self.inner.owner.lock().unwrap();
        *owner = None;
        self.inner.freed.notify_all();
    }
}

// --- fifo link --------------------------------------------------------------

/// Pair of bounded word queues standing in for the SIO FIFOs.
pub struct SimFifoLink {
    fifos: [Mutex<VecDeque<u32>>; 2],
    depth: usize,
}

impl SimFifoLink {
    pub fn new(depth: usize) -> Self {
        Self {
            fifos: [Mutex::new(VecDeque::new()), Mutex::new(VecDeque::new())],
            depth,
        }
    }
}

impl FifoLink for SimFifoLink {
    fn current_core(&self) -> CoreId {
        current_core()
    }

    fn try_push(&self, word: u32) -> bool {
        let mut fifo = self.fifos[current_core().peer().index()].lock().unwrap();
        if fifo.len() == self.depth {
            return false;
        }
        fifo.push_back(word);
        true
    }

    fn try_pop(&self) -> Option<u32> {
        self.fifos[current_core().index()].lock().unwrap().pop_front()
    }
}

// --- scheduler ---------------------------------------------------------------

/// Counts scheduler interactions; park/unpark carry a permit so an
/// early unpark is not lost (std `thread::park` semantics).
#[derive(Clone, Default)]
pub struct SimScheduler {
    inner: Arc<SimSchedulerInner>,
}

#[derive(Default)]
struct SimSchedulerInner {
    yields: AtomicUsize,
    parks: AtomicUsize,
    unparks: AtomicUsize,
    permit: Mutex<bool>,
    woken: Condvar,
}

impl SimScheduler {
    pub fn yields(&self) -> usize {
        self.inner.yields.load(Ordering::SeqCst)
    }

    pub fn parks(&self) -> usize {
        self.inner.parks.load(Ordering::SeqCst)
    }

    pub fn unparks(&self) -> usize {
        self.inner.unparks.load(Ordering::SeqCst)
    }
}

impl Scheduler for SimScheduler {
    fn yield_now(&self) {
        self.inner.yields.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn park_current(&self) {
        self.inner.parks.fetch_add(1, Ordering::SeqCst);
        let mut permit = self.inner.permit.lock().unwrap();
        while !*permit {
            permit = self.inner.woken.wait(permit).unwrap();
        }
        *permit = false;
    }

    fn unpark_peer(&self) {
        self.inner.unparks.fetch_add(1, Ordering::SeqCst);
        let mut permit = self.inner.permit.lock().unwrap();
        *permit = true;
        self.inner.woken.notify_all();
    }
}

// --- pio hardware ------------------------------------------------------------

struct SimBlock {
    gpio_base: u8,
    claimed: Mutex<u8>,
    used_slots: Mutex<usize>,
}

/// Simulated set of PIO blocks: claim bitmask and a descending
/// instruction-memory bump allocator per block, like the real facility.
pub struct SimPio {
    blocks: Vec<SimBlock>,
}

impl SimPio {
    /// One block per entry in `gpio_bases`.
    pub fn new(gpio_bases: &[u8]) -> Self {
        Self {
            blocks: gpio_bases
                .iter()
                .map(|&gpio_base| SimBlock {
                    gpio_base,
                    claimed: Mutex::new(0),
                    used_slots: Mutex::new(0),
                })
                .collect(),
        }
    }

    /// Instruction slots consumed in `block` so far.
    pub fn used_slots(&self, block: u8) -> usize {
        *self.blocks[block as usize].used_slots.lock().unwrap()
    }

    /// Bitmask of claimed state machines in `block`.
    pub fn claimed_mask(&self, block: u8) -> u8 {
        *self.blocks[block as usize].claimed.lock().unwrap()
    }

    /// Pre-claim every state machine in `block`.
    pub fn exhaust_state_machines(&self, block: u8) {
        *self.blocks[block as usize].claimed.lock().unwrap() =
            (1 << STATE_MACHINES_PER_BLOCK) - 1;
    }

    /// Pretend `block`'s instruction memory is already full.
    pub fn exhaust_microcode(&self, block: u8) {
        *self.blocks[block as usize].used_slots.lock().unwrap() = MICROCODE_SLOTS;
    }
}

impl PioHw for SimPio {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn gpio_base(&self, block: u8) -> u8 {
        self.blocks[block as usize].gpio_base
    }

    fn claim_free_sm(&self, block: u8) -> Option<u8> {
        let mut claimed = self.blocks[block as usize].claimed.lock().unwrap();
        for sm in 0..STATE_MACHINES_PER_BLOCK as u8 {
            if *claimed & (1 << sm) == 0 {
                *claimed |= 1 << sm;
                return Some(sm);
            }
        }
        None
    }

    fn release_sm(&self, block: u8, sm: u8) {
        let mut claimed = self.blocks[block as usize].claimed.lock().unwrap();
        *claimed &= !(1 << sm);
    }

    fn can_load(&self, block: u8, image: &ProgramImage<'_>) -> bool {
        let used = *self.blocks[block as usize].used_slots.lock().unwrap();
        used + image.len() <= MICROCODE_SLOTS
    }

    fn load(&self, block: u8, image: &ProgramImage<'_>) -> Result<u8, PioError> {
        let mut used = self.blocks[block as usize].used_slots.lock().unwrap();
        if *used + image.len() > MICROCODE_SLOTS {
            return Err(PioError::ProgramTooLarge);
        }
        *used += image.len();
        // Top-down, like the real instruction-memory allocator.
        Ok((MICROCODE_SLOTS - *used) as u8)
    }
}
