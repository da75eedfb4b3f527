//! PIO state-machine and microcode allocation
//!
//! A PIO block has ~32 shared instruction slots and four state machines
//! executing out of them. Peripheral drivers hand the allocator a
//! program image and the pins it must reach; the allocator finds a
//! block where the image is (or fits), loads it at most once per block,
//! and claims one state machine. Three passes, cheapest first:
//!
//! 1. reuse - a matching block already holds this exact image;
//! 2. fit - a block we already use has room for it;
//! 3. fallback - claim a fresh block, load, and mark it ours for good.
//!
//! Everything runs under a [`CoreLock`]: both cores allocate against
//! the same tables. Released claims return only the state machine;
//! loaded microcode is never reclaimed, so churning through many
//! distinct programs can exhaust instruction memory while state
//! machines sit free. Known limitation, inherited deliberately: callers
//! rely on re-finding already-loaded programs without re-checking free
//! space.

use core::cell::RefCell;
use core::marker::PhantomData;

use heapless::{FnvIndexMap, Vec};

use crate::lock::CoreLock;
use crate::platform::RawCoreMutex;

/// Most blocks any supported chip carries (RP2040: 2, RP2350: 3).
pub const MAX_PIO_BLOCKS: usize = 3;

/// Instruction slots shared by all state machines of one block.
pub const MICROCODE_SLOTS: usize = 32;

/// Independent state machines per block.
pub const STATE_MACHINES_PER_BLOCK: usize = 4;

/// Distinct images one block's load table can track.
const LOADED_PROGRAMS_PER_BLOCK: usize = 16;

/// Contiguous run of GPIO pins a program drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinRange {
    base: u8,
    count: u8,
}

impl PinRange {
    /// `count` pins starting at `base`. A zero count is treated as one
    /// pin.
    pub const fn new(base: u8, count: u8) -> Self {
        Self {
            base,
            count: if count == 0 { 1 } else { count },
        }
    }

    pub const fn first(&self) -> u8 {
        self.base
    }

    pub const fn last(&self) -> u8 {
        self.base + self.count - 1
    }

    /// GPIO base a block must sit at to serve this range: a block's
    /// window covers 32 pins from its base, so anything past GPIO 31
    /// needs a base-16 block.
    pub const fn required_base(&self) -> u8 {
        if self.last() >= 32 {
            16
        } else {
            0
        }
    }

    /// Whether a block whose window starts at `gpio_base` reaches every
    /// pin of this range.
    pub(crate) const fn reachable_from(&self, gpio_base: u8) -> bool {
        gpio_base <= self.first() && self.last() < gpio_base + 32
    }
}

/// Borrowed, immutable PIO program image.
///
/// Identity is the address of the instruction slice: two loads of the
/// same static program coalesce, while a runtime-synthesized variant
/// (say, a template re-parameterized for a different bit width) is a
/// distinct program. The `'prog` lifetime on [`PioAllocator`] keeps
/// every image alive as long as the load tables that reference it.
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage<'a> {
    instructions: &'a [u16],
    origin: Option<u8>,
}

impl<'a> ProgramImage<'a> {
    pub const fn new(instructions: &'a [u16]) -> Self {
        Self {
            instructions,
            origin: None,
        }
    }

    /// An image that only runs correctly at a fixed load offset.
    pub const fn with_origin(instructions: &'a [u16], origin: u8) -> Self {
        Self {
            instructions,
            origin: Some(origin),
        }
    }

    pub fn instructions(&self) -> &'a [u16] {
        self.instructions
    }

    pub fn origin(&self) -> Option<u8> {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    fn key(&self) -> usize {
        self.instructions.as_ptr() as usize
    }
}

/// Why an allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PioError {
    /// No block/state-machine/microcode combination fits. Hard
    /// exhaustion: never auto-retried, the caller disables the feature
    /// that wanted the slot.
    Exhausted,
    /// The image alone exceeds a block's instruction memory.
    ProgramTooLarge,
    /// `acquire` re-entered from the core already holding the
    /// allocation lock (e.g. from an interrupt handler, where it must
    /// not be called).
    LockReentry,
}

/// Ownership of one state machine, plus where its program was loaded.
///
/// Returned by [`PioAllocator::acquire`]; give it back with
/// [`PioAllocator::release`] when the driver shuts down.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a claim holds a state machine until released"]
pub struct PioClaim {
    block: u8,
    sm: u8,
    offset: u8,
}

impl PioClaim {
    /// Index of the PIO block.
    pub fn block(&self) -> u8 {
        self.block
    }

    /// State machine index within the block.
    pub fn state_machine(&self) -> u8 {
        self.sm
    }

    /// Instruction-memory offset the program starts at.
    pub fn offset(&self) -> u8 {
        self.offset
    }
}

/// The underlying hardware claim/load facility.
///
/// State-machine claims must be atomic with respect to both cores (the
/// RP2040 implementation uses a critical section over a claim bitmask,
/// as pico-sdk does); loads need not be, since the allocator serializes
/// them under its lock.
pub trait PioHw {
    fn block_count(&self) -> usize;

    /// GPIO number the block's 32-pin window starts at.
    fn gpio_base(&self, block: u8) -> u8;

    /// Atomically claim a free state machine, if any.
    fn claim_free_sm(&self, block: u8) -> Option<u8>;

    /// Return a state machine to the pool.
    fn release_sm(&self, block: u8, sm: u8);

    /// Whether the block's remaining instruction memory fits `image`.
    fn can_load(&self, block: u8, image: &ProgramImage<'_>) -> bool;

    /// Load `image` and return its offset.
    fn load(&self, block: u8, image: &ProgramImage<'_>) -> Result<u8, PioError>;
}

struct BlockTable {
    /// Set the first time we load anything into the block; never
    /// cleared afterward.
    allocated: bool,
    /// Image identity -> load offset.
    loaded: FnvIndexMap<usize, u8, LOADED_PROGRAMS_PER_BLOCK>,
}

impl BlockTable {
    fn new() -> Self {
        Self {
            allocated: false,
            loaded: FnvIndexMap::new(),
        }
    }

    fn has_table_room(&self) -> bool {
        self.loaded.len() < self.loaded.capacity()
    }
}

/// Allocates (block, state machine, microcode offset) triples.
///
/// One instance owns the allocation tables for the whole chip and is
/// injected into every PIO-backed driver; the tables live here, not in
/// ambient globals. The instance itself is not `Sync` - the HAL wraps
/// it in a shareable cell once, relying on the internal [`CoreLock`]
/// for cross-core exclusion.
pub struct PioAllocator<'prog, H: PioHw, M: RawCoreMutex> {
    hw: H,
    lock: CoreLock<M>,
    tables: RefCell<Vec<BlockTable, MAX_PIO_BLOCKS>>,
    _images: PhantomData<&'prog [u16]>,
}

impl<'prog, H: PioHw, M: RawCoreMutex> PioAllocator<'prog, H, M> {
    /// Build the per-block tables from the hardware topology. Blocks
    /// beyond [`MAX_PIO_BLOCKS`] are ignored.
    pub fn new(hw: H, mutex: M) -> Self {
        let mut tables = Vec::new();
        for _ in 0..hw.block_count().min(MAX_PIO_BLOCKS) {
            let _ = tables.push(BlockTable::new());
        }
        Self {
            hw,
            lock: CoreLock::new(mutex),
            tables: RefCell::new(tables),
            _images: PhantomData,
        }
    }

    /// Find or load `image` somewhere it can drive `pins`, and claim a
    /// state machine there.
    ///
    /// Runs end to end under the allocation lock, so it may block while
    /// the other core allocates - never call it from interrupt context.
    /// On failure no table has changed.
    pub fn acquire(
        &self,
        image: ProgramImage<'prog>,
        pins: PinRange,
    ) -> Result<PioClaim, PioError> {
        if image.len() > MICROCODE_SLOTS {
            return Err(PioError::ProgramTooLarge);
        }
        let guard = self.lock.acquire();
        if !guard.is_acquired() {
            return Err(PioError::LockReentry);
        }
        let mut tables = self.tables.borrow_mut();
        let required = pins.required_base();

        // Reuse pass: the image is already loaded somewhere suitable.
        for (idx, table) in tables.iter().enumerate() {
            let block = idx as u8;
            if self.hw.gpio_base(block) != required {
                continue;
            }
            if let Some(&offset) = table.loaded.get(&image.key()) {
                if let Some(sm) = self.hw.claim_free_sm(block) {
                    return Ok(PioClaim { block, sm, offset });
                }
            }
        }

        // Fit pass: a block already ours has room for the image.
        for idx in 0..tables.len() {
            let block = idx as u8;
            if !tables[idx].allocated
                || self.hw.gpio_base(block) != required
                || !tables[idx].has_table_room()
                || !self.hw.can_load(block, &image)
            {
                continue;
            }
            if let Some(sm) = self.hw.claim_free_sm(block) {
                return match self.hw.load(block, &image) {
                    Ok(offset) => {
                        let _ = tables[idx].loaded.insert(image.key(), offset);
                        Ok(PioClaim { block, sm, offset })
                    }
                    Err(e) => {
                        self.hw.release_sm(block, sm);
                        Err(e)
                    }
                };
            }
        }

        // Fallback pass: take over an untouched block that reaches the
        // pins. Its allocated flag is permanent from here on.
        for idx in 0..tables.len() {
            let block = idx as u8;
            if tables[idx].allocated
                || !pins.reachable_from(self.hw.gpio_base(block))
                || !self.hw.can_load(block, &image)
            {
                continue;
            }
            if let Some(sm) = self.hw.claim_free_sm(block) {
                return match self.hw.load(block, &image) {
                    Ok(offset) => {
                        tables[idx].allocated = true;
                        let _ = tables[idx].loaded.insert(image.key(), offset);
                        Ok(PioClaim { block, sm, offset })
                    }
                    Err(e) => {
                        self.hw.release_sm(block, sm);
                        Err(e)
                    }
                };
            }
        }

        Err(PioError::Exhausted)
    }

    /// Return the claim's state machine to the pool.
    ///
    /// The program stays loaded; a later `acquire` of the same image
    /// re-finds it at the same offset.
    pub fn release(&self, claim: PioClaim) {
        self.hw.release_sm(claim.block, claim.sm);
    }

    /// The underlying hardware facility.
    pub fn hw(&self) -> &H {
        &self.hw
    }
}
