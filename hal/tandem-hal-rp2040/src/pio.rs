//! PIO claim/load facility and timing helpers
//!
//! The RP2040 has two PIO blocks, four state machines each, 32 shared
//! instruction slots per block, both windows starting at GPIO 0. The
//! hardware has no claim registers; like pico-sdk, claims are a
//! software bitmask, here mutated only inside a chip-wide critical
//! section so both cores can race `claim_free_sm` safely.
//!
//! Instruction memory is handed out top-down and never reclaimed,
//! matching the allocator's no-eviction policy. Unconditional JMPs
//! encode an absolute target, so loading anywhere but offset 0 means
//! relocating them.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_rp::clocks::clk_sys_freq;
use embassy_rp::pac;
use fixed::types::extra::U8;
use fixed::FixedU32;

use crate::sio::SioCoreMutex;
use tandem_core::pio::{PioError, PioHw, ProgramImage, MICROCODE_SLOTS, STATE_MACHINES_PER_BLOCK};

/// PIO blocks on the RP2040.
pub const PIO_BLOCK_COUNT: usize = 2;

struct BlockState {
    /// Bitmask of claimed state machines.
    claimed: AtomicU8,
    /// Instruction slots consumed from the top of the block's memory.
    used_slots: AtomicU8,
}

impl BlockState {
    const fn new() -> Self {
        Self {
            claimed: AtomicU8::new(0),
            used_slots: AtomicU8::new(0),
        }
    }
}

/// The RP2040 implementation of the hardware claim/load facility.
pub struct RpPio {
    blocks: [BlockState; PIO_BLOCK_COUNT],
}

impl RpPio {
    pub const fn new() -> Self {
        Self {
            blocks: [BlockState::new(), BlockState::new()],
        }
    }

    fn regs(block: u8) -> pac::pio::Pio {
        if block == 0 {
            pac::PIO0
        } else {
            pac::PIO1
        }
    }

    /// Offset the next load of `len` slots would start at, or `None`
    /// if it does not fit.
    fn fit(&self, block: u8, image: &ProgramImage<'_>) -> Option<u8> {
        let used = self.blocks[block as usize].used_slots.load(Ordering::Relaxed) as usize;
        let len = image.len();
        match image.origin() {
            // Fixed-origin image: must sit below everything handed out
            // so far.
            Some(origin) => {
                let origin = origin as usize;
                (origin + len <= MICROCODE_SLOTS - used).then_some(origin as u8)
            }
            None => MICROCODE_SLOTS
                .checked_sub(used + len)
                .map(|offset| offset as u8),
        }
    }
}

impl Default for RpPio {
    fn default() -> Self {
        Self::new()
    }
}

impl PioHw for RpPio {
    fn block_count(&self) -> usize {
        PIO_BLOCK_COUNT
    }

    fn gpio_base(&self, _block: u8) -> u8 {
        // Both RP2040 windows start at GPIO 0. (RP2350B's third block
        // and base-16 windows would surface here.)
        0
    }

    fn claim_free_sm(&self, block: u8) -> Option<u8> {
        let claimed = &self.blocks[block as usize].claimed;
        critical_section::with(|_| {
            let mask = claimed.load(Ordering::Relaxed);
            for sm in 0..STATE_MACHINES_PER_BLOCK as u8 {
                if mask & (1 << sm) == 0 {
                    claimed.store(mask | (1 << sm), Ordering::Relaxed);
                    return Some(sm);
                }
            }
            None
        })
    }

    fn release_sm(&self, block: u8, sm: u8) {
        let claimed = &self.blocks[block as usize].claimed;
        critical_section::with(|_| {
            let mask = claimed.load(Ordering::Relaxed);
            claimed.store(mask & !(1 << sm), Ordering::Relaxed);
        });
    }

    fn can_load(&self, block: u8, image: &ProgramImage<'_>) -> bool {
        self.fit(block, image).is_some()
    }

    fn load(&self, block: u8, image: &ProgramImage<'_>) -> Result<u8, PioError> {
        let offset = self.fit(block, image).ok_or(PioError::ProgramTooLarge)?;
        let regs = Self::regs(block);

        for (i, &instr) in image.instructions().iter().enumerate() {
            // Unconditional JMP (top three opcode bits 000) targets are
            // absolute; shift them by the load offset.
            let relocated = if instr & 0xe000 == 0 {
                instr + offset as u16
            } else {
                instr
            };
            regs.instr_mem(offset as usize + i)
                .write(|w| w.set_instr_mem(relocated));
        }

        let used = &self.blocks[block as usize].used_slots;
        let consumed = match image.origin() {
            // Reserve from the fixed origin to the top so nothing lands
            // on it later.
            Some(origin) => (MICROCODE_SLOTS - origin as usize) as u8,
            None => used.load(Ordering::Relaxed) + image.len() as u8,
        };
        used.store(consumed.max(used.load(Ordering::Relaxed)), Ordering::Relaxed);
        Ok(offset)
    }
}

/// The chip-wide allocator type: RP2040 facility, SIO-backed lock,
/// process-lifetime program images.
pub type RpPioAllocator = tandem_core::pio::PioAllocator<'static, RpPio, SioCoreMutex>;

/// Shareable wrapper for the one allocator instance.
///
/// `PioAllocator` is deliberately not `Sync`: its tables sit in a
/// `RefCell` serialized by the internal `CoreLock`. This wrapper is
/// what asserts that sharing across the two cores is sound.
pub struct SharedPioAllocator {
    inner: RpPioAllocator,
}

// SAFETY: every table access inside `PioAllocator` happens under its
// `CoreLock`, which excludes the other core, and `RpPio`'s own state is
// mutated only inside critical sections.
#[allow(unsafe_code)]
unsafe impl Sync for SharedPioAllocator {}

impl SharedPioAllocator {
    pub fn new() -> Self {
        Self {
            inner: tandem_core::pio::PioAllocator::new(RpPio::new(), SioCoreMutex::new()),
        }
    }
}

impl Default for SharedPioAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for SharedPioAllocator {
    type Target = RpPioAllocator;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// System clock frequency in Hz.
pub fn f_cpu() -> u32 {
    clk_sys_freq()
}

/// Microseconds to PIO clock cycles at the current system clock.
///
/// PIO state machines tick at `clk_sys / divider`; with divider 1 a
/// cycle is a sysclk cycle.
pub fn us_to_pio_cycles(us: u32) -> u32 {
    us * (clk_sys_freq() / 1_000_000)
}

/// 16.8 fixed-point clock divider running a state machine at
/// `freq_hz`.
///
/// Clamped to the hardware's divider range; 0 requests the slowest
/// possible clock.
pub fn clkdiv_for_frequency(freq_hz: u32) -> FixedU32<U8> {
    if freq_hz == 0 {
        return FixedU32::from_bits(u32::MAX >> 8 << 8);
    }
    let div_x256 = ((clk_sys_freq() as u64) << 8) / freq_hz as u64;
    let div_x256 = div_x256.clamp(1 << 8, (u32::MAX >> 8) as u64) as u32;
    FixedU32::from_bits(div_x256)
}
