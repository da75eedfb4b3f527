//! SIO-backed core identity, FIFO link, and cross-core mutex

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_rp::pac;
use tandem_core::platform::{CoreId, FifoLink, RawCoreMutex, TryLock};

/// Which core this code is executing on, from the banked CPUID
/// register.
#[inline(always)]
pub fn current_core() -> CoreId {
    CoreId(pac::SIO.cpuid().read() as u8)
}

/// The paired inter-processor hardware FIFOs.
///
/// The registers are banked per core: `FIFO_WR` always feeds the peer's
/// inbound FIFO and `FIFO_RD` always drains this core's, so one ZST
/// serves both cores.
pub struct SioFifo;

impl SioFifo {
    /// Discard pending inbound words and clear the sticky
    /// overflow/underflow status bits.
    pub fn flush(&self) {
        while pac::SIO.fifo().st().read().vld() {
            let _ = pac::SIO.fifo().rd().read();
        }
        pac::SIO.fifo().st().write_value(pac::sio::regs::FifoSt(0xff));
    }
}

impl FifoLink for SioFifo {
    #[inline(always)]
    fn current_core(&self) -> CoreId {
        current_core()
    }

    #[inline(always)]
    fn try_push(&self, word: u32) -> bool {
        let sio = pac::SIO;
        if !sio.fifo().st().read().rdy() {
            return false;
        }
        sio.fifo().wr().write_value(word);
        // Wake a peer blocked in WFE on an empty FIFO.
        cortex_m::asm::sev();
        true
    }

    #[inline(always)]
    fn try_pop(&self) -> Option<u32> {
        let sio = pac::SIO;
        if sio.fifo().st().read().vld() {
            Some(sio.fifo().rd().read())
        } else {
            None
        }
    }
}

const FREE: u8 = 0xff;

/// Cross-core mutex: an owner-core byte mutated only inside a chip-wide
/// critical section.
///
/// embassy-rp's `critical-section-impl` takes a SIO spinlock in
/// addition to masking interrupts, so the section excludes the other
/// core as well; plain load/store atomics suffice inside it (thumbv6m
/// has no atomic read-modify-write anyway).
pub struct SioCoreMutex {
    owner: AtomicU8,
}

impl SioCoreMutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU8::new(FREE),
        }
    }
}

impl Default for SioCoreMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawCoreMutex for SioCoreMutex {
    #[inline(always)]
    fn current_core(&self) -> CoreId {
        current_core()
    }

    fn try_lock(&self) -> TryLock {
        let me = current_core().0;
        critical_section::with(|_| match self.owner.load(Ordering::Relaxed) {
            FREE => {
                self.owner.store(me, Ordering::Relaxed);
                TryLock::Acquired
            }
            owner if owner == me => TryLock::HeldByCaller,
            _ => TryLock::HeldByOther,
        })
    }

    fn lock_blocking(&self) {
        loop {
            if matches!(self.try_lock(), TryLock::Acquired) {
                return;
            }
            // Woken by the owner's SEV on unlock.
            cortex_m::asm::wfe();
        }
    }

    fn unlock(&self) {
        critical_section::with(|_| self.owner.store(FREE, Ordering::Relaxed));
        cortex_m::asm::sev();
    }
}
