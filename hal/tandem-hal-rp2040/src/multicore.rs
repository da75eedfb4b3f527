//! Shared inter-core channel and its FIFO interrupt handlers
//!
//! The handlers (and everything they reach) must execute from RAM: a
//! freeze request arrives precisely because flash is about to be erased
//! or rewritten, and XIP stalls any core still fetching from it. The
//! handler bodies carry `.data.ram_func` placement and the channel's
//! service path is `#[inline(always)]` so no stray flash call survives.

use embassy_rp::interrupt::{Interrupt, InterruptExt};
use embassy_rp::pac;

use crate::sio::{current_core, SioCoreMutex, SioFifo};
use tandem_core::control::CrossCoreChannel;

/// The one channel both cores share.
///
/// Data words pushed here surface on the peer through its FIFO
/// interrupt; `freeze_peer`/`resume_peer` bracket flash maintenance.
pub static CROSS_CORE: CrossCoreChannel<SioFifo, SioCoreMutex> =
    CrossCoreChannel::new(SioFifo, SioCoreMutex::new());

/// Per-core one-time setup: flush stale FIFO state and enable this
/// core's FIFO interrupt.
///
/// Call once from each core during startup, before any use of
/// [`CROSS_CORE`].
pub fn register_core() {
    SioFifo.flush();
    let irq = if current_core().0 == 0 {
        Interrupt::SIO_IRQ_PROC0
    } else {
        Interrupt::SIO_IRQ_PROC1
    };
    irq.unpend();
    unsafe { irq.enable() };
}

#[inline(always)]
fn fifo_irq() {
    // Clear the sticky status bits that raised the interrupt.
    pac::SIO.fifo().st().write_value(pac::sio::regs::FifoSt(0xff));
    // Interrupts stay masked for the whole drain: if this is a freeze
    // request we must run nothing but this loop until resumed.
    cortex_m::interrupt::free(|_| CROSS_CORE.service_fifo_irq());
}

#[allow(non_snake_case)]
#[no_mangle]
#[link_section = ".data.ram_func"]
extern "C" fn SIO_IRQ_PROC0() {
    fifo_irq();
}

#[allow(non_snake_case)]
#[no_mangle]
#[link_section = ".data.ram_func"]
extern "C" fn SIO_IRQ_PROC1() {
    fifo_irq();
}
