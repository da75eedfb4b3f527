//! RP2040-specific bindings for the Tandem dual-core runtime core
//!
//! This crate implements the hardware seams of `tandem-core` on the
//! RP2040's SIO block and PIO register files:
//!
//! - Core identity, inter-core FIFO link, and the cross-core mutex (`sio`)
//! - The shared inter-core channel and its RAM-resident FIFO interrupt
//!   handlers (`multicore`)
//! - The PIO state-machine claim and instruction-memory load facility,
//!   plus clock-divider helpers (`pio`)

#![no_std]

pub mod multicore;
pub mod pio;
pub mod sio;

pub use multicore::{register_core, CROSS_CORE};
pub use sio::current_core;
