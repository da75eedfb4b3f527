//! Board-agnostic dual-core resource-sharing primitives
//!
//! This crate contains the logic that has to reason about two CPU cores
//! racing over shared state with no memory protection between them:
//!
//! - Deadlock-detecting cross-core lock (`lock`)
//! - Inter-core signalling channel with a freeze/resume protocol (`control`)
//! - PIO state-machine and microcode allocator (`pio`)
//! - Interrupt-safe single-producer/single-consumer byte ring (`ring`)
//!
//! Everything hardware-specific is reached through the narrow traits in
//! `platform`, so the concurrency and allocation policies are exercised
//! on the host with simulated cores. The RP2040 implementations live in
//! `tandem-hal-rp2040`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod control;
pub mod lock;
pub mod pio;
pub mod platform;
pub mod ring;

#[cfg(test)]
mod sim;
