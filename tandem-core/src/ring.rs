//! Interrupt-safe single-producer/single-consumer byte ring
//!
//! Moves bytes from an interrupt handler into ordinary call context (or
//! the reverse) without locks. Correctness rests on exactly two rules:
//! each index is advanced by exactly one role, and a Release store of an
//! index is never issued before the slot it publishes. One slot is kept
//! permanently empty so a full ring and an empty ring are
//! distinguishable from the indices alone.
//!
//! A push that would catch up to the reader is rejected and recorded in
//! a sticky overflow flag: data loss is explicit, never silent
//! corruption of bytes already queued.
//!
//! Only load/store atomics are used; thumbv6m has no atomic
//! read-modify-write and none is needed here.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Lock-free SPSC ring of `C` slots holding up to `C - 1` bytes.
///
/// Usually lives in a `static`; [`split`](Self::split) hands out the two
/// role handles once, during single-threaded startup.
pub struct ByteRing<const C: usize> {
    slots: [AtomicU8; C],
    /// Advanced only by the producer.
    write: AtomicUsize,
    /// Advanced only by the consumer.
    read: AtomicUsize,
    /// Sticky; set on rejected push, cleared by `take_overflow`.
    overflow: AtomicBool,
    split_taken: AtomicBool,
}

impl<const C: usize> ByteRing<C> {
    const ZERO: AtomicU8 = AtomicU8::new(0);

    pub const fn new() -> Self {
        const {
            assert!(C >= 2, "a ring needs one data slot plus the empty slot");
        }
        Self {
            slots: [Self::ZERO; C],
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
            split_taken: AtomicBool::new(false),
        }
    }

    /// Hand out the producer and consumer handles.
    ///
    /// Returns `None` on every call after the first. Call during
    /// single-threaded startup, before the interrupt side is live.
    pub fn split(&self) -> Option<(RingWriter<'_, C>, RingReader<'_, C>)> {
        if self.split_taken.load(Ordering::Acquire) {
            return None;
        }
        self.split_taken.store(true, Ordering::Release);
        Some((RingWriter { ring: self }, RingReader { ring: self }))
    }

    /// Bytes the ring can hold at once.
    pub const fn capacity(&self) -> usize {
        C - 1
    }

    /// Bytes currently queued: pushes minus pops.
    pub fn available(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + C - read) % C
    }

    fn push(&self, byte: u8) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        let next = if write + 1 == C { 0 } else { write + 1 };
        if next == self.read.load(Ordering::Acquire) {
            // Full. Drop the byte, remember that we did.
            self.overflow.store(true, Ordering::Relaxed);
            return false;
        }
        self.slots[write].store(byte, Ordering::Relaxed);
        // The slot must be visible before the advanced index is.
        self.write.store(next, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u8> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        let byte = self.slots[read].load(Ordering::Relaxed);
        let next = if read + 1 == C { 0 } else { read + 1 };
        // The slot must have been read before the producer may reuse it.
        self.read.store(next, Ordering::Release);
        Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        Some(self.slots[read].load(Ordering::Relaxed))
    }

    fn take_overflow(&self) -> bool {
        let hold = self.overflow.load(Ordering::Relaxed);
        if hold {
            self.overflow.store(false, Ordering::Relaxed);
        }
        hold
    }
}

/// Producer handle. May be driven from an interrupt handler: `push`
/// never blocks, never allocates, and runs in bounded time.
pub struct RingWriter<'a, const C: usize> {
    ring: &'a ByteRing<C>,
}

impl<const C: usize> RingWriter<'_, C> {
    /// Queue one byte. Returns false (and sets the overflow flag) when
    /// the ring is full; the byte is dropped.
    pub fn push(&mut self, byte: u8) -> bool {
        self.ring.push(byte)
    }

    /// Bytes that can still be pushed before the ring is full.
    pub fn free(&self) -> usize {
        self.ring.capacity() - self.ring.available()
    }
}

/// Consumer handle for ordinary call context.
pub struct RingReader<'a, const C: usize> {
    ring: &'a ByteRing<C>,
}

impl<const C: usize> RingReader<'_, C> {
    /// Dequeue the oldest byte, if any.
    pub fn pop(&mut self) -> Option<u8> {
        self.ring.pop()
    }

    /// Look at the oldest byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.ring.peek()
    }

    /// Bytes currently queued.
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// Whether any push was dropped since the last call. Clears the
    /// flag.
    pub fn take_overflow(&mut self) -> bool {
        self.ring.take_overflow()
    }
}
