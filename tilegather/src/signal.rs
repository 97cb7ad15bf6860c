//! Cross-rank signaling: readiness flags and the phased barrier.
//!
//! This is the sole cross-rank consistency mechanism in the crate.
//! A producer publishes data with Relaxed stores and then raises a
//! flag with a Release store; a consumer spin-loads the flag with
//! Acquire ordering and, once it observes the expected value, every
//! write that preceded the flag store is visible. There is no other
//! fence anywhere.
//!
//! A wait that resolves hands back a [`ReadyToken`]; load paths that
//! must not start before the flag condition demand one, so the data
//! dependency is visible in the type system rather than implied by
//! call order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Proof that a flag wait resolved with Acquire ordering.
///
/// Zero-sized; only [`FlagBuffer::wait`] and [`FlagBuffer::wait_range`]
/// can mint one.
#[derive(Debug, Clone, Copy)]
pub struct ReadyToken(());

impl ReadyToken {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

/// Spin-wait back-off: yield to the scheduler every this many polls,
/// so waiters make progress even when ranks outnumber cores.
const SPINS_PER_YIELD: u32 = 64;

/// A per-rank array of readiness counters, one slot per rank.
///
/// Each slot has exactly one writer per phase; any rank may read any
/// slot. Writers only move a slot forward within a phase; resets
/// happen inside a barrier bracket where no reader can be polling.
pub struct FlagBuffer {
    slots: Vec<AtomicU32>,
}

impl FlagBuffer {
    /// Create a zeroed flag buffer with `len` slots.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// A buffer with every slot already at `value`.
    ///
    /// Used by the gemm-only paths, where all of A is resident up
    /// front and no wait should ever block.
    #[must_use]
    pub fn all_set(len: usize, value: u32) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicU32::new(value)).collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the buffer has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Single-writer, release-ordered flag write.
    ///
    /// All memory writes made by this thread before the call become
    /// visible to any reader whose wait on `slot` observes `value`.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    pub fn set(&self, slot: usize, value: u32) {
        self.slots[slot].store(value, Ordering::Release);
    }

    /// Acquire-ordered read of one slot.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    #[must_use]
    pub fn get(&self, slot: usize) -> u32 {
        self.slots[slot].load(Ordering::Acquire)
    }

    /// Block until `slot` reaches at least `expected`.
    ///
    /// In-kernel spin wait, not a host-level block: other scheduling
    /// units keep running. A flag that never arrives hangs forever;
    /// there is no liveness fallback.
    pub fn wait(&self, slot: usize, expected: u32) -> ReadyToken {
        self.wait_range(slot, 1, expected)
    }

    /// Block until every slot in `[start, start + count)` reaches at
    /// least `expected`, with acquire ordering on the final observation
    /// of each slot.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn wait_range(&self, start: usize, count: usize, expected: u32) -> ReadyToken {
        assert!(start + count <= self.slots.len(), "flag range out of bounds");
        for slot in &self.slots[start..start + count] {
            let mut spins = 0u32;
            while slot.load(Ordering::Acquire) < expected {
                spins += 1;
                if spins % SPINS_PER_YIELD == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
        ReadyToken::new()
    }

    /// Zero every slot.
    ///
    /// Only valid inside a barrier bracket: no rank may be polling
    /// this buffer while it is reset.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }

    /// Current value of every slot (test/diagnostic use).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .collect()
    }
}

/// All-to-all phased rendezvous over per-rank sync buffers.
///
/// Every participant sets its own slot in every peer's sync buffer to
/// the phase value, then waits for all slots of its own buffer to
/// reach it. Running a second handshake at `phase + 1` gives a full
/// release/re-entry pair, so the barrier is reusable without any
/// memory reset: callers just advance the phase each invocation and
/// consume phases in strictly increasing order per slot.
pub struct BarrierGroup {
    sync: Vec<Arc<FlagBuffer>>,
}

impl BarrierGroup {
    /// Create the shared sync buffers for a group of `num_ranks`.
    #[must_use]
    pub fn create(num_ranks: usize) -> Self {
        Self {
            sync: (0..num_ranks)
                .map(|_| Arc::new(FlagBuffer::new(num_ranks)))
                .collect(),
        }
    }

    /// Number of participants.
    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.sync.len()
    }

    /// Arrive at `phase` and wait until every rank has.
    ///
    /// # Panics
    /// Panics if `rank` is out of range.
    pub fn arrive_and_wait(&self, rank: usize, phase: u32) {
        assert!(rank < self.sync.len(), "rank out of range");
        for peer in &self.sync {
            peer.set(rank, phase);
        }
        self.sync[rank].wait_range(0, self.sync.len(), phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_sees_prior_writes() {
        // The canonical release/acquire handshake: data written before
        // set() must be visible after wait() resolves.
        let flags = Arc::new(FlagBuffer::new(2));
        let data = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&flags);
        let d = Arc::clone(&data);
        let writer = thread::spawn(move || {
            d.store(42, Ordering::Relaxed);
            f.set(1, 1);
        });

        let _token = flags.wait(1, 1);
        assert_eq!(data.load(Ordering::Relaxed), 42);
        writer.join().unwrap();
    }

    #[test]
    fn wait_range_blocks_on_every_slot() {
        let flags = Arc::new(FlagBuffer::new(4));
        let f = Arc::clone(&flags);
        let writer = thread::spawn(move || {
            // Raise out of order; the waiter needs all of [1, 4).
            f.set(3, 1);
            f.set(1, 1);
            f.set(2, 1);
        });
        let _token = flags.wait_range(1, 3, 1);
        assert_eq!(flags.snapshot()[1..], [1, 1, 1]);
        writer.join().unwrap();
    }

    #[test]
    fn wait_accepts_later_value() {
        // A waiter must not hang if the writer has already advanced
        // past the expected value.
        let flags = FlagBuffer::new(1);
        flags.set(0, 5);
        let _token = flags.wait(0, 3);
    }

    #[test]
    fn all_set_never_blocks() {
        let flags = FlagBuffer::all_set(3, 1);
        let _token = flags.wait_range(0, 3, 1);
    }

    #[test]
    fn barrier_rendezvous_and_reuse() {
        let num_ranks = 4;
        let barrier = Arc::new(BarrierGroup::create(num_ranks));
        let counter = Arc::new(AtomicU32::new(0));

        thread::scope(|s| {
            for rank in 0..num_ranks {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    // Two invocations back-to-back, phases advancing by
                    // 2 each (the even/odd handshake pair).
                    for call in 0..2u32 {
                        let phase = 1 + 2 * call;
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.arrive_and_wait(rank, phase);
                        // After the barrier every rank has arrived.
                        assert!(
                            counter.load(Ordering::SeqCst) >= num_ranks as u32 * (call + 1)
                        );
                        barrier.arrive_and_wait(rank, phase + 1);
                    }
                });
            }
        });
    }
}
