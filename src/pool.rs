//! Message pools.
//!
//! A `Pool<N>` is a fixed-size array of `N` message slots, all sharing the
//! same declared message size and initial cursor offset. Allocation is a
//! first-free linear scan — there's no free list, `N` is always tiny (4
//! cache entries, a handful of sockets), so the scan is cheap and the code
//! stays simple.
//!
//! Every pool here is a `'static` array declared once at the top of the
//! program, sized per pool by const generics — compile-time-sized storage
//! with no bump-arena bookkeeping needed. See `DESIGN.md`.

use core::cell::{Cell, UnsafeCell};

use crate::message::{Message, MAX_FRAME};

/// One slot in a [`Pool`]: fixed physical storage plus the bookkeeping a
/// [`Message`](crate::message::Message) built over it needs.
pub struct PoolSlot {
    pub(crate) bytes: UnsafeCell<[u8; MAX_FRAME]>,
    pub(crate) in_use: Cell<bool>,
}

// SAFETY: the whole crate runs on a single logical thread; nothing here
// is ever accessed concurrently.
unsafe impl Sync for PoolSlot {}

impl PoolSlot {
    const fn new() -> Self {
        PoolSlot {
            bytes: UnsafeCell::new([0u8; MAX_FRAME]),
            in_use: Cell::new(false),
        }
    }
}

/// A fixed-size vector of message slots of identical declared size and
/// initial offset.
pub struct Pool<const N: usize> {
    slots: [PoolSlot; N],
    /// Declared logical message size for every slot (`<= MAX_FRAME`).
    size: u16,
    /// Initial cursor position for every message allocated from this pool.
    offset: u16,
}

impl<const N: usize> Pool<N> {
    /// Declare a pool of `N` messages, each with logical capacity `size`
    /// bytes and an initial cursor `offset` bytes into the slot.
    pub const fn new(size: u16, offset: u16) -> Self {
        assert!(size as usize <= MAX_FRAME, "pool message size exceeds MAX_FRAME");
        assert!(offset <= size, "pool offset exceeds declared message size");
        Pool {
            slots: [const { PoolSlot::new() }; N],
            size,
            offset,
        }
    }

    /// Must be called once before first use; `const fn new` can't zero the
    /// in-use flags through a non-const `Cell::set`, but the initializer
    /// already does that — `init` exists so callers have an explicit,
    /// visible wiring step.
    pub fn init(&'static self) {
        for slot in &self.slots {
            slot.in_use.set(false);
        }
    }

    /// Number of slots in this pool.
    pub const fn len(&self) -> usize {
        N
    }

    /// Get the `idx`'th slot regardless of whether it's currently in use —
    /// used to acquire a known, single-owner slot for periodic emissions
    /// (e.g. ARP retry requests reuse the cache entry's own pool slot by
    /// index). Caller must `clear()` before reuse.
    pub fn idx(&'static self, idx: usize) -> Message {
        Message::from_pool_slot(&self.slots[idx], self.offset, self.size)
    }

    /// Allocate the first free slot, marking it in use. Returns `None` if
    /// the pool is full — callers must tolerate this.
    pub fn alloc(&'static self) -> Option<Message> {
        for slot in &self.slots {
            if !slot.in_use.get() {
                slot.in_use.set(true);
                let mut msg = Message::from_pool_slot(slot, self.offset, self.size);
                msg.clear();
                return Some(msg);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_scans_first_free() {
        static POOL: Pool<2> = Pool::new(64, 0);
        POOL.init();
        let a = POOL.alloc().unwrap();
        let b = POOL.alloc().unwrap();
        assert!(POOL.alloc().is_none());
        a.free();
        let c = POOL.alloc();
        assert!(c.is_some());
        b.free();
        c.unwrap().free();
    }

    #[test]
    fn idx_bypasses_in_use() {
        static POOL: Pool<2> = Pool::new(64, 0);
        POOL.init();
        let _held = POOL.alloc().unwrap();
        // idx(0) returns the same slot even though it's held.
        let mut reused = POOL.idx(0);
        reused.clear();
        reused.write1(42);
        assert_eq!(reused.len(), 1);
    }
}
