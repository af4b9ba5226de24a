//! Message queues.
//!
//! A ring buffer of `N` message slots: `get`/`put` indices, the standard
//! full/empty test (`put+1 == get` means full, `get == put` means empty —
//! one slot is always left unused), and `pushback` semantics for re-queuing
//! a message at the head. The ring holds `Option<Message>` directly, so an
//! empty slot is `None` rather than a stale pointer.

use crate::message::Message;

/// A fixed-depth FIFO of [`Message`]s with pushback.
pub struct Queue<const N: usize> {
    ring: [Option<Message>; N],
    get: usize,
    put: usize,
    pushback: bool,
}

impl<const N: usize> Queue<N> {
    pub const fn new() -> Self {
        assert!(N >= 2, "queue depth must leave room for the empty/full sentinel slot");
        Queue {
            ring: [const { None }; N],
            get: 0,
            put: 0,
            pushback: false,
        }
    }

    fn next(&self, i: usize) -> usize {
        if i + 1 == N {
            0
        } else {
            i + 1
        }
    }

    /// Enqueue at the tail. Returns `Err(msg)` (without taking ownership)
    /// if the ring is full — caller must free `msg` itself.
    pub fn write(&mut self, msg: Message) -> Result<(), Message> {
        let next = self.next(self.put);
        if next == self.get {
            return Err(msg);
        }
        self.ring[self.put] = Some(msg);
        self.put = next;
        Ok(())
    }

    /// Dequeue from the head, or `None` if empty.
    pub fn read(&mut self) -> Option<Message> {
        if self.get == self.put {
            return None;
        }
        let next = self.next(self.get);
        let msg = self.ring[self.get].take();
        self.get = next;
        msg
    }

    /// Place `msg` back at the head (un-dequeue) so it's the next thing
    /// `read()` returns. Sets the pushback flag. Returns `false` (without
    /// taking ownership) if the ring has no room to hold it.
    pub fn pushback(&mut self, msg: Message) -> Result<(), Message> {
        let where_ = if self.get == 0 { N - 1 } else { self.get - 1 };
        if where_ == self.put {
            return Err(msg);
        }
        self.ring[where_] = Some(msg);
        self.get = where_;
        self.pushback = true;
        Ok(())
    }

    /// Read and clear the pushback flag in one step.
    pub fn check_and_clear_pushback(&mut self) -> bool {
        let was = self.pushback;
        self.pushback = false;
        was
    }

    /// Drain the queue, freeing every resident message.
    pub fn clear(&mut self) {
        while let Some(msg) = self.read() {
            msg.free();
        }
        self.pushback = false;
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }
}

impl<const N: usize> Default for Queue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    static POOL: Pool<8> = Pool::new(16, 0);

    fn setup() -> Queue<3> {
        POOL.init();
        Queue::new()
    }

    #[test]
    fn fifo_order() {
        let mut q = setup();
        q.write(POOL.alloc().unwrap()).unwrap();
        q.write(POOL.alloc().unwrap()).unwrap();
        assert!(!q.is_empty());
        let a = q.read().unwrap();
        let b = q.read().unwrap();
        assert!(q.read().is_none());
        a.free();
        b.free();
    }

    #[test]
    fn full_ring_rejects_write() {
        let mut q = setup();
        // depth 3 => only 2 usable slots.
        q.write(POOL.alloc().unwrap()).unwrap();
        q.write(POOL.alloc().unwrap()).unwrap();
        let m = POOL.alloc().unwrap();
        let rejected = q.write(m);
        assert!(rejected.is_err());
        rejected.unwrap_err().free();
        q.clear();
    }

    #[test]
    fn pushback_is_observed_and_reread_first() {
        let mut q = setup();
        q.write(POOL.alloc().unwrap()).unwrap();
        let first = q.read().unwrap();
        assert!(!q.check_and_clear_pushback());
        q.pushback(first).unwrap();
        assert!(q.check_and_clear_pushback());
        assert!(!q.check_and_clear_pushback());
        let reread = q.read().unwrap();
        reread.free();
    }

    #[test]
    fn clear_frees_everything() {
        let mut q = setup();
        q.write(POOL.alloc().unwrap()).unwrap();
        q.write(POOL.alloc().unwrap()).unwrap();
        q.clear();
        assert!(q.is_empty());
        // pool slots must be free again
        let _a = POOL.alloc().unwrap();
        let _b = POOL.alloc().unwrap();
    }
}
