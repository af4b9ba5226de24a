//! Timer wheel.
//!
//! Running timers form a singly linked list, each one slotted into a
//! fixed table rather than embedded directly in its owning task's state
//! and linked by a raw pointer — that classic intrusive-list shape needs
//! possibly-dangling pointers into caller-owned memory to work safely,
//! and this crate has no heap to spend reproducing that. Ownership is
//! inverted instead: the wheel owns every timer's state in a fixed slot
//! table, and callers hold a small `Copy` [`TimerHandle`]. The intrusive
//! list itself survives — `Slot::next` links slots by index the way a
//! pointer would.

/// A lightweight reference to one timer owned by a [`TimerWheel`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(u8);

/// Number of ticks per second, driven by a 50ms hardware tick (~20Hz).
pub const TICKS_PER_SECOND: u32 = 20;

/// Upper bound on timers expiring within a single [`TimerWheel::run`] call.
const MAX_EXPIRED_PER_TICK: usize = 10;

struct Slot {
    in_use: bool,
    running: bool,
    expired: bool,
    owner: u8,
    id: u8,
    remaining: u32,
    next: Option<u8>,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            in_use: false,
            running: false,
            expired: false,
            owner: 0,
            id: 0,
            remaining: 0,
            next: None,
        }
    }
}

/// A fixed-capacity timer wheel. `owner` is an opaque small integer the
/// caller interprets however its task table does.
pub struct TimerWheel<const N: usize> {
    slots: [Slot; N],
    head: Option<u8>,
}

impl<const N: usize> TimerWheel<N> {
    pub const fn new() -> Self {
        assert!(N <= u8::MAX as usize, "timer wheel capacity must fit a u8 index");
        TimerWheel {
            slots: [const { Slot::new() }; N],
            head: None,
        }
    }

    /// Reserve a fresh timer slot. Panics if the table is full — timer
    /// count is fixed at wiring time, so exhaustion here is a programmer
    /// error, same class as pool/queue table exhaustion.
    pub fn alloc(&mut self, owner: u8) -> TimerHandle {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.owner = owner;
                slot.id = 0;
                slot.remaining = 0;
                slot.running = false;
                slot.expired = false;
                slot.next = None;
                return TimerHandle(i as u8);
            }
        }
        panic!("timer wheel exhausted");
    }

    fn slot(&self, h: TimerHandle) -> &Slot {
        &self.slots[h.0 as usize]
    }

    fn slot_mut(&mut self, h: TimerHandle) -> &mut Slot {
        &mut self.slots[h.0 as usize]
    }

    /// Detach and zero a timer, assigning it a fresh owner-local `id`.
    pub fn reset(&mut self, h: TimerHandle, id: u8) {
        self.stop(h);
        let slot = self.slot_mut(h);
        slot.expired = false;
        slot.remaining = 0;
        slot.id = id;
    }

    /// Start (or restart) the timer to expire in `seconds`.
    pub fn start_seconds(&mut self, h: TimerHandle, seconds: u16) {
        self.start_ticks(h, (seconds as u32) * TICKS_PER_SECOND);
    }

    /// Start (or restart) the timer to expire in `ticks` ticks. Linking
    /// into the running list only happens if the timer wasn't already
    /// running — restarting an already-running timer must not double-link it.
    pub fn start_ticks(&mut self, h: TimerHandle, ticks: u32) {
        let was_running = self.slot(h).running;
        {
            let slot = self.slot_mut(h);
            slot.remaining = ticks;
        }
        if !was_running {
            let slot = self.slot_mut(h);
            slot.running = true;
            slot.next = self.head;
            self.head = Some(h.0);
        }
    }

    /// Stop and unlink the timer. No-op if not running.
    pub fn stop(&mut self, h: TimerHandle) {
        if !self.slot(h).running {
            return;
        }
        let mut cur = self.head;
        let mut prev: Option<u8> = None;
        while let Some(i) = cur {
            if i == h.0 {
                let next = self.slots[i as usize].next;
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.head = next,
                }
                let slot = &mut self.slots[i as usize];
                slot.running = false;
                slot.next = None;
                return;
            }
            prev = cur;
            cur = self.slots[i as usize].next;
        }
    }

    pub fn read(&self, h: TimerHandle) -> u32 {
        self.slot(h).remaining
    }

    pub fn expired(&self, h: TimerHandle) -> bool {
        self.slot(h).expired
    }

    pub fn running(&self, h: TimerHandle) -> bool {
        self.slot(h).running
    }

    /// Advance every running timer by `nticks` and invoke `dispatch(owner,
    /// id)` for each one that expires, after the walk completes so no
    /// expiry callback ever observes a still-linked timer. At most
    /// [`MAX_EXPIRED_PER_TICK`] timers fire per call; any further expiry is
    /// postponed one tick (`remaining = 1`).
    pub fn run(&mut self, nticks: u32, mut dispatch: impl FnMut(u8, u8)) {
        let mut expired_idx: [u8; MAX_EXPIRED_PER_TICK] = [0; MAX_EXPIRED_PER_TICK];
        let mut expired_count = 0usize;

        let mut cur = self.head;
        let mut prev: Option<u8> = None;
        while let Some(i) = cur {
            let next = self.slots[i as usize].next;
            let slot = &mut self.slots[i as usize];
            if nticks < slot.remaining {
                slot.remaining -= nticks;
                prev = cur;
            } else if expired_count >= MAX_EXPIRED_PER_TICK {
                slot.remaining = 1;
                prev = cur;
            } else {
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.head = next,
                }
                let slot = &mut self.slots[i as usize];
                slot.next = None;
                slot.remaining = 0;
                slot.running = false;
                slot.expired = true;
                expired_idx[expired_count] = i;
                expired_count += 1;
            }
            cur = next;
        }

        for &i in &expired_idx[..expired_count] {
            let slot = &self.slots[i as usize];
            dispatch(slot.owner, slot.id);
        }
    }
}

impl<const N: usize> Default for TimerWheel<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Object-safe view of a [`TimerWheel`] behind interior mutability, so a
/// protocol task can own timers without being generic over the wheel's
/// total capacity — the same role [`crate::scheduler::Router`] plays for
/// the scheduler.
pub trait Timers {
    fn alloc(&self, owner: u8) -> TimerHandle;
    fn reset(&self, h: TimerHandle, id: u8);
    fn start_seconds(&self, h: TimerHandle, seconds: u16);
    fn start_ticks(&self, h: TimerHandle, ticks: u32);
    fn stop(&self, h: TimerHandle);
    fn read(&self, h: TimerHandle) -> u32;
    fn expired(&self, h: TimerHandle) -> bool;
    fn running(&self, h: TimerHandle) -> bool;
}

/// A [`TimerWheel`] behind an `UnsafeCell`, mirroring
/// [`SchedulerCell`](crate::scheduler::SchedulerCell)'s ambient-access
/// justification: every call is a short, non-overlapping borrow, sound
/// under the crate's single-logical-thread invariant.
pub struct TimerWheelCell<const N: usize> {
    inner: core::cell::UnsafeCell<TimerWheel<N>>,
}

unsafe impl<const N: usize> Sync for TimerWheelCell<N> {}

impl<const N: usize> TimerWheelCell<N> {
    pub const fn new() -> Self {
        TimerWheelCell {
            inner: core::cell::UnsafeCell::new(TimerWheel::new()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut TimerWheel<N>) -> R) -> R {
        let wheel = unsafe { &mut *self.inner.get() };
        f(wheel)
    }
}

impl<const N: usize> Timers for TimerWheelCell<N> {
    fn alloc(&self, owner: u8) -> TimerHandle {
        self.with(|w| w.alloc(owner))
    }
    fn reset(&self, h: TimerHandle, id: u8) {
        self.with(|w| w.reset(h, id))
    }
    fn start_seconds(&self, h: TimerHandle, seconds: u16) {
        self.with(|w| w.start_seconds(h, seconds))
    }
    fn start_ticks(&self, h: TimerHandle, ticks: u32) {
        self.with(|w| w.start_ticks(h, ticks))
    }
    fn stop(&self, h: TimerHandle) {
        self.with(|w| w.stop(h))
    }
    fn read(&self, h: TimerHandle) -> u32 {
        self.with(|w| w.read(h))
    }
    fn expired(&self, h: TimerHandle) -> bool {
        self.with(|w| w.expired(h))
    }
    fn running(&self, h: TimerHandle) -> bool {
        self.with(|w| w.running(h))
    }
}
