//! Cooperative task runtime.
//!
//! A task table indexed by a small integer id, each slot holding a
//! type-erased handler set plus optional down/up queues. Rust has no
//! function-pointer-plus-void-star idiom worth reaching for here, but the
//! table still needs *some* way to hold heterogeneously-typed task state
//! and differently-sized queues side by side. This module erases both
//! behind two small trait objects instead of one big enum: [`TaskHandlers`]
//! (the down/up/idle/timeout handler set) and [`Mailbox`] (a
//! [`Queue`](crate::queue::Queue) of any depth). A concrete task module
//! (`demos/terminal-server`, or `net::arp`/`net::ip`/etc. for the stack's
//! own internal tasks) implements `TaskHandlers` once and the scheduler
//! never needs to know its concrete type again.
//!
//! # Reentrancy
//!
//! A task's down/up handler can recurse into another task's handler while
//! still executing the current one (e.g. ARP's `up` handler calling
//! straight into IP's `up` handler for a bullet message). A literal
//! `&mut self`-based dispatcher would make Rust's borrow checker reject
//! that nested call back into the same scheduler. [`SchedulerCell`]
//! provides ambient access instead, through an `UnsafeCell` rather than
//! `&mut self` borrows, so nested calls each take a fresh, transient
//! borrow instead of holding one for the whole call chain. This is sound
//! only under the invariant the rest of this crate already leans on:
//! exactly one logical thread of execution, ever.

use core::any::Any;

use crate::message::Message;

/// A task's published liveness state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Published {
    #[default]
    Other,
    Idle,
    Active,
}

/// A type-erased message queue, implemented by [`Queue`](crate::queue::Queue)
/// of any depth, so the scheduler's task table can hold queues of
/// different sizes side by side.
pub trait Mailbox {
    fn write(&mut self, msg: Message) -> Result<(), Message>;
    fn read(&mut self) -> Option<Message>;
    fn pushback(&mut self, msg: Message) -> Result<(), Message>;
    fn check_and_clear_pushback(&mut self) -> bool;
    fn clear(&mut self);
}

impl<const N: usize> Mailbox for crate::queue::Queue<N> {
    fn write(&mut self, msg: Message) -> Result<(), Message> {
        crate::queue::Queue::write(self, msg)
    }
    fn read(&mut self) -> Option<Message> {
        crate::queue::Queue::read(self)
    }
    fn pushback(&mut self, msg: Message) -> Result<(), Message> {
        crate::queue::Queue::pushback(self, msg)
    }
    fn check_and_clear_pushback(&mut self) -> bool {
        crate::queue::Queue::check_and_clear_pushback(self)
    }
    fn clear(&mut self) {
        crate::queue::Queue::clear(self)
    }
}

/// The handler set a task implements. `idle`/`timeout` default to doing
/// nothing, for the common case of a task with no periodic work or timers
/// of its own.
///
/// `Any` lets a caller holding a `&dyn TaskHandlers` `downcast_ref`/
/// `downcast_mut` to the concrete task type it already knows it
/// registered.
pub trait TaskHandlers: Any {
    /// Handle a message travelling down the stack (app → wire).
    fn down(&mut self, msg: Message);
    /// Handle a message travelling up the stack (wire → app).
    fn up(&mut self, msg: Message);
    /// Run once per scheduler pass when neither queue yielded a message.
    fn idle(&mut self) {}
    /// A timer this task owns has expired.
    fn timeout(&mut self, _local_id: u8) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TaskSlot {
    handlers: &'static mut dyn TaskHandlers,
    mq_down: Option<&'static mut dyn Mailbox>,
    mq_up: Option<&'static mut dyn Mailbox>,
    published: Published,
}

/// A fixed task table of capacity `N`, indexed directly by task id.
/// Index `0` is reserved (`TASKID_NULL`) and always empty.
pub struct Scheduler<const N: usize> {
    tasks: [Option<TaskSlot>; N],
    current_taskid: u8,
}

impl<const N: usize> Scheduler<N> {
    pub const fn new() -> Self {
        Scheduler {
            tasks: [const { None }; N],
            current_taskid: 0,
        }
    }

    /// Register a task at `taskid`. Queues and pools are plain `'static`
    /// references the caller already owns.
    pub fn register(
        &mut self,
        taskid: u8,
        handlers: &'static mut dyn TaskHandlers,
        mq_down: Option<&'static mut dyn Mailbox>,
        mq_up: Option<&'static mut dyn Mailbox>,
    ) {
        assert!(taskid != 0, "taskid 0 is reserved (TASKID_NULL)");
        self.tasks[taskid as usize] = Some(TaskSlot {
            handlers,
            mq_down,
            mq_up,
            published: Published::default(),
        });
    }

    fn slot_mut(&mut self, taskid: u8) -> &mut TaskSlot {
        self.tasks[taskid as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("no task registered at taskid {taskid}"))
    }

    pub fn current_taskid(&self) -> u8 {
        self.current_taskid
    }

    /// Downcast the current task's handler state.
    pub fn current_instance<T: TaskHandlers>(&mut self) -> Option<&mut T> {
        let id = self.current_taskid;
        self.instance_mut(id)
    }

    pub fn instance_mut<T: TaskHandlers>(&mut self, taskid: u8) -> Option<&mut T> {
        self.slot_mut(taskid).handlers.as_any_mut().downcast_mut::<T>()
    }

    pub fn published(&self, taskid: u8) -> Published {
        self.tasks[taskid as usize]
            .as_ref()
            .map(|t| t.published)
            .unwrap_or_default()
    }

    /// Set the *currently running* task's published state.
    pub fn set_published(&mut self, state: Published) {
        let id = self.current_taskid;
        self.slot_mut(id).published = state;
    }

    fn with_current<R>(&mut self, taskid: u8, f: impl FnOnce(&mut Self) -> R) -> R {
        let save = self.current_taskid;
        self.current_taskid = taskid;
        let r = f(self);
        self.current_taskid = save;
        r
    }

    /// Send `msg` to `taskid`'s down handler: queued normally, delivered
    /// synchronously if the task has no down queue or `msg` is a BULLET.
    /// A full queue frees `msg` rather than leaking its pool slot.
    pub fn send_down(&mut self, taskid: u8, msg: Message) {
        let bullet = msg.is_bullet();
        let has_queue = self.slot_mut(taskid).mq_down.is_some();
        if has_queue && !bullet {
            let slot = self.slot_mut(taskid);
            if let Err(msg) = slot.mq_down.as_mut().unwrap().write(msg) {
                msg.free();
            }
        } else {
            self.with_current(taskid, |s| s.slot_mut(taskid).handlers.down(msg));
        }
    }

    /// Send `msg` to `taskid`'s up handler, same rules as
    /// [`send_down`](Self::send_down).
    pub fn send_up(&mut self, taskid: u8, msg: Message) {
        let bullet = msg.is_bullet();
        let has_queue = self.slot_mut(taskid).mq_up.is_some();
        if has_queue && !bullet {
            let slot = self.slot_mut(taskid);
            if let Err(msg) = slot.mq_up.as_mut().unwrap().write(msg) {
                msg.free();
            }
        } else {
            self.with_current(taskid, |s| s.slot_mut(taskid).handlers.up(msg));
        }
    }

    /// Call `taskid`'s timeout handler for `local_id`, driven by a
    /// [`TimerWheel::run`](crate::timer::TimerWheel::run) dispatch closure.
    pub fn timeout(&mut self, taskid: u8, local_id: u8) {
        self.with_current(taskid, |s| s.slot_mut(taskid).handlers.timeout(local_id));
    }

    /// One pass over the task table: feed one down message and one up
    /// message to each task in turn, then run its idle routine. Returns
    /// early — skipping the remaining tasks this pass — the moment any
    /// queue reports a pushback, so the outer loop restarts from task 1
    /// rather than continuing past a task that couldn't make progress.
    pub fn run_once(&mut self) {
        for taskid in 1..N as u8 {
            if self.tasks[taskid as usize].is_none() {
                continue;
            }
            if self.pump_down(taskid) {
                return;
            }
            if self.pump_up(taskid) {
                return;
            }
            self.with_current(taskid, |s| s.slot_mut(taskid).handlers.idle());
        }
    }

    /// Returns `true` if a pushback occurred (scan should stop).
    fn pump_down(&mut self, taskid: u8) -> bool {
        let msg = match self.slot_mut(taskid).mq_down.as_mut() {
            Some(mq) => mq.read(),
            None => None,
        };
        if let Some(msg) = msg {
            self.with_current(taskid, |s| s.slot_mut(taskid).handlers.down(msg));
            return self.slot_mut(taskid).mq_down.as_mut().unwrap().check_and_clear_pushback();
        }
        false
    }

    fn pump_up(&mut self, taskid: u8) -> bool {
        let msg = match self.slot_mut(taskid).mq_up.as_mut() {
            Some(mq) => mq.read(),
            None => None,
        };
        if let Some(msg) = msg {
            self.with_current(taskid, |s| s.slot_mut(taskid).handlers.up(msg));
            return self.slot_mut(taskid).mq_up.as_mut().unwrap().check_and_clear_pushback();
        }
        false
    }
}

impl<const N: usize> Default for Scheduler<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ambient access to a `'static` [`Scheduler`], for task handlers that need
/// to forward a message on (`send_down`/`send_up`) from inside their own
/// `down`/`up` body. See the reentrancy note in the module documentation.
pub struct SchedulerCell<const N: usize> {
    inner: core::cell::UnsafeCell<Scheduler<N>>,
}

unsafe impl<const N: usize> Sync for SchedulerCell<N> {}

impl<const N: usize> SchedulerCell<N> {
    pub const fn new() -> Self {
        SchedulerCell {
            inner: core::cell::UnsafeCell::new(Scheduler::new()),
        }
    }

    /// Run `f` against the scheduler. Safe to call reentrantly (a handler
    /// invoked from within an outer `with` may call `with` again) as long
    /// as the single-logical-thread invariant holds — see the module
    /// documentation.
    pub fn with<R>(&self, f: impl FnOnce(&mut Scheduler<N>) -> R) -> R {
        let sched = unsafe { &mut *self.inner.get() };
        f(sched)
    }
}

/// Object-safe view of [`SchedulerCell`], so a protocol task (ARP, IP,
/// ICMP, TCP) can forward messages onward without being generic over the
/// scheduler's task-table capacity.
pub trait Router {
    fn send_down(&self, taskid: u8, msg: Message);
    fn send_up(&self, taskid: u8, msg: Message);
    /// Set the *calling* task's published state. Only meaningful called
    /// from within that task's own handler.
    fn set_published(&self, state: Published);
    /// Read any task's published state — used by an application task to
    /// poll whether the socket task it depends on (e.g. a listening TCP
    /// socket) is idle or active.
    fn published(&self, taskid: u8) -> Published;
}

impl<const N: usize> Router for SchedulerCell<N> {
    fn send_down(&self, taskid: u8, msg: Message) {
        self.with(|s| s.send_down(taskid, msg))
    }
    fn send_up(&self, taskid: u8, msg: Message) {
        self.with(|s| s.send_up(taskid, msg))
    }
    fn set_published(&self, state: Published) {
        self.with(|s| s.set_published(state))
    }
    fn published(&self, taskid: u8) -> Published {
        self.with(|s| s.published(taskid))
    }
}
