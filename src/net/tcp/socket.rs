//! Per-connection TCP state machine against RFC 793.
//!
//! This is the per-connection half that pairs with the demux task's
//! encode/decode half in [`super`], structured the way
//! [`super::super::arp::Arp`] structures its own state machine: one struct
//! per connection, `TaskHandlers::down`/`up` for the two message
//! directions, `timeout` for retry/delayed-ACK/TIME_WAIT, a `SocketLookup`
//! impl so the demux task can find it.
//!
//! The demux task's up-forwarded format carries `[seq][ack][code_bits]
//! [window][payload]` for an already-bound connection, but a LISTEN socket
//! also needs to learn who just tried to connect, so `super::Tcp::up`
//! additionally prepends `[rem_ipaddr,4][rem_port,2]`; see `DESIGN.md` for
//! the rationale.

use crate::message::Message;
use crate::pool::Pool;
use crate::scheduler::{Published, Router, TaskHandlers};
use crate::timer::{TimerHandle, Timers};

use super::super::tcp_flag;
use super::super::types::Ipv4Addr;
use super::{timer as tcp_timer, Binding, SocketLookup};

/// Message types exchanged with the application.
pub mod app_msg {
    pub const OPEN_ACTIVE: u8 = 0;
    pub const OPEN_PASSIVE: u8 = 1;
    pub const DATA: u8 = 2;
    pub const DATA_PUSH: u8 = 3;
    pub const CLOSE: u8 = 4;
    pub const ABORT: u8 = 5;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Optional application hook: `(listen_port, actual_dst_port) -> accept?`,
/// giving the application a chance to perform side effects, or refuse,
/// before a passive connection is accepted.
pub trait ListenCallback {
    fn on_listen(&self, listen_port: u16, actual_dst_port: u16) -> bool;
}

/// Accept unconditionally — the default when no hook is wired.
pub struct AlwaysAccept;
impl ListenCallback for AlwaysAccept {
    fn on_listen(&self, _listen_port: u16, _actual_dst_port: u16) -> bool {
        true
    }
}

/// One TCP connection's control block. `N` sizes this socket's own reply
/// pool; a demo can share one pool between two socket instances by passing
/// the same `&'static Pool<N>` to both.
pub struct Socket<const N: usize> {
    state: TcpState,
    loc_port: u16,
    rem_port: u16,
    rem_ipaddr: Ipv4Addr,

    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    rcv_wnd: u16,

    /// Outstanding unacknowledged data, held for retransmit. Holds the raw
    /// payload only; the TCP header is rebuilt fresh on each transmission.
    pending: Option<Message>,
    pending_seq: u32,
    retry_count: u8,
    ack_pending: bool,

    retry_timer: Option<TimerHandle>,
    delayed_ack_timer: Option<TimerHandle>,

    pool: &'static Pool<N>,
    router: &'static dyn Router,
    wheel: &'static dyn Timers,
    listen_cb: &'static dyn ListenCallback,
    tcp_taskid: u8,
    app_taskid: u8,
}

impl<const N: usize> Socket<N> {
    pub const fn new(
        pool: &'static Pool<N>,
        router: &'static dyn Router,
        wheel: &'static dyn Timers,
        listen_cb: &'static dyn ListenCallback,
        tcp_taskid: u8,
        app_taskid: u8,
    ) -> Self {
        Socket {
            state: TcpState::Closed,
            loc_port: 0,
            rem_port: 0,
            rem_ipaddr: Ipv4Addr::ZERO,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            rcv_wnd: 0,
            pending: None,
            pending_seq: 0,
            retry_count: 0,
            ack_pending: false,
            retry_timer: None,
            delayed_ack_timer: None,
            pool,
            router,
            wheel,
            listen_cb,
            tcp_taskid,
            app_taskid,
        }
    }

    pub fn init(&mut self, socket_taskid: u8) {
        let retry = self.wheel.alloc(socket_taskid);
        self.wheel.reset(retry, tcp_timer::RETRY);
        self.retry_timer = Some(retry);

        let delayed_ack = self.wheel.alloc(socket_taskid);
        self.wheel.reset(delayed_ack, tcp_timer::DELAYED_ACK);
        self.delayed_ack_timer = Some(delayed_ack);

        // Advertised window is fixed at this socket's own reply-message
        // capacity: there is no out-of-order buffering to size a dynamic
        // window against.
        if let Some(probe) = self.pool.alloc() {
            self.rcv_wnd = probe.room();
            probe.free();
        }

        self.publish();
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    fn publish(&self) {
        let published = match self.state {
            TcpState::Closed => Published::Idle,
            TcpState::Established => Published::Active,
            _ => Published::Other,
        };
        self.router.set_published(published);
    }

    fn retry(&self) -> TimerHandle {
        self.retry_timer.expect("Socket::init not called")
    }

    fn delayed_ack(&self) -> TimerHandle {
        self.delayed_ack_timer.expect("Socket::init not called")
    }

    /// Build and forward a control/data segment down to the TCP encode
    /// task in the `[dst_ipaddr,4][src_port,2][dst_port,2][seq,4][ack,4]
    /// [code_bits,2][window,2][user data]` format `tcp_down` expects.
    fn emit(&self, code_bits: u8, seq_nbr: u32, ack_nbr: u32, payload: Option<&[u8]>) {
        let Some(msg) = self.pool.alloc() else { return };

        if let Some(bytes) = payload {
            let n = core::cmp::min(bytes.len(), msg.room() as usize);
            for &b in &bytes[..n] {
                msg.write1(b);
            }
        }

        msg.push2(self.rcv_wnd);
        msg.push2(code_bits as u16);
        msg.push4(ack_nbr);
        msg.push4(seq_nbr);
        msg.push2(self.rem_port);
        msg.push2(self.loc_port);
        msg.push4(self.rem_ipaddr.to_u32());

        self.router.send_down(self.tcp_taskid, msg);
    }

    fn abort(&mut self) {
        self.wheel.stop(self.retry());
        self.wheel.stop(self.delayed_ack());
        if let Some(pending) = self.pending.take() {
            pending.free();
        }
        self.state = TcpState::Closed;
        self.retry_count = 0;
        self.ack_pending = false;
        self.publish();
    }

    fn notify_app(&self, kind: u8) {
        if let Some(msg) = self.pool.alloc() {
            msg.write1(kind);
            self.router.send_up(self.app_taskid, msg);
        }
    }

    /// Shared ESTABLISHED/FIN_WAIT data+ACK handling: strict in-order
    /// acceptance (`seq == rcv.nxt`, no out-of-order buffering), ACK
    /// processing against the held retransmit buffer, and delayed-ACK
    /// scheduling for piggybacking.
    fn handle_data_and_ack(&mut self, seq_nbr: u32, ack_nbr: u32, flags: u8, window: u16, msg: &Message) {
        self.snd_wnd = window;

        if flags & tcp_flag::ACK != 0 {
            if let Some(pending) = &self.pending {
                let unacked_len = pending.as_slice().len() as u32;
                if ack_nbr.wrapping_sub(self.pending_seq) >= unacked_len && ack_nbr != self.pending_seq {
                    self.snd_una = ack_nbr;
                    self.wheel.stop(self.retry());
                    self.retry_count = 0;
                    if let Some(pending) = self.pending.take() {
                        pending.free();
                    }
                }
            } else if ack_nbr == self.snd_nxt {
                self.snd_una = ack_nbr;
            }
        }

        if seq_nbr == self.rcv_nxt && !msg.is_empty() {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(msg.len() as u32);
            let kind = if flags & tcp_flag::PSH != 0 { app_msg::DATA_PUSH } else { app_msg::DATA };
            if let Some(up) = self.pool.alloc() {
                for &b in msg.as_slice() {
                    up.write1(b);
                }
                up.push1(kind);
                self.router.send_up(self.app_taskid, up);
            }
            self.ack_pending = true;
            self.wheel.start_ticks(self.delayed_ack(), tcp_timer::DELAYED_ACK_TICKS);
        }
    }
}

/// `'static` storage for a [`Socket`] that two independent parts of the
/// system need a view into at once: the scheduler's exclusive
/// [`TaskHandlers`] and the TCP demux task's shared [`SocketLookup`] scan
/// over every socket's current binding. Plain
/// `&'static mut`/`&'static` can't both point at one object, so this
/// wraps it the same way [`SchedulerCell`](crate::scheduler::SchedulerCell)
/// wraps the scheduler itself, under the same invariant: one logical
/// thread of execution, ever.
pub struct SocketCell<const N: usize> {
    inner: core::cell::UnsafeCell<Socket<N>>,
}

unsafe impl<const N: usize> Sync for SocketCell<N> {}

impl<const N: usize> SocketCell<N> {
    pub const fn new(
        pool: &'static Pool<N>,
        router: &'static dyn Router,
        wheel: &'static dyn Timers,
        listen_cb: &'static dyn ListenCallback,
        tcp_taskid: u8,
        app_taskid: u8,
    ) -> Self {
        SocketCell {
            inner: core::cell::UnsafeCell::new(Socket::new(pool, router, wheel, listen_cb, tcp_taskid, app_taskid)),
        }
    }

    /// Wiring-time setup, forwarding to [`Socket::init`].
    pub fn init(&self, socket_taskid: u8) {
        unsafe { (*self.inner.get()).init(socket_taskid) }
    }

    /// Hand the scheduler exclusive access for task-table registration.
    pub fn as_task_handlers(&'static self) -> &'static mut dyn TaskHandlers {
        unsafe { &mut *self.inner.get() }
    }
}

impl<const N: usize> SocketLookup for SocketCell<N> {
    fn binding(&self) -> Option<Binding> {
        unsafe { (*self.inner.get()).binding() }
    }
}

impl<const N: usize> SocketLookup for Socket<N> {
    fn binding(&self) -> Option<Binding> {
        match self.state {
            TcpState::Closed => None,
            TcpState::Listen => Some(Binding {
                loc_port: self.loc_port,
                rem_port: 0,
                rem_ipaddr: Ipv4Addr::ZERO,
                listening: true,
            }),
            _ => Some(Binding {
                loc_port: self.loc_port,
                rem_port: self.rem_port,
                rem_ipaddr: self.rem_ipaddr,
                listening: false,
            }),
        }
    }
}

impl<const N: usize> TaskHandlers for Socket<N> {
    /// From the application: `[msg_type,1][payload]`.
    fn down(&mut self, msg: Message) {
        let kind = msg.pop1();
        match kind {
            app_msg::OPEN_PASSIVE => {
                self.loc_port = msg.pop2();
                self.state = TcpState::Listen;
                self.publish();
                msg.free();
            }
            app_msg::OPEN_ACTIVE => {
                self.loc_port = msg.pop2();
                self.rem_port = msg.pop2();
                self.rem_ipaddr = Ipv4Addr::from_u32(msg.pop4());
                self.snd_nxt = 0;
                self.snd_una = 0;
                self.emit(tcp_flag::SYN, self.snd_nxt, self.rcv_nxt, None);
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                self.state = TcpState::SynSent;
                self.wheel.start_seconds(self.retry(), tcp_timer::RETRY_SECONDS);
                self.publish();
                msg.free();
            }
            app_msg::DATA | app_msg::DATA_PUSH => {
                if self.state == TcpState::Established && self.pending.is_none() {
                    let len = msg.len();
                    let flags = tcp_flag::ACK | if kind == app_msg::DATA_PUSH { tcp_flag::PSH } else { 0 };
                    self.emit(flags, self.snd_nxt, self.rcv_nxt, Some(msg.as_slice()));
                    self.pending_seq = self.snd_nxt;
                    self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
                    self.retry_count = 0;
                    self.wheel.start_seconds(self.retry(), tcp_timer::RETRY_SECONDS);
                    self.pending = Some(msg);
                    return;
                }
                msg.free();
            }
            app_msg::CLOSE => {
                match self.state {
                    TcpState::Established => {
                        self.emit(tcp_flag::FIN | tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                        self.snd_nxt = self.snd_nxt.wrapping_add(1);
                        self.state = TcpState::FinWait1;
                        self.publish();
                    }
                    TcpState::CloseWait => {
                        self.emit(tcp_flag::FIN | tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                        self.snd_nxt = self.snd_nxt.wrapping_add(1);
                        self.state = TcpState::LastAck;
                        self.publish();
                    }
                    _ => self.abort(),
                }
                msg.free();
            }
            app_msg::ABORT => {
                self.emit(tcp_flag::RST, self.snd_nxt, self.rcv_nxt, None);
                self.abort();
                msg.free();
            }
            _ => msg.free(),
        }
    }

    /// From the TCP demux task: `[rem_ipaddr,4][rem_port,2][seq,4][ack,4]
    /// [code_bits (hlen packed),2][window,2][payload]`.
    fn up(&mut self, msg: Message) {
        let rem_ipaddr = Ipv4Addr::from_u32(msg.pop4());
        let rem_port = msg.pop2();
        let seq_nbr = msg.pop4();
        let ack_nbr = msg.pop4();
        let hlen_code_bits = msg.pop2();
        let window = msg.pop2();
        let flags = (hlen_code_bits & 0x3F) as u8;

        if flags & tcp_flag::RST != 0 {
            self.notify_app(app_msg::CLOSE);
            self.abort();
            msg.free();
            return;
        }

        match self.state {
            TcpState::Listen => {
                if flags & tcp_flag::SYN != 0
                    && flags & tcp_flag::ACK == 0
                    && self.listen_cb.on_listen(self.loc_port, self.loc_port)
                {
                    self.rem_port = rem_port;
                    self.rem_ipaddr = rem_ipaddr;
                    self.rcv_nxt = seq_nbr.wrapping_add(1);
                    self.snd_wnd = window;
                    self.emit(tcp_flag::SYN | tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.state = TcpState::SynReceived;
                    self.wheel.start_seconds(self.retry(), tcp_timer::RETRY_SECONDS);
                    self.publish();
                }
            }
            TcpState::SynSent => {
                if flags & tcp_flag::SYN != 0 {
                    self.rcv_nxt = seq_nbr.wrapping_add(1);
                    self.snd_wnd = window;
                    if flags & tcp_flag::ACK != 0 && ack_nbr == self.snd_nxt {
                        self.snd_una = ack_nbr;
                        self.wheel.stop(self.retry());
                        self.emit(tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                        self.state = TcpState::Established;
                    } else {
                        self.emit(tcp_flag::SYN | tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                        self.snd_nxt = self.snd_nxt.wrapping_add(1);
                        self.state = TcpState::SynReceived;
                    }
                    self.publish();
                }
            }
            TcpState::SynReceived => {
                if flags & tcp_flag::ACK != 0 && ack_nbr == self.snd_nxt {
                    self.snd_una = ack_nbr;
                    self.wheel.stop(self.retry());
                    self.state = TcpState::Established;
                    self.publish();
                }
            }
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                self.handle_data_and_ack(seq_nbr, ack_nbr, flags, window, &msg);
                if flags & tcp_flag::FIN != 0 {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.emit(tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                    match self.state {
                        TcpState::Established => {
                            self.notify_app(app_msg::CLOSE);
                            self.state = TcpState::CloseWait;
                        }
                        TcpState::FinWait1 => self.state = TcpState::Closing,
                        TcpState::FinWait2 => {
                            self.wheel.reset(self.retry(), tcp_timer::TIME_WAIT);
                            self.wheel.start_seconds(self.retry(), tcp_timer::TIME_WAIT_SECONDS);
                            self.state = TcpState::TimeWait;
                        }
                        _ => {}
                    }
                    self.publish();
                } else if self.state == TcpState::FinWait1 && flags & tcp_flag::ACK != 0 && ack_nbr == self.snd_nxt {
                    self.state = TcpState::FinWait2;
                    self.publish();
                }
            }
            TcpState::Closing => {
                if flags & tcp_flag::ACK != 0 && ack_nbr == self.snd_nxt {
                    self.wheel.reset(self.retry(), tcp_timer::TIME_WAIT);
                    self.wheel.start_seconds(self.retry(), tcp_timer::TIME_WAIT_SECONDS);
                    self.state = TcpState::TimeWait;
                    self.publish();
                }
            }
            TcpState::LastAck => {
                if flags & tcp_flag::ACK != 0 && ack_nbr == self.snd_nxt {
                    self.abort();
                }
            }
            TcpState::CloseWait | TcpState::TimeWait | TcpState::Closed => {}
        }

        msg.free();
    }

    /// Retry, delayed-ACK, and TIME_WAIT all share this socket's two timer
    /// handles, told apart by the owner-local id stamped at `reset` time.
    fn timeout(&mut self, local_id: u8) {
        match local_id {
            tcp_timer::RETRY => {
                if self.pending.is_some() {
                    if self.retry_count >= tcp_timer::RETRY_LIMIT {
                        self.notify_app(app_msg::CLOSE);
                        self.abort();
                    } else {
                        self.retry_count += 1;
                        // `pending` is retained only for its raw bytes;
                        // `emit` reads them straight off the held message
                        // before allocating its own fresh one from the pool.
                        let slice = self.pending.as_ref().unwrap().as_slice();
                        self.emit(tcp_flag::ACK | tcp_flag::PSH, self.pending_seq, self.rcv_nxt, Some(slice));
                        self.wheel.start_seconds(self.retry(), tcp_timer::RETRY_SECONDS);
                    }
                }
            }
            tcp_timer::DELAYED_ACK => {
                if self.ack_pending {
                    self.ack_pending = false;
                    self.emit(tcp_flag::ACK, self.snd_nxt, self.rcv_nxt, None);
                }
            }
            tcp_timer::TIME_WAIT => {
                self.abort();
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerWheelCell;
    use core::cell::Cell;

    struct Sink {
        last_down: Cell<Option<(u8, u16)>>,
        last_up: Cell<Option<u8>>,
        published: Cell<Option<Published>>,
    }
    unsafe impl Sync for Sink {}
    impl Router for Sink {
        fn send_down(&self, taskid: u8, msg: Message) {
            self.last_down.set(Some((taskid, msg.len())));
            msg.free();
        }
        fn send_up(&self, taskid: u8, msg: Message) {
            self.last_up.set(Some(msg.read1(0)));
            let _ = taskid;
            msg.free();
        }
        fn set_published(&self, state: Published) {
            self.published.set(Some(state));
        }
        fn published(&self, _taskid: u8) -> Published {
            self.published.get().unwrap_or_default()
        }
    }

    macro_rules! test_socket {
        ($name:ident) => {
            static $name: (Pool<4>, TimerWheelCell<2>, Sink, AlwaysAccept) = (
                Pool::new(80, 20),
                TimerWheelCell::new(),
                Sink { last_down: Cell::new(None), last_up: Cell::new(None), published: Cell::new(None) },
                AlwaysAccept,
            );
        };
    }

    #[test]
    fn active_open_sends_syn_and_enters_syn_sent() {
        test_socket!(FIXTURE);
        let (pool, wheel, router, cb) = &FIXTURE;
        pool.init();
        let mut sock: Socket<4> = Socket::new(pool, router, wheel, cb, 9, 1);
        sock.init(5);

        let open = pool.alloc().unwrap();
        open.write1(app_msg::OPEN_ACTIVE);
        open.write2(1234);
        open.write2(80);
        open.write4(Ipv4Addr::new(10, 0, 0, 2).to_u32());
        sock.down(open);

        assert_eq!(sock.state(), TcpState::SynSent);
        assert_eq!(router.last_down.get().map(|(t, _)| t), Some(9));
    }

    #[test]
    fn passive_open_accepts_syn_and_replies_syn_ack() {
        test_socket!(FIXTURE);
        let (pool, wheel, router, cb) = &FIXTURE;
        pool.init();
        let mut sock: Socket<4> = Socket::new(pool, router, wheel, cb, 9, 1);
        sock.init(5);

        let listen = pool.alloc().unwrap();
        listen.write1(app_msg::OPEN_PASSIVE);
        listen.write2(80);
        sock.down(listen);
        assert_eq!(sock.state(), TcpState::Listen);

        let syn = pool.alloc().unwrap();
        syn.push2(0); // window
        syn.push2((5u16 << 12) | (tcp_flag::SYN as u16));
        syn.push4(0); // ack
        syn.push4(100); // seq
        syn.push2(1234); // rem_port
        syn.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32()); // rem_ipaddr
        sock.up(syn);

        assert_eq!(sock.state(), TcpState::SynReceived);
        assert_eq!(router.last_down.get().map(|(t, _)| t), Some(9));
    }
}
