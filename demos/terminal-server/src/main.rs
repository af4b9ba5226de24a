//! Terminal server reference integration.
//!
//! Wires the whole stack (Ethernet → ARP → IP → ICMP/TCP → two listening
//! sockets) plus two terminal-server application tasks that bridge a TCP
//! connection to a UART, via a static task table. Task ids run
//! `TASKID_TCPAPP1`..`TASKID_TCP`; `TASKID_TCPSOCK1`'s pool is shared
//! with ICMP and TCP.
//!
//! There's no real eZ80F91 board behind this binary — [`uart::Uart`] and
//! `NullMac`/`DemoClock` below stand in for the hardware collaborators a
//! real board support package would supply. This binary exists to show
//! the static task-table wiring and the `run()` loop, not to be flashed
//! anywhere.

#![no_std]
#![no_main]

mod uart;

use core::cell::Cell;
use core::panic::PanicInfo;

use bmz_net::clock::Clock;
use bmz_net::message::Message;
use bmz_net::net::arp::Arp;
use bmz_net::net::ethernet::{Ethernet, MacDriver};
use bmz_net::net::icmp::Icmp;
use bmz_net::net::ip::Ip;
use bmz_net::net::tcp::socket::{app_msg, ListenCallback, SocketCell};
use bmz_net::net::tcp::{SocketLookup, Tcp};
use bmz_net::net::types::{Config, Ipv4Addr, MacAddr};
use bmz_net::pool::Pool;
use bmz_net::queue::Queue;
use bmz_net::scheduler::{Published, Router, SchedulerCell, TaskHandlers};
use bmz_net::timer::TimerWheelCell;
use uart::Uart;

// Task ids. Order is otherwise insignificant here — the scheduler indexes
// by taskid directly, and only TCPSOCK1/2's down queues are ever
// deferred to a later pass.
const TASKID_TCPAPP1: u8 = 1;
const TASKID_TCPAPP2: u8 = 2;
const TASKID_TCPSOCK1: u8 = 3;
const TASKID_TCPSOCK2: u8 = 4;
const TASKID_ETHER: u8 = 5;
const TASKID_ARP: u8 = 6;
const TASKID_IP: u8 = 7;
const TASKID_ICMP: u8 = 8;
const TASKID_TCP: u8 = 9;
const TASK_TABLE_NBR: usize = 10;

const DEFAULT_POOL_LEN: u16 = 500;
const DEFAULT_POOL_OFFSET: u16 = 54;
const DEFAULT_MQ_DEPTH: usize = 8;

const PORT1_LISTEN: u16 = 23;
const PORT2_LISTEN: u16 = 23;

/// The terminal-server application task: bridges a TCP connection to a
/// UART. Nothing ever sends this task a message down, so
/// [`down`](TaskHandlers::down) is unreachable in practice.
pub struct Terminal<const N: usize> {
    pool: &'static Pool<N>,
    router: &'static dyn Router,
    uart: &'static Uart,
    tcpsock_taskid: u8,
    loc_port: u16,
}

impl<const N: usize> Terminal<N> {
    pub const fn new(pool: &'static Pool<N>, router: &'static dyn Router, uart: &'static Uart, tcpsock_taskid: u8, loc_port: u16) -> Self {
        Terminal { pool, router, uart, tcpsock_taskid, loc_port }
    }
}

impl<const N: usize> TaskHandlers for Terminal<N> {
    fn down(&mut self, msg: Message) {
        msg.free();
    }

    /// Message in (from TCPSOCK): `[msg_type,1][payload]`.
    fn up(&mut self, msg: Message) {
        let kind = msg.pop1();
        if kind == app_msg::DATA || kind == app_msg::DATA_PUSH {
            for &b in msg.as_slice() {
                self.uart.write(b);
            }
        }
        msg.free();
    }

    /// Open passively once the socket is idle, or drain whatever the
    /// UART has buffered once a connection is established.
    fn idle(&mut self) {
        match self.router.published(self.tcpsock_taskid) {
            Published::Idle => {
                if let Some(msg) = self.pool.alloc() {
                    msg.write2(self.loc_port);
                    msg.push1(app_msg::OPEN_PASSIVE);
                    self.router.send_down(self.tcpsock_taskid, msg);
                }
            }
            Published::Active => {
                if self.uart.read_test() {
                    if let Some(msg) = self.pool.alloc() {
                        while msg.room() >= 1 && self.uart.read_test() {
                            msg.write1(self.uart.read());
                        }
                        msg.push1(app_msg::DATA_PUSH);
                        self.router.send_down(self.tcpsock_taskid, msg);
                    }
                }
            }
            Published::Other => {}
        }
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

/// A single fixed baud rate per UART, set whenever its listening socket
/// accepts a connection. A scheme that maps distinct port ranges to
/// distinct baud rates would need a socket to answer for a whole range
/// and tell ports apart from the segment itself, which this stack's
/// socket selection doesn't model — it binds one socket to exactly one
/// `loc_port`. One fixed baud per listening socket is the simple version
/// of that idea.
struct FixedBaud {
    uart: &'static Uart,
    baud: u32,
}
impl ListenCallback for FixedBaud {
    fn on_listen(&self, _listen_port: u16, _loc_port: u16) -> bool {
        self.uart.init(self.baud);
        true
    }
}

/// No physical link to bring up — always reports success, the way a
/// loopback/virtual MAC would for this demo.
struct NullMac;
impl MacDriver for NullMac {
    fn poll_rx(&self) -> Option<Message> {
        None
    }
    fn transmit(&self, _frame: &[u8]) {}
    fn link_up(&self) -> bool {
        true
    }
    fn try_link_up(&self) -> bool {
        true
    }
}

/// Free-running tick source stand-in for a real hardware counter.
struct DemoClock {
    ticks: Cell<u32>,
}
unsafe impl Sync for DemoClock {}
impl Clock for DemoClock {
    fn ticks(&self) -> u32 {
        self.ticks.get()
    }
    fn hi_res_ticks(&self) -> u32 {
        self.ticks.get()
    }
}
impl DemoClock {
    fn tick(&self) {
        self.ticks.set(self.ticks.get().wrapping_add(1));
    }
}

static CONFIG: Config = Config::new(
    Ipv4Addr::new(192, 168, 2, 42),
    Ipv4Addr::new(255, 255, 255, 0),
    Ipv4Addr::new(192, 168, 2, 9),
    MacAddr::new([0xaa, 0xaa, 0x12, 0x34, 0x56, 0x78]),
);

static CLOCK: DemoClock = DemoClock { ticks: Cell::new(0) };
static MAC: NullMac = NullMac;
static UART0: Uart = Uart::new();
static UART1: Uart = Uart::new();
static BAUD1: FixedBaud = FixedBaud { uart: &UART0, baud: 9600 };
static BAUD2: FixedBaud = FixedBaud { uart: &UART1, baud: 9600 };

static SCHEDULER: SchedulerCell<TASK_TABLE_NBR> = SchedulerCell::new();
static TIMERS: TimerWheelCell<16> = TimerWheelCell::new();

// TCPSOCK1's pool, shared with ICMP and TCP.
static SOCK1_POOL: Pool<4> = Pool::new(DEFAULT_POOL_LEN, DEFAULT_POOL_OFFSET);
// TCPAPP1's pool, shared with TCPAPP2 (depth 12, len 40, offset 1).
static APP_POOL: Pool<12> = Pool::new(40, 1);
// ARP's own cache-reply pool (`ETH_MINFRAME`/`ETH_OFFSET`).
static ARP_POOL: Pool<4> = Pool::new(bmz_net::net::arp::POOL_SIZE, bmz_net::net::arp::POOL_OFFSET);

static SOCK1_DOWN_Q: Queue<{ 2 * DEFAULT_MQ_DEPTH }> = Queue::new();
static SOCK2_DOWN_Q: Queue<20> = Queue::new();

static SOCKET1: SocketCell<4> = SocketCell::new(&SOCK1_POOL, &SCHEDULER, &TIMERS, &BAUD1, TASKID_TCP, TASKID_TCPAPP1);
static SOCKET2: SocketCell<4> = SocketCell::new(&SOCK1_POOL, &SCHEDULER, &TIMERS, &BAUD2, TASKID_TCP, TASKID_TCPAPP2);

static SOCKETS: [(u8, &dyn SocketLookup); 2] = [(TASKID_TCPSOCK1, &SOCKET1), (TASKID_TCPSOCK2, &SOCKET2)];

// These task instances are each owned exclusively by the scheduler's task
// table once registered (`&'static mut dyn TaskHandlers`); `static mut`
// plus `addr_of_mut!` is the same pattern `scheduler::tests` uses to get
// there without ever materializing a second, aliasing reference.
static mut TCP_TASK: Tcp<4> = Tcp::new(&SOCK1_POOL, &SCHEDULER, &CONFIG, TASKID_IP, &SOCKETS);
static mut ICMP_TASK: Icmp<4> = Icmp::new(&SOCK1_POOL, &SCHEDULER, TASKID_IP);
static mut IP_TASK: Ip = Ip::new(&SCHEDULER, &CLOCK, &CONFIG, TASKID_ARP, TASKID_TCP, TASKID_ICMP);
static mut ARP_TASK: Arp = Arp::new(&ARP_POOL, &TIMERS, &SCHEDULER, &CONFIG, TASKID_ETHER);
static mut ETHER_TASK: Ethernet = Ethernet::new(&MAC, &SCHEDULER, &TIMERS, TASKID_ARP, TASKID_IP);
static mut TERMINAL1: Terminal<12> = Terminal::new(&APP_POOL, &SCHEDULER, &UART0, TASKID_TCPSOCK1, PORT1_LISTEN);
static mut TERMINAL2: Terminal<12> = Terminal::new(&APP_POOL, &SCHEDULER, &UART1, TASKID_TCPSOCK2, PORT2_LISTEN);

/// One-time wiring of every task and pool, then the run loop: a
/// scheduler pass per tick, the timer wheel advanced and dispatched
/// against the very same scheduler.
fn run() -> ! {
    SOCK1_POOL.init();
    APP_POOL.init();
    ARP_POOL.init();

    SOCKET1.init(TASKID_TCPSOCK1);
    SOCKET2.init(TASKID_TCPSOCK2);

    SCHEDULER.with(|s| {
        // SAFETY: registered once, before `run_once` is ever called — no
        // other code holds a reference to these `static mut`s yet.
        unsafe {
            let ether = &mut *core::ptr::addr_of_mut!(ETHER_TASK);
            ether.init(TASKID_ETHER);
            s.register(TASKID_ETHER, ether, None, None);

            let arp = &mut *core::ptr::addr_of_mut!(ARP_TASK);
            arp.init(TASKID_ARP);
            s.register(TASKID_ARP, arp, None, None);

            let ip = &mut *core::ptr::addr_of_mut!(IP_TASK);
            s.register(TASKID_IP, ip, None, None);

            let icmp = &mut *core::ptr::addr_of_mut!(ICMP_TASK);
            icmp.init();
            s.register(TASKID_ICMP, icmp, None, None);

            let tcp = &mut *core::ptr::addr_of_mut!(TCP_TASK);
            tcp.init();
            s.register(TASKID_TCP, tcp, None, None);

            let down1 = &mut *core::ptr::addr_of_mut!(SOCK1_DOWN_Q);
            s.register(TASKID_TCPSOCK1, SOCKET1.as_task_handlers(), Some(down1), None);

            let down2 = &mut *core::ptr::addr_of_mut!(SOCK2_DOWN_Q);
            s.register(TASKID_TCPSOCK2, SOCKET2.as_task_handlers(), Some(down2), None);

            let term1 = &mut *core::ptr::addr_of_mut!(TERMINAL1);
            s.register(TASKID_TCPAPP1, term1, None, None);

            let term2 = &mut *core::ptr::addr_of_mut!(TERMINAL2);
            s.register(TASKID_TCPAPP2, term2, None, None);
        }
    });

    loop {
        SCHEDULER.with(|s| s.run_once());
        CLOCK.tick();
        TIMERS.with(|w| {
            w.run(1, |taskid, local_id| {
                SCHEDULER.with(|s| s.timeout(taskid, local_id));
            })
        });
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    run()
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}
