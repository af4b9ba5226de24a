//! Ethernet demux task.
//!
//! EMAC register/PHY bring-up is hardware-specific and handled by an
//! external collaborator; this module covers everything else: a TX
//! pad-and-copy step and an RX poll-and-demux loop. [`MacDriver`] is the
//! seam: `poll_rx`/`transmit`/`link_up`/`try_link_up` stand in for the
//! EMAC ring and PHY a chip-specific driver would drive directly.
//! Everything on this side of the seam — padding short frames,
//! demultiplexing by ethertype, retrying link establishment on a timer —
//! is ordinary, portable logic and lives here.

use crate::message::Message;
use crate::scheduler::{Published, Router, TaskHandlers};
use crate::timer::{TimerHandle, Timers};

use super::frame_type;
use super::types::{ETHADDR_LEN, ETH_MINFRAME};

/// The external MAC/PHY collaborator. Implemented by the chip-specific
/// driver; this crate only calls through it.
pub trait MacDriver {
    /// Pull the next received frame off the ring, if one is ready, already
    /// spliced into a [`Message`] by the zero-copy RX path.
    fn poll_rx(&self) -> Option<Message>;
    /// Transmit one complete, already-padded frame.
    fn transmit(&self, frame: &[u8]);
    /// Whether the physical link is currently established.
    fn link_up(&self) -> bool;
    /// (Re)attempt to bring the link up; returns whether it succeeded.
    fn try_link_up(&self) -> bool;
}

const LINK_RETRY_SECONDS: u16 = 10;

/// The Ethernet task: pads and transmits on the way down, polls and
/// demultiplexes by ethertype on the way up, retries link establishment on
/// a timer.
pub struct Ethernet {
    mac: &'static dyn MacDriver,
    router: &'static dyn Router,
    wheel: &'static dyn Timers,
    timer: Option<TimerHandle>,
    arp_taskid: u8,
    ip_taskid: u8,
}

impl Ethernet {
    pub const fn new(
        mac: &'static dyn MacDriver,
        router: &'static dyn Router,
        wheel: &'static dyn Timers,
        arp_taskid: u8,
        ip_taskid: u8,
    ) -> Self {
        Ethernet {
            mac,
            router,
            wheel,
            timer: None,
            arp_taskid,
            ip_taskid,
        }
    }

    /// Wiring-time setup: try to bring the link up once; if it fails, arm
    /// the retry timer instead of publishing active.
    pub fn init(&mut self, ethernet_taskid: u8) {
        let handle = self.wheel.alloc(ethernet_taskid);
        self.wheel.reset(handle, 0);
        self.timer = Some(handle);

        if self.mac.try_link_up() {
            self.router.set_published(Published::Active);
        } else {
            self.wheel.start_seconds(handle, LINK_RETRY_SECONDS);
            self.router.set_published(Published::Other);
        }
    }

    fn demux(&self, msg: Message) {
        msg.pop_n(ETHADDR_LEN as u16 * 2); // dst + src MAC addresses
        let ethertype = msg.pop2();
        if ethertype == frame_type::IP {
            self.router.send_up(self.ip_taskid, msg);
        } else if ethertype == frame_type::ARP {
            self.router.send_up(self.arp_taskid, msg);
        } else {
            msg.free();
        }
    }
}

impl TaskHandlers for Ethernet {
    /// Message in: a complete frame with Ethernet header already pushed on
    /// (dst, src, ethertype), ready for the wire.
    fn down(&mut self, msg: Message) {
        let short = ETH_MINFRAME as u16;
        if msg.len() < short {
            for _ in msg.len()..short {
                msg.write1(0);
            }
        }
        self.mac.transmit(msg.as_slice());
        msg.free();
    }

    fn up(&mut self, msg: Message) {
        // Ethernet has no up path of its own — frames arrive via `idle`'s
        // poll loop, not by another task forwarding them here. Free
        // defensively rather than leak the slot if ever misrouted here.
        msg.free();
    }

    /// Drain every frame currently queued on the ring and demux it.
    fn idle(&mut self) {
        while let Some(msg) = self.mac.poll_rx() {
            self.demux(msg);
        }
    }

    /// Retry link establishment.
    fn timeout(&mut self, _local_id: u8) {
        if self.mac.try_link_up() {
            self.router.set_published(Published::Active);
        } else {
            self.wheel.start_seconds(self.timer.expect("init not called"), LINK_RETRY_SECONDS);
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
    use crate::pool::Pool;
    use crate::timer::TimerWheelCell;
    use core::cell::{Cell, RefCell};

    struct Sink {
        last_up: Cell<Option<(u8, u16)>>,
        last_published: Cell<Option<Published>>,
    }
    unsafe impl Sync for Sink {}
    impl Router for Sink {
        fn send_down(&self, _taskid: u8, msg: Message) {
            msg.free();
        }
        fn send_up(&self, taskid: u8, msg: Message) {
            self.last_up.set(Some((taskid, msg.len())));
            msg.free();
        }
        fn set_published(&self, state: Published) {
            self.last_published.set(Some(state));
        }
        fn published(&self, _taskid: u8) -> Published {
            self.last_published.get().unwrap_or_default()
        }
    }

    struct FakeMac {
        rx: RefCell<Option<Message>>,
        tx_len: Cell<Option<usize>>,
        link: Cell<bool>,
    }
    unsafe impl Sync for FakeMac {}
    impl MacDriver for FakeMac {
        fn poll_rx(&self) -> Option<Message> {
            self.rx.borrow_mut().take()
        }
        fn transmit(&self, frame: &[u8]) {
            self.tx_len.set(Some(frame.len()));
        }
        fn link_up(&self) -> bool {
            self.link.get()
        }
        fn try_link_up(&self) -> bool {
            self.link.set(true);
            true
        }
    }

    static POOL: Pool<2> = Pool::new(64, 14);
    static WHEEL: TimerWheelCell<2> = TimerWheelCell::new();

    #[test]
    fn short_frame_is_padded_before_transmit() {
        POOL.init();
        static MAC: FakeMac = FakeMac { rx: RefCell::new(None), tx_len: Cell::new(None), link: Cell::new(false) };
        static ROUTER: Sink = Sink { last_up: Cell::new(None), last_published: Cell::new(None) };
        let mut eth = Ethernet::new(&MAC, &ROUTER, &WHEEL, 2, 3);
        eth.init(1);

        let m = POOL.alloc().unwrap();
        m.write1(0xAA);
        eth.down(m);
        assert_eq!(MAC.tx_len.get(), Some(ETH_MINFRAME));
        assert_eq!(ROUTER.last_published.get(), Some(Published::Active));
    }

    #[test]
    fn idle_demuxes_by_ethertype() {
        POOL.init();
        static MAC: FakeMac = FakeMac { rx: RefCell::new(None), tx_len: Cell::new(None), link: Cell::new(false) };
        static ROUTER: Sink = Sink { last_up: Cell::new(None), last_published: Cell::new(None) };

        let m = POOL.alloc().unwrap();
        m.write6(&[0xAA; 6]); // dst MAC
        m.write6(&[0xBB; 6]); // src MAC
        m.write2(frame_type::ARP);
        m.write1(7);
        *MAC.rx.borrow_mut() = Some(m);

        let mut eth = Ethernet::new(&MAC, &ROUTER, &WHEEL, 2, 3);
        eth.init(1);
        eth.idle();

        assert_eq!(ROUTER.last_up.get().map(|(taskid, _)| taskid), Some(2));
    }
}
