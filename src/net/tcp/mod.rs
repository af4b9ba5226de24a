//! TCP segment encode/decode and demux.
//!
//! This task builds and validates the wire segment and routes it to
//! whichever per-connection socket task owns it; the per-connection
//! RFC 793 state machine itself lives in [`socket`].

pub mod socket;
pub mod timer;

use crate::message::Message;
use crate::pool::Pool;
use crate::scheduler::{Router, TaskHandlers};

use super::checksum;
use super::protocol;
use super::tcp_flag;
use super::types::{Config, Ipv4Addr};

const STD_TCP_HEADER_LEN: u16 = 20;
const CHECKSUM_OFFSET_IN_HEADER: u16 = 16;

/// What a socket currently has bound, for the demux task's selection scan.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Binding {
    pub loc_port: u16,
    pub rem_port: u16,
    pub rem_ipaddr: Ipv4Addr,
    pub listening: bool,
}

/// Queried by the demux task to route an inbound segment to its owning
/// socket.
pub trait SocketLookup {
    fn binding(&self) -> Option<Binding>;
}

/// Build the standard 20-byte TCP header plus its 12-byte pseudo-header,
/// checksum it, then strip the pseudo-header back off — shared by
/// `Tcp::down` and the RST path, since both build byte-identical segments.
fn encode_segment(
    msg: &Message,
    my_ipaddr: Ipv4Addr,
    dst_ipaddr: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_nbr: u32,
    ack_nbr: u32,
    code_bits: u16,
    window: u16,
) {
    let hlen_code_bits = ((STD_TCP_HEADER_LEN >> 2) << 12) | code_bits;

    msg.push2(0); // urgent pointer
    msg.push2(0); // checksum, filled in below
    msg.push2(window);
    msg.push2(hlen_code_bits);
    msg.push4(ack_nbr);
    msg.push4(seq_nbr);
    msg.push2(dst_port);
    msg.push2(src_port);

    let segment_len = msg.len();
    msg.push2(segment_len);
    msg.push1(protocol::TCP);
    msg.push1(0);
    msg.push4(dst_ipaddr.to_u32());
    msg.push4(my_ipaddr.to_u32());

    let checksum = checksum::calculate(msg.as_slice());
    msg.pop_n(12);
    msg.poke2(checksum, CHECKSUM_OFFSET_IN_HEADER);
}

/// The TCP demux/encode task. `sockets` is the fixed table of
/// `(taskid, lookup)` pairs scanned to select an owning socket — every
/// socket is an ordinary scheduler task, addressed by `taskid` the same
/// way ARP/IP address their neighbors.
pub struct Tcp<const N: usize> {
    pool: &'static Pool<N>,
    router: &'static dyn Router,
    config: &'static Config,
    ip_taskid: u8,
    sockets: &'static [(u8, &'static dyn SocketLookup)],
}

impl<const N: usize> Tcp<N> {
    pub const fn new(
        pool: &'static Pool<N>,
        router: &'static dyn Router,
        config: &'static Config,
        ip_taskid: u8,
        sockets: &'static [(u8, &'static dyn SocketLookup)],
    ) -> Self {
        Tcp { pool, router, config, ip_taskid, sockets }
    }

    pub fn init(&self) {
        self.pool.init();
    }

    /// Select the owning socket: an exact (non-listening) match wins
    /// outright; otherwise the first socket listening on `loc_port`.
    fn select(&self, loc_port: u16, rem_port: u16, rem_ipaddr: Ipv4Addr) -> Option<u8> {
        for &(taskid, lookup) in self.sockets {
            if let Some(b) = lookup.binding() {
                if !b.listening && b.loc_port == loc_port && b.rem_port == rem_port && b.rem_ipaddr == rem_ipaddr {
                    return Some(taskid);
                }
            }
        }
        for &(taskid, lookup) in self.sockets {
            if let Some(b) = lookup.binding() {
                if b.listening && b.loc_port == loc_port {
                    return Some(taskid);
                }
            }
        }
        None
    }

    /// RST for a SYN to an unbound port: `ack = seq+1`, `seq = 0`, ACK+RST
    /// set.
    fn send_rst(&self, rem_ipaddr: Ipv4Addr, loc_port: u16, rem_port: u16, seq_nbr: u32) {
        if let Some(msg) = self.pool.alloc() {
            let code_bits = (tcp_flag::ACK | tcp_flag::RST) as u16;
            encode_segment(&msg, self.config.my_ipaddr, rem_ipaddr, loc_port, rem_port, 0, seq_nbr.wrapping_add(1), code_bits, 0);
            msg.push4(rem_ipaddr.to_u32());
            msg.push1(protocol::TCP);
            self.router.send_down(self.ip_taskid, msg);
        }
    }
}

impl<const N: usize> TaskHandlers for Tcp<N> {
    /// Message in (from a socket task): `[dst_ipaddr,4][src_port,2]
    /// [dst_port,2][seq,4][ack,4][code_bits,2][window,2][user data]`.
    /// Message out (to IP): `[protocol,1][dst_ipaddr,4][tcp segment]`.
    fn down(&mut self, msg: Message) {
        let dst_ipaddr = Ipv4Addr::from_u32(msg.pop4());
        let src_port = msg.pop2();
        let dst_port = msg.pop2();
        let seq_nbr = msg.pop4();
        let ack_nbr = msg.pop4();
        let code_bits = msg.pop2();
        let window = msg.pop2();

        encode_segment(&msg, self.config.my_ipaddr, dst_ipaddr, src_port, dst_port, seq_nbr, ack_nbr, code_bits, window);

        msg.push4(dst_ipaddr.to_u32());
        msg.push1(protocol::TCP);
        self.router.send_down(self.ip_taskid, msg);
    }

    /// Message in (from IP): `[src_ipaddr,4][tcp segment]`.
    /// Message out (to the selected socket): `[rem_ipaddr,4][rem_port,2]
    /// [seq,4][ack,4][code_bits,2][window,2][payload]`.
    fn up(&mut self, msg: Message) {
        let rem_ipaddr = Ipv4Addr::from_u32(msg.pop4());
        let segment_len = msg.len();

        let mut err = segment_len < STD_TCP_HEADER_LEN;
        let mut hlen = 0u16;
        if !err {
            hlen = ((msg.read1(12) >> 4) as u16) << 2;
            if hlen < STD_TCP_HEADER_LEN || hlen > segment_len {
                err = true;
            }
        }

        if !err {
            msg.push2(segment_len);
            msg.push1(protocol::TCP);
            msg.push1(0);
            msg.push4(self.config.my_ipaddr.to_u32());
            msg.push4(rem_ipaddr.to_u32());

            let existing = msg.read2(12 + CHECKSUM_OFFSET_IN_HEADER);
            msg.poke2(0, 12 + CHECKSUM_OFFSET_IN_HEADER);
            let calculated = checksum::calculate(msg.as_slice());
            msg.poke2(existing, 12 + CHECKSUM_OFFSET_IN_HEADER);
            err = !checksum::verify(calculated, existing);

            msg.pop_n(12);
        }

        if !err {
            let rem_port = msg.pop2();
            let loc_port = msg.pop2();
            let seq_nbr = msg.pop4();
            let ack_nbr = msg.pop4();
            let hlen_code_bits = msg.pop2();
            let window = msg.pop2();
            msg.pop2(); // checksum
            msg.pop2(); // urgent ptr

            match self.select(loc_port, rem_port, rem_ipaddr) {
                Some(taskid) => {
                    msg.push2(window);
                    msg.push2(hlen_code_bits);
                    msg.push4(ack_nbr);
                    msg.push4(seq_nbr);
                    msg.push2(rem_port);
                    msg.push4(rem_ipaddr.to_u32());
                    self.router.send_up(taskid, msg);
                }
                None if hlen_code_bits & (tcp_flag::SYN as u16) != 0 => {
                    msg.free();
                    self.send_rst(rem_ipaddr, loc_port, rem_port, seq_nbr);
                }
                None => msg.free(),
            }
            return;
        }

        msg.free();
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
    use core::cell::Cell;

    struct Sink {
        last: Cell<Option<(u8, u16)>>,
    }
    unsafe impl Sync for Sink {}
    impl Router for Sink {
        fn send_down(&self, taskid: u8, msg: Message) {
            self.last.set(Some((taskid, msg.len())));
            msg.free();
        }
        fn send_up(&self, taskid: u8, msg: Message) {
            self.last.set(Some((taskid, msg.len())));
            msg.free();
        }
        fn set_published(&self, _state: crate::scheduler::Published) {}
        fn published(&self, _taskid: u8) -> crate::scheduler::Published {
            crate::scheduler::Published::default()
        }
    }

    struct FakeSocket(Binding);
    impl SocketLookup for FakeSocket {
        fn binding(&self) -> Option<Binding> {
            Some(self.0)
        }
    }

    const CONFIG: Config = Config::new(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(10, 0, 0, 254),
        crate::net::types::MacAddr::new([0, 1, 2, 3, 4, 5]),
    );

    static POOL: Pool<4> = Pool::new(200, 34);
    static LISTENER: FakeSocket =
        FakeSocket(Binding { loc_port: 23, rem_port: 0, rem_ipaddr: Ipv4Addr::ZERO, listening: true });
    static SOCKETS: [(u8, &'static dyn SocketLookup); 1] = [(7, &LISTENER)];

    #[test]
    fn down_builds_checksummed_segment_and_forwards_to_ip() {
        POOL.init();
        static ROUTER: Sink = Sink { last: Cell::new(None) };
        let mut tcp: Tcp<4> = Tcp::new(&POOL, &ROUTER, &CONFIG, 2, &SOCKETS);

        let m = POOL.alloc().unwrap();
        m.write1(0xAB); // user data
        m.push2(4096); // window
        m.push2(tcp_flag::SYN as u16); // code bits
        m.push4(0); // ack
        m.push4(0); // seq
        m.push2(23); // dst port
        m.push2(1025); // src port
        m.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32()); // dst ip

        tcp.down(m);
        assert_eq!(ROUTER.last.get().map(|(taskid, _)| taskid), Some(2));
    }

    #[test]
    fn up_syn_to_listening_port_dispatches_to_socket() {
        POOL.init();
        static ROUTER: Sink = Sink { last: Cell::new(None) };
        let mut tcp: Tcp<4> = Tcp::new(&POOL, &ROUTER, &CONFIG, 2, &SOCKETS);

        let seg = POOL.alloc().unwrap();
        seg.write2(1025); // src port
        seg.write2(23); // dst port
        seg.write4(100); // seq
        seg.write4(0); // ack
        seg.write2((5u16 << 12) | (tcp_flag::SYN as u16));
        seg.write2(4096); // window
        seg.write2(0); // checksum, filled below
        seg.write2(0); // urgent ptr

        seg.push2(seg.len());
        seg.push1(protocol::TCP);
        seg.push1(0);
        seg.push4(CONFIG.my_ipaddr.to_u32());
        seg.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32());
        let csum = checksum::calculate(seg.as_slice());
        seg.pop_n(12);
        seg.poke2(csum, CHECKSUM_OFFSET_IN_HEADER);
        seg.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32());

        tcp.up(seg);
        assert_eq!(ROUTER.last.get().map(|(taskid, _)| taskid), Some(7));
    }

    #[test]
    fn up_syn_to_unbound_port_sends_rst() {
        POOL.init();
        static ROUTER: Sink = Sink { last: Cell::new(None) };
        let mut tcp: Tcp<4> = Tcp::new(&POOL, &ROUTER, &CONFIG, 2, &SOCKETS);

        let seg = POOL.alloc().unwrap();
        seg.write2(1025);
        seg.write2(9999); // unbound dst port
        seg.write4(100);
        seg.write4(0);
        seg.write2((5u16 << 12) | (tcp_flag::SYN as u16));
        seg.write2(4096);
        seg.write2(0);
        seg.write2(0);

        seg.push2(seg.len());
        seg.push1(protocol::TCP);
        seg.push1(0);
        seg.push4(CONFIG.my_ipaddr.to_u32());
        seg.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32());
        let csum = checksum::calculate(seg.as_slice());
        seg.pop_n(12);
        seg.poke2(csum, CHECKSUM_OFFSET_IN_HEADER);
        seg.push4(Ipv4Addr::new(10, 0, 0, 2).to_u32());

        tcp.up(seg);
        assert_eq!(ROUTER.last.get().map(|(taskid, _)| taskid), Some(2)); // RST forwarded to IP
    }
}
