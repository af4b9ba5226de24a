//! IPv4. No fragmentation, no options beyond skipping them, no
//! forwarding: this is a host stack, not a router.

use crate::clock::Clock;
use crate::message::Message;
use crate::scheduler::{Router, TaskHandlers};

use super::checksum;
use super::protocol;
use super::types::{Config, Ipv4Addr};

const VER_HLEN_TOS: u16 = 0x4500;
const STD_IP_HEADER_LEN: u16 = 20;
const TTL: u8 = 40;
const CHECKSUM_OFFSET: u16 = 10;
const NO_FRAGMENTATION_MASK: u16 = 0x3FFF; // allows the don't-fragment bit

/// The IP task: an ordinary struct registered with the scheduler, holding
/// what would otherwise be module-global state.
pub struct Ip {
    router: &'static dyn Router,
    clock: &'static dyn Clock,
    config: &'static Config,
    identification: u16,
    id_reset: bool,
    arp_taskid: u8,
    tcp_taskid: u8,
    icmp_taskid: u8,
}

impl Ip {
    pub const fn new(
        router: &'static dyn Router,
        clock: &'static dyn Clock,
        config: &'static Config,
        arp_taskid: u8,
        tcp_taskid: u8,
        icmp_taskid: u8,
    ) -> Self {
        Ip {
            router,
            clock,
            config,
            identification: 0,
            id_reset: true,
            arp_taskid,
            tcp_taskid,
            icmp_taskid,
        }
    }

    /// Next-hop address for `dst_ipaddr`: itself if on our subnet,
    /// otherwise the configured default gateway. Falls back to classful
    /// masking when `config.subnet_mask` is unset.
    fn route(&self, dst_ipaddr: Ipv4Addr) -> Ipv4Addr {
        let my_ipaddr = self.config.my_ipaddr;
        let mask = if self.config.subnet_mask != Ipv4Addr::ZERO {
            self.config.subnet_mask
        } else {
            classful_mask(my_ipaddr)
        };
        if my_ipaddr.same_subnet(dst_ipaddr, mask) {
            dst_ipaddr
        } else {
            self.config.default_route
        }
    }
}

fn classful_mask(addr: Ipv4Addr) -> Ipv4Addr {
    let v = addr.to_u32();
    if v & 0x8000_0000 == 0 {
        Ipv4Addr::from_u32(0xFF00_0000) // class A
    } else if v & 0xC000_0000 == 0x8000_0000 {
        Ipv4Addr::from_u32(0xFFFF_0000) // class B
    } else if v & 0xE000_0000 == 0xC000_0000 {
        Ipv4Addr::from_u32(0xFFFF_FF00) // class C
    } else {
        Ipv4Addr::from_u32(0xFFFF_FFFF)
    }
}

impl TaskHandlers for Ip {
    /// Message in: `[protocol,1][dst_ipaddr,4][payload]`.
    /// Message out (to ARP): `[next_hop_ipaddr,4][ip hdr][payload]`.
    fn down(&mut self, msg: Message) {
        let protocol = msg.pop1();
        let dst_ipaddr = Ipv4Addr::from_u32(msg.pop4());

        let total_len = msg.len() + STD_IP_HEADER_LEN;

        msg.push4(dst_ipaddr.to_u32());
        msg.push4(self.config.my_ipaddr.to_u32());
        msg.push2(0); // checksum, filled in below
        msg.push1(protocol);
        msg.push1(TTL);
        msg.push2(0); // no fragmentation
        if self.id_reset {
            self.id_reset = false;
            self.identification = self.clock.hi_res_ticks() as u16;
        }
        msg.push2(self.identification);
        self.identification = self.identification.wrapping_add(1);
        msg.push2(total_len);
        msg.push2(VER_HLEN_TOS);

        let checksum = checksum::calculate(&msg.as_slice()[..STD_IP_HEADER_LEN as usize]);
        msg.poke2(checksum, CHECKSUM_OFFSET);

        let next_hop = self.route(dst_ipaddr);
        msg.push4(next_hop.to_u32());

        self.router.send_down(self.arp_taskid, msg);
    }

    /// Message in (from Ethernet): `[ip hdr][payload]`.
    /// Message out (to TCP/ICMP): `[src_ipaddr,4][payload]`.
    fn up(&mut self, mut msg: Message) {
        let len = msg.len();
        let mut err = len < STD_IP_HEADER_LEN;
        let mut hlen = 0u16;

        if !err {
            let ver_hlen = msg.read1(0);
            if ver_hlen & 0xF0 != 0x40 {
                err = true;
            } else {
                hlen = ((ver_hlen & 0x0F) as u16) << 2;
                if hlen < STD_IP_HEADER_LEN || hlen > len {
                    err = true;
                }
            }
        }

        if !err {
            let existing = msg.read2(CHECKSUM_OFFSET);
            msg.poke2(0, CHECKSUM_OFFSET);
            let calculated = checksum::calculate(&msg.as_slice()[..hlen as usize]);
            msg.poke2(existing, CHECKSUM_OFFSET);
            err = !checksum::verify(calculated, existing);
        }

        if !err {
            msg.pop2(); // ver_hlen_tos
            let total_len = msg.pop2();
            msg.pop2(); // identification
            let fragmentation = msg.pop2();
            msg.pop1(); // ttl
            let protocol = msg.pop1();
            msg.pop2(); // checksum
            let src_ipaddr = Ipv4Addr::from_u32(msg.pop4());
            msg.pop4(); // dst, unused — we are the destination by construction

            if total_len > len || total_len < hlen {
                err = true;
            } else if total_len < len {
                msg.truncate(total_len - STD_IP_HEADER_LEN);
            }
            if fragmentation & NO_FRAGMENTATION_MASK != 0 {
                err = true;
            }

            if !err {
                msg.pop_n(hlen - STD_IP_HEADER_LEN); // options, unparsed
                msg.push4(src_ipaddr.to_u32());
                match protocol {
                    protocol::TCP => {
                        self.router.send_up(self.tcp_taskid, msg);
                        return;
                    }
                    protocol::ICMP => {
                        self.router.send_up(self.icmp_taskid, msg);
                        return;
                    }
                    _ => {}
                }
            }
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
    use crate::clock::test_double::TestClock;
    use crate::pool::Pool;
    use core::cell::Cell;

    const CONFIG: Config = Config::new(
        Ipv4Addr::new(192, 168, 1, 10),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(192, 168, 1, 1),
        crate::net::types::MacAddr::new([0, 1, 2, 3, 4, 5]),
    );

    struct Sink {
        last: Cell<Option<(u8, usize)>>,
    }
    unsafe impl Sync for Sink {}
    impl Router for Sink {
        fn send_down(&self, taskid: u8, msg: Message) {
            self.last.set(Some((taskid, msg.len() as usize)));
            msg.free();
        }
        fn send_up(&self, taskid: u8, msg: Message) {
            self.last.set(Some((taskid, msg.len() as usize)));
            msg.free();
        }
        fn set_published(&self, _state: crate::scheduler::Published) {}
        fn published(&self, _taskid: u8) -> crate::scheduler::Published {
            crate::scheduler::Published::default()
        }
    }

    // Each test gets its own pool/clock/router statics — a `Pool` shared
    // across tests would race under parallel test execution; the
    // single-logical-thread invariant only holds within one Ip instance,
    // not across independent tests.
    macro_rules! test_ip {
        ($name:ident) => {
            static $name: (Pool<4>, TestClock, Sink) = (Pool::new(200, 34), TestClock::new(), Sink { last: Cell::new(None) });
        };
    }

    #[test]
    fn same_subnet_routes_direct() {
        test_ip!(FIXTURE);
        let (_pool, clock, router) = &FIXTURE;
        let ip = Ip::new(router, clock, &CONFIG, 1, 2, 3);
        let dst = Ipv4Addr::new(192, 168, 1, 250);
        assert_eq!(ip.route(dst), dst);
    }

    #[test]
    fn off_subnet_routes_via_gateway() {
        test_ip!(FIXTURE);
        let (_pool, clock, router) = &FIXTURE;
        let ip = Ip::new(router, clock, &CONFIG, 1, 2, 3);
        let dst = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(ip.route(dst), CONFIG.default_route);
    }

    #[test]
    fn down_builds_header_with_valid_checksum_and_forwards_to_arp() {
        test_ip!(FIXTURE);
        let (pool, clock, router) = &FIXTURE;
        pool.init();
        let mut ip = Ip::new(router, clock, &CONFIG, 7, 2, 3);

        let m = pool.alloc().unwrap();
        m.push1(42); // payload
        m.push4(Ipv4Addr::new(192, 168, 1, 250).to_u32());
        m.push1(protocol::TCP);
        ip.down(m);

        assert_eq!(router.last.get().map(|(taskid, _)| taskid), Some(7));
    }

    #[test]
    fn up_rejects_bad_checksum() {
        test_ip!(FIXTURE);
        let (pool, clock, router) = &FIXTURE;
        pool.init();
        let mut ip = Ip::new(router, clock, &CONFIG, 1, 2, 3);

        let m = pool.alloc().unwrap();
        m.write2(VER_HLEN_TOS);
        m.write2(20);
        m.write2(0);
        m.write2(0);
        m.write1(TTL);
        m.write1(protocol::TCP);
        m.write2(0xDEAD); // bogus, nonzero checksum
        m.write4(Ipv4Addr::new(192, 168, 1, 250).to_u32());
        m.write4(CONFIG.my_ipaddr.to_u32());

        ip.up(m);
        assert_eq!(router.last.get(), None);
    }

    #[test]
    fn up_dispatches_by_protocol() {
        test_ip!(FIXTURE);
        let (pool, clock, router) = &FIXTURE;
        pool.init();
        let mut ip = Ip::new(router, clock, &CONFIG, 1, 9, 3);

        let m = pool.alloc().unwrap();
        m.write2(VER_HLEN_TOS);
        m.write2(20);
        m.write2(0);
        m.write2(0);
        m.write1(TTL);
        m.write1(protocol::TCP);
        m.write2(0);
        m.write4(Ipv4Addr::new(192, 168, 1, 250).to_u32());
        m.write4(CONFIG.my_ipaddr.to_u32());
        let existing = m.read2(CHECKSUM_OFFSET);
        m.poke2(0, CHECKSUM_OFFSET);
        let csum = checksum::calculate(m.as_slice());
        m.poke2(csum, CHECKSUM_OFFSET);
        let _ = existing;

        ip.up(m);
        assert_eq!(router.last.get().map(|(taskid, _)| taskid), Some(9));
    }
}
