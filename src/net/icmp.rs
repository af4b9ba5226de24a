//! ICMP echo. Only echo request/reply; other ICMP message types are
//! silently discarded.

use crate::message::Message;
use crate::pool::Pool;
use crate::scheduler::{Router, TaskHandlers};

use super::checksum;
use super::protocol;

const TYPE_OFFSET: u16 = 0;
const CHECKSUM_OFFSET: u16 = 2;
const ECHO_REQUEST_TYPE: u8 = 8;
const ECHO_REQUEST_CODE: u8 = 0;
const ECHO_REPLY_TYPE: u8 = 0;

/// The ICMP task. `N` is the reply pool's depth — concurrent echo replies
/// in flight.
pub struct Icmp<const N: usize> {
    pool: &'static Pool<N>,
    router: &'static dyn Router,
    ip_taskid: u8,
}

impl<const N: usize> Icmp<N> {
    pub const fn new(pool: &'static Pool<N>, router: &'static dyn Router, ip_taskid: u8) -> Self {
        Icmp { pool, router, ip_taskid }
    }

    pub fn init(&self) {
        self.pool.init();
    }
}

impl<const N: usize> TaskHandlers for Icmp<N> {
    /// ICMP never originates traffic of its own; nothing sends it a
    /// message down.
    fn down(&mut self, msg: Message) {
        msg.free();
    }

    /// Message in: `[src_ipaddr,4][payload]`.
    /// Message out (to IP, only for an echo request): `[protocol,1]
    /// [dst_ipaddr,4][payload]`.
    fn up(&mut self, msg: Message) {
        let rem_ipaddr = msg.pop4();

        let existing = msg.read2(CHECKSUM_OFFSET);
        msg.poke2(0, CHECKSUM_OFFSET);
        let calculated = checksum::calculate(msg.as_slice());
        msg.poke2(existing, CHECKSUM_OFFSET);
        let err = !checksum::verify(calculated, existing);

        if !err {
            let kind = msg.read1(TYPE_OFFSET);
            let code = msg.read1(TYPE_OFFSET + 1);
            if kind == ECHO_REQUEST_TYPE && code == ECHO_REQUEST_CODE {
                if let Some(reply) = self.pool.alloc() {
                    let payload = msg.as_slice();
                    let n = core::cmp::min(payload.len(), reply.room() as usize);
                    for &b in &payload[..n] {
                        reply.write1(b);
                    }
                    reply.poke1(ECHO_REPLY_TYPE, TYPE_OFFSET);
                    reply.poke2(0, CHECKSUM_OFFSET);
                    let csum = checksum::calculate(reply.as_slice());
                    reply.poke2(csum, CHECKSUM_OFFSET);

                    reply.push4(rem_ipaddr);
                    reply.push1(protocol::ICMP);
                    self.router.send_down(self.ip_taskid, reply);
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
        fn send_up(&self, _taskid: u8, msg: Message) {
            msg.free();
        }
        fn set_published(&self, _state: crate::scheduler::Published) {}
        fn published(&self, _taskid: u8) -> crate::scheduler::Published {
            crate::scheduler::Published::default()
        }
    }

    static POOL: Pool<2> = Pool::new(100, 14);

    #[test]
    fn echo_request_produces_reply_with_type_zero() {
        POOL.init();
        static ROUTER: Sink = Sink { last: Cell::new(None) };
        let mut icmp = Icmp::new(&POOL, &ROUTER, 5);

        let m = POOL.alloc().unwrap();
        m.write1(8); // type: echo request
        m.write1(0); // code
        m.write2(0); // checksum, filled in below
        m.write4(0xDEAD_BEEF); // payload
        let csum = checksum::calculate(m.as_slice());
        m.poke2(csum, CHECKSUM_OFFSET);
        m.push4(0xC0A8_01FA); // src ipaddr, pushed last so it's at the front

        icmp.up(m);
        assert_eq!(ROUTER.last.get().map(|(taskid, _)| taskid), Some(5));
    }

    #[test]
    fn non_echo_type_is_silently_dropped() {
        POOL.init();
        static ROUTER: Sink = Sink { last: Cell::new(None) };
        let mut icmp = Icmp::new(&POOL, &ROUTER, 5);

        let m = POOL.alloc().unwrap();
        m.write1(0); // type == 0 (echo reply, not a request)
        m.write1(0);
        m.write2(0);
        let csum = checksum::calculate(m.as_slice());
        m.poke2(csum, CHECKSUM_OFFSET);
        m.push4(0xC0A8_01FA);

        icmp.up(m);
        assert_eq!(ROUTER.last.get(), None);
    }
}
