//! ARP cache.
//!
//! One cache entry per IP address we've talked to, each IDLE / WAITING /
//! BOUND, each with its own hold queue (messages waiting on an unresolved
//! address) and retry timer. `down` resolves and forwards, queuing and
//! kicking off a request on a miss; `up` processes requests and replies,
//! binding the cache and releasing anything that was waiting; `timeout`
//! retries, gives up, or flushes a stale binding.

use crate::message::Message;
use crate::pool::Pool;
use crate::queue::Queue;
use crate::scheduler::{Router, TaskHandlers};
use crate::timer::{TimerHandle, Timers};

use super::frame_type;
use super::types::{Config, Ipv4Addr, MacAddr, ETHADDR_LEN, ETH_MINFRAME, ETH_OFFSET, IPADDR_LEN};

const CACHE_NBR: usize = 4;
const DEFAULT_MQ_DEPTH: usize = 8;
const TIMER_RETRY_SECONDS: u16 = 1;
const TIMER_FLUSH_SECONDS: u16 = 10 * 60;
const RETRY_LIMIT: u8 = 3;
const OPCODE_REQUEST: u16 = 1;
const OPCODE_REPLY: u16 = 2;
const HW_TYPE_ETHERNET: u16 = 1;
const ETH_BROADCAST: [u8; ETHADDR_LEN] = [0xFF; ETHADDR_LEN];
const ETH_ZERO: [u8; ETHADDR_LEN] = [0; ETHADDR_LEN];

/// Declared message size/offset for ARP's request/reply pool, sized to a
/// minimum Ethernet frame and offset past its header.
pub const POOL_SIZE: u16 = ETH_MINFRAME as u16;
pub const POOL_OFFSET: u16 = ETH_OFFSET as u16;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Idle,
    Waiting,
    Bound,
}

struct CacheEntry {
    state: CacheState,
    mq: Queue<DEFAULT_MQ_DEPTH>,
    ipaddr: Ipv4Addr,
    ethaddr: MacAddr,
    timer: Option<TimerHandle>,
    retry_count: u8,
}

impl CacheEntry {
    const fn new() -> Self {
        CacheEntry {
            state: CacheState::Idle,
            mq: Queue::new(),
            ipaddr: Ipv4Addr::ZERO,
            ethaddr: MacAddr::ZERO,
            timer: None,
            retry_count: 0,
        }
    }

    fn timer(&self) -> TimerHandle {
        self.timer.expect("cache entry used before Arp::init")
    }
}

/// The ARP task: an ordinary struct registered with the scheduler, holding
/// what would otherwise be a module-global cache table.
pub struct Arp {
    pool: &'static Pool<CACHE_NBR>,
    wheel: &'static dyn Timers,
    router: &'static dyn Router,
    config: &'static Config,
    ether_taskid: u8,
    cache: [CacheEntry; CACHE_NBR],
}

impl Arp {
    pub const fn new(
        pool: &'static Pool<CACHE_NBR>,
        wheel: &'static dyn Timers,
        router: &'static dyn Router,
        config: &'static Config,
        ether_taskid: u8,
    ) -> Self {
        Arp {
            pool,
            wheel,
            router,
            config,
            ether_taskid,
            cache: [const { CacheEntry::new() }; CACHE_NBR],
        }
    }

    /// Wiring-time setup: initialize the pool and give each cache entry its
    /// own timer, its index doubling as the timer's local id.
    pub fn init(&mut self, arp_taskid: u8) {
        self.pool.init();
        for (i, entry) in self.cache.iter_mut().enumerate() {
            let handle = self.wheel.alloc(arp_taskid);
            self.wheel.reset(handle, i as u8);
            entry.timer = Some(handle);
        }
    }

    fn lookup(&self, ipaddr: Ipv4Addr) -> Option<usize> {
        self.cache
            .iter()
            .position(|e| e.state == CacheState::Bound && e.ipaddr == ipaddr)
    }

    /// Pick a cache slot for `ipaddr`, by tie-break order: an exact match
    /// (WAITING or BOUND) wins outright; otherwise the first IDLE entry;
    /// otherwise the BOUND entry with least time remaining; otherwise — a
    /// case not expected to come up in practice — the WAITING entry with
    /// the highest retry count, forcibly cleared.
    fn select(&mut self, ipaddr: Ipv4Addr) -> usize {
        let mut idle: Option<usize> = None;
        let mut oldest: Option<usize> = None;
        let mut min_bound = u32::MAX;
        let mut very_reluctant: Option<usize> = None;
        let mut max_retry_count = 0u8;

        for i in 0..CACHE_NBR {
            match self.cache[i].state {
                CacheState::Bound => {
                    if self.cache[i].ipaddr == ipaddr {
                        return i;
                    }
                    let remaining = self.wheel.read(self.cache[i].timer());
                    if remaining <= min_bound {
                        min_bound = remaining;
                        oldest = Some(i);
                    }
                }
                CacheState::Idle => {
                    if idle.is_none() {
                        idle = Some(i);
                    }
                }
                CacheState::Waiting => {
                    if self.cache[i].ipaddr == ipaddr {
                        return i;
                    }
                    if self.cache[i].retry_count >= max_retry_count {
                        max_retry_count = self.cache[i].retry_count;
                        very_reluctant = Some(i);
                    }
                }
            }
        }

        if let Some(i) = idle {
            return i;
        }
        if let Some(i) = oldest {
            return i;
        }
        let i = very_reluctant.expect("a 4-entry cache always has a candidate");
        self.cache[i].mq.clear();
        self.wheel.stop(self.cache[i].timer());
        self.cache[i].state = CacheState::Idle;
        i
    }

    fn send_request(&self, mut msg: Message, target_ipaddr: Ipv4Addr) {
        msg.clear();
        msg.push2(frame_type::ARP);
        msg.push6(self.config.my_ethaddr.as_bytes());
        msg.push6(&ETH_BROADCAST);
        msg.write2(HW_TYPE_ETHERNET);
        msg.write2(frame_type::IP);
        msg.write1(ETHADDR_LEN as u8);
        msg.write1(IPADDR_LEN as u8);
        msg.write2(OPCODE_REQUEST);
        msg.write6(self.config.my_ethaddr.as_bytes());
        msg.write4(self.config.my_ipaddr.to_u32());
        msg.write6(&ETH_ZERO);
        msg.write4(target_ipaddr.to_u32());
        self.router.send_down(self.ether_taskid, msg);
    }

    fn send_reply(&self, mut msg: Message, target_ipaddr: Ipv4Addr, target_ethaddr: MacAddr) {
        msg.clear();
        msg.push2(frame_type::ARP);
        msg.push6(self.config.my_ethaddr.as_bytes());
        msg.push6(target_ethaddr.as_bytes());
        msg.write2(HW_TYPE_ETHERNET);
        msg.write2(frame_type::IP);
        msg.write1(ETHADDR_LEN as u8);
        msg.write1(IPADDR_LEN as u8);
        msg.write2(OPCODE_REPLY);
        msg.write6(self.config.my_ethaddr.as_bytes());
        msg.write4(self.config.my_ipaddr.to_u32());
        msg.write6(target_ethaddr.as_bytes());
        msg.write4(target_ipaddr.to_u32());
        self.router.send_down(self.ether_taskid, msg);
    }

    fn prefix_and_forward(&self, queued: Message, dst: MacAddr) {
        queued.push2(frame_type::IP);
        queued.push6(self.config.my_ethaddr.as_bytes());
        queued.push6(dst.as_bytes());
        self.router.send_down(self.ether_taskid, queued);
    }
}

impl TaskHandlers for Arp {
    /// Message in: `[next_hop_ipaddr,4][ip hdr][payload]`.
    fn down(&mut self, msg: Message) {
        let ipaddr = Ipv4Addr::from_u32(msg.pop4());

        if let Some(idx) = self.lookup(ipaddr) {
            let dst = self.cache[idx].ethaddr;
            self.prefix_and_forward(msg, dst);
            return;
        }

        let idx = self.select(ipaddr);
        if let Err(msg) = self.cache[idx].mq.write(msg) {
            msg.free();
        }

        if self.cache[idx].state == CacheState::Idle {
            let request = self.pool.idx(idx);
            self.send_request(request, ipaddr);
            self.cache[idx].ipaddr = ipaddr;
            self.cache[idx].state = CacheState::Waiting;
            self.cache[idx].retry_count = 0;
            self.wheel.start_seconds(self.cache[idx].timer(), TIMER_RETRY_SECONDS);
        }
    }

    /// Message in: raw ARP frame, `[hw type,2][frame type,2][hw len,1]
    /// [addr len,1][opcode,2][sender eth,6][sender ip,4][target eth,6]
    /// [target ip,4]`.
    fn up(&mut self, msg: Message) {
        let hw_type = msg.read2(0);
        let ft = msg.read2(2);
        let hw_len = msg.read1(4);
        let addr_len = msg.read1(5);
        let opcode = msg.read2(6);
        let sender_ethaddr = MacAddr::new(msg.read6(8));
        let sender_ipaddr = Ipv4Addr::from_u32(msg.read4(14));
        let target_ipaddr = Ipv4Addr::from_u32(msg.read4(24));

        let wanted = hw_type == HW_TYPE_ETHERNET
            && ft == frame_type::IP
            && hw_len as usize == ETHADDR_LEN
            && addr_len as usize == IPADDR_LEN
            && self.config.my_ipaddr == target_ipaddr
            && (opcode == OPCODE_REPLY || opcode == OPCODE_REQUEST);

        if wanted {
            let idx = self.select(sender_ipaddr);

            if opcode == OPCODE_REQUEST {
                let reply = self.pool.idx(idx);
                self.send_reply(reply, sender_ipaddr, sender_ethaddr);
            }

            let oldstate = self.cache[idx].state;
            self.cache[idx].state = CacheState::Bound;
            self.cache[idx].ipaddr = sender_ipaddr;
            self.cache[idx].ethaddr = sender_ethaddr;
            self.wheel.start_seconds(self.cache[idx].timer(), TIMER_FLUSH_SECONDS);

            if oldstate == CacheState::Waiting {
                while let Some(queued) = self.cache[idx].mq.read() {
                    self.prefix_and_forward(queued, sender_ethaddr);
                }
            }
        }

        msg.free();
    }

    fn timeout(&mut self, local_id: u8) {
        let idx = local_id as usize;
        match self.cache[idx].state {
            CacheState::Bound => self.cache[idx].state = CacheState::Idle,
            CacheState::Waiting => {
                if self.cache[idx].retry_count <= RETRY_LIMIT {
                    self.cache[idx].retry_count += 1;
                    let ipaddr = self.cache[idx].ipaddr;
                    let msg = self.pool.idx(idx);
                    self.send_request(msg, ipaddr);
                    self.wheel.start_seconds(self.cache[idx].timer(), TIMER_RETRY_SECONDS);
                } else {
                    self.cache[idx].mq.clear();
                    self.cache[idx].state = CacheState::Idle;
                }
            }
            CacheState::Idle => {}
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

    const CONFIG: Config = Config::new(
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(10, 0, 0, 1),
        MacAddr::new([2, 0, 0, 0, 0, 1]),
    );

    struct Sink;
    unsafe impl Sync for Sink {}
    impl Router for Sink {
        fn send_down(&self, _taskid: u8, msg: Message) {
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

    // Each test gets its own pool/wheel/router statics — a `Pool`/
    // `TimerWheelCell` shared across tests would race under parallel
    // test execution; the single-logical-thread invariant only holds
    // within one Arp instance, not across independent tests.
    macro_rules! test_arp {
        ($name:ident) => {
            static $name: (Pool<CACHE_NBR>, TimerWheelCell<CACHE_NBR>, Sink) = (
                Pool::new(POOL_SIZE, POOL_OFFSET),
                TimerWheelCell::new(),
                Sink,
            );
        };
    }

    #[test]
    fn unresolved_destination_queues_and_sends_request() {
        test_arp!(FIXTURE);
        let (pool, wheel, router) = &FIXTURE;
        pool.init();
        let mut arp = Arp::new(pool, wheel, router, &CONFIG, 5);
        arp.init(6);

        let target = Ipv4Addr::new(10, 0, 0, 9);
        let m = pool.alloc().unwrap();
        m.push4(target.to_u32());
        arp.down(m);
        assert!(matches!(arp.cache[0].state, CacheState::Waiting));
        assert!(wheel.running(arp.cache[0].timer()));
    }

    #[test]
    fn reply_binds_cache_and_flushes_queue() {
        test_arp!(FIXTURE);
        let (pool, wheel, router) = &FIXTURE;
        pool.init();
        let mut arp = Arp::new(pool, wheel, router, &CONFIG, 5);
        arp.init(6);

        let target = Ipv4Addr::new(10, 0, 0, 9);
        let m = pool.alloc().unwrap();
        m.push4(target.to_u32());
        arp.down(m);

        let reply = pool.alloc().unwrap();
        reply.write2(1);
        reply.write2(frame_type::IP);
        reply.write1(ETHADDR_LEN as u8);
        reply.write1(IPADDR_LEN as u8);
        reply.write2(OPCODE_REPLY);
        reply.write6(&[9, 9, 9, 9, 9, 9]);
        reply.write4(target.to_u32());
        reply.write6(&[0; 6]);
        reply.write4(CONFIG.my_ipaddr.to_u32());
        arp.up(reply);

        assert!(matches!(arp.cache[0].state, CacheState::Bound));
        assert_eq!(arp.cache[0].ethaddr, MacAddr::new([9, 9, 9, 9, 9, 9]));
    }

    #[test]
    fn retry_limit_gives_up_and_flushes() {
        test_arp!(FIXTURE);
        let (pool, wheel, router) = &FIXTURE;
        pool.init();
        let mut arp = Arp::new(pool, wheel, router, &CONFIG, 5);
        arp.init(6);

        let target = Ipv4Addr::new(10, 0, 0, 9);
        let m = pool.alloc().unwrap();
        m.push4(target.to_u32());
        arp.down(m);
        for _ in 0..=RETRY_LIMIT + 1 {
            arp.timeout(0);
        }
        assert!(matches!(arp.cache[0].state, CacheState::Idle));
    }
}
