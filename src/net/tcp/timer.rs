//! Per-socket timer-local ids — each [`Socket`](super::socket::Socket)
//! owns two wheel handles and tells them apart by the owner-local id
//! `TimerWheel::reset` stamps on them.

pub const RETRY: u8 = 0;
pub const DELAYED_ACK: u8 = 1;
pub const TIME_WAIT: u8 = 2;

/// Retransmit interval. A fixed interval rather than exponential backoff,
/// matching every other retry timer (ARP, Ethernet link).
pub const RETRY_SECONDS: u16 = 3;
pub const RETRY_LIMIT: u8 = 5;

/// One scheduler tick, long enough to coalesce a piggybacked reply.
pub const DELAYED_ACK_TICKS: u32 = 1;

/// Shortened 2MSL stand-in: a single fixed timeout back to CLOSED rather
/// than true duplicate-segment suppression over a full MSL-based wait.
pub const TIME_WAIT_SECONDS: u16 = 30;
