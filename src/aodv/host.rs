//! Contract between the routing engine and whatever moves its packets.
//! The host owns sockets, the clock and the timer facility. The engine calls into
//! it synchronously and never blocks; failures of asynchronous sends come back into
//! the engine as events (see `Aodv::handle_send_failure`).
use crate::aodv::messages::Message;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::net::Ipv4Addr;

/// An application data packet. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, payload: Vec<u8>) -> Packet {
        Packet {
            source,
            destination,
            payload,
        }
    }
}

/// Forwarding decision handed to the host together with a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub next_hop: Ipv4Addr,
    pub interface: u32,
}

/// A local network interface the engine may send on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub address: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

/// Opaque handle to a scheduled timer. Used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Timers the engine schedules through the host. When one fires, the host hands it
/// back via `Aodv::handle_timer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// Route discovery for a destination timed out.
    RouteRequest { destination: Ipv4Addr },
    /// Periodic Hello check.
    Hello,
    /// Periodic sweep of routes, neighbors, the duplicate cache and the queue.
    Maintenance,
    /// No RREP-ACK arrived from this neighbor in time.
    AckWait { neighbor: Ipv4Addr },
    /// The black-list period for this neighbor is over.
    BlacklistExpired { neighbor: Ipv4Addr },
}

/// Reasons reported to the host when a data packet is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted to make room in the pending queue.
    QueueFull,
    /// Sat in the pending queue longer than the maximum queue time.
    QueueTimeout,
    /// Route discovery exhausted its retries.
    DiscoveryFailed,
    /// A local repair did not find a new route.
    RepairFailed,
    /// Transit packet without any route to its destination.
    NoRoute,
    /// The next hop became unreachable while forwarding.
    LinkBroken,
    /// Packet came back to the node that originated it.
    Looped,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DropReason::QueueFull => write!(f, "QUEUE_FULL"),
            DropReason::QueueTimeout => write!(f, "QUEUE_TIMEOUT"),
            DropReason::DiscoveryFailed => write!(f, "DISCOVERY_FAILED"),
            DropReason::RepairFailed => write!(f, "REPAIR_FAILED"),
            DropReason::NoRoute => write!(f, "NO_ROUTE"),
            DropReason::LinkBroken => write!(f, "LINK_BROKEN"),
            DropReason::Looped => write!(f, "LOOPED"),
        }
    }
}

/// Collaborator interface the engine drives.
pub trait Host {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Sends a control message. `destination` is `Ipv4Addr::BROADCAST` for broadcasts.
    fn send(&mut self, msg: &Message, destination: Ipv4Addr, interface: u32, ttl: u8);

    /// Arms a timer that fires after `delay`.
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle;

    /// Revokes a timer. Cancelling an already fired timer is a no-op.
    fn cancel(&mut self, handle: TimerHandle);

    /// Hands a packet addressed to this node up to the application.
    fn deliver_locally(&mut self, packet: Packet);

    /// Transmits a data packet to the next hop of `route`.
    fn forward(&mut self, packet: Packet, route: Route);

    /// Observability hook for discarded data packets.
    fn packet_dropped(&mut self, packet: Packet, reason: DropReason);

    /// Route discovery for `destination` failed.
    fn destination_unreachable(&mut self, destination: Ipv4Addr);
}
