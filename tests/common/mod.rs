//! Deterministic in-memory network for driving several engines against each other.
//! All nodes share one virtual clock. Messages travel with zero latency over an
//! explicit set of bidirectional links, and unicasts over a missing link come back to
//! the sender as send failures.
use aodv_router::aodv::messages::{Message, RouteError, RouteRequest};
use aodv_router::aodv::{Aodv, AodvConfig, DropReason, Host, Interface, Packet, Route, Timer, TimerHandle};
use aodv_router::logging::create_discard_logger;
use aodv_router::node::timers::TimerQueue;
use chrono::{DateTime, Duration, Utc};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::UNIX_EPOCH;

/// Every simulated node has a single interface with this index.
pub const IFACE: u32 = 1;
const MAX_DELIVERY_ROUNDS: usize = 100_000;

type Clock = Rc<Cell<DateTime<Utc>>>;

pub fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::<Utc>::from(UNIX_EPOCH) + Duration::seconds(1_000)
}

/// Defaults without periodic Hellos.
pub fn quiet_config() -> AodvConfig {
    let mut config = AodvConfig::default();
    config.enable_hello = false;
    config
}

#[derive(Debug)]
pub enum Outgoing {
    Control {
        msg: Message,
        destination: Ipv4Addr,
        ttl: u8,
    },
    Data {
        packet: Packet,
        route: Route,
    },
}

pub struct SimHost {
    clock: Clock,
    pub timers: TimerQueue<Timer>,
    pub outbox: Vec<Outgoing>,
    pub delivered: Vec<Packet>,
    pub dropped: Vec<(Packet, DropReason)>,
    pub unreachable: Vec<Ipv4Addr>,
}

impl SimHost {
    fn new(clock: Clock) -> SimHost {
        SimHost {
            clock,
            timers: TimerQueue::new(),
            outbox: Vec::new(),
            delivered: Vec::new(),
            dropped: Vec::new(),
            unreachable: Vec::new(),
        }
    }
}

impl Host for SimHost {
    fn now(&self) -> DateTime<Utc> {
        self.clock.get()
    }

    fn send(&mut self, msg: &Message, destination: Ipv4Addr, _interface: u32, ttl: u8) {
        self.outbox.push(Outgoing::Control {
            msg: msg.clone(),
            destination,
            ttl,
        });
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.timers.schedule(self.clock.get() + delay, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    fn deliver_locally(&mut self, packet: Packet) {
        self.delivered.push(packet);
    }

    fn forward(&mut self, packet: Packet, route: Route) {
        self.outbox.push(Outgoing::Data { packet, route });
    }

    fn packet_dropped(&mut self, packet: Packet, reason: DropReason) {
        self.dropped.push((packet, reason));
    }

    fn destination_unreachable(&mut self, destination: Ipv4Addr) {
        self.unreachable.push(destination);
    }
}

/// A control message as it left a node.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub msg: Message,
    pub ttl: u8,
    pub at: DateTime<Utc>,
}

pub struct Network {
    clock: Clock,
    nodes: BTreeMap<Ipv4Addr, Aodv<SimHost>>,
    links: BTreeSet<(Ipv4Addr, Ipv4Addr)>,
    pub log: Vec<Transmission>,
}

fn ordered(a: Ipv4Addr, b: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Network {
    pub fn new() -> Network {
        Network {
            clock: Rc::new(Cell::new(start_time())),
            nodes: BTreeMap::new(),
            links: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    /// Nodes linked one after the other, in the given order.
    pub fn line(addresses: &[Ipv4Addr], config: &AodvConfig) -> Network {
        let mut net = Network::new();
        for a in addresses {
            net.add_node(*a, config.clone());
        }
        for pair in addresses.windows(2) {
            net.link(pair[0], pair[1]);
        }
        net
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.get()
    }

    pub fn add_node(&mut self, address: Ipv4Addr, config: AodvConfig) {
        let o = address.octets();
        let interface = Interface {
            index: IFACE,
            address,
            broadcast: Ipv4Addr::new(o[0], o[1], o[2], 255),
        };
        let host = SimHost::new(self.clock.clone());
        let engine = Aodv::new(config, host, vec![interface], create_discard_logger())
            .expect("Could not create engine");
        self.nodes.insert(address, engine);
    }

    pub fn link(&mut self, a: Ipv4Addr, b: Ipv4Addr) {
        self.links.insert(ordered(a, b));
    }

    pub fn unlink(&mut self, a: Ipv4Addr, b: Ipv4Addr) {
        self.links.remove(&ordered(a, b));
    }

    pub fn linked(&self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        self.links.contains(&ordered(a, b))
    }

    fn neighbors_of(&self, a: Ipv4Addr) -> Vec<Ipv4Addr> {
        self.links
            .iter()
            .filter_map(|(x, y)| {
                if *x == a {
                    Some(*y)
                } else if *y == a {
                    Some(*x)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Arms the periodic timers of every node.
    pub fn start(&mut self) {
        for node in self.nodes.values_mut() {
            node.start();
        }
    }

    pub fn node(&self, a: Ipv4Addr) -> &Aodv<SimHost> {
        self.nodes.get(&a).expect("Unknown node")
    }

    pub fn node_mut(&mut self, a: Ipv4Addr) -> &mut Aodv<SimHost> {
        self.nodes.get_mut(&a).expect("Unknown node")
    }

    /// Hands a packet to the application side of `from`. Nothing moves until the
    /// network runs.
    pub fn send(&mut self, from: Ipv4Addr, to: Ipv4Addr, payload: &str) {
        let packet = Packet::new(from, to, payload.as_bytes().to_vec());
        self.node_mut(from).route_output(packet);
    }

    /// Delivers queued transmissions until every outbox is empty. No time passes.
    pub fn run_until_idle(&mut self) {
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let sender = self
                .nodes
                .iter()
                .find(|(_, n)| !n.host().outbox.is_empty())
                .map(|(a, _)| *a);
            let sender = match sender {
                Some(s) => s,
                None => return,
            };
            let outgoing: Vec<Outgoing> = self.node_mut(sender).host_mut().outbox.drain(..).collect();
            for out in outgoing {
                self.transmit(sender, out);
            }
        }
        panic!("Network did not settle");
    }

    fn transmit(&mut self, from: Ipv4Addr, out: Outgoing) {
        match out {
            Outgoing::Control {
                msg,
                destination,
                ttl,
            } => {
                let data = msg.to_bytes().expect("Could not encode message");
                self.log.push(Transmission {
                    from,
                    to: destination,
                    msg,
                    ttl,
                    at: self.now(),
                });
                if destination == Ipv4Addr::BROADCAST {
                    for n in self.neighbors_of(from) {
                        self.node_mut(n)
                            .receive(&data, from, IFACE, ttl)
                            .expect("Could not decode message");
                    }
                } else if self.linked(from, destination) {
                    self.node_mut(destination)
                        .receive(&data, from, IFACE, ttl)
                        .expect("Could not decode message");
                } else {
                    self.node_mut(from).handle_send_failure(destination, None);
                }
            }
            Outgoing::Data { packet, route } => {
                if self.linked(from, route.next_hop) {
                    self.node_mut(route.next_hop).route_input(packet, from, IFACE);
                } else {
                    self.node_mut(from).handle_send_failure(route.next_hop, Some(packet));
                }
            }
        }
    }

    /// Moves the virtual clock forward, firing timers across all nodes in deadline order.
    pub fn advance(&mut self, by: Duration) {
        self.run_until_idle();
        let target = self.now() + by;
        loop {
            let mut next: Option<(DateTime<Utc>, Ipv4Addr)> = None;
            for (a, node) in self.nodes.iter_mut() {
                if let Some(d) = node.host_mut().timers.next_deadline() {
                    if d <= target && next.map_or(true, |(nd, _)| d < nd) {
                        next = Some((d, *a));
                    }
                }
            }
            let (deadline, address) = match next {
                Some(n) => n,
                None => break,
            };
            self.clock.set(deadline);
            let node = self.node_mut(address);
            if let Some((_, timer)) = node.host_mut().timers.pop_due(deadline) {
                node.handle_timer(timer);
            }
            self.run_until_idle();
        }
        self.clock.set(target);
    }

    pub fn requests_from(&self, from: Ipv4Addr) -> Vec<(RouteRequest, u8)> {
        self.log
            .iter()
            .filter(|t| t.from == from)
            .filter_map(|t| match &t.msg {
                Message::Request(r) => Some((r.clone(), t.ttl)),
                _ => None,
            })
            .collect()
    }

    pub fn errors_from(&self, from: Ipv4Addr) -> Vec<(RouteError, Ipv4Addr)> {
        self.log
            .iter()
            .filter(|t| t.from == from)
            .filter_map(|t| match &t.msg {
                Message::Error(e) => Some((e.clone(), t.to)),
                _ => None,
            })
            .collect()
    }
}
