//! Implementation of the Ad-hoc On-Demand Distance Vector routing protocol (RFC 3561).
//! The engine is a single-threaded state machine. Every entry point runs to completion
//! against the `Host` it owns; nothing in here blocks or spawns threads.
use crate::logging::{log_handle_message, log_sent_message, MessageStatus};
use crate::AodvError;
use chrono::{DateTime, Duration, Utc};
use slog::Logger;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

pub mod config;
pub mod host;
pub mod messages;
pub mod neighbors;
pub mod queue;
pub mod rate_limit;
pub mod route_table;
pub mod rreq_cache;

pub use self::config::AodvConfig;
pub use self::host::{DropReason, Host, Interface, Packet, Route, Timer, TimerHandle};

use self::messages::*;
use self::neighbors::Neighbors;
use self::queue::RequestQueue;
use self::rate_limit::RateLimiter;
use self::route_table::{seq_newer, RouteEntry, RouteState, RouteUpdate, RoutingTable, Unreachable};
use self::rreq_cache::RreqCache;

/// Where route discovery for a destination stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No discovery has been attempted since the last outcome was forgotten.
    Idle,
    Searching { attempt: u32, ttl: u8 },
    /// A local repair search for a broken transit route.
    Repairing { ttl: u8 },
    Found,
    Failed,
}

#[derive(Debug)]
struct Discovery {
    attempt: u32,
    ttl: u8,
    timer: Option<TimerHandle>,
    /// The current attempt has not been transmitted yet because of the RREQ rate limit.
    deferred: bool,
    /// Hop count of the broken route, for local repairs.
    repair_of: Option<u8>,
}

/// Protocol counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub rreq_sent: u64,
    pub rrep_sent: u64,
    pub rerr_sent: u64,
    pub rrep_ack_sent: u64,
    pub hello_sent: u64,
    pub rreq_received: u64,
    pub rrep_received: u64,
    pub rerr_received: u64,
    pub rrep_ack_received: u64,
    pub hello_received: u64,
    pub duplicate_rreqs: u64,
    pub stale_rreps: u64,
    pub blacklisted_drops: u64,
    pub ttl_expired: u64,
    pub rate_limited_rreqs: u64,
    pub rate_limited_rerrs: u64,
    pub malformed_messages: u64,
    pub data_forwarded: u64,
    pub data_delivered: u64,
}

impl Stats {
    fn record_sent(&mut self, msg: &Message) {
        match msg {
            Message::Request(_) => self.rreq_sent += 1,
            Message::Reply(m) if m.is_hello() => self.hello_sent += 1,
            Message::Reply(_) => self.rrep_sent += 1,
            Message::Error(_) => self.rerr_sent += 1,
            Message::ReplyAck => self.rrep_ack_sent += 1,
        }
    }

    fn record_received(&mut self, msg: &Message) {
        match msg {
            Message::Request(_) => self.rreq_received += 1,
            Message::Reply(m) if m.is_hello() => self.hello_received += 1,
            Message::Reply(_) => self.rrep_received += 1,
            Message::Error(_) => self.rerr_received += 1,
            Message::ReplyAck => self.rrep_ack_received += 1,
        }
    }
}

fn millis(d: Duration) -> u32 {
    let ms = d.num_milliseconds();
    if ms <= 0 {
        0
    } else {
        std::cmp::min(ms, i64::from(std::u32::MAX)) as u32
    }
}

/// The AODV routing engine.
pub struct Aodv<H: Host> {
    config: AodvConfig,
    host: H,
    interfaces: Vec<Interface>,
    /// Own destination sequence number.
    seq_no: u32,
    /// Identifier of the last originated RREQ.
    rreq_id: u32,
    route_table: RoutingTable,
    neighbors: Neighbors,
    rreq_cache: RreqCache,
    queue: RequestQueue,
    discoveries: HashMap<Ipv4Addr, Discovery>,
    outcomes: HashMap<Ipv4Addr, DiscoveryState>,
    /// Pending RREP-ACK waits, per neighbor.
    ack_timers: HashMap<Ipv4Addr, TimerHandle>,
    hello_timer: Option<TimerHandle>,
    maintenance_timer: Option<TimerHandle>,
    last_broadcast: Option<DateTime<Utc>>,
    rreq_limiter: RateLimiter,
    rerr_limiter: RateLimiter,
    stats: Stats,
    logger: Logger,
}

impl<H: Host> Aodv<H> {
    /// Creates a new engine. Timers are not armed until `start` is called.
    pub fn new(
        config: AodvConfig,
        host: H,
        interfaces: Vec<Interface>,
        logger: Logger,
    ) -> Result<Aodv<H>, AodvError> {
        config.validate()?;
        let neighbors = Neighbors::new(config.neighbor_timeout());
        let queue = RequestQueue::new(
            config.max_queue_len,
            config.max_queue_len_per_destination,
            config.max_queue_time(),
        );
        let rreq_limiter = RateLimiter::per_second(config.rreq_rate_limit);
        let rerr_limiter = RateLimiter::per_second(config.rerr_rate_limit);

        Ok(Aodv {
            config,
            host,
            interfaces,
            seq_no: 0,
            rreq_id: 0,
            route_table: RoutingTable::new(),
            neighbors,
            rreq_cache: RreqCache::new(),
            queue,
            discoveries: HashMap::new(),
            outcomes: HashMap::new(),
            ack_timers: HashMap::new(),
            hello_timer: None,
            maintenance_timer: None,
            last_broadcast: None,
            rreq_limiter,
            rerr_limiter,
            stats: Stats::default(),
            logger,
        })
    }

    /// Arms the periodic Hello (when enabled) and maintenance timers.
    pub fn start(&mut self) {
        if let Some(t) = self.hello_timer.take() {
            self.host.cancel(t);
        }
        if let Some(t) = self.maintenance_timer.take() {
            self.host.cancel(t);
        }
        if self.config.enable_hello {
            self.hello_timer = Some(self.host.schedule(self.config.hello_interval(), Timer::Hello));
        }
        self.maintenance_timer = Some(
            self.host
                .schedule(self.config.maintenance_interval(), Timer::Maintenance),
        );
        info!(self.logger, "AODV started"; "interfaces" => self.interfaces.len());
    }

    pub fn config(&self) -> &AodvConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.route_table
    }

    pub fn neighbors(&self) -> &Neighbors {
        &self.neighbors
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn sequence_number(&self) -> u32 {
        self.seq_no
    }

    /// Number of packets waiting for a route to `destination`.
    pub fn queued_packets(&self, destination: &Ipv4Addr) -> usize {
        self.queue.len_for(destination)
    }

    pub fn discovery_state(&self, destination: &Ipv4Addr) -> DiscoveryState {
        match self.discoveries.get(destination) {
            Some(d) if d.repair_of.is_some() => DiscoveryState::Repairing { ttl: d.ttl },
            Some(d) => DiscoveryState::Searching {
                attempt: d.attempt,
                ttl: d.ttl,
            },
            None => self
                .outcomes
                .get(destination)
                .cloned()
                .unwrap_or(DiscoveryState::Idle),
        }
    }

    pub fn is_my_address(&self, addr: &Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| &i.address == addr)
    }

    fn primary_address(&self) -> Option<Ipv4Addr> {
        self.interfaces.first().map(|i| i.address)
    }

    fn has_interface(&self, index: u32) -> bool {
        self.interfaces.iter().any(|i| i.index == index)
    }

    // **************************************************
    // ***************** Interfaces *********************
    // **************************************************

    pub fn interface_up(&mut self, iface: Interface) {
        info!(self.logger, "Interface up"; "index" => iface.index, "address" => %iface.address);
        match self.interfaces.iter_mut().find(|i| i.index == iface.index) {
            Some(existing) => *existing = iface,
            None => self.interfaces.push(iface),
        }
    }

    /// Tears down everything reachable through the interface and notifies the
    /// precursors over the interfaces that remain.
    pub fn interface_down(&mut self, index: u32) {
        let now = self.host.now();
        info!(self.logger, "Interface down"; "index" => index);
        self.interfaces.retain(|i| i.index != index);

        for neighbor in self.neighbors.on_interface(index) {
            self.forget_neighbor(&neighbor);
        }
        let broken = self
            .route_table
            .invalidate_interface(index, now, self.config.delete_period());
        self.report_unreachable(broken, now);
    }

    // **************************************************
    // ******************  Data path ********************
    // **************************************************

    /// Routes a packet originated by the local application.
    pub fn route_output(&mut self, packet: Packet) {
        let now = self.host.now();
        if self.is_my_address(&packet.destination) {
            self.stats.data_delivered += 1;
            self.host.deliver_locally(packet);
            return;
        }

        let route = self
            .route_table
            .lookup_valid(&packet.destination, now)
            .and_then(|e| e.route());
        if let Some(route) = route {
            self.refresh_active(&[route.destination, route.next_hop], now);
            self.stats.data_forwarded += 1;
            self.host.forward(packet, route);
            return;
        }

        let destination = packet.destination;
        info!(
            self.logger,
            "Packet queued";
            "destination" => %destination,
            "status" => MessageStatus::QUEUED,
        );
        self.enqueue(packet, now);
        if !self.discoveries.contains_key(&destination) {
            self.start_discovery(destination, now);
        }
    }

    /// Handles a data packet received from `previous_hop`.
    pub fn route_input(&mut self, packet: Packet, previous_hop: Ipv4Addr, interface: u32) {
        let now = self.host.now();
        self.neighbors.touch(previous_hop, interface, now);

        if self.is_my_address(&packet.source) {
            self.drop_packet(packet, DropReason::Looped);
            return;
        }

        if self.is_my_address(&packet.destination) {
            self.refresh_active(&[packet.source, previous_hop], now);
            self.stats.data_delivered += 1;
            self.host.deliver_locally(packet);
            return;
        }

        let route = self
            .route_table
            .lookup_valid(&packet.destination, now)
            .and_then(|e| e.route());
        if let Some(route) = route {
            self.refresh_active(
                &[route.destination, route.next_hop, packet.source, previous_hop],
                now,
            );
            self.stats.data_forwarded += 1;
            self.host.forward(packet, route);
            return;
        }

        let (state, dest_seq_no) = match self.route_table.lookup(&packet.destination) {
            Some(e) => (Some(e.state), e.dest_seq_no),
            None => (None, 0),
        };
        match state {
            Some(RouteState::InSearch) | Some(RouteState::RepairInProgress) => {
                self.enqueue(packet, now);
            }
            _ => {
                //RFC(6.11) - (ii) data packet for a destination without an active route
                let destination = packet.destination;
                self.drop_packet(packet, DropReason::NoRoute);
                let mut precursors = BTreeSet::new();
                precursors.insert(previous_hop);
                self.send_route_error(
                    RerrFlags::empty(),
                    vec![(destination, dest_seq_no)],
                    precursors,
                    now,
                );
            }
        }
    }

    /// Link-layer report that a transmission to `next_hop` failed. `packet` is the data
    /// packet that could not be delivered, if any.
    pub fn handle_send_failure(&mut self, next_hop: Ipv4Addr, packet: Option<Packet>) {
        let now = self.host.now();
        warn!(self.logger, "BROKEN_LINK detected"; "neighbor" => %next_hop);
        self.forget_neighbor(&next_hop);
        let delete_period = self.config.delete_period();

        let packet = match packet {
            Some(p) => p,
            None => {
                let broken = self
                    .route_table
                    .invalidate_next_hop(&next_hop, now, delete_period);
                self.report_unreachable(broken, now);
                return;
            }
        };

        let destination = packet.destination;
        let transit = !self.is_my_address(&packet.source);
        let repairable = self.route_table.lookup(&destination).and_then(|e| {
            if e.state == RouteState::Valid
                && e.next_hop == Some(next_hop)
                && e.hop_count <= self.config.max_repair_ttl()
            {
                Some(e.hop_count)
            } else {
                None
            }
        });

        match repairable {
            Some(prev_hops)
                if self.config.enable_local_repair
                    && transit
                    && !self.discoveries.contains_key(&destination) =>
            {
                let source_hops = self
                    .route_table
                    .lookup(&packet.source)
                    .map_or(0, |e| e.hop_count);
                if let Some(e) = self.route_table.lookup_mut(&destination) {
                    e.state = RouteState::RepairInProgress;
                    e.next_hop = None;
                }
                let broken = self
                    .route_table
                    .invalidate_next_hop(&next_hop, now, delete_period);
                self.report_unreachable(broken, now);
                self.enqueue(packet, now);
                self.start_local_repair(destination, prev_hops, source_hops, now);
            }
            _ => {
                let broken = self
                    .route_table
                    .invalidate_next_hop(&next_hop, now, delete_period);
                self.report_unreachable(broken, now);
                if transit {
                    self.drop_packet(packet, DropReason::LinkBroken);
                } else {
                    self.enqueue(packet, now);
                    if !self.discoveries.contains_key(&destination) {
                        self.start_discovery(destination, now);
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, packet: Packet, now: DateTime<Utc>) {
        for (p, reason) in self.queue.enqueue(packet, now) {
            self.drop_packet(p, reason);
        }
    }

    fn drop_packet(&mut self, packet: Packet, reason: DropReason) {
        info!(
            self.logger,
            "Packet dropped";
            "source" => %packet.source,
            "destination" => %packet.destination,
            "reason" => %reason,
            "status" => MessageStatus::DROPPED,
        );
        self.host.packet_dropped(packet, reason);
    }

    /// Extends the lifetime of the active routes in `destinations` (RFC 6.2).
    fn refresh_active(&mut self, destinations: &[Ipv4Addr], now: DateTime<Utc>) {
        let lifetime = now + self.config.active_route_timeout();
        for dst in destinations {
            let valid = self
                .route_table
                .lookup_valid(dst, now)
                .is_some();
            if valid {
                self.route_table.refresh_lifetime(dst, lifetime);
            }
        }
    }

    /// Hands every packet buffered for `destination` to the host if a route exists now.
    fn flush_queue(&mut self, destination: &Ipv4Addr, now: DateTime<Utc>) {
        let route = match self
            .route_table
            .lookup_valid(destination, now)
            .and_then(|e| e.route())
        {
            Some(r) => r,
            None => return,
        };
        let packets = self.queue.drain(destination);
        if packets.is_empty() {
            return;
        }
        info!(
            self.logger,
            "Sending queued packets";
            "destination" => %destination,
            "count" => packets.len(),
        );
        self.refresh_active(&[route.destination, route.next_hop], now);
        for packet in packets {
            self.stats.data_forwarded += 1;
            self.host.forward(packet, route);
        }
    }

    // **************************************************
    // ***************** Route discovery ****************
    // **************************************************

    fn start_discovery(&mut self, destination: Ipv4Addr, now: DateTime<Utc>) {
        if self.primary_address().is_none() {
            warn!(self.logger, "No interfaces to run route discovery on"; "destination" => %destination);
            for p in self.queue.drop_destination(&destination) {
                self.drop_packet(p, DropReason::DiscoveryFailed);
            }
            return;
        }

        match self.route_table.lookup_mut(&destination) {
            Some(e) => e.state = RouteState::InSearch,
            None => self.route_table.insert(RouteEntry::in_search(
                destination,
                now + self.config.path_discovery_time(),
            )),
        }
        self.outcomes.remove(&destination);
        let ttl = self.config.initial_ttl();
        self.discoveries.insert(
            destination,
            Discovery {
                attempt: 0,
                ttl,
                timer: None,
                deferred: false,
                repair_of: None,
            },
        );
        info!(self.logger, "Route discovery started"; "destination" => %destination, "ttl" => ttl);
        self.transmit_request(destination, now);
    }

    /// RFC(6.12) - a node upstream of a break may try to repair the route itself.
    fn start_local_repair(
        &mut self,
        destination: Ipv4Addr,
        prev_hops: u8,
        source_hops: u8,
        now: DateTime<Utc>,
    ) {
        //TTL = max(MIN_REPAIR_TTL, 0.5 * #hops to the source) + LOCAL_ADD_TTL
        let ttl = std::cmp::max(prev_hops, source_hops / 2)
            .saturating_add(self.config.local_add_ttl);
        let ttl = std::cmp::min(ttl, self.config.net_diameter);
        self.outcomes.remove(&destination);
        self.discoveries.insert(
            destination,
            Discovery {
                attempt: 0,
                ttl,
                timer: None,
                deferred: false,
                repair_of: Some(prev_hops),
            },
        );
        info!(self.logger, "Local repair started"; "destination" => %destination, "ttl" => ttl);
        self.transmit_request(destination, now);
    }

    /// Sends the RREQ for the current attempt of the discovery for `destination` and arms
    /// its retry timer.
    fn transmit_request(&mut self, destination: Ipv4Addr, now: DateTime<Utc>) {
        let (attempt, ttl, repair) = match self.discoveries.get(&destination) {
            Some(d) => (d.attempt, d.ttl, d.repair_of.is_some()),
            None => return,
        };
        let originator = match self.primary_address() {
            Some(a) => a,
            None => return,
        };

        if !self.rreq_limiter.try_acquire(now) {
            self.stats.rate_limited_rreqs += 1;
            let delay = std::cmp::max(self.rreq_limiter.retry_after(now), Duration::milliseconds(1));
            debug!(self.logger, "RREQ rate limit reached"; "destination" => %destination);
            let timer = self.host.schedule(delay, Timer::RouteRequest { destination });
            if let Some(d) = self.discoveries.get_mut(&destination) {
                if let Some(old) = d.timer.replace(timer) {
                    self.host.cancel(old);
                }
                d.deferred = true;
            }
            return;
        }

        self.seq_no = self.seq_no.wrapping_add(1);
        self.rreq_id = self.rreq_id.wrapping_add(1);

        let mut flags = RreqFlags::empty();
        if self.config.destination_only {
            flags.insert(RreqFlags::DESTINATION_ONLY);
        }
        if self.config.gratuitous_reply {
            flags.insert(RreqFlags::GRATUITOUS_RREP);
        }
        let known_seq = self
            .route_table
            .lookup(&destination)
            .filter(|e| e.has_valid_seq_no())
            .map(|e| e.dest_seq_no);
        let dest_seq_no = match known_seq {
            //RFC(6.12) - a repairing node asks for a fresher route than the broken one
            Some(seq) if repair => seq.wrapping_add(1),
            Some(seq) => seq,
            None => {
                flags.insert(RreqFlags::UNKNOWN_SEQUENCE_NUMBER);
                0
            }
        };

        let rreq = RouteRequest {
            flags,
            hop_count: 0,
            rreq_id: self.rreq_id,
            destination,
            dest_seq_no,
            originator,
            orig_seq_no: self.seq_no,
        };
        //Our own request must not be processed again when neighbors rebroadcast it.
        self.rreq_cache
            .record(originator, self.rreq_id, now + self.config.path_discovery_time());
        self.broadcast(Message::Request(rreq), ttl, now);

        let timeout = self.config.ring_traversal_time(ttl, attempt);
        let timer = self.host.schedule(timeout, Timer::RouteRequest { destination });
        if let Some(d) = self.discoveries.get_mut(&destination) {
            if let Some(old) = d.timer.replace(timer) {
                self.host.cancel(old);
            }
            d.deferred = false;
        }
    }

    fn route_request_timeout(&mut self, destination: Ipv4Addr, now: DateTime<Utc>) {
        //A route may have shown up through some other message in the meantime.
        if self.route_table.lookup_valid(&destination, now).is_some() {
            self.route_available(&destination, now);
            return;
        }

        let (attempt, ttl, deferred, repair) = match self.discoveries.get(&destination) {
            Some(d) => (d.attempt, d.ttl, d.deferred, d.repair_of.is_some()),
            None => return,
        };
        if deferred {
            self.transmit_request(destination, now);
            return;
        }
        if repair {
            self.local_repair_failed(destination, now);
            return;
        }

        let attempt = attempt + 1;
        if attempt < self.config.rreq_retries {
            let ttl = self.config.next_ttl(ttl);
            if let Some(d) = self.discoveries.get_mut(&destination) {
                d.attempt = attempt;
                d.ttl = ttl;
            }
            info!(
                self.logger,
                "Route discovery retry";
                "destination" => %destination,
                "attempt" => attempt,
                "ttl" => ttl,
            );
            self.transmit_request(destination, now);
            return;
        }

        warn!(self.logger, "RREQ retries exceeded"; "destination" => %destination);
        self.discoveries.remove(&destination);
        self.outcomes.insert(destination, DiscoveryState::Failed);
        if let Some(e) = self.route_table.lookup_mut(&destination) {
            if e.state == RouteState::InSearch {
                e.state = RouteState::Invalid;
                e.next_hop = None;
                e.lifetime = now + self.config.delete_period();
            }
        }
        for p in self.queue.drop_destination(&destination) {
            self.drop_packet(p, DropReason::DiscoveryFailed);
        }
        self.host.destination_unreachable(destination);
    }

    fn local_repair_failed(&mut self, destination: Ipv4Addr, now: DateTime<Utc>) {
        warn!(self.logger, "Local repair failed"; "destination" => %destination);
        self.discoveries.remove(&destination);
        self.outcomes.insert(destination, DiscoveryState::Failed);
        let broken = self
            .route_table
            .invalidate(&destination, now, self.config.delete_period());
        self.report_unreachable(broken.into_iter().collect(), now);
        for p in self.queue.drop_destination(&destination) {
            self.drop_packet(p, DropReason::RepairFailed);
        }
    }

    /// Completes an outstanding discovery for `destination` once a valid route exists.
    fn route_available(&mut self, destination: &Ipv4Addr, now: DateTime<Utc>) {
        let hop_count = match self.route_table.lookup_valid(destination, now) {
            Some(e) => e.hop_count,
            None => return,
        };
        if let Some(d) = self.discoveries.remove(destination) {
            if let Some(t) = d.timer {
                self.host.cancel(t);
            }
            self.outcomes.insert(*destination, DiscoveryState::Found);
            info!(
                self.logger,
                "Route found";
                "destination" => %destination,
                "hops" => hop_count,
            );
            //RFC(6.12) - a repaired route that got longer is announced with the N flag
            if let Some(prev_hops) = d.repair_of {
                if hop_count > prev_hops {
                    let seq = self
                        .route_table
                        .lookup(destination)
                        .map(|e| e.dest_seq_no)
                        .unwrap_or(0);
                    let precursors = self
                        .route_table
                        .precursors_of(destination)
                        .into_iter()
                        .collect();
                    self.send_route_error(
                        RerrFlags::NO_DELETE,
                        vec![(*destination, seq)],
                        precursors,
                        now,
                    );
                }
            }
        }
        self.flush_queue(destination, now);
    }

    // **************************************************
    // ***************** Message input ******************
    // **************************************************

    /// Decodes and processes a control message received from `sender`.
    pub fn receive(
        &mut self,
        data: &[u8],
        sender: Ipv4Addr,
        interface: u32,
        ttl: u8,
    ) -> Result<(), AodvError> {
        let msg = match Message::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(self.logger, "Could not decode message"; "source" => %sender, "reason" => %e);
                return Err(e);
            }
        };
        self.handle_message(msg, sender, interface, ttl);
        Ok(())
    }

    /// Processes an already decoded control message. `ttl` is the remaining IP TTL the
    /// message arrived with.
    pub fn handle_message(&mut self, msg: Message, sender: Ipv4Addr, interface: u32, ttl: u8) {
        if self.is_my_address(&sender) {
            return;
        }
        let now = self.host.now();
        self.stats.record_received(&msg);
        self.neighbors.touch(sender, interface, now);
        if !self.neighbors.is_blacklisted(&sender, now) {
            self.update_route_to_neighbor(sender, interface, now);
        }

        match &msg {
            Message::Request(m) => self.process_route_request(m, &msg, sender, interface, ttl, now),
            Message::Reply(m) if m.is_hello() => self.process_hello(m, &msg, sender, interface, now),
            Message::Reply(m) => self.process_route_reply(m, &msg, sender, interface, ttl, now),
            Message::Error(m) => self.process_route_error(m, &msg, sender, now),
            Message::ReplyAck => self.process_reply_ack(&msg, sender),
        }
    }

    /// RFC(6.2) - any control message proves the sender is a one-hop neighbor.
    fn update_route_to_neighbor(&mut self, neighbor: Ipv4Addr, interface: u32, now: DateTime<Utc>) {
        let lifetime = now + self.config.active_route_timeout();
        let replacement = match self.route_table.lookup_mut(&neighbor) {
            Some(e)
                if e.state == RouteState::Valid
                    && e.next_hop == Some(neighbor)
                    && e.interface == interface =>
            {
                e.lifetime = std::cmp::max(e.lifetime, lifetime);
                None
            }
            Some(e) => {
                //A known sequence number stays valid so older advertisements remain stale
                let seq = if e.has_valid_seq_no() {
                    Some(e.dest_seq_no)
                } else {
                    None
                };
                let mut entry = RouteEntry::new(neighbor, neighbor, interface, 1, seq, lifetime);
                entry.dest_seq_no = e.dest_seq_no;
                entry.precursors = e.precursors.clone();
                Some(entry)
            }
            None => Some(RouteEntry::new(neighbor, neighbor, interface, 1, None, lifetime)),
        };
        if let Some(entry) = replacement {
            self.route_table.insert(entry);
            self.route_available(&neighbor, now);
        }
    }

    fn process_route_request(
        &mut self,
        m: &RouteRequest,
        msg: &Message,
        sender: Ipv4Addr,
        interface: u32,
        ttl: u8,
        now: DateTime<Utc>,
    ) {
        if self.is_my_address(&m.originator) {
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("OWN_REQUEST"), None, msg);
            return;
        }
        if self.rreq_cache.seen(m.originator, m.rreq_id, now) {
            self.stats.duplicate_rreqs += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("DUPLICATE"), None, msg);
            return;
        }
        //RFC(6.8) - requests from black-listed neighbors are ignored
        if self.neighbors.is_blacklisted(&sender, now) {
            self.stats.blacklisted_drops += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("BLACKLISTED"), None, msg);
            return;
        }
        self.rreq_cache
            .record(m.originator, m.rreq_id, now + self.config.path_discovery_time());

        let hops = m.hop_count.saturating_add(1);

        //RFC(6.5) - create or update the reverse route to the originator
        let minimal_lifetime = now + self.config.net_traversal_time() * 2
            - self.config.node_traversal_time() * (2 * i32::from(hops));
        let (orig_seq, lifetime, precursors) = match self.route_table.lookup(&m.originator) {
            Some(e) => {
                let seq = if e.has_valid_seq_no() && !seq_newer(m.orig_seq_no, e.dest_seq_no) {
                    e.dest_seq_no
                } else {
                    m.orig_seq_no
                };
                let lifetime = if e.is_valid(now) {
                    std::cmp::max(e.lifetime, minimal_lifetime)
                } else {
                    minimal_lifetime
                };
                (seq, lifetime, e.precursors.clone())
            }
            None => (m.orig_seq_no, minimal_lifetime, Default::default()),
        };
        let mut reverse = RouteEntry::new(m.originator, sender, interface, hops, Some(orig_seq), lifetime);
        reverse.precursors = precursors;
        self.route_table.insert(reverse);
        self.route_available(&m.originator, now);

        //RFC(6.6.1) - we are the destination
        if self.is_my_address(&m.destination) {
            if !m.flags.contains(RreqFlags::UNKNOWN_SEQUENCE_NUMBER)
                && seq_newer(m.dest_seq_no, self.seq_no)
            {
                self.seq_no = m.dest_seq_no;
            }
            log_handle_message(
                &self.logger,
                sender,
                MessageStatus::ACCEPTED,
                Some("RREQ reached its destination"),
                Some("Route response process will be initiated"),
                msg,
            );
            let rrep = RouteReply {
                flags: RrepFlags::empty(),
                prefix_size: 0,
                hop_count: 0,
                destination: m.destination,
                dest_seq_no: self.seq_no,
                originator: m.originator,
                lifetime: millis(self.config.my_route_timeout()),
            };
            self.send_message(Message::Reply(rrep), sender, interface, self.config.net_diameter, now);
            return;
        }

        //RFC(6.6.2) - an intermediate node with a fresh enough route answers
        if !m.flags.contains(RreqFlags::DESTINATION_ONLY) {
            let known = self
                .route_table
                .lookup_valid(&m.destination, now)
                .filter(|e| e.has_valid_seq_no())
                .filter(|e| {
                    m.flags.contains(RreqFlags::UNKNOWN_SEQUENCE_NUMBER)
                        || !seq_newer(m.dest_seq_no, e.dest_seq_no)
                })
                .and_then(|e| {
                    e.next_hop
                        .map(|nh| (nh, e.hop_count, e.dest_seq_no, e.remaining_lifetime_ms(now)))
                });
            if let Some((next_hop, dest_hops, dest_seq, remaining)) = known {
                self.reply_as_intermediate(m, msg, sender, interface, next_hop, dest_hops, dest_seq, remaining, hops, now);
                return;
            }
        }

        if ttl <= 1 {
            self.stats.ttl_expired += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("TTL_EXPIRED"), None, msg);
            return;
        }

        //Forward the request with the freshest sequence number we know for the destination.
        let dest_seq_no = match self.route_table.lookup(&m.destination) {
            Some(e) if e.has_valid_seq_no() && seq_newer(e.dest_seq_no, m.dest_seq_no) => e.dest_seq_no,
            _ => m.dest_seq_no,
        };
        let fwd = RouteRequest {
            hop_count: hops,
            dest_seq_no,
            ..m.clone()
        };
        log_handle_message(
            &self.logger,
            sender,
            MessageStatus::FORWARDING,
            Some("No route to destination"),
            None,
            msg,
        );
        self.broadcast(Message::Request(fwd), ttl - 1, now);
    }

    #[allow(clippy::too_many_arguments)]
    fn reply_as_intermediate(
        &mut self,
        m: &RouteRequest,
        msg: &Message,
        sender: Ipv4Addr,
        interface: u32,
        next_hop: Ipv4Addr,
        dest_hops: u8,
        dest_seq: u32,
        remaining: u32,
        orig_hops: u8,
        now: DateTime<Utc>,
    ) {
        log_handle_message(
            &self.logger,
            sender,
            MessageStatus::ACCEPTED,
            Some("A valid route to destination has been found!"),
            Some("Route response process will be initiated"),
            msg,
        );
        //RFC(6.6.2) - precursor bookkeeping for both directions
        self.route_table.add_precursor(&m.destination, sender);
        self.route_table.add_precursor(&m.originator, next_hop);

        let rrep = RouteReply {
            flags: RrepFlags::empty(),
            prefix_size: 0,
            hop_count: dest_hops,
            destination: m.destination,
            dest_seq_no: dest_seq,
            originator: m.originator,
            lifetime: remaining,
        };
        self.send_message(Message::Reply(rrep), sender, interface, self.config.net_diameter, now);

        //RFC(6.6.3) - let the destination learn the route back to the originator
        if m.flags.contains(RreqFlags::GRATUITOUS_RREP) {
            let (orig_seq, orig_lifetime) = match self.route_table.lookup(&m.originator) {
                Some(e) => (e.dest_seq_no, e.remaining_lifetime_ms(now)),
                None => (m.orig_seq_no, 0),
            };
            let iface = self
                .route_table
                .lookup(&m.destination)
                .map(|e| e.interface)
                .unwrap_or(interface);
            let gratuitous = RouteReply {
                flags: RrepFlags::empty(),
                prefix_size: 0,
                hop_count: orig_hops,
                destination: m.originator,
                dest_seq_no: orig_seq,
                originator: m.destination,
                lifetime: orig_lifetime,
            };
            self.send_message(Message::Reply(gratuitous), next_hop, iface, self.config.net_diameter, now);
        }
    }

    fn process_route_reply(
        &mut self,
        m: &RouteReply,
        msg: &Message,
        sender: Ipv4Addr,
        interface: u32,
        ttl: u8,
        now: DateTime<Utc>,
    ) {
        if self.neighbors.is_blacklisted(&sender, now) {
            self.stats.blacklisted_drops += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("BLACKLISTED"), None, msg);
            return;
        }
        if m.flags.contains(RrepFlags::ACK_REQUIRED) {
            self.send_message(Message::ReplyAck, sender, interface, 1, now);
        }
        if self.is_my_address(&m.destination) {
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("OWN_ADDRESS"), None, msg);
            return;
        }

        //RFC(6.7) - create or update the forward route
        let hops = m.hop_count.saturating_add(1);
        let lifetime = now + Duration::milliseconds(i64::from(m.lifetime));
        let candidate = RouteEntry::new(m.destination, sender, interface, hops, Some(m.dest_seq_no), lifetime);
        if self.route_table.insert_or_update(candidate) == RouteUpdate::Stale {
            self.stats.stale_rreps += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("STALE"), None, msg);
            return;
        }

        if self.is_my_address(&m.originator) {
            log_handle_message(
                &self.logger,
                sender,
                MessageStatus::ACCEPTED,
                Some("Route to destination established"),
                None,
                msg,
            );
            self.route_available(&m.destination, now);
            return;
        }
        self.route_available(&m.destination, now);

        if ttl <= 1 {
            self.stats.ttl_expired += 1;
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("TTL_EXPIRED"), None, msg);
            return;
        }
        let reverse = self
            .route_table
            .lookup_valid(&m.originator, now)
            .and_then(|e| e.route());
        let reverse = match reverse {
            Some(r) => r,
            None => {
                log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("NO_REVERSE_ROUTE"), None, msg);
                return;
            }
        };

        //RFC(6.7) - lifetime of the reverse route and precursors on both sides
        self.route_table
            .refresh_lifetime(&m.originator, now + self.config.active_route_timeout());
        self.route_table.add_precursor(&m.destination, reverse.next_hop);
        self.route_table.add_precursor(&sender, reverse.next_hop);
        self.route_table.add_precursor(&m.originator, sender);
        self.route_table.add_precursor(&reverse.next_hop, sender);

        let mut flags = m.flags;
        flags.remove(RrepFlags::ACK_REQUIRED);
        if self.config.reply_ack_required {
            flags.insert(RrepFlags::ACK_REQUIRED);
            let timer = self.host.schedule(
                self.config.next_hop_wait(),
                Timer::AckWait {
                    neighbor: reverse.next_hop,
                },
            );
            if let Some(old) = self.ack_timers.insert(reverse.next_hop, timer) {
                self.host.cancel(old);
            }
        }
        let relayed = RouteReply {
            flags,
            hop_count: hops,
            ..m.clone()
        };
        log_handle_message(
            &self.logger,
            sender,
            MessageStatus::FORWARDING,
            Some("Relaying reply towards originator"),
            None,
            msg,
        );
        self.send_message(Message::Reply(relayed), reverse.next_hop, reverse.interface, ttl - 1, now);
    }

    /// RFC(6.9) - a Hello installs or refreshes the route to the neighbor itself.
    fn process_hello(
        &mut self,
        m: &RouteReply,
        msg: &Message,
        sender: Ipv4Addr,
        interface: u32,
        now: DateTime<Utc>,
    ) {
        if m.destination != sender {
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("FOREIGN_HELLO"), None, msg);
            return;
        }
        if self.neighbors.is_blacklisted(&sender, now) {
            self.stats.blacklisted_drops += 1;
            return;
        }
        let lifetime = now
            + std::cmp::max(
                Duration::milliseconds(i64::from(m.lifetime)),
                self.config.neighbor_timeout(),
            );
        let candidate = RouteEntry::new(sender, sender, interface, 1, Some(m.dest_seq_no), lifetime);
        self.route_table.insert_or_update(candidate);
        debug!(self.logger, "Hello received"; "neighbor" => %sender, "seq" => m.dest_seq_no);
        self.route_available(&sender, now);
    }

    fn process_route_error(&mut self, m: &RouteError, msg: &Message, sender: Ipv4Addr, now: DateTime<Utc>) {
        let no_delete = m.flags.contains(RerrFlags::NO_DELETE);
        let delete_period = self.config.delete_period();
        let mut unreachable = Vec::new();
        let mut precursors = BTreeSet::new();

        for (dst, seq) in m.destinations.iter() {
            if self.is_my_address(dst) {
                continue;
            }
            let affected = match self.route_table.lookup(dst) {
                Some(e) => {
                    e.next_hop == Some(sender)
                        && (e.state == RouteState::Valid || e.state == RouteState::RepairInProgress)
                        && !seq_newer(e.dest_seq_no, *seq)
                }
                None => false,
            };
            if !affected {
                continue;
            }
            if no_delete {
                //RFC(6.12) - the route was repaired upstream; only pass the news on
                precursors.extend(self.route_table.precursors_of(dst));
                unreachable.push((*dst, *seq));
            } else if let Some(u) = self.route_table.invalidate_with_seq(dst, *seq, now, delete_period) {
                precursors.extend(u.precursors.iter().cloned());
                unreachable.push((u.destination, u.dest_seq_no));
            }
        }

        if unreachable.is_empty() {
            log_handle_message(&self.logger, sender, MessageStatus::DROPPED, Some("NO_AFFECTED_ROUTES"), None, msg);
            return;
        }
        log_handle_message(
            &self.logger,
            sender,
            MessageStatus::ACCEPTED,
            Some("Routes invalidated"),
            Some("Propagating RERR to precursors"),
            msg,
        );
        let flags = if no_delete {
            RerrFlags::NO_DELETE
        } else {
            RerrFlags::empty()
        };
        self.send_route_error(flags, unreachable, precursors, now);
    }

    /// Only the pending wait is cancelled. An active black-list runs out on its own timer.
    fn process_reply_ack(&mut self, msg: &Message, sender: Ipv4Addr) {
        if let Some(t) = self.ack_timers.remove(&sender) {
            self.host.cancel(t);
        }
        log_handle_message(&self.logger, sender, MessageStatus::ACCEPTED, None, None, msg);
    }

    // **************************************************
    // ****************** Link breaks *******************
    // **************************************************

    /// Drops all per-neighbor state for `neighbor`.
    fn forget_neighbor(&mut self, neighbor: &Ipv4Addr) {
        if let Some(t) = self.neighbors.clear_blacklist(neighbor) {
            self.host.cancel(t);
        }
        self.neighbors.mark_unreachable(neighbor);
        if let Some(t) = self.ack_timers.remove(neighbor) {
            self.host.cancel(t);
        }
    }

    /// Invalidates every route through `neighbor` and notifies their precursors.
    fn handle_link_break(&mut self, neighbor: Ipv4Addr, now: DateTime<Utc>) {
        warn!(self.logger, "BROKEN_LINK detected"; "neighbor" => %neighbor);
        self.forget_neighbor(&neighbor);
        let broken = self
            .route_table
            .invalidate_next_hop(&neighbor, now, self.config.delete_period());
        self.report_unreachable(broken, now);
    }

    /// Emits one RERR covering `broken` to the union of their precursors.
    fn report_unreachable(&mut self, broken: Vec<Unreachable>, now: DateTime<Utc>) {
        if broken.is_empty() {
            return;
        }
        let mut precursors = BTreeSet::new();
        let mut destinations = Vec::with_capacity(broken.len());
        for u in broken {
            info!(self.logger, "Route invalidated"; "destination" => %u.destination, "seq" => u.dest_seq_no);
            precursors.extend(u.precursors.into_iter());
            destinations.push((u.destination, u.dest_seq_no));
        }
        self.send_route_error(RerrFlags::empty(), destinations, precursors, now);
    }

    /// RFC(6.11) - unicast when a single precursor needs to know, broadcast otherwise.
    fn send_route_error(
        &mut self,
        flags: RerrFlags,
        destinations: Vec<(Ipv4Addr, u32)>,
        mut precursors: BTreeSet<Ipv4Addr>,
        now: DateTime<Utc>,
    ) {
        let own: Vec<Ipv4Addr> = self.interfaces.iter().map(|i| i.address).collect();
        precursors.retain(|p| !own.contains(p));
        if precursors.is_empty() || destinations.is_empty() {
            debug!(self.logger, "No precursors to notify"; "destinations" => destinations.len());
            return;
        }

        let unicast = if precursors.len() == 1 {
            precursors.iter().next().and_then(|p| {
                let iface = self
                    .neighbors
                    .get(p)
                    .map(|n| n.interface)
                    .or_else(|| self.route_table.lookup(p).map(|e| e.interface));
                match iface {
                    Some(i) if self.has_interface(i) => Some((*p, i)),
                    _ => None,
                }
            })
        } else {
            None
        };

        for chunk in destinations.chunks(MAX_RERR_DESTINATIONS) {
            if !self.rerr_limiter.try_acquire(now) {
                self.stats.rate_limited_rerrs += 1;
                warn!(self.logger, "RERR rate limit reached"; "destinations" => chunk.len());
                continue;
            }
            let msg = Message::Error(RouteError {
                flags,
                destinations: chunk.to_vec(),
            });
            match unicast {
                Some((p, iface)) => self.send_message(msg, p, iface, 1, now),
                None => self.broadcast(msg, 1, now),
            }
        }
    }

    // **************************************************
    // ********************* Timers *********************
    // **************************************************

    pub fn handle_timer(&mut self, timer: Timer) {
        let now = self.host.now();
        match timer {
            Timer::RouteRequest { destination } => self.route_request_timeout(destination, now),
            Timer::Hello => self.hello_maintenance(now),
            Timer::Maintenance => self.do_maintenance(now),
            Timer::AckWait { neighbor } => self.ack_timeout(neighbor, now),
            Timer::BlacklistExpired { neighbor } => {
                self.neighbors.clear_blacklist(&neighbor);
                debug!(self.logger, "Black-list expired"; "neighbor" => %neighbor);
            }
        }
    }

    fn hello_maintenance(&mut self, now: DateTime<Utc>) {
        if !self.config.enable_hello {
            return;
        }
        let quiet = self
            .last_broadcast
            .map_or(true, |t| now - t >= self.config.hello_interval());
        if quiet {
            let lifetime = millis(self.config.neighbor_timeout());
            let interfaces = self.interfaces.clone();
            for iface in interfaces {
                let hello = RouteReply {
                    flags: RrepFlags::empty(),
                    prefix_size: 0,
                    hop_count: 0,
                    destination: iface.address,
                    dest_seq_no: self.seq_no,
                    originator: iface.address,
                    lifetime,
                };
                self.send_message(Message::Reply(hello), Ipv4Addr::BROADCAST, iface.index, 1, now);
            }
        }
        self.hello_timer = Some(self.host.schedule(self.config.hello_interval(), Timer::Hello));
    }

    fn do_maintenance(&mut self, now: DateTime<Utc>) {
        let expired = self
            .route_table
            .purge_expired(now, self.config.delete_period());
        for dst in expired {
            debug!(self.logger, "Route expired"; "destination" => %dst);
        }
        self.rreq_cache.purge(now);
        for p in self.queue.sweep_expired(now) {
            self.drop_packet(p, DropReason::QueueTimeout);
        }

        if self.config.enable_hello {
            for neighbor in self.neighbors.purge(now) {
                self.handle_link_break(neighbor, now);
            }
        } else {
            //Without Hellos only send failures prove a link dead, so next hops in use stay
            let in_use: BTreeSet<Ipv4Addr> = self
                .route_table
                .entries()
                .filter(|e| e.is_valid(now))
                .filter_map(|e| e.next_hop)
                .collect();
            let lost = self.neighbors.purge_except(now, &in_use);
            for neighbor in lost {
                self.forget_neighbor(&neighbor);
            }
        }

        self.maintenance_timer = Some(
            self.host
                .schedule(self.config.maintenance_interval(), Timer::Maintenance),
        );
    }

    /// RFC(6.8) - a neighbor that did not acknowledge a RREP is black-listed.
    fn ack_timeout(&mut self, neighbor: Ipv4Addr, now: DateTime<Utc>) {
        if self.ack_timers.remove(&neighbor).is_none() {
            return;
        }
        let timeout = self.config.blacklist_timeout();
        let interface = self
            .neighbors
            .get(&neighbor)
            .map(|n| n.interface)
            .or_else(|| self.interfaces.first().map(|i| i.index))
            .unwrap_or(0);
        let timer = self
            .host
            .schedule(timeout, Timer::BlacklistExpired { neighbor });
        if let Some(old) = self
            .neighbors
            .blacklist(neighbor, interface, now + timeout, timer, now)
        {
            self.host.cancel(old);
        }
        warn!(self.logger, "Neighbor black-listed"; "neighbor" => %neighbor, "reason" => "RREP_ACK timeout");
    }

    // **************************************************
    // ********************* Output *********************
    // **************************************************

    fn send_message(&mut self, msg: Message, destination: Ipv4Addr, interface: u32, ttl: u8, now: DateTime<Utc>) {
        log_sent_message(&self.logger, destination, ttl, &msg);
        self.stats.record_sent(&msg);
        if destination == Ipv4Addr::BROADCAST {
            self.last_broadcast = Some(now);
        }
        self.host.send(&msg, destination, interface, ttl);
    }

    fn broadcast(&mut self, msg: Message, ttl: u8, now: DateTime<Utc>) {
        let indices: Vec<u32> = self.interfaces.iter().map(|i| i.index).collect();
        for index in indices {
            self.send_message(msg.clone(), Ipv4Addr::BROADCAST, index, ttl, now);
        }
    }
}
