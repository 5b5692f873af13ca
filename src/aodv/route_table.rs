//! Per-destination route state.
use crate::aodv::host::Route;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

bitflags! {
    #[derive(Default)]
    pub struct RouteFlags : u32 {
        const VALID_SEQ_NO = 0b00000001;
        /// The destination is a direct link neighbor.
        const NEIGHBOR = 0b00000010;
        const GATEWAY = 0b00000100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Valid,
    Invalid,
    InSearch,
    RepairInProgress,
}

/// Modular "newer than" comparison for sequence numbers (RFC 3561, section 6.1).
pub fn seq_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub dest_seq_no: u32,
    pub flags: RouteFlags,
    pub state: RouteState,
    pub next_hop: Option<Ipv4Addr>,
    pub interface: u32,
    pub hop_count: u8,
    pub lifetime: DateTime<Utc>,
    pub precursors: HashSet<Ipv4Addr>,
}

impl RouteEntry {
    /// Creates a Valid route. A `None` sequence number leaves VALID_SEQ_NO unset.
    pub fn new(
        destination: Ipv4Addr,
        next_hop: Ipv4Addr,
        interface: u32,
        hop_count: u8,
        dest_seq_no: Option<u32>,
        lifetime: DateTime<Utc>,
    ) -> Self {
        let mut flags = RouteFlags::VALID_SEQ_NO;
        let seq = match dest_seq_no {
            Some(seq) => seq,
            None => {
                flags.remove(RouteFlags::VALID_SEQ_NO);
                0
            }
        };
        if destination == next_hop {
            flags.insert(RouteFlags::NEIGHBOR);
        }
        RouteEntry {
            destination,
            dest_seq_no: seq,
            flags,
            state: RouteState::Valid,
            next_hop: Some(next_hop),
            interface,
            hop_count,
            lifetime,
            precursors: HashSet::new(),
        }
    }

    /// Placeholder entry for a destination whose discovery just started.
    pub fn in_search(destination: Ipv4Addr, lifetime: DateTime<Utc>) -> Self {
        RouteEntry {
            destination,
            dest_seq_no: 0,
            flags: RouteFlags::empty(),
            state: RouteState::InSearch,
            next_hop: None,
            interface: 0,
            hop_count: 0,
            lifetime,
            precursors: HashSet::new(),
        }
    }

    pub fn has_valid_seq_no(&self) -> bool {
        self.flags.contains(RouteFlags::VALID_SEQ_NO)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.state == RouteState::Valid && self.next_hop.is_some() && self.lifetime > now
    }

    /// Forwarding view of a usable entry.
    pub fn route(&self) -> Option<Route> {
        self.next_hop.map(|next_hop| Route {
            destination: self.destination,
            next_hop,
            interface: self.interface,
        })
    }

    /// Remaining lifetime in milliseconds, as advertised in a RREP.
    pub fn remaining_lifetime_ms(&self, now: DateTime<Utc>) -> u32 {
        let remaining = (self.lifetime - now).num_milliseconds();
        if remaining <= 0 {
            0
        } else {
            std::cmp::min(remaining, std::u32::MAX as i64) as u32
        }
    }

    fn accepts(&self, candidate: &RouteEntry) -> bool {
        // RFC(6.7) - (i) the sequence number in the routing table is marked as invalid
        if !self.has_valid_seq_no() {
            return true;
        }
        // RFC(6.7) - (ii) the advertised sequence number is newer
        if seq_newer(candidate.dest_seq_no, self.dest_seq_no) {
            return true;
        }
        if candidate.dest_seq_no != self.dest_seq_no {
            return false;
        }
        // RFC(6.7) - (iii) same sequence number but the route is not active
        if self.state != RouteState::Valid {
            return true;
        }
        // RFC(6.7) - (iv) same sequence number and fewer hops
        if candidate.hop_count < self.hop_count {
            return true;
        }
        //Equal cost: only a refresh through the same neighbor is taken.
        candidate.hop_count == self.hop_count && candidate.next_hop == self.next_hop
    }
}

/// Outcome of `RoutingTable::insert_or_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteUpdate {
    Inserted,
    Updated,
    /// The advertisement was not fresher than the installed route.
    Stale,
}

/// A destination that became unreachable and the sequence number to advertise for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    pub destination: Ipv4Addr,
    pub dest_seq_no: u32,
    pub precursors: HashSet<Ipv4Addr>,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<Ipv4Addr, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, destination: &Ipv4Addr) -> Option<&RouteEntry> {
        self.entries.get(destination)
    }

    pub fn lookup_mut(&mut self, destination: &Ipv4Addr) -> Option<&mut RouteEntry> {
        self.entries.get_mut(destination)
    }

    /// Returns the entry only if it can be used for forwarding right now.
    pub fn lookup_valid(&self, destination: &Ipv4Addr, now: DateTime<Utc>) -> Option<&RouteEntry> {
        self.entries.get(destination).filter(|e| e.is_valid(now))
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Installs `candidate` if it is fresher than the current entry. Precursors of an
    /// existing entry are kept, the candidate's lifetime never shortens a Valid route
    /// through the same next hop.
    pub fn insert_or_update(&mut self, mut candidate: RouteEntry) -> RouteUpdate {
        match self.entries.get_mut(&candidate.destination) {
            None => {
                self.entries.insert(candidate.destination, candidate);
                RouteUpdate::Inserted
            }
            Some(entry) => {
                if !entry.accepts(&candidate) {
                    return RouteUpdate::Stale;
                }
                if entry.state == RouteState::Valid && entry.next_hop == candidate.next_hop {
                    candidate.lifetime = std::cmp::max(candidate.lifetime, entry.lifetime);
                }
                candidate.precursors.extend(entry.precursors.drain());
                *entry = candidate;
                RouteUpdate::Updated
            }
        }
    }

    /// Unconditionally stores `entry`, replacing whatever was there.
    pub fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.destination, entry);
    }

    pub fn remove(&mut self, destination: &Ipv4Addr) -> Option<RouteEntry> {
        self.entries.remove(destination)
    }

    pub fn set_state(&mut self, destination: &Ipv4Addr, state: RouteState) -> bool {
        match self.entries.get_mut(destination) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Extends the lifetime of a Valid route to at least `lifetime`.
    pub fn refresh_lifetime(&mut self, destination: &Ipv4Addr, lifetime: DateTime<Utc>) -> bool {
        match self.entries.get_mut(destination) {
            Some(entry) if entry.state == RouteState::Valid => {
                entry.lifetime = std::cmp::max(entry.lifetime, lifetime);
                true
            }
            _ => false,
        }
    }

    /// Marks the route Invalid, bumps its sequence number so stale advertisements
    /// cannot reinstall it, and clears the next hop. Precursors are kept for error fan-out.
    pub fn invalidate(
        &mut self,
        destination: &Ipv4Addr,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Option<Unreachable> {
        let entry = self.entries.get_mut(destination)?;
        if entry.state == RouteState::Invalid {
            return None;
        }
        let seq = entry.dest_seq_no.wrapping_add(1);
        Some(RoutingTable::mark_invalid(entry, seq, now, delete_period))
    }

    /// Like `invalidate`, but adopts the sequence number advertised in a RERR.
    pub fn invalidate_with_seq(
        &mut self,
        destination: &Ipv4Addr,
        dest_seq_no: u32,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Option<Unreachable> {
        let entry = self.entries.get_mut(destination)?;
        if entry.state == RouteState::Invalid {
            return None;
        }
        let seq = if seq_newer(dest_seq_no, entry.dest_seq_no) {
            dest_seq_no
        } else {
            entry.dest_seq_no
        };
        Some(RoutingTable::mark_invalid(entry, seq, now, delete_period))
    }

    fn mark_invalid(
        entry: &mut RouteEntry,
        dest_seq_no: u32,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Unreachable {
        entry.state = RouteState::Invalid;
        entry.dest_seq_no = dest_seq_no;
        entry.next_hop = None;
        entry.lifetime = now + delete_period;
        Unreachable {
            destination: entry.destination,
            dest_seq_no: entry.dest_seq_no,
            precursors: entry.precursors.clone(),
        }
    }

    /// Invalidates every active route whose next hop is `next_hop`, the route to the
    /// neighbor itself included. Results are ordered by destination.
    pub fn invalidate_next_hop(
        &mut self,
        next_hop: &Ipv4Addr,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Vec<Unreachable> {
        let affected: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|e| e.next_hop.as_ref() == Some(next_hop))
            .filter(|e| e.state == RouteState::Valid || e.state == RouteState::RepairInProgress)
            .map(|e| e.destination)
            .collect();
        self.invalidate_all(affected, now, delete_period)
    }

    /// Invalidates every active route that leaves through `interface`.
    pub fn invalidate_interface(
        &mut self,
        interface: u32,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Vec<Unreachable> {
        let affected: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|e| e.interface == interface && e.next_hop.is_some())
            .filter(|e| e.state == RouteState::Valid || e.state == RouteState::RepairInProgress)
            .map(|e| e.destination)
            .collect();
        self.invalidate_all(affected, now, delete_period)
    }

    fn invalidate_all(
        &mut self,
        mut destinations: Vec<Ipv4Addr>,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Vec<Unreachable> {
        destinations.sort();
        destinations
            .iter()
            .filter_map(|d| self.invalidate(d, now, delete_period))
            .collect()
    }

    /// Expired Valid routes become Invalid for `delete_period`, expired Invalid routes are
    /// removed. Returns the destinations that were invalidated by this sweep.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, delete_period: Duration) -> Vec<Ipv4Addr> {
        self.entries
            .retain(|_, e| !(e.state == RouteState::Invalid && e.lifetime <= now));

        let mut expired: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|e| e.state == RouteState::Valid && e.lifetime <= now)
            .map(|e| e.destination)
            .collect();
        expired.sort();
        for dest in expired.iter() {
            if let Some(entry) = self.entries.get_mut(dest) {
                entry.state = RouteState::Invalid;
                entry.lifetime = now + delete_period;
            }
        }
        expired
    }

    pub fn add_precursor(&mut self, destination: &Ipv4Addr, precursor: Ipv4Addr) -> bool {
        match self.entries.get_mut(destination) {
            Some(entry) => entry.precursors.insert(precursor),
            None => false,
        }
    }

    pub fn precursors_of(&self, destination: &Ipv4Addr) -> Vec<Ipv4Addr> {
        let mut precursors: Vec<Ipv4Addr> = self
            .entries
            .get(destination)
            .map(|e| e.precursors.iter().cloned().collect())
            .unwrap_or_default();
        precursors.sort();
        precursors
    }
}
