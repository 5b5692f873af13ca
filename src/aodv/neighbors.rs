//! Link-neighbor liveness and black-list state.
use crate::aodv::host::TimerHandle;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub address: Ipv4Addr,
    pub interface: u32,
    pub last_heard: DateTime<Utc>,
    pub expire: DateTime<Utc>,
    /// Set while the neighbor may not be used as a next hop.
    pub blacklisted_until: Option<DateTime<Utc>>,
    blacklist_timer: Option<TimerHandle>,
}

#[derive(Debug)]
pub struct Neighbors {
    entries: HashMap<Ipv4Addr, Neighbor>,
    /// How long a neighbor stays alive without being heard from.
    timeout: Duration,
}

impl Neighbors {
    pub fn new(timeout: Duration) -> Self {
        Neighbors {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, addr: &Ipv4Addr) -> Option<&Neighbor> {
        self.entries.get(addr)
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.entries.contains_key(addr)
    }

    /// Records that `addr` was heard from at `now`. A black-list whose period is over
    /// is lifted; an active one stays in place.
    pub fn touch(&mut self, addr: Ipv4Addr, interface: u32, now: DateTime<Utc>) {
        let expire = now + self.timeout;
        let entry = self.entries.entry(addr).or_insert_with(|| Neighbor {
            address: addr,
            interface,
            last_heard: now,
            expire,
            blacklisted_until: None,
            blacklist_timer: None,
        });
        entry.interface = interface;
        entry.last_heard = now;
        entry.expire = std::cmp::max(entry.expire, expire);
        if entry.blacklisted_until.map_or(false, |until| until <= now) {
            entry.blacklisted_until = None;
            entry.blacklist_timer = None;
        }
    }

    /// Forgets the neighbor. The caller is responsible for the route fallout.
    pub fn mark_unreachable(&mut self, addr: &Ipv4Addr) -> Option<Neighbor> {
        self.entries.remove(addr)
    }

    /// Excludes the neighbor from route installation until `until`. Returns the timer
    /// handle of a previous black-list that is now superseded.
    pub fn blacklist(
        &mut self,
        addr: Ipv4Addr,
        interface: u32,
        until: DateTime<Utc>,
        timer: TimerHandle,
        now: DateTime<Utc>,
    ) -> Option<TimerHandle> {
        let timeout = self.timeout;
        let entry = self.entries.entry(addr).or_insert_with(|| Neighbor {
            address: addr,
            interface,
            last_heard: now,
            expire: now + timeout,
            blacklisted_until: None,
            blacklist_timer: None,
        });
        entry.blacklisted_until = Some(until);
        entry.blacklist_timer.replace(timer)
    }

    pub fn is_blacklisted(&self, addr: &Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.entries
            .get(addr)
            .and_then(|n| n.blacklisted_until)
            .map_or(false, |until| until > now)
    }

    /// Lifts the black-list. Returns the pending expiry timer so it can be cancelled.
    pub fn clear_blacklist(&mut self, addr: &Ipv4Addr) -> Option<TimerHandle> {
        let entry = self.entries.get_mut(addr)?;
        entry.blacklisted_until = None;
        entry.blacklist_timer.take()
    }

    /// Neighbors on `interface`, sorted.
    pub fn on_interface(&self, interface: u32) -> Vec<Ipv4Addr> {
        let mut addrs: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|n| n.interface == interface)
            .map(|n| n.address)
            .collect();
        addrs.sort();
        addrs
    }

    /// Removes and returns the neighbors that have not been heard from in time.
    pub fn purge(&mut self, now: DateTime<Utc>) -> Vec<Ipv4Addr> {
        self.purge_except(now, &BTreeSet::new())
    }

    /// Like `purge`, but the addresses in `keep` survive even when silent.
    pub fn purge_except(&mut self, now: DateTime<Utc>, keep: &BTreeSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
        let mut expired: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|n| n.expire <= now && !keep.contains(&n.address))
            .map(|n| n.address)
            .collect();
        expired.sort();
        for addr in expired.iter() {
            self.entries.remove(addr);
        }
        expired
    }
}
