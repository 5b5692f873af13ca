//! Cache of (originator, RREQ id) pairs used to process each route request once.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Default)]
pub struct RreqCache {
    entries: HashMap<(Ipv4Addr, u32), DateTime<Utc>>,
}

impl RreqCache {
    pub fn new() -> Self {
        RreqCache {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the pair was recorded and has not expired yet. An expired pair is
    /// evicted on the spot.
    pub fn seen(&mut self, originator: Ipv4Addr, rreq_id: u32, now: DateTime<Utc>) -> bool {
        let key = (originator, rreq_id);
        match self.entries.get(&key) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn record(&mut self, originator: Ipv4Addr, rreq_id: u32, expiry: DateTime<Utc>) {
        let e = self.entries.entry((originator, rreq_id)).or_insert(expiry);
        *e = std::cmp::max(*e, expiry);
    }

    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }
}
