//! A "drop-front" queue buffering data packets while their route is being resolved.
use crate::aodv::host::{DropReason, Packet};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPacket {
    pub packet: Packet,
    pub enqueued: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RequestQueue {
    packets: VecDeque<QueuedPacket>,
    max_len: usize,
    max_len_per_destination: usize,
    max_age: Duration,
}

impl RequestQueue {
    pub fn new(max_len: usize, max_len_per_destination: usize, max_age: Duration) -> Self {
        RequestQueue {
            packets: VecDeque::new(),
            max_len,
            max_len_per_destination: std::cmp::min(max_len_per_destination, max_len),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len_for(&self, destination: &Ipv4Addr) -> usize {
        self.packets
            .iter()
            .filter(|q| &q.packet.destination == destination)
            .count()
    }

    pub fn contains(&self, destination: &Ipv4Addr) -> bool {
        self.packets
            .iter()
            .any(|q| &q.packet.destination == destination)
    }

    /// Admits `packet`, returning whatever had to be evicted to make room.
    pub fn enqueue(&mut self, packet: Packet, now: DateTime<Utc>) -> Vec<(Packet, DropReason)> {
        let mut dropped: Vec<(Packet, DropReason)> = self
            .sweep_expired(now)
            .into_iter()
            .map(|p| (p, DropReason::QueueTimeout))
            .collect();

        if self.max_len == 0 {
            dropped.push((packet, DropReason::QueueFull));
            return dropped;
        }

        let destination = packet.destination;
        if self.len_for(&destination) >= self.max_len_per_destination {
            let pos = self
                .packets
                .iter()
                .position(|q| q.packet.destination == destination);
            if let Some(q) = pos.and_then(|i| self.packets.remove(i)) {
                dropped.push((q.packet, DropReason::QueueFull));
            }
        } else if self.packets.len() >= self.max_len {
            if let Some(q) = self.packets.pop_front() {
                dropped.push((q.packet, DropReason::QueueFull));
            }
        }

        self.packets.push_back(QueuedPacket {
            packet,
            enqueued: now,
        });
        dropped
    }

    /// Removes every packet buffered for `destination`, oldest first.
    pub fn drain(&mut self, destination: &Ipv4Addr) -> Vec<Packet> {
        let (matching, rest): (VecDeque<QueuedPacket>, VecDeque<QueuedPacket>) = self
            .packets
            .drain(..)
            .partition(|q| &q.packet.destination == destination);
        self.packets = rest;
        matching.into_iter().map(|q| q.packet).collect()
    }

    /// Same as `drain`; named for the failure path.
    pub fn drop_destination(&mut self, destination: &Ipv4Addr) -> Vec<Packet> {
        self.drain(destination)
    }

    /// Removes packets older than the maximum queue time.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Packet> {
        let max_age = self.max_age;
        let (expired, rest): (VecDeque<QueuedPacket>, VecDeque<QueuedPacket>) = self
            .packets
            .drain(..)
            .partition(|q| now - q.enqueued >= max_age);
        self.packets = rest;
        expired.into_iter().map(|q| q.packet).collect()
    }
}
