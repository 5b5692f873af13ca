use crate::common::*;
use aodv_router::aodv::messages::{Message, RouteReply, RrepFlags};
use aodv_router::aodv::queue::RequestQueue;
use aodv_router::aodv::route_table::seq_newer;
use aodv_router::aodv::{DropReason, Packet};
use chrono::Duration;
use std::net::Ipv4Addr;

fn ms(millis: i64) -> Duration {
    Duration::milliseconds(millis)
}

fn reply(destination: Ipv4Addr, seq: u32, hop_count: u8, originator: Ipv4Addr) -> Message {
    Message::Reply(RouteReply {
        flags: RrepFlags::empty(),
        prefix_size: 0,
        hop_count,
        destination,
        dest_seq_no: seq,
        originator,
        lifetime: 3_000,
    })
}

#[test]
fn route_sequence_numbers_never_regress() {
    let (a, d) = (addr(1), addr(9));
    let mut net = Network::new();
    net.add_node(a, quiet_config());

    let replies = [
        (10, 3, addr(2)),
        (4, 1, addr(3)),
        (10, 2, addr(3)),
        (11, 5, addr(2)),
        (2, 1, addr(4)),
        (11, 5, addr(4)),
        (15, 6, addr(2)),
        (14, 1, addr(3)),
    ];
    let mut last: Option<u32> = None;
    for (seq, hops, sender) in replies.iter() {
        net.node_mut(a)
            .handle_message(reply(d, *seq, *hops, a), *sender, IFACE, 30);
        let current = net
            .node(a)
            .routing_table()
            .lookup(&d)
            .map(|e| e.dest_seq_no)
            .expect("No route installed");
        if let Some(prev) = last {
            assert!(current == prev || seq_newer(current, prev));
        }
        last = Some(current);
    }
    assert_eq!(last, Some(15));
}

#[test]
fn flooded_request_is_processed_once_per_node() {
    let mut config = quiet_config();
    config.enable_expanding_ring_search = false;
    let ring: Vec<Ipv4Addr> = (1..=6).map(addr).collect();
    let mut net = Network::line(&ring, &config);
    net.link(ring[5], ring[0]);

    let origin = ring[0];
    net.send(origin, addr(99), "nobody");
    net.run_until_idle();

    for node in ring.iter().skip(1) {
        let forwarded = net
            .requests_from(*node)
            .iter()
            .filter(|(r, _)| r.originator == origin && r.rreq_id == 1)
            .count();
        assert_eq!(forwarded, 1, "node {} forwarded {} times", node, forwarded);
    }
    assert_eq!(net.requests_from(origin).len(), 1);
}

#[test]
fn queue_evicts_oldest_and_drains_in_order() {
    let now = start_time();
    let mut queue = RequestQueue::new(3, 3, Duration::seconds(30));
    let packet = |dest: u8, n: u8| Packet::new(addr(1), addr(dest), vec![n]);

    let mut evicted = Vec::new();
    for (i, dest) in [9, 8, 9, 8, 9].iter().enumerate() {
        let at = now + ms(i as i64);
        evicted.extend(queue.enqueue(packet(*dest, i as u8), at));
    }
    assert_eq!(
        evicted,
        vec![
            (packet(9, 0), DropReason::QueueFull),
            (packet(8, 1), DropReason::QueueFull),
        ]
    );
    assert_eq!(queue.drain(&addr(9)), vec![packet(9, 2), packet(9, 4)]);
    assert_eq!(queue.drain(&addr(8)), vec![packet(8, 3)]);
    assert!(queue.is_empty());
}

#[test]
fn exhausted_discovery_stays_quiet_until_new_traffic() {
    let (a, lost) = (addr(1), addr(99));
    let mut net = Network::line(&[a, addr(2)], &quiet_config());
    net.start();

    net.send(a, lost, "one");
    net.send(a, lost, "two");
    net.advance(ms(5_000));
    assert_eq!(net.requests_from(a).len(), 2);
    let dropped: Vec<DropReason> = net.node(a).host().dropped.iter().map(|(_, r)| *r).collect();
    assert_eq!(dropped, vec![DropReason::DiscoveryFailed, DropReason::DiscoveryFailed]);

    net.advance(ms(10_000));
    assert_eq!(net.requests_from(a).len(), 2);

    net.send(a, lost, "three");
    net.run_until_idle();
    let requests = net.requests_from(a);
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].1, 1);
}

#[test]
fn ring_search_ttl_grows_then_clamps() {
    let mut config = quiet_config();
    config.rreq_retries = 6;
    let a = addr(1);
    let mut net = Network::new();
    net.add_node(a, config);

    net.send(a, addr(99), "far away");
    net.advance(ms(60_000));

    let ttls: Vec<u8> = net.requests_from(a).iter().map(|(_, ttl)| *ttl).collect();
    assert_eq!(ttls, vec![1, 3, 5, 7, 35, 35]);
}
