use crate::common::*;
use aodv_router::aodv::messages::Message;
use aodv_router::aodv::DiscoveryState;
use chrono::Duration;

fn ms(millis: i64) -> Duration {
    Duration::milliseconds(millis)
}

#[test]
fn discovery_across_a_line() {
    let (a, d) = (addr(1), addr(4));
    let mut net = Network::line(&[addr(1), addr(2), addr(3), addr(4)], &quiet_config());
    net.start();

    net.send(a, d, "hello D");
    net.run_until_idle();

    //One request with the starting TTL and the first broadcast id; the packet waits
    let requests = net.requests_from(a);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0.rreq_id, 1);
    assert_eq!(requests[0].1, 1);
    assert_eq!(net.node(a).queued_packets(&d), 1);
    assert!(net.node(d).host().delivered.is_empty());

    //The second ring reaches D
    net.advance(ms(240));
    let requests = net.requests_from(a);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1, 3);

    let reply_seq = net
        .log
        .iter()
        .filter(|t| t.from == d)
        .find_map(|t| match &t.msg {
            Message::Reply(r) if r.destination == d && !r.is_hello() => Some(r.dest_seq_no),
            _ => None,
        })
        .expect("D did not reply");
    let route = net
        .node(a)
        .routing_table()
        .lookup_valid(&d, net.now())
        .expect("No route to D");
    assert_eq!(route.dest_seq_no, reply_seq);
    assert_eq!(route.next_hop, Some(addr(2)));
    assert_eq!(route.hop_count, 3);
    assert_eq!(net.node(a).discovery_state(&d), DiscoveryState::Found);

    assert_eq!(net.node(a).queued_packets(&d), 0);
    let delivered = &net.node(d).host().delivered;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"hello D".to_vec());
    assert_eq!(delivered[0].source, a);

    //The route is still valid, so no new discovery
    net.advance(ms(2000));
    net.send(a, d, "again");
    net.run_until_idle();
    assert_eq!(net.requests_from(a).len(), 2);
    assert_eq!(net.node(d).host().delivered.len(), 2);
}

#[test]
fn intermediate_node_answers_from_its_table() {
    let (a, b, d, e) = (addr(1), addr(2), addr(4), addr(5));
    let mut net = Network::line(&[a, b, addr(3), d], &quiet_config());
    net.add_node(e, quiet_config());
    net.link(e, b);
    net.start();

    net.send(a, d, "first");
    net.advance(ms(240));
    assert_eq!(net.node(d).host().delivered.len(), 1);

    net.send(e, d, "from E");
    net.run_until_idle();

    //B answered E's first ring on D's behalf
    let own_requests = net
        .requests_from(e)
        .into_iter()
        .filter(|(r, _)| r.originator == e)
        .count();
    assert_eq!(own_requests, 1);
    assert!(net
        .requests_from(b)
        .iter()
        .all(|(r, _)| r.originator != e));

    let route = net
        .node(e)
        .routing_table()
        .lookup_valid(&d, net.now())
        .expect("No route to D");
    assert_eq!(route.next_hop, Some(b));
    assert_eq!(route.hop_count, 3);
    assert_eq!(net.node(d).host().delivered.len(), 2);

    //The gratuitous reply taught D the way back to E
    let back = net
        .node(d)
        .routing_table()
        .lookup_valid(&e, net.now())
        .expect("No route back to E");
    assert_eq!(back.next_hop, Some(addr(3)));
    assert_eq!(back.hop_count, 3);
}

#[test]
fn unreachable_destination_is_reported() {
    let (a, lost) = (addr(1), addr(99));
    let mut net = Network::line(&[a, addr(2)], &quiet_config());
    net.start();

    net.send(a, lost, "anyone?");
    net.advance(ms(5_000));

    assert_eq!(net.node(a).discovery_state(&lost), DiscoveryState::Failed);
    assert_eq!(net.node(a).host().unreachable, vec![lost]);
    assert_eq!(net.node(a).host().dropped.len(), 1);
    assert!(net.node(addr(2)).host().delivered.is_empty());
}
