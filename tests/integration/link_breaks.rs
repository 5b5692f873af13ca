use crate::common::*;
use aodv_router::aodv::messages::RerrFlags;
use aodv_router::aodv::route_table::RouteState;
use aodv_router::aodv::{AodvConfig, DiscoveryState, DropReason};
use chrono::Duration;
use std::net::Ipv4Addr;

fn ms(millis: i64) -> Duration {
    Duration::milliseconds(millis)
}

#[test]
fn broken_next_hop_sends_one_error_to_all_precursors() {
    let (a, b, c, d, e) = (addr(1), addr(2), addr(3), addr(4), addr(5));
    let mut config = quiet_config();
    config.enable_local_repair = false;
    let mut net = Network::line(&[a, b, c, d], &config);
    net.add_node(e, config);
    net.link(e, b);
    net.start();

    //Both A and E reach D through B
    net.send(a, d, "from A");
    net.advance(ms(240));
    net.send(e, d, "from E");
    net.run_until_idle();
    assert_eq!(net.node(d).host().delivered.len(), 2);
    assert_eq!(net.node(b).routing_table().precursors_of(&d), vec![a, e]);

    net.unlink(b, c);
    net.send(a, d, "lost");
    net.run_until_idle();

    let errors = net.errors_from(b);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, Ipv4Addr::BROADCAST);
    let listed: Vec<Ipv4Addr> = errors[0].0.destinations.iter().map(|(dst, _)| *dst).collect();
    assert_eq!(listed, vec![c, d]);

    assert_eq!(net.node(b).host().dropped.len(), 1);
    assert_eq!(net.node(b).host().dropped[0].1, DropReason::LinkBroken);
    let now = net.now();
    assert!(net.node(a).routing_table().lookup_valid(&d, now).is_none());
    assert!(net.node(e).routing_table().lookup_valid(&d, now).is_none());
    //Neither A nor E has precursors for D, so the error stops there
    assert!(net.errors_from(a).is_empty());
    assert!(net.errors_from(e).is_empty());
}

#[test]
fn silent_neighbor_is_detected_through_hello_loss() {
    let (s, a, n, d) = (addr(5), addr(1), addr(2), addr(3));
    let mut net = Network::line(&[s, a, n, d], &AodvConfig::default());
    net.start();
    net.advance(ms(1_500));
    assert!(net.node(a).neighbors().contains(&n));

    net.send(s, d, "via N");
    net.advance(ms(300));
    assert_eq!(net.node(d).host().delivered.len(), 1);

    //N goes quiet
    net.unlink(a, n);
    net.unlink(n, d);
    net.advance(ms(4_000));

    assert!(!net.node(a).neighbors().contains(&n));
    assert_eq!(
        net.node(a).routing_table().lookup(&d).map(|e| e.state),
        Some(RouteState::Invalid)
    );
    let errors = net.errors_from(a);
    assert!(!errors.is_empty());
    assert!(errors[0].0.destinations.iter().any(|(dst, _)| *dst == d));
    assert!(net
        .node(s)
        .routing_table()
        .lookup_valid(&d, net.now())
        .is_none());
}

#[test]
fn local_repair_reroutes_transit_traffic() {
    let (s, a, b, d, x) = (addr(5), addr(1), addr(2), addr(3), addr(4));
    let mut net = Network::line(&[s, a, b, d], &quiet_config());
    net.add_node(x, quiet_config());
    net.link(a, x);
    net.start();

    net.send(s, d, "first");
    net.advance(ms(240));
    assert_eq!(net.node(d).host().delivered.len(), 1);
    assert_eq!(
        net.node(a).routing_table().lookup(&d).and_then(|e| e.next_hop),
        Some(b)
    );

    //B loses D, but D is now reachable around it
    net.unlink(b, d);
    net.link(x, d);
    net.send(s, d, "second");
    net.run_until_idle();

    assert_eq!(net.node(d).host().delivered.len(), 2);
    assert_eq!(net.node(b).discovery_state(&d), DiscoveryState::Found);
    assert_eq!(
        net.node(a).routing_table().lookup(&d).and_then(|e| e.next_hop),
        Some(x)
    );
    //The repaired path is longer, which B announces without tearing routes down
    let errors = net.errors_from(b);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.flags.contains(RerrFlags::NO_DELETE));
    assert!(net
        .node(s)
        .routing_table()
        .lookup_valid(&d, net.now())
        .is_some());
}
