use crate::common::*;
use aodv_router::aodv::messages::{Message, RouteRequest, RreqFlags};
use aodv_router::aodv::Packet;
use aodv_router::logging::create_discard_logger;
use aodv_router::node::{dispatch, Event};

#[test]
fn application_send_starts_discovery() {
    let (a, b) = (addr(1), addr(2));
    let mut net = Network::line(&[a, b], &quiet_config());
    let logger = create_discard_logger();

    let keep_going = dispatch(
        net.node_mut(a),
        Event::Send {
            destination: b,
            payload: b"hi".to_vec(),
        },
        &logger,
    );
    assert!(keep_going);
    net.run_until_idle();

    //B answers for itself
    assert_eq!(net.requests_from(a).len(), 1);
    assert_eq!(net.node(b).host().delivered.len(), 1);
    assert_eq!(net.node(b).host().delivered[0].payload, b"hi".to_vec());
}

#[test]
fn control_frames_are_decoded() {
    let a = addr(1);
    let mut net = Network::line(&[a], &quiet_config());
    let logger = create_discard_logger();

    let rreq = Message::Request(RouteRequest {
        flags: RreqFlags::UNKNOWN_SEQUENCE_NUMBER,
        hop_count: 0,
        rreq_id: 4,
        destination: addr(9),
        dest_seq_no: 0,
        originator: addr(7),
        orig_seq_no: 3,
    });
    let data = rreq.to_bytes().expect("Could not encode message");
    assert!(dispatch(
        net.node_mut(a),
        Event::Control {
            data,
            sender: addr(7),
            interface: IFACE,
            ttl: 4,
        },
        &logger,
    ));
    assert_eq!(net.node(a).stats().rreq_received, 1);

    //Garbage is counted and does not stop the loop
    assert!(dispatch(
        net.node_mut(a),
        Event::Control {
            data: vec![1, 2, 3],
            sender: addr(7),
            interface: IFACE,
            ttl: 4,
        },
        &logger,
    ));
    assert_eq!(net.node(a).stats().malformed_messages, 1);
}

#[test]
fn data_and_failures_reach_the_engine() {
    let (a, b) = (addr(1), addr(2));
    let mut net = Network::line(&[a, b], &quiet_config());
    let logger = create_discard_logger();
    net.node_mut(a).handle_message(
        Message::ReplyAck,
        b,
        IFACE,
        1,
    );
    assert!(net.node(a).neighbors().contains(&b));

    dispatch(
        net.node_mut(a),
        Event::Data {
            packet: Packet::new(b, a, b"for you".to_vec()),
            previous_hop: b,
            interface: IFACE,
        },
        &logger,
    );
    assert_eq!(net.node(a).host().delivered.len(), 1);

    dispatch(
        net.node_mut(a),
        Event::SendFailure {
            next_hop: b,
            packet: None,
        },
        &logger,
    );
    assert!(!net.node(a).neighbors().contains(&b));
    assert!(net
        .node(a)
        .routing_table()
        .lookup_valid(&b, net.now())
        .is_none());
}

#[test]
fn shutdown_stops_the_loop() {
    let a = addr(1);
    let mut net = Network::line(&[a], &quiet_config());
    let logger = create_discard_logger();
    assert!(dispatch(net.node_mut(a), Event::ShowRoutes, &logger));
    assert!(!dispatch(net.node_mut(a), Event::Shutdown, &logger));
}
