//! A node process. It drives one AODV engine from a single event loop fed by the
//! socket listeners and the local application.
use crate::aodv::{Aodv, Host, Packet};
use crate::{AodvError, AodvErrorKind};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use slog::Logger;
use std::net::Ipv4Addr;

pub mod node_config;
pub mod timers;
pub mod udp;

use self::node_config::NodeConfig;
use self::udp::UdpHost;

/// Longest the event loop sleeps when no timer is pending.
const IDLE_WAIT_MS: u64 = 1000;

/// Inputs to the event loop.
#[derive(Debug)]
pub enum Event {
    /// A control message frame received on the AODV port.
    Control {
        data: Vec<u8>,
        sender: Ipv4Addr,
        interface: u32,
        ttl: u8,
    },
    /// A data packet received from a neighbor.
    Data {
        packet: Packet,
        previous_hop: Ipv4Addr,
        interface: u32,
    },
    /// A unicast transmission to `next_hop` failed.
    SendFailure {
        next_hop: Ipv4Addr,
        packet: Option<Packet>,
    },
    /// The local application wants to send `payload` to `destination`.
    Send {
        destination: Ipv4Addr,
        payload: Vec<u8>,
    },
    /// Print the routing table.
    ShowRoutes,
    Shutdown,
}

/// Applies `event` to the engine. Returns false when the loop should stop.
pub fn dispatch<H: Host>(engine: &mut Aodv<H>, event: Event, logger: &Logger) -> bool {
    match event {
        Event::Control {
            data,
            sender,
            interface,
            ttl,
        } => {
            //Decoding errors are logged and counted by the engine
            let _res = engine.receive(&data, sender, interface, ttl);
        }
        Event::Data {
            packet,
            previous_hop,
            interface,
        } => engine.route_input(packet, previous_hop, interface),
        Event::SendFailure { next_hop, packet } => engine.handle_send_failure(next_hop, packet),
        Event::Send {
            destination,
            payload,
        } => match engine.interfaces().first().map(|i| i.address) {
            Some(source) => engine.route_output(Packet::new(source, destination, payload)),
            None => {
                error!(logger, "No interface to send from"; "destination" => %destination);
            }
        },
        Event::ShowRoutes => {
            let now = engine.host().now();
            for entry in engine.routing_table().entries() {
                println!(
                    "{}\tvia {}\thops {}\tseq {}\t{:?}\t{}ms",
                    entry.destination,
                    entry
                        .next_hop
                        .map_or_else(|| String::from("-"), |nh| nh.to_string()),
                    entry.hop_count,
                    entry.dest_seq_no,
                    entry.state,
                    entry.remaining_lifetime_ms(now),
                );
            }
        }
        Event::Shutdown => {
            info!(logger, "Shutdown requested");
            return false;
        }
    }
    true
}

/// A running AODV router bound to real interfaces.
pub struct Node {
    name: String,
    engine: Aodv<UdpHost>,
    events: Receiver<Event>,
    sender: Sender<Event>,
    logger: Logger,
}

impl Node {
    /// Resolves the configured interfaces, opens the sockets and builds the engine.
    pub fn new(config: NodeConfig, logger: Logger) -> Result<Node, AodvError> {
        config.validate()?;
        let mut attached = Vec::with_capacity(config.interfaces.len());
        for name in config.interfaces.iter() {
            let a = udp::resolve_interface(name)?;
            info!(logger, "Using interface"; "name" => name, "address" => %a.interface.address, "index" => a.interface.index);
            attached.push(a);
        }

        let (sender, events) = unbounded();
        let host = UdpHost::new(
            attached.clone(),
            config.port,
            config.data_port,
            sender.clone(),
            logger.clone(),
        )?;
        let interfaces = attached.iter().map(|a| a.interface).collect();
        let engine = Aodv::new(config.aodv, host, interfaces, logger.clone())?;

        Ok(Node {
            name: config.node_name,
            engine,
            events,
            sender,
            logger,
        })
    }

    /// Handle for feeding application events into the loop from other threads.
    pub fn event_sender(&self) -> Sender<Event> {
        self.sender.clone()
    }

    pub fn engine(&self) -> &Aodv<UdpHost> {
        &self.engine
    }

    /// Runs the event loop until a `Shutdown` event arrives.
    pub fn run(&mut self) -> Result<(), AodvError> {
        info!(self.logger, "Node started"; "name" => &self.name);
        self.engine.start();

        loop {
            let now = Utc::now();
            while let Some(timer) = self.engine.host_mut().pop_due(now) {
                self.engine.handle_timer(timer);
            }

            let wait = match self.engine.host_mut().next_deadline() {
                Some(deadline) => (deadline - Utc::now())
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_millis(0)),
                None => std::time::Duration::from_millis(IDLE_WAIT_MS),
            };

            match self.events.recv_timeout(wait) {
                Ok(event) => {
                    if !dispatch(&mut self.engine, event, &self.logger) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let err_msg = String::from("Event channel closed");
                    return Err(AodvErrorKind::Node(err_msg).into());
                }
            }
        }

        info!(self.logger, "Node stopped"; "stats" => format!("{:?}", self.engine.stats()));
        Ok(())
    }
}
