//! `Host` implementation over UDP sockets on real network interfaces.
//! Control messages travel on the AODV port inside a one-byte TTL envelope. Data packets
//! travel on a separate port, encoded with CBOR.
use crate::aodv::messages::Message;
use crate::aodv::{DropReason, Host, Interface, Packet, Route, Timer, TimerHandle};
use crate::logging::MessageStatus;
use crate::node::timers::TimerQueue;
use crate::node::Event;
use crate::{AodvError, AodvErrorKind};
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::Sender;
use ipnetwork::{IpNetwork, Ipv4Network};
use pnet_datalink as datalink;
use slog::Logger;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread::{self, JoinHandle};

const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// A local interface and the IPv4 network it is attached to.
#[derive(Debug, Clone, Copy)]
pub struct AttachedInterface {
    pub interface: Interface,
    pub network: Ipv4Network,
}

/// Resolves an OS network interface by name. The first IPv4 address of the NIC is used.
pub fn resolve_interface(name: &str) -> Result<AttachedInterface, AodvError> {
    for iface in datalink::interfaces() {
        if iface.name != name {
            continue;
        }
        for address in iface.ips.iter() {
            match address {
                IpNetwork::V4(net) => {
                    return Ok(AttachedInterface {
                        interface: Interface {
                            index: iface.index,
                            address: net.ip(),
                            broadcast: net.broadcast(),
                        },
                        network: *net,
                    })
                }
                IpNetwork::V6(_addr) => {
                    /* AODV runs over IPv4 */
                }
            }
        }
    }
    let err_msg = format!("Network interface {} not found or has no IPv4 address.", name);
    Err(AodvErrorKind::Configuration(err_msg).into())
}

fn interface_for(interfaces: &[AttachedInterface], sender: &Ipv4Addr) -> Option<u32> {
    interfaces
        .iter()
        .find(|a| a.network.contains(*sender))
        .map(|a| a.interface.index)
}

/// Creates a broadcast-capable UDP socket bound to `port` on all addresses.
pub fn new_socket(port: u16) -> Result<Socket, AodvError> {
    let networking = |msg: String| move |e: io::Error| AodvError {
        kind: AodvErrorKind::Networking(msg),
        cause: Some(Box::new(e)),
    };

    let sock = Socket::new(Domain::ipv4(), Type::dgram(), Some(Protocol::udp()))
        .map_err(networking(String::from("Failed to create new socket")))?;
    sock.set_reuse_address(true)
        .map_err(networking(String::from("Failed to configure socket")))?;
    sock.set_broadcast(true)
        .map_err(networking(String::from("Failed to configure socket")))?;
    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    sock.bind(&SockAddr::from(address))
        .map_err(networking(format!("Could not bind socket to address {}", &address)))?;
    Ok(sock)
}

fn clone_socket(sock: &Socket) -> Result<Socket, AodvError> {
    sock.try_clone().map_err(|e| AodvError {
        kind: AodvErrorKind::Networking(String::from("Failed to clone socket")),
        cause: Some(Box::new(e)),
    })
}

/// Read errors worth retrying. Anything else ends the listener.
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => false,
    }
}

/// Reads control frames from `sock` and posts them to the event loop until the loop goes away.
pub fn spawn_control_listener(
    sock: Socket,
    interfaces: Vec<AttachedInterface>,
    events: Sender<Event>,
    logger: Logger,
) -> JoinHandle<()> {
    let own: Vec<Ipv4Addr> = interfaces.iter().map(|a| a.interface.address).collect();
    thread::spawn(move || {
        let mut buffer = vec![0; MAX_UDP_PAYLOAD_SIZE + 1];
        loop {
            let (bytes_read, peer) = match sock.recv_from(&mut buffer) {
                Ok(r) => r,
                Err(ref e) if is_transient(e) => continue,
                Err(e) => {
                    error!(logger, "Control listener stopped"; "reason" => %e);
                    break;
                }
            };
            let sender = match peer.as_inet() {
                Some(addr) => *addr.ip(),
                None => continue,
            };
            //Our own broadcasts loop back
            if own.contains(&sender) || bytes_read < 2 {
                continue;
            }
            let interface = match interface_for(&interfaces, &sender) {
                Some(i) => i,
                None => {
                    debug!(logger, "Message from outside attached networks"; "source" => %sender);
                    continue;
                }
            };
            let event = Event::Control {
                data: buffer[1..bytes_read].to_vec(),
                sender,
                interface,
                ttl: buffer[0],
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Reads data packets from `sock` and posts them to the event loop.
pub fn spawn_data_listener(
    sock: Socket,
    interfaces: Vec<AttachedInterface>,
    events: Sender<Event>,
    logger: Logger,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = vec![0; MAX_UDP_PAYLOAD_SIZE + 1];
        loop {
            let (bytes_read, peer) = match sock.recv_from(&mut buffer) {
                Ok(r) => r,
                Err(ref e) if is_transient(e) => continue,
                Err(e) => {
                    error!(logger, "Data listener stopped"; "reason" => %e);
                    break;
                }
            };
            let previous_hop = match peer.as_inet() {
                Some(addr) => *addr.ip(),
                None => continue,
            };
            let interface = match interface_for(&interfaces, &previous_hop) {
                Some(i) => i,
                None => continue,
            };
            let packet: Packet = match serde_cbor::from_slice(&buffer[..bytes_read]) {
                Ok(p) => p,
                Err(e) => {
                    error!(logger, "Failed reading packet"; "reason" => %e, "source" => %previous_hop);
                    continue;
                }
            };
            let event = Event::Data {
                packet,
                previous_hop,
                interface,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Host backed by UDP sockets and the system clock.
pub struct UdpHost {
    control: Socket,
    data: Socket,
    port: u16,
    data_port: u16,
    interfaces: Vec<AttachedInterface>,
    timers: TimerQueue<Timer>,
    /// Send failures are reported back through the event loop.
    events: Sender<Event>,
    logger: Logger,
}

impl UdpHost {
    /// Opens the control and data sockets and starts their listener threads.
    pub fn new(
        interfaces: Vec<AttachedInterface>,
        port: u16,
        data_port: u16,
        events: Sender<Event>,
        logger: Logger,
    ) -> Result<UdpHost, AodvError> {
        let control = new_socket(port)?;
        let data = new_socket(data_port)?;
        let _control_listener = spawn_control_listener(
            clone_socket(&control)?,
            interfaces.clone(),
            events.clone(),
            logger.clone(),
        );
        let _data_listener = spawn_data_listener(
            clone_socket(&data)?,
            interfaces.clone(),
            events.clone(),
            logger.clone(),
        );
        info!(logger, "Sockets ready"; "port" => port, "data_port" => data_port);

        Ok(UdpHost {
            control,
            data,
            port,
            data_port,
            interfaces,
            timers: TimerQueue::new(),
            events,
            logger,
        })
    }

    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Timer> {
        self.timers.pop_due(now).map(|(_, timer)| timer)
    }

    fn broadcast_address(&self, interface: u32) -> Option<Ipv4Addr> {
        self.interfaces
            .iter()
            .find(|a| a.interface.index == interface)
            .map(|a| a.interface.broadcast)
    }
}

impl Host for UdpHost {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn send(&mut self, msg: &Message, destination: Ipv4Addr, interface: u32, ttl: u8) {
        let data = match msg.to_bytes() {
            Ok(d) => d,
            Err(e) => {
                error!(self.logger, "Could not encode message"; "reason" => %e);
                return;
            }
        };
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(ttl);
        frame.extend_from_slice(&data);

        let target = if destination == Ipv4Addr::BROADCAST {
            match self.broadcast_address(interface) {
                Some(b) => b,
                None => {
                    warn!(self.logger, "Unknown interface"; "index" => interface);
                    return;
                }
            }
        } else {
            destination
        };
        let addr = SocketAddr::V4(SocketAddrV4::new(target, self.port));
        if let Err(e) = self.control.send_to(&frame, &SockAddr::from(addr)) {
            warn!(self.logger, "Failed to send message"; "destination" => %target, "reason" => %e);
            if destination != Ipv4Addr::BROADCAST {
                let _res = self.events.send(Event::SendFailure {
                    next_hop: destination,
                    packet: None,
                });
            }
        }
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.timers.schedule(Utc::now() + delay, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    fn deliver_locally(&mut self, packet: Packet) {
        info!(
            self.logger,
            "Packet delivered";
            "source" => %packet.source,
            "size" => packet.payload.len(),
            "status" => MessageStatus::ACCEPTED,
        );
        println!(
            "[{}] {}",
            packet.source,
            String::from_utf8_lossy(&packet.payload)
        );
    }

    fn forward(&mut self, packet: Packet, route: Route) {
        let data = match serde_cbor::to_vec(&packet) {
            Ok(d) => d,
            Err(e) => {
                error!(self.logger, "Could not encode packet"; "reason" => %e);
                return;
            }
        };
        let addr = SocketAddr::V4(SocketAddrV4::new(route.next_hop, self.data_port));
        match self.data.send_to(&data, &SockAddr::from(addr)) {
            Ok(_) => {
                debug!(
                    self.logger,
                    "Packet sent";
                    "destination" => %packet.destination,
                    "next_hop" => %route.next_hop,
                    "status" => MessageStatus::SENT,
                );
            }
            Err(e) => {
                warn!(self.logger, "Failed to send packet"; "next_hop" => %route.next_hop, "reason" => %e);
                let _res = self.events.send(Event::SendFailure {
                    next_hop: route.next_hop,
                    packet: Some(packet),
                });
            }
        }
    }

    fn packet_dropped(&mut self, packet: Packet, reason: DropReason) {
        debug!(
            self.logger,
            "Host notified of drop";
            "destination" => %packet.destination,
            "reason" => %reason,
        );
    }

    fn destination_unreachable(&mut self, destination: Ipv4Addr) {
        eprintln!("Destination {} is unreachable", destination);
    }
}
