//! AODV control messages and their binary encoding (RFC 3561, section 5).
//! All multi-byte fields are big endian. The TTL of a message travels in the
//! transport envelope, never in the message body.
use crate::{AodvError, AodvErrorKind};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use slog::{Record, Serializer, KV};
use std::io::{Cursor, Read};
use std::net::Ipv4Addr;

const RREQ_TYPE: u8 = 1;
const RREP_TYPE: u8 = 2;
const RERR_TYPE: u8 = 3;
const RREP_ACK_TYPE: u8 = 4;

const RREQ_SIZE: usize = 24;
const RREP_SIZE: usize = 20;
const RERR_HEADER_SIZE: usize = 4;
const RERR_ENTRY_SIZE: usize = 8;
const RREP_ACK_SIZE: usize = 2;
/// Largest number of unreachable destinations a single RERR can carry.
pub const MAX_RERR_DESTINATIONS: usize = std::u8::MAX as usize;
const PREFIX_SIZE_MASK: u8 = 0b0001_1111;

// **************************************************
// ******************  Messages *********************
// **************************************************
bitflags! {
    #[derive(Default)]
    pub struct RreqFlags: u8 {
        const JOIN = 0b1000_0000;
        const REPAIR = 0b0100_0000;
        const GRATUITOUS_RREP = 0b0010_0000;
        const DESTINATION_ONLY = 0b0001_0000;
        const UNKNOWN_SEQUENCE_NUMBER = 0b0000_1000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct RrepFlags: u8 {
        const REPAIR = 0b1000_0000;
        const ACK_REQUIRED = 0b0100_0000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct RerrFlags: u8 {
        const NO_DELETE = 0b1000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub flags: RreqFlags,
    pub hop_count: u8,
    pub rreq_id: u32,
    pub destination: Ipv4Addr,
    pub dest_seq_no: u32,
    pub originator: Ipv4Addr,
    pub orig_seq_no: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReply {
    pub flags: RrepFlags,
    //Not used for routing decisions. Kept for completeness in accordance to the RFC.
    pub prefix_size: u8,
    pub hop_count: u8,
    pub destination: Ipv4Addr,
    pub dest_seq_no: u32,
    pub originator: Ipv4Addr,
    /// In milliseconds
    pub lifetime: u32,
}

impl RouteReply {
    /// A Hello is a RREP advertising a route to its own sender.
    pub fn is_hello(&self) -> bool {
        self.destination == self.originator
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteError {
    pub flags: RerrFlags,
    /// Unreachable destinations and their sequence numbers, in advertisement order.
    pub destinations: Vec<(Ipv4Addr, u32)>,
}

///Messages used by the AODV protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RouteRequest),
    Reply(RouteReply),
    Error(RouteError),
    ReplyAck,
}

impl Message {
    /// Label used in logs and statistics.
    pub fn label(&self) -> &'static str {
        match self {
            Message::Request(_) => "RREQ",
            Message::Reply(m) if m.is_hello() => "HELLO",
            Message::Reply(_) => "RREP",
            Message::Error(_) => "RERR",
            Message::ReplyAck => "RREP_ACK",
        }
    }

    /// Serializes the message into its wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AodvError> {
        let mut buf = Vec::with_capacity(RREQ_SIZE);
        self.write_into(&mut buf).map_err(|e| {
            let err_msg = format!("Error serializing {} message", self.label());
            AodvError {
                kind: AodvErrorKind::Serialization(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;
        Ok(buf)
    }

    fn write_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Message::Request(m) => {
                buf.write_u8(RREQ_TYPE)?;
                buf.write_u8(m.flags.bits())?;
                buf.write_u8(0)?;
                buf.write_u8(m.hop_count)?;
                buf.write_u32::<BigEndian>(m.rreq_id)?;
                buf.write_u32::<BigEndian>(m.destination.into())?;
                buf.write_u32::<BigEndian>(m.dest_seq_no)?;
                buf.write_u32::<BigEndian>(m.originator.into())?;
                buf.write_u32::<BigEndian>(m.orig_seq_no)?;
            }
            Message::Reply(m) => {
                buf.write_u8(RREP_TYPE)?;
                buf.write_u8(m.flags.bits())?;
                buf.write_u8(m.prefix_size & PREFIX_SIZE_MASK)?;
                buf.write_u8(m.hop_count)?;
                buf.write_u32::<BigEndian>(m.destination.into())?;
                buf.write_u32::<BigEndian>(m.dest_seq_no)?;
                buf.write_u32::<BigEndian>(m.originator.into())?;
                buf.write_u32::<BigEndian>(m.lifetime)?;
            }
            Message::Error(m) => {
                if m.destinations.is_empty() || m.destinations.len() > MAX_RERR_DESTINATIONS {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("RERR must list 1 to {} destinations", MAX_RERR_DESTINATIONS),
                    ));
                }
                buf.write_u8(RERR_TYPE)?;
                buf.write_u8(m.flags.bits())?;
                buf.write_u8(0)?;
                buf.write_u8(m.destinations.len() as u8)?;
                for (dest, seq_no) in m.destinations.iter() {
                    buf.write_u32::<BigEndian>((*dest).into())?;
                    buf.write_u32::<BigEndian>(*seq_no)?;
                }
            }
            Message::ReplyAck => {
                buf.write_u8(RREP_ACK_TYPE)?;
                buf.write_u8(0)?;
            }
        }
        Ok(())
    }

    /// Parses a message from its wire format. The buffer must hold exactly one message.
    pub fn from_bytes(data: &[u8]) -> Result<Message, AodvError> {
        let msg_type = *data.first().ok_or_else(|| malformed("Empty AODV message"))?;
        let expected = match msg_type {
            RREQ_TYPE => RREQ_SIZE,
            RREP_TYPE => RREP_SIZE,
            RREP_ACK_TYPE => RREP_ACK_SIZE,
            RERR_TYPE => {
                if data.len() < RERR_HEADER_SIZE {
                    return Err(malformed("Truncated RERR header"));
                }
                let count = data[3] as usize;
                if count == 0 {
                    return Err(malformed("RERR without destinations"));
                }
                RERR_HEADER_SIZE + count * RERR_ENTRY_SIZE
            }
            t => return Err(malformed(&format!("Unknown AODV message type {}", t))),
        };
        if data.len() != expected {
            return Err(malformed(&format!(
                "Message type {} must be {} bytes, got {}",
                msg_type,
                expected,
                data.len()
            )));
        }

        let mut rdr = Cursor::new(&data[1..]);
        Message::read_body(msg_type, &mut rdr).map_err(|e| AodvError {
            kind: AodvErrorKind::Serialization(String::from("Error deserializing message")),
            cause: Some(Box::new(e)),
        })
    }

    fn read_body<R: Read>(msg_type: u8, rdr: &mut R) -> std::io::Result<Message> {
        let msg = match msg_type {
            RREQ_TYPE => {
                let flags = RreqFlags::from_bits_truncate(rdr.read_u8()?);
                let _reserved = rdr.read_u8()?;
                Message::Request(RouteRequest {
                    flags,
                    hop_count: rdr.read_u8()?,
                    rreq_id: rdr.read_u32::<BigEndian>()?,
                    destination: Ipv4Addr::from(rdr.read_u32::<BigEndian>()?),
                    dest_seq_no: rdr.read_u32::<BigEndian>()?,
                    originator: Ipv4Addr::from(rdr.read_u32::<BigEndian>()?),
                    orig_seq_no: rdr.read_u32::<BigEndian>()?,
                })
            }
            RREP_TYPE => Message::Reply(RouteReply {
                flags: RrepFlags::from_bits_truncate(rdr.read_u8()?),
                prefix_size: rdr.read_u8()? & PREFIX_SIZE_MASK,
                hop_count: rdr.read_u8()?,
                destination: Ipv4Addr::from(rdr.read_u32::<BigEndian>()?),
                dest_seq_no: rdr.read_u32::<BigEndian>()?,
                originator: Ipv4Addr::from(rdr.read_u32::<BigEndian>()?),
                lifetime: rdr.read_u32::<BigEndian>()?,
            }),
            RERR_TYPE => {
                let flags = RerrFlags::from_bits_truncate(rdr.read_u8()?);
                let _reserved = rdr.read_u8()?;
                let count = rdr.read_u8()?;
                let mut destinations = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let dest = Ipv4Addr::from(rdr.read_u32::<BigEndian>()?);
                    let seq_no = rdr.read_u32::<BigEndian>()?;
                    destinations.push((dest, seq_no));
                }
                Message::Error(RouteError { flags, destinations })
            }
            _ => {
                let _reserved = rdr.read_u8()?;
                Message::ReplyAck
            }
        };
        Ok(msg)
    }
}

fn malformed(msg: &str) -> AodvError {
    AodvErrorKind::Serialization(msg.to_string()).into()
}

impl KV for Message {
    fn serialize(&self, _rec: &Record, serializer: &mut dyn Serializer) -> slog::Result {
        serializer.emit_str("msg_type", self.label())?;
        match *self {
            Message::Request(ref m) => {
                serializer.emit_arguments("msg.originator", &format_args!("{}", m.originator))?;
                serializer.emit_arguments("msg.destination", &format_args!("{}", m.destination))?;
                serializer.emit_u8("hop_count", m.hop_count)?;
                serializer.emit_u32("rreq_id", m.rreq_id)
            }
            Message::Reply(ref m) => {
                serializer.emit_arguments("msg.originator", &format_args!("{}", m.originator))?;
                serializer.emit_arguments("msg.destination", &format_args!("{}", m.destination))?;
                serializer.emit_u8("hop_count", m.hop_count)?;
                serializer.emit_u32("dest_seq_no", m.dest_seq_no)
            }
            Message::Error(ref m) => {
                serializer.emit_usize("msg.num_affected_destinations", m.destinations.len())
            }
            Message::ReplyAck => Ok(()),
        }
    }
}
