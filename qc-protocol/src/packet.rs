//! Client wire: length-prefixed XML packets
//!
//! ```text
//! ┌──────────────────┬────────────────────────────────────────────┐
//! │ Length (2 bytes) │ Payload (Length bytes)                     │
//! │ Big-endian u16   │ UTF-8 <packet id="origin#seq" re="..">..   │
//! └──────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! Every child of `<packet>` is one command element, resolved through the
//! [`CommandRegistry`]. Children that fail to decode are dropped; a packet
//! with no usable command is discarded as a whole and the codec moves on to
//! the next frame.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};
use xmltree::{Element, XMLNode};

use crate::command::{Command, CommandRegistry};
use crate::error::PacketError;
use crate::xml;

/// Size of the big-endian length prefix
pub const HEADER_LEN: usize = 2;

/// Largest payload the length prefix can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const PACKET_ELEMENT: &str = "packet";

// ============================================================================
// Packet ids
// ============================================================================

/// Packet identifier: `<origin>#<sequence>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub origin: String,
    pub sequence: u64,
}

impl PacketId {
    pub fn new(origin: impl Into<String>, sequence: u64) -> Self {
        Self {
            origin: origin.into(),
            sequence,
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

impl FromStr for PacketId {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, sequence) = s
            .rsplit_once('#')
            .ok_or_else(|| PacketError::InvalidId(s.to_string()))?;
        if origin.is_empty() {
            return Err(PacketError::InvalidId(s.to_string()));
        }
        let sequence = sequence
            .parse()
            .map_err(|_| PacketError::InvalidId(s.to_string()))?;
        Ok(Self::new(origin, sequence))
    }
}

// ============================================================================
// Packets
// ============================================================================

/// A decoded packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: PacketId,
    pub reply_to: Option<PacketId>,
    pub commands: Vec<Command>,
}

/// A packet waiting to be encoded; the codec assigns its id
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPacket {
    pub reply_to: Option<PacketId>,
    pub commands: Vec<Command>,
}

impl OutgoingPacket {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            reply_to: None,
            commands,
        }
    }

    /// Packet answering `request`
    pub fn reply(request: &PacketId, commands: Vec<Command>) -> Self {
        Self {
            reply_to: Some(request.clone()),
            commands,
        }
    }

    /// Packet carrying one command
    pub fn single(command: impl Into<Command>) -> Self {
        Self::new(vec![command.into()])
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Split `commands` into packets that each fit one frame
    ///
    /// A packet is closed once it holds `max_commands` commands or when the
    /// next command would push its payload past [`MAX_PAYLOAD_LEN`] under any
    /// sequence number of `origin`. A command too large for a packet of its
    /// own is dropped.
    pub fn pack(origin: &str, commands: Vec<Command>, max_commands: usize) -> Vec<OutgoingPacket> {
        let max_commands = max_commands.max(1);
        let budget = MAX_PAYLOAD_LEN.saturating_sub(envelope_len(origin));

        let mut packets = Vec::new();
        let mut current = Vec::new();
        let mut used = 0;
        for command in commands {
            let size = match xml::write_compact(&command.to_element()) {
                Ok(text) => text.len(),
                Err(e) => {
                    warn!(command = command.name(), error = %e, "Command cannot be serialized, dropped");
                    continue;
                }
            };
            if size > budget {
                warn!(command = command.name(), size, "Command too large for a packet, dropped");
                continue;
            }
            if !current.is_empty() && (current.len() == max_commands || used + size > budget) {
                packets.push(Self::new(std::mem::take(&mut current)));
                used = 0;
            }
            used += size;
            current.push(command);
        }
        if !current.is_empty() {
            packets.push(Self::new(current));
        }
        packets
    }
}

/// Bytes of `<packet id="..."></packet>` for the longest id of `origin`
fn envelope_len(origin: &str) -> usize {
    let mut root = Element::new(PACKET_ELEMENT);
    root.attributes
        .insert("id".to_string(), PacketId::new(origin, u64::MAX).to_string());
    let open = xml::write_compact(&root).map_or(MAX_PAYLOAD_LEN, |text| text.len());
    open + PACKET_ELEMENT.len() + "</>".len()
}

// ============================================================================
// PacketCodec
// ============================================================================

/// Frames packets for one connection
///
/// Each codec numbers its outgoing packets independently starting at 1.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    self_id: String,
    sequence: u64,
    registry: Arc<CommandRegistry>,
}

impl PacketCodec {
    pub fn new(self_id: impl Into<String>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            self_id: self_id.into(),
            sequence: 0,
            registry,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Id of the last packet encoded, if any
    pub fn last_id(&self) -> Option<PacketId> {
        (self.sequence > 0).then(|| PacketId::new(self.self_id.clone(), self.sequence))
    }

    /// Serialize `packet` into its payload text under the next sequence id
    pub fn encode_payload(&mut self, packet: &OutgoingPacket) -> Result<(PacketId, String), PacketError> {
        let id = PacketId::new(self.self_id.clone(), self.sequence + 1);
        if packet.is_empty() {
            return Err(PacketError::Empty(id.to_string()));
        }

        let mut root = Element::new(PACKET_ELEMENT);
        root.attributes.insert("id".to_string(), id.to_string());
        if let Some(reply_to) = &packet.reply_to {
            root.attributes.insert("re".to_string(), reply_to.to_string());
        }
        for command in &packet.commands {
            command.validate()?;
            root.children.push(XMLNode::Element(command.to_element()));
        }

        let payload = xml::write_compact(&root).map_err(PacketError::Serialize)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::TooLarge(payload.len()));
        }

        self.sequence += 1;
        Ok((id, payload))
    }

    /// Encode `packet` into a complete frame
    pub fn encode_frame(&mut self, packet: &OutgoingPacket) -> Result<Vec<u8>, PacketError> {
        let mut frame = BytesMut::new();
        self.encode(packet.clone(), &mut frame)?;
        Ok(frame.to_vec())
    }

    /// Decode one payload (without its length prefix)
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Packet, PacketError> {
        let text = std::str::from_utf8(payload).map_err(|_| PacketError::InvalidUtf8)?;
        let mut root = Element::parse(text.as_bytes()).map_err(|e| PacketError::Xml(e.to_string()))?;
        xml::strip_namespaces(&mut root);

        if root.name != PACKET_ELEMENT {
            return Err(PacketError::UnexpectedRoot(root.name));
        }

        let id: PacketId = xml::attribute(&root, "id")
            .ok_or(PacketError::MissingId)?
            .parse()?;
        let reply_to = match xml::attribute(&root, "re") {
            None => None,
            Some(raw) => match raw.parse::<PacketId>() {
                Ok(reply_to) => Some(reply_to),
                Err(e) => {
                    warn!(packet = %id, error = %e, "Ignoring malformed reply-to id");
                    None
                }
            },
        };

        let commands: Vec<Command> = xml::child_elements(&root)
            .filter_map(|child| self.registry.decode(child))
            .collect();
        if commands.is_empty() {
            return Err(PacketError::Empty(id.to_string()));
        }

        Ok(Packet {
            id,
            reply_to,
            commands,
        })
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        loop {
            if buf.len() < HEADER_LEN {
                buf.reserve(HEADER_LEN - buf.len());
                return Ok(None);
            }

            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if buf.len() < HEADER_LEN + length {
                buf.reserve(HEADER_LEN + length - buf.len());
                return Ok(None);
            }

            buf.advance(HEADER_LEN);
            let payload = buf.split_to(length);
            match self.decode_payload(&payload) {
                Ok(packet) => {
                    trace!(packet = %packet.id, commands = packet.commands.len(), "Decoded packet");
                    return Ok(Some(packet));
                }
                Err(e) => warn!(error = %e, length, "Discarding packet"),
            }
        }
    }
}

impl Encoder<OutgoingPacket> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: OutgoingPacket, dst: &mut BytesMut) -> Result<(), PacketError> {
        let (id, payload) = self.encode_payload(&packet)?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u16(payload.len() as u16);
        dst.put_slice(payload.as_bytes());
        trace!(packet = %id, length = payload.len(), "Encoded packet");
        Ok(())
    }
}
