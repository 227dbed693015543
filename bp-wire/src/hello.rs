use std::{net::Ipv4Addr, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::vtime;

/// Message type of a HELLO message on the wire.
pub const HELLO_MESSAGE: u8 = 1;

/// Length of the packet header in bytes.
pub const PACKET_HEADER_LEN: usize = 4;

/// Length of a message header in bytes.
pub const MESSAGE_HEADER_LEN: usize = 12;

/// Length of the fixed part of a HELLO body in bytes.
pub const HELLO_FIXED_LEN: usize = 26;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid packet length: {0}")]
    PacketLength(usize),
    #[error("Invalid message size: {0}")]
    MessageSize(usize),
    #[error("Truncated {what}: need {need} bytes, have {have}")]
    Truncated { what: &'static str, need: usize, have: usize },
    #[error("Invalid willingness: {0}")]
    Willingness(u8),
    #[error("Non-finite position ({x}, {y})")]
    Position { x: f64, y: f64 },
    #[error("Too many interfaces: {0}")]
    TooManyInterfaces(usize),
    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),
}

/// How willing a node is to carry traffic for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Willingness {
    Never = 0,
    Low = 1,
    #[default]
    Default = 3,
    High = 6,
    Always = 7,
}

impl TryFrom<u8> for Willingness {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Never),
            1 => Ok(Self::Low),
            3 => Ok(Self::Default),
            6 => Ok(Self::High),
            7 => Ok(Self::Always),
            _ => Err(value),
        }
    }
}

/// A control packet: a header followed by one or more messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Per-interface packet sequence number.
    pub seq: u16,
    pub messages: Vec<Message>,
}

impl Packet {
    /// Creates a packet carrying a single message.
    pub fn single(seq: u16, message: Message) -> Self {
        Self { seq, messages: vec![message] }
    }

    /// Returns the encoded length of the packet in bytes.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.messages.iter().map(Message::encoded_len).sum::<usize>()
    }

    /// Iterates over the HELLO messages in this packet together with their headers.
    pub fn hellos(&self) -> impl Iterator<Item = (&MessageHeader, &Hello)> {
        self.messages.iter().filter_map(|m| match &m.body {
            MessageBody::Hello(hello) => Some((&m.header, hello)),
            MessageBody::Unknown { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    /// Creates a HELLO message. HELLOs are never forwarded, so `ttl` is 1 and `hop_count` 0.
    pub fn hello(originator: Ipv4Addr, seq: u16, vtime: Duration, hello: Hello) -> Self {
        Self {
            header: MessageHeader {
                kind: HELLO_MESSAGE,
                vtime,
                originator,
                ttl: 1,
                hop_count: 0,
                seq,
            },
            body: MessageBody::Hello(hello),
        }
    }

    /// Returns the encoded length of the message in bytes, header included.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.body.encoded_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// The message type.
    pub kind: u8,
    /// How long the receiver should consider the information valid.
    pub vtime: Duration,
    /// Main address of the node that created the message.
    pub originator: Ipv4Addr,
    pub ttl: u8,
    pub hop_count: u8,
    /// Message sequence number.
    pub seq: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Hello(Hello),
    /// A message type this implementation doesn't understand, kept opaque.
    Unknown { kind: u8, payload: Bytes },
}

impl MessageBody {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Hello(hello) => hello.encoded_len(),
            Self::Unknown { payload, .. } => payload.len(),
        }
    }
}

/// Link-sensing and backlog advertisement sent periodically by every node.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub willingness: Willingness,
    /// Total backlog of the sender, in packets.
    pub queue_length: u32,
    /// Address of the interface the HELLO was sent on.
    pub addr: Ipv4Addr,
    pub x: f64,
    pub y: f64,
    /// Backlog per sender interface, saturating at [`MAX_REPORTED`](crate::MAX_REPORTED).
    /// [`UNREPORTED`](crate::UNREPORTED) marks an interface that is down.
    pub iface_queues: Vec<u8>,
}

impl Hello {
    /// Returns the encoded length of the HELLO body in bytes.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HELLO_FIXED_LEN + self.iface_queues.len()
    }

    fn decode(mut src: BytesMut) -> Result<Self, Error> {
        if src.len() < HELLO_FIXED_LEN {
            return Err(Error::Truncated { what: "hello", need: HELLO_FIXED_LEN, have: src.len() });
        }

        let willingness = src.get_u8();
        let willingness = Willingness::try_from(willingness).map_err(Error::Willingness)?;
        let queue_length = src.get_u32();
        let addr = Ipv4Addr::from(src.get_u32());
        let x = src.get_f64();
        let y = src.get_f64();
        if !x.is_finite() || !y.is_finite() {
            return Err(Error::Position { x, y });
        }

        let n = src.get_u8() as usize;
        if src.len() < n {
            return Err(Error::Truncated { what: "hello interfaces", need: n, have: src.len() });
        }

        let iface_queues = src.split_to(n).to_vec();

        Ok(Self { willingness, queue_length, addr, x, y, iface_queues })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.willingness as u8);
        dst.put_u32(self.queue_length);
        dst.put_u32(u32::from(self.addr));
        dst.put_f64(self.x);
        dst.put_f64(self.y);
        dst.put_u8(self.iface_queues.len() as u8);
        dst.put_slice(&self.iface_queues);
    }
}

/// Datagram codec for control packets.
///
/// Every decode error consumes the offending bytes, so a malformed datagram never poisons the
/// next one read from the same socket.
#[derive(Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }

    fn decode_message(src: &mut BytesMut) -> Result<Message, Error> {
        if src.len() < MESSAGE_HEADER_LEN {
            return Err(Error::Truncated {
                what: "message header",
                need: MESSAGE_HEADER_LEN,
                have: src.len(),
            });
        }

        let kind = src.get_u8();
        let vtime = vtime::decode(src.get_u8());
        let size = src.get_u16() as usize;
        if size < MESSAGE_HEADER_LEN {
            return Err(Error::MessageSize(size));
        }

        // The first 4 header bytes are already consumed.
        let rest = size - 4;
        if src.len() < rest {
            return Err(Error::Truncated { what: "message", need: rest, have: src.len() });
        }

        let mut message = src.split_to(rest);
        let originator = Ipv4Addr::from(message.get_u32());
        let ttl = message.get_u8();
        let hop_count = message.get_u8();
        let seq = message.get_u16();

        let header = MessageHeader { kind, vtime, originator, ttl, hop_count, seq };
        let body = match kind {
            HELLO_MESSAGE => MessageBody::Hello(Hello::decode(message)?),
            _ => {
                trace!(kind, size, "Skipping unknown message type");
                MessageBody::Unknown { kind, payload: message.freeze() }
            }
        };

        Ok(Message { header, body })
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if length < PACKET_HEADER_LEN {
            src.clear();
            return Err(Error::PacketLength(length));
        }

        // Not enough bytes yet
        if src.len() < length {
            return Ok(None);
        }

        let mut packet = src.split_to(length);
        packet.advance(2);
        let seq = packet.get_u16();

        let mut messages = Vec::with_capacity(1);
        while !packet.is_empty() {
            messages.push(Self::decode_message(&mut packet)?);
        }

        Ok(Some(Packet { seq, messages }))
    }

    /// A datagram is exactly one packet: trailing bytes are discarded and a short datagram is
    /// an error rather than a partial frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.decode(src).inspect_err(|_| src.clear())?;
        match decoded {
            Some(packet) => {
                src.clear();
                Ok(Some(packet))
            }
            None if src.is_empty() => Ok(None),
            None => {
                let have = src.len();
                let need = if have < PACKET_HEADER_LEN {
                    PACKET_HEADER_LEN
                } else {
                    u16::from_be_bytes([src[0], src[1]]) as usize
                };
                src.clear();
                Err(Error::Truncated { what: "packet", need, have })
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.encoded_len();
        if length > u16::MAX as usize {
            return Err(Error::TooLarge(length));
        }

        // Reserve enough space for the whole packet
        dst.reserve(length);

        dst.put_u16(length as u16);
        dst.put_u16(item.seq);

        for message in item.messages {
            let size = message.encoded_len();
            if let MessageBody::Hello(ref hello) = message.body {
                if hello.iface_queues.len() > u8::MAX as usize {
                    return Err(Error::TooManyInterfaces(hello.iface_queues.len()));
                }
            }

            dst.put_u8(message.header.kind);
            dst.put_u8(vtime::encode(message.header.vtime));
            dst.put_u16(size as u16);
            dst.put_u32(u32::from(message.header.originator));
            dst.put_u8(message.header.ttl);
            dst.put_u8(message.header.hop_count);
            dst.put_u16(message.header.seq);

            match message.body {
                MessageBody::Hello(hello) => hello.encode(dst),
                MessageBody::Unknown { payload, .. } => dst.put(payload),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello() -> Hello {
        Hello {
            willingness: Willingness::High,
            queue_length: 17,
            addr: Ipv4Addr::new(10, 0, 0, 2),
            x: 120.5,
            y: -40.25,
            iface_queues: vec![3, 14, crate::UNREPORTED],
        }
    }

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        Codec::new().encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn hello_layout() {
        let packet = Packet::single(
            9,
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 4, Duration::from_secs(6), sample_hello()),
        );
        let buf = encode(packet.clone());

        assert_eq!(buf.len(), PACKET_HEADER_LEN + MESSAGE_HEADER_LEN + HELLO_FIXED_LEN + 3);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]) as usize, buf.len());
        assert_eq!(buf[4], HELLO_MESSAGE);
        // ttl and hop count
        assert_eq!(buf[12], 1);
        assert_eq!(buf[13], 0);

        let decoded = Codec::new().decode_eof(&mut buf.clone()).unwrap().unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn skips_unknown_messages() {
        let unknown = Message {
            header: MessageHeader {
                kind: 42,
                vtime: Duration::from_secs(1),
                originator: Ipv4Addr::new(10, 0, 0, 9),
                ttl: 255,
                hop_count: 3,
                seq: 1,
            },
            body: MessageBody::Unknown { kind: 42, payload: Bytes::from_static(b"opaque") },
        };
        let hello =
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 2, Duration::from_secs(3), sample_hello());
        let mut buf = encode(Packet { seq: 1, messages: vec![unknown, hello] });

        let packet = Codec::new().decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(packet.messages.len(), 2);

        let hellos: Vec<_> = packet.hellos().collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(hellos[0].1.queue_length, 17);
    }

    #[test]
    fn truncated_datagram_is_rejected_and_consumed() {
        let packet = Packet::single(
            1,
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 1, Duration::from_secs(3), sample_hello()),
        );
        let buf = encode(packet);

        let mut short = BytesMut::from(&buf[..buf.len() - 5]);
        assert!(matches!(Codec::new().decode_eof(&mut short), Err(Error::Truncated { .. })));
        assert!(short.is_empty());
    }

    #[test]
    fn lying_message_size_is_rejected() {
        let packet = Packet::single(
            1,
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 1, Duration::from_secs(3), sample_hello()),
        );
        let mut buf = encode(packet);
        // Message size smaller than a header.
        buf[6] = 0;
        buf[7] = 4;

        assert!(matches!(Codec::new().decode_eof(&mut buf), Err(Error::MessageSize(4))));
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let mut hello = sample_hello();
        hello.x = f64::NAN;
        let packet = Packet::single(
            1,
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 1, Duration::from_secs(3), hello),
        );
        let mut buf = encode(packet);
        assert!(matches!(Codec::new().decode_eof(&mut buf), Err(Error::Position { .. })));

        let packet = Packet::single(
            1,
            Message::hello(Ipv4Addr::new(10, 0, 0, 2), 1, Duration::from_secs(3), sample_hello()),
        );
        let mut buf = encode(packet);
        // Willingness byte is the first byte after both headers.
        buf[PACKET_HEADER_LEN + MESSAGE_HEADER_LEN] = 5;
        assert!(matches!(Codec::new().decode_eof(&mut buf), Err(Error::Willingness(5))));
    }

    #[test]
    fn garbage_length_clears_buffer() {
        let mut buf = BytesMut::from(&[0u8, 2, 0, 0, 0xde, 0xad][..]);
        assert!(matches!(Codec::new().decode(&mut buf), Err(Error::PacketLength(2))));
        assert!(buf.is_empty());
    }
}
