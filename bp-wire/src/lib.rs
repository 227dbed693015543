//! Wire formats for the backpressure routing protocol.
//!
//! Control traffic is a single message type, the periodic HELLO, carried in OLSR-style
//! packets over UDP broadcast:
//!
//! ```text
//! PacketHeader  { length: u16, seq: u16 }
//! MessageHeader { type: u8, vtime: u8, size: u16, originator: [u8; 4],
//!                 ttl: u8, hop_count: u8, msg_seq: u16 }
//! Hello         { willingness: u8, queue_length: u32, addr: [u8; 4],
//!                 x: f64, y: f64, n_ifaces: u8, per_iface: [u8; n_ifaces] }
//! ```
//!
//! All integers are big-endian.

pub mod hello;
pub mod vtime;

pub use hello::{Codec, Error, Hello, Message, MessageBody, MessageHeader, Packet, Willingness};

/// The default UDP port for HELLO traffic.
pub const DEFAULT_PORT: u16 = 698;

/// Per-interface backlog value meaning "unreported or interface down".
pub const UNREPORTED: u8 = 255;

/// Largest per-interface backlog value that can be advertised.
pub const MAX_REPORTED: u8 = 254;
