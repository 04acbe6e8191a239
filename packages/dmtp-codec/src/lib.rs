//! # dmtp-codec
//!
//! Shared DMTP wire vocabulary for the fleet telematics client.
//!
//! These types are used by:
//! - `dmtp-client`: building and parsing packets exchanged with the DMT server
//! - test harnesses that replay captured server dialogs
//!
//! ## Wire Conventions
//!
//! - Every binary packet starts with the marker byte `0xE0`; the 16-bit
//!   packet type is `0xE0 << 8 | type_byte`. Negotiated ASCII encodings
//!   instead send one `$E0XX<sep><payload>[*HH]\r` line per packet.
//! - One length byte follows the type byte, then `0..=255` payload bytes.
//! - Multi-byte payload fields are big-endian unless a packet family says
//!   otherwise.
//! - GPS points travel as two big-endian signed 32-bit integers scaled by
//!   10^7 (latitude first).
//!
//! ## Invariants
//! - A block on a stream transport ends with an EOB packet carrying a 2-byte
//!   Fletcher checksum computed over every byte sent since the last EOB.
//! - Datagram transports send EOB with an empty payload.

pub mod checksum;
pub mod encoding;
pub mod packet;
pub mod point;
pub mod status;

pub use checksum::Fletcher;
pub use encoding::Encoding;
pub use packet::{FrameError, FrameIter, Packet, PacketPriority};
pub use point::GpsPoint;
