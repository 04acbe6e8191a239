//! # packet
//!
//! DMTP packet structure, type constants and binary framing.
//!
//! On the wire each packet is `[0xE0, type, len, payload...]`. The packet
//! type constants below keep the full 16-bit form (`0xE0xx`) so a parsed
//! header can be compared directly against them.

use thiserror::Error;

use crate::checksum::char_xor;
use crate::encoding::{base64, Encoding};

/// Marker byte opening every DMTP packet.
pub const PACKET_HEADER_BASIC: u8 = 0xE0;

/// Payload length is carried in a single byte.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Account and device identifiers are clipped to this many bytes.
pub const MAX_ID_LEN: usize = 20;

// ── Client → server packet types ──────────────────────────────────────────────

pub mod client {
    pub const UNIQUE_ID: u16 = 0xE011;
    pub const ACCOUNT_ID: u16 = 0xE012;
    pub const DEVICE_ID: u16 = 0xE013;
    pub const PROPERTY_VALUE: u16 = 0xE023;
    /// End of block, nothing more queued.
    pub const EOB_DONE: u16 = 0xE03D;
    /// End of block, more events remain.
    pub const EOB_MORE: u16 = 0xE03E;
    pub const ERROR: u16 = 0xE042;
    /// Event packet families. The format index selects the payload layout;
    /// format 3 is the generic status report.
    pub const DMTSP_FORMAT_0: u16 = 0xE050;
    pub const DMTSP_FORMAT_1: u16 = 0xE051;
    pub const DMTSP_FORMAT_2: u16 = 0xE052;
    pub const DMTSP_FORMAT_3: u16 = 0xE053;
    pub const DMTSP_FORMAT_4: u16 = 0xE054;

    pub fn is_event(hdr_type: u16) -> bool {
        (DMTSP_FORMAT_0..=DMTSP_FORMAT_4).contains(&hdr_type)
    }
}

// ── Server → client packet types ──────────────────────────────────────────────

pub mod server {
    pub const EOB_DONE: u16 = 0xE000;
    pub const EOB_SPEAK_FREELY: u16 = 0xE001;
    /// Payload: optional 1-byte low sequence of the last packet acknowledged.
    pub const ACK: u16 = 0xE0A0;
    pub const GET_PROPERTY: u16 = 0xE0B0;
    pub const SET_PROPERTY: u16 = 0xE0B1;
    pub const FILE_UPLOAD: u16 = 0xE0C0;
    /// Payload: 2-byte error code, 2-byte offending packet type, extra bytes.
    pub const ERROR: u16 = 0xE0E0;
    /// TCP clock-sync gate. Payload: 4-byte server UTC seconds.
    pub const AUTH: u16 = 0xE0F1;
    /// End of transmission. On TCP the payload may carry server UTC seconds.
    pub const EOT: u16 = 0xE0FF;
}

// ── Packet status bits ────────────────────────────────────────────────────────

/// Slot holds a live packet.
pub const STATUS_FILLED: u8 = 0x01;
/// Packet has been durably written to the backing file.
pub const STATUS_PRESERVED: u8 = 0x02;
/// Packet was transmitted in the current or a previous session.
pub const STATUS_SENT: u8 = 0x08;

// ── Priority ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketPriority {
    #[default]
    None = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

impl PacketPriority {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Low,
            2 => Self::Normal,
            3 => Self::High,
            _ => Self::None,
        }
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One DMTP packet as held in a queue slot or parsed off the wire.
///
/// `seq_pos`/`seq_len` locate the low sequence byte embedded in the payload
/// of event packets; the queue patches it when the packet is assigned its
/// sequence number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub header_type: u16,
    pub sequence: u32,
    pub priority: PacketPriority,
    pub status: u8,
    pub seq_pos: u16,
    pub seq_len: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid packet header byte 0x{0:02x}")]
    BadHeader(u8),
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("payload exceeds 255 bytes")]
    Oversize,
}

impl Packet {
    pub fn new(header_type: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= MAX_PAYLOAD_LEN);
        Self {
            header_type,
            data,
            ..Default::default()
        }
    }

    /// Bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        3 + self.data.len()
    }

    pub fn is_sent(&self) -> bool {
        self.status & STATUS_SENT != 0
    }

    pub fn is_filled(&self) -> bool {
        self.status & STATUS_FILLED != 0
    }

    pub fn is_preserved(&self) -> bool {
        self.status & STATUS_PRESERVED != 0
    }

    /// Append the binary-framed packet to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push((self.header_type >> 8) as u8);
        buf.push((self.header_type & 0xFF) as u8);
        buf.push(self.data.len() as u8);
        buf.extend_from_slice(&self.data);
    }

    /// Append the packet in the negotiated session encoding.
    ///
    /// Binary is the native frame above. The ASCII encodings produce one
    /// line per packet: `$`, four hex digits of the packet type, a
    /// separator naming the payload encoding (`:` hex, `=` base64, `,`
    /// CSV), the encoded payload, an optional `*HH` character-XOR
    /// checksum, and `\r`. A CSV packet without a field template carries
    /// its payload as a single hex field, as the reference encoder does.
    pub fn encode_encoded_into(&self, encoding: Encoding, checksummed: bool, buf: &mut Vec<u8>) {
        if encoding == Encoding::Binary {
            self.encode_into(buf);
            return;
        }
        let mut line = String::with_capacity(8 + self.data.len() * 2);
        line.push('$');
        push_hex_u16(&mut line, self.header_type);
        match encoding {
            Encoding::Hex => {
                line.push(':');
                push_hex(&mut line, &self.data);
            }
            Encoding::Csv => {
                line.push(',');
                push_hex(&mut line, &self.data);
            }
            Encoding::Base64 => {
                line.push('=');
                line.push_str(&base64(&self.data));
            }
            Encoding::Binary => unreachable!(),
        }
        if checksummed {
            let sum = char_xor(&line);
            line.push('*');
            push_hex(&mut line, &[sum]);
        }
        line.push('\r');
        buf.extend_from_slice(line.as_bytes());
    }

    /// Parse one framed packet from the front of `buf`.
    /// Returns the packet and the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Packet, usize), FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::Truncated {
                need: 3,
                have: buf.len(),
            });
        }
        if buf[0] != PACKET_HEADER_BASIC {
            return Err(FrameError::BadHeader(buf[0]));
        }
        let data_len = buf[2] as usize;
        let total = 3 + data_len;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                need: total,
                have: buf.len(),
            });
        }
        let pkt = Packet {
            header_type: u16::from_be_bytes([buf[0], buf[1]]),
            data: buf[3..total].to_vec(),
            ..Default::default()
        };
        Ok((pkt, total))
    }
}

fn push_hex(out: &mut String, data: &[u8]) {
    use std::fmt::Write;
    for b in data {
        let _ = write!(out, "{b:02X}");
    }
}

fn push_hex_u16(out: &mut String, v: u16) {
    use std::fmt::Write;
    let _ = write!(out, "{v:04X}");
}

// ── Frame iterator ────────────────────────────────────────────────────────────

/// Walks every framed packet in a received buffer, skipping leading garbage
/// up to the first `0xE0` marker. Stops at the first malformed or truncated
/// frame.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    pos: usize,
    started: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            started: false,
        }
    }

    /// Offset of the first unconsumed byte.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if !self.started {
            self.started = true;
            self.pos += self.buf[self.pos..]
                .iter()
                .position(|&b| b == PACKET_HEADER_BASIC)?;
        }
        match Packet::parse(&self.buf[self.pos..]) {
            Ok((pkt, used)) => {
                self.pos += used;
                Some(pkt)
            }
            Err(_) => None,
        }
    }
}

/// True when the buffer ends on a session-terminating server packet, meaning
/// the block has been fully received and no further read is needed.
pub fn ends_transmission(buf: &[u8]) -> bool {
    let mut last = None;
    let mut iter = FrameIter::new(buf);
    for pkt in &mut iter {
        last = Some(pkt.header_type);
    }
    matches!(
        last,
        Some(server::EOT) | Some(server::EOB_DONE) | Some(server::EOB_SPEAK_FREELY)
    ) && iter.pos() == buf.len()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
