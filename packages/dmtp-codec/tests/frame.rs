//! Wire vectors for DMTP framing, captured from a reference server dialog.

use dmtp_codec::packet::{client, server, FrameIter, Packet};
use dmtp_codec::Fletcher;

/// Identification triple as it appears on the wire:
///
/// E0 11 01 03 | E0 12 07 "fleet01" | E0 13 05 "truck"
#[test]
fn identification_triple() {
    let buf = hex::decode("e0110103e01207666c6565743031e01305747275636b").unwrap();
    let pkts: Vec<Packet> = FrameIter::new(&buf).collect();
    assert_eq!(pkts.len(), 3);
    assert_eq!(pkts[0].header_type, client::UNIQUE_ID);
    assert_eq!(pkts[0].data, [0x03]);
    assert_eq!(pkts[1].header_type, client::ACCOUNT_ID);
    assert_eq!(pkts[1].data, b"fleet01");
    assert_eq!(pkts[2].header_type, client::DEVICE_ID);
    assert_eq!(pkts[2].data, b"truck");
}

/// Server turn: ACK of sequence low-byte 0x0B followed by EOT carrying the
/// server clock (2023-11-14T22:13:20Z = 0x6553F100).
///
/// E0 A0 01 0B | E0 FF 04 65 53 F1 00
#[test]
fn ack_then_eot_with_server_time() {
    let buf = hex::decode("e0a0010be0ff046553f100").unwrap();
    let pkts: Vec<Packet> = FrameIter::new(&buf).collect();
    assert_eq!(pkts.len(), 2);
    assert_eq!(pkts[0].header_type, server::ACK);
    assert_eq!(pkts[0].data, [0x0B]);
    assert_eq!(pkts[1].header_type, server::EOT);
    let t = u32::from_be_bytes(pkts[1].data[..4].try_into().unwrap());
    assert_eq!(t, 1_700_000_000, "{t:#x}");
}

/// A TCP block terminated by EOB-Done whose Fletcher check bytes make the
/// whole block sum to zero.
#[test]
fn tcp_block_checksum() {
    let mut block = Vec::new();
    Packet::new(client::UNIQUE_ID, vec![0x03]).encode_into(&mut block);
    Packet::new(
        client::DMTSP_FORMAT_3,
        hex::decode("f0106553f8000100").unwrap(),
    )
    .encode_into(&mut block);

    let mut fcs = Fletcher::new();
    fcs.update(&block);
    // EOB packet: header, type, len=2, then the placeholder bytes folded in.
    fcs.update(&[0xE0, (client::EOB_DONE & 0xFF) as u8, 2, 0, 0]);
    let check = fcs.check_bytes();

    block.extend_from_slice(&[0xE0, (client::EOB_DONE & 0xFF) as u8, 2]);
    block.extend_from_slice(&check);

    // Receiver side: accumulate everything including check bytes.
    let mut verify = Fletcher::new();
    let eob_start = block.len() - 5;
    verify.update(&block[..eob_start]);
    verify.update(&[0xE0, (client::EOB_DONE & 0xFF) as u8, 2, 0, 0]);
    verify.update(&block[block.len() - 2..]);
    assert!(verify.is_valid());
}

/// A server error packet: code NAK_PACKET_ENCODING (0xF114) against the
/// account-id packet type.
#[test]
fn server_error_payload() {
    let buf = hex::decode("e0e004f114e012").unwrap();
    let pkts: Vec<Packet> = FrameIter::new(&buf).collect();
    assert_eq!(pkts.len(), 1);
    let data = &pkts[0].data;
    let code = u16::from_be_bytes([data[0], data[1]]);
    let against = u16::from_be_bytes([data[2], data[3]]);
    assert_eq!(code, dmtp_codec::status::server_error::PACKET_ENCODING);
    assert_eq!(against, client::ACCOUNT_ID);
}
