//! SSDV packetiser module.
//!
//! Splits a JPEG byte stream into standard 256-byte SSDV packets (no-FEC
//! variant) carrying the base-40 callsign, image id, packet id, resolution
//! and a trailing CRC-32. The JPEG codec itself lives behind the camera
//! abstraction; this module only does what the image transmitter needs to
//! chunk and label.

use crc::{Crc, CRC_32_ISO_HDLC};

/// Total SSDV packet length.
pub const PACKET_LEN: usize = 256;

/// Packet sync byte, stripped when the packet rides in an AX.25 info field.
pub const SYNC: u8 = 0x55;

/// Packet type marker for the no-FEC variant.
pub const TYPE_NOFEC: u8 = 0x67;

/// Header length, sync byte included.
const HEADER_LEN: usize = 15;

/// CRC-32 trailer length.
const CRC_LEN: usize = 4;

/// JPEG payload bytes per packet.
pub const PAYLOAD_LEN: usize = PACKET_LEN - HEADER_LEN - CRC_LEN;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// End-of-image flag bit.
const FLAG_EOI: u8 = 0x04;

/// Encodes a callsign into its base-40 form.
pub fn encode_callsign(call: &str) -> u32 {
    let mut value = 0u32;
    for c in call.chars().take(6) {
        let code = match c.to_ascii_uppercase() {
            '0'..='9' => c as u32 - '0' as u32 + 1,
            c @ 'A'..='Z' => c as u32 - 'A' as u32 + 11,
            '-' => 37,
            _ => 0,
        };
        value = value * 40 + code;
    }
    value
}

/// Decodes a base-40 callsign.
pub fn decode_callsign(mut value: u32) -> String {
    let mut chars = Vec::new();
    while value > 0 {
        let code = value % 40;
        value /= 40;
        chars.push(match code {
            1..=10 => (b'0' + (code - 1) as u8) as char,
            11..=36 => (b'A' + (code - 11) as u8) as char,
            37 => '-',
            _ => '?',
        });
    }
    chars.iter().rev().collect()
}

/// Splits a JPEG into SSDV packets. The MCU alignment fields are marked
/// unknown; receivers treat such packets as a plain sequential stream.
pub fn packetise(
    call: &str,
    image_id: u8,
    quality: u8,
    width: u16,
    height: u16,
    jpeg: &[u8],
) -> Vec<Vec<u8>> {
    let callsign = encode_callsign(call);
    let total = jpeg.len().div_ceil(PAYLOAD_LEN).max(1);

    (0..total)
        .map(|packet_id| {
            let start = packet_id * PAYLOAD_LEN;
            let chunk = &jpeg[start.min(jpeg.len())..(start + PAYLOAD_LEN).min(jpeg.len())];
            let last = packet_id + 1 == total;

            let mut packet = vec![0u8; PACKET_LEN];
            packet[0] = SYNC;
            packet[1] = TYPE_NOFEC;
            packet[2..6].copy_from_slice(&callsign.to_be_bytes());
            packet[6] = image_id;
            packet[7..9].copy_from_slice(&(packet_id as u16).to_be_bytes());
            packet[9] = (width / 16) as u8;
            packet[10] = (height / 16) as u8;
            packet[11] = (quality & 0x07) << 3 | if last { FLAG_EOI } else { 0 };
            packet[12] = 0xFF;
            packet[13..15].copy_from_slice(&0xFFFFu16.to_be_bytes());
            packet[HEADER_LEN..HEADER_LEN + chunk.len()].copy_from_slice(chunk);

            let crc = CRC32.checksum(&packet[1..PACKET_LEN - CRC_LEN]);
            packet[PACKET_LEN - CRC_LEN..].copy_from_slice(&crc.to_be_bytes());
            packet
        })
        .collect()
}

/// Verifies a packet's CRC-32 trailer.
pub fn verify_packet(packet: &[u8]) -> bool {
    if packet.len() != PACKET_LEN || packet[0] != SYNC {
        return false;
    }
    let stored = u32::from_be_bytes([
        packet[PACKET_LEN - 4],
        packet[PACKET_LEN - 3],
        packet[PACKET_LEN - 2],
        packet[PACKET_LEN - 1],
    ]);
    CRC32.checksum(&packet[1..PACKET_LEN - CRC_LEN]) == stored
}
