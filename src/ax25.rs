//! AX.25 framing module.
//!
//! Encodes and decodes AX.25 UI frames (the only frame type APRS uses) and
//! provides the HDLC bit layer: FCS, bit stuffing, NRZI for AFSK 1200 and
//! the G3RUH scrambler for 2FSK 9600.

use std::{fmt, str::FromStr};

use crc::{Crc, CRC_16_IBM_SDLC};
use once_cell::sync::Lazy;

use crate::error;

/// Maximum info field length.
pub const MAX_INFO: usize = 256;

/// Maximum number of digipeater path entries.
pub const MAX_PATH: usize = 8;

/// UI frame control byte.
const CONTROL_UI: u8 = 0x03;

/// No layer 3 protocol identifier.
const PID_NONE: u8 = 0xF0;

/// HDLC flag octet.
pub const FLAG: u8 = 0x7E;

/// CRC-16/X.25, the AX.25 frame check sequence.
const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// The flag octet as a bit pattern.
static FLAG_BITS: Lazy<Vec<u8>> = Lazy::new(|| bytes_to_bits(&[FLAG]));

/// An AX.25 address: callsign, SSID and the has-been-repeated bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    call: String,
    ssid: u8,
    repeated: bool,
}

impl Address {
    /// Creates an address, validating the callsign length and charset.
    pub fn new<S: Into<String>>(call: S, ssid: u8) -> Result<Self, error::Codec> {
        let call = call.into().to_ascii_uppercase();
        if call.is_empty()
            || call.len() > 6
            || !call.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(error::Codec::InvalidCall { call });
        }
        Ok(Self {
            call,
            ssid: ssid & 0x0F,
            repeated: false,
        })
    }

    /// Gets the callsign without the SSID.
    pub fn call(&self) -> &str {
        &self.call
    }

    /// Gets the SSID.
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Checks the has-been-repeated (H) bit.
    pub fn repeated(&self) -> bool {
        self.repeated
    }

    /// Sets the has-been-repeated (H) bit.
    pub fn set_repeated(&mut self, repeated: bool) {
        self.repeated = repeated;
    }

    /// Encodes the address into its 7-byte wire form.
    fn encode(&self, last: bool, buf: &mut Vec<u8>) {
        let mut call = [b' '; 6];
        call[..self.call.len()].copy_from_slice(self.call.as_bytes());
        buf.extend(call.iter().map(|c| c << 1));

        let mut ssid = 0x60 | (self.ssid << 1);
        if self.repeated {
            ssid |= 0x80;
        }
        if last {
            ssid |= 0x01;
        }
        buf.push(ssid);
    }

    /// Decodes a 7-byte wire address. Returns the address and whether the
    /// extension bit marked it as the last one.
    fn decode(bytes: &[u8]) -> Result<(Self, bool), error::Codec> {
        let call: String = bytes[..6]
            .iter()
            .map(|b| (b >> 1) as char)
            .filter(|c| *c != ' ')
            .collect();
        let ssid_byte = bytes[6];
        let mut address = Address::new(call, (ssid_byte >> 1) & 0x0F)?;
        address.repeated = ssid_byte & 0x80 != 0;
        Ok((address, ssid_byte & 0x01 != 0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)?;
        } else {
            write!(f, "{}-{}", self.call, self.ssid)?;
        }
        if self.repeated {
            write!(f, "*")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = error::Codec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, repeated) = match s.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (s, false),
        };
        let (call, ssid) = match s.split_once('-') {
            Some((call, ssid)) => (
                call,
                ssid.parse::<u8>().map_err(|_| error::Codec::InvalidCall {
                    call: s.to_owned(),
                })?,
            ),
            None => (s, 0),
        };
        let mut address = Address::new(call, ssid)?;
        address.repeated = repeated;
        Ok(address)
    }
}

/// An AX.25 UI frame envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Source address.
    pub source: Address,
    /// Destination address.
    pub destination: Address,
    /// Digipeater path, at most [`MAX_PATH`] entries.
    pub path: Vec<Address>,
    /// Info field, at most [`MAX_INFO`] bytes.
    pub info: Vec<u8>,
}

impl Packet {
    /// Creates a UI frame, validating path and info limits.
    pub fn new(
        source: Address,
        destination: Address,
        path: Vec<Address>,
        info: Vec<u8>,
    ) -> Result<Self, error::Codec> {
        if path.len() > MAX_PATH {
            return Err(error::Codec::PathTooLong { len: path.len() });
        }
        if info.len() > MAX_INFO {
            return Err(error::Codec::PacketTooLong {
                len: info.len(),
                max: MAX_INFO,
            });
        }
        Ok(Self {
            source,
            destination,
            path,
            info,
        })
    }

    /// Encodes the frame without FCS.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 7 * self.path.len() + self.info.len());
        self.destination.encode(false, &mut buf);
        self.source.encode(self.path.is_empty(), &mut buf);
        for (i, digi) in self.path.iter().enumerate() {
            digi.encode(i + 1 == self.path.len(), &mut buf);
        }
        buf.push(CONTROL_UI);
        buf.push(PID_NONE);
        buf.extend_from_slice(&self.info);
        buf
    }

    /// Encodes the frame and appends the FCS, LSB first.
    pub fn encode_with_fcs(&self) -> Vec<u8> {
        let mut buf = self.encode();
        let fcs = FCS.checksum(&buf);
        buf.extend_from_slice(&fcs.to_le_bytes());
        buf
    }

    /// Decodes a frame with trailing FCS, verifying it.
    pub fn decode(bytes: &[u8]) -> Result<Self, error::Codec> {
        if bytes.len() < 2 {
            return Err(error::Codec::FrameTooShort { len: bytes.len() });
        }
        let (body, fcs_bytes) = bytes.split_at(bytes.len() - 2);
        let stored = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);
        if FCS.checksum(body) != stored {
            return Err(error::Codec::BadFcs);
        }
        Self::decode_without_fcs(body)
    }

    /// Decodes a frame body without FCS.
    pub fn decode_without_fcs(body: &[u8]) -> Result<Self, error::Codec> {
        // Destination, source, control, PID at minimum.
        if body.len() < 16 {
            return Err(error::Codec::FrameTooShort { len: body.len() });
        }

        let (destination, last) = Address::decode(&body[0..7])?;
        if last {
            return Err(error::Codec::FrameTooShort { len: body.len() });
        }
        let (source, mut last) = Address::decode(&body[7..14])?;

        let mut pos = 14;
        let mut path = Vec::new();
        while !last {
            if path.len() == MAX_PATH || body.len() < pos + 7 {
                return Err(error::Codec::PathTooLong { len: path.len() + 1 });
            }
            let (digi, is_last) = Address::decode(&body[pos..pos + 7])?;
            path.push(digi);
            last = is_last;
            pos += 7;
        }

        if body.len() < pos + 2 {
            return Err(error::Codec::FrameTooShort { len: body.len() });
        }
        let control = body[pos];
        let pid = body[pos + 1];
        if control != CONTROL_UI || pid != PID_NONE {
            return Err(error::Codec::NotUi { control, pid });
        }

        let info = body[pos + 2..].to_vec();
        if info.len() > MAX_INFO {
            return Err(error::Codec::PacketTooLong {
                len: info.len(),
                max: MAX_INFO,
            });
        }

        Ok(Self {
            source,
            destination,
            path,
            info,
        })
    }

    /// Checks whether the frame was heard directly, i.e. no path entry has
    /// its H bit set.
    pub fn heard_direct(&self) -> bool {
        self.path.iter().all(|digi| !digi.repeated())
    }
}

/// Unpacks bytes into bits, MSB first per octet.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

/// Packs bits back into bytes, MSB first per octet. Trailing bits short of
/// an octet are dropped.
pub fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks_exact(8)
        .map(|chunk| chunk.iter().fold(0, |acc, bit| (acc << 1) | bit))
        .collect()
}

/// HDLC bit stuffing: a zero is inserted after five consecutive ones.
pub fn stuff_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / 5);
    let mut ones = 0;
    for &bit in bits {
        out.push(bit);
        if bit == 1 {
            ones += 1;
            if ones == 5 {
                out.push(0);
                ones = 0;
            }
        } else {
            ones = 0;
        }
    }
    out
}

/// Reverses [`stuff_bits`]: the zero following five ones is dropped.
pub fn unstuff_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len());
    let mut ones = 0;
    let mut skip_next_zero = false;
    for &bit in bits {
        if skip_next_zero {
            skip_next_zero = false;
            if bit == 0 {
                ones = 0;
                continue;
            }
        }
        out.push(bit);
        if bit == 1 {
            ones += 1;
            if ones == 5 {
                skip_next_zero = true;
                ones = 0;
            }
        } else {
            ones = 0;
        }
    }
    out
}

/// Builds the complete HDLC bitstream for one frame: preamble flags, the
/// stuffed frame body, one closing flag. Flags themselves are never stuffed.
pub fn hdlc_bits(frame_with_fcs: &[u8], preamble_flags: u16) -> Vec<u8> {
    let body = stuff_bits(&bytes_to_bits(frame_with_fcs));

    let mut out = Vec::with_capacity((usize::from(preamble_flags) + 2) * 8 + body.len());
    for _ in 0..preamble_flags.max(1) {
        out.extend_from_slice(&FLAG_BITS);
    }
    out.extend_from_slice(&body);
    out.extend_from_slice(&FLAG_BITS);
    out
}

/// NRZI encoding: a zero toggles the line, a one keeps it.
pub fn nrzi_encode(bits: &[u8]) -> Vec<u8> {
    let mut level = 1u8;
    bits.iter()
        .map(|&bit| {
            if bit == 0 {
                level ^= 1;
            }
            level
        })
        .collect()
}

/// Reverses [`nrzi_encode`].
pub fn nrzi_decode(levels: &[u8]) -> Vec<u8> {
    let mut last = 1u8;
    levels
        .iter()
        .map(|&level| {
            let bit = u8::from(level == last);
            last = level;
            bit
        })
        .collect()
}

/// G3RUH scrambler, polynomial `x^17 + x^12 + 1`, over the stuffed HDLC
/// bitstream.
pub fn scramble(bits: &[u8]) -> Vec<u8> {
    let mut sr = 0u32;
    bits.iter()
        .map(|&bit| {
            let out = bit ^ ((sr >> 11) & 1) as u8 ^ ((sr >> 16) & 1) as u8;
            sr = (sr << 1) | u32::from(out);
            out
        })
        .collect()
}

/// Reverses [`scramble`].
pub fn descramble(bits: &[u8]) -> Vec<u8> {
    let mut sr = 0u32;
    bits.iter()
        .map(|&bit| {
            let out = bit ^ ((sr >> 11) & 1) as u8 ^ ((sr >> 16) & 1) as u8;
            sr = (sr << 1) | u32::from(bit);
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::new(
            Address::new("DL7AD", 12).unwrap(),
            Address::new("APECAN", 0).unwrap(),
            vec![
                Address::new("WIDE1", 1).unwrap(),
                Address::new("WIDE2", 2).unwrap(),
            ],
            b"!4903.50N/07201.75WO/A=006562".to_vec(),
        )
        .unwrap()
    }

    /// Checks the address string round-trip, including the H bit marker.
    #[test]
    fn address_round_trip() {
        for s in ["DL7AD-12", "APECAN", "WIDE1-1*", "N0CALL-7"] {
            let address: Address = s.parse().unwrap();
            assert_eq!(address.to_string(), s);
        }
        assert!("".parse::<Address>().is_err());
        assert!("TOOLONGCALL".parse::<Address>().is_err());
        assert!("DL7AD-XX".parse::<Address>().is_err());
    }

    /// Checks the frame byte round-trip for every path length.
    #[test]
    fn frame_round_trip_all_path_lengths() {
        for entries in 0..=MAX_PATH {
            let path: Vec<Address> = (0..entries)
                .map(|i| Address::new(format!("WIDE{}", i + 1), (i + 1) as u8).unwrap())
                .collect();
            let packet = Packet::new(
                Address::new("DL7AD", 12).unwrap(),
                Address::new("APECAN", 0).unwrap(),
                path,
                b">test status".to_vec(),
            )
            .unwrap();

            let decoded = Packet::decode(&packet.encode_with_fcs()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    /// A frame whose FCS does not verify is rejected.
    #[test]
    fn bad_fcs_rejected() {
        let mut bytes = sample_packet().encode_with_fcs();
        let len = bytes.len();
        bytes[len - 4] ^= 0x01;
        assert!(matches!(Packet::decode(&bytes), Err(error::Codec::BadFcs)));
    }

    /// Oversize info fields are rejected at construction.
    #[test]
    fn oversize_info_rejected() {
        let result = Packet::new(
            Address::new("DL7AD", 12).unwrap(),
            Address::new("APECAN", 0).unwrap(),
            Vec::new(),
            vec![b'x'; MAX_INFO + 1],
        );
        assert!(matches!(
            result,
            Err(error::Codec::PacketTooLong { len: 257, max: 256 })
        ));
    }

    /// The H bit survives the wire round-trip.
    #[test]
    fn h_bit_round_trip() {
        let mut packet = sample_packet();
        packet.path[0].set_repeated(true);
        let decoded = Packet::decode(&packet.encode_with_fcs()).unwrap();
        assert!(decoded.path[0].repeated());
        assert!(!decoded.path[1].repeated());
        assert!(!decoded.heard_direct());
    }

    /// Stuffed output never contains six consecutive ones, and unstuffing
    /// restores the input.
    #[test]
    fn stuffing_round_trip() {
        let patterns: [&[u8]; 4] = [
            &[0xFF, 0xFF, 0xFF],
            &[0x7E, 0x7E],
            &[0xAA, 0x55, 0xFB, 0xFF, 0x00],
            &[],
        ];
        for bytes in patterns {
            let bits = bytes_to_bits(bytes);
            let stuffed = stuff_bits(&bits);
            assert!(
                !stuffed.windows(6).any(|w| w.iter().all(|&b| b == 1)),
                "six consecutive ones in stuffed output"
            );
            assert_eq!(unstuff_bits(&stuffed), bits);
        }
    }

    /// NRZI round-trip.
    #[test]
    fn nrzi_round_trip() {
        let bits = bytes_to_bits(&[0x7E, 0x00, 0xFF, 0xA5]);
        assert_eq!(nrzi_decode(&nrzi_encode(&bits)), bits);
    }

    /// Scrambler round-trip.
    #[test]
    fn scrambler_round_trip() {
        let bits = bytes_to_bits(&[0x00, 0xFF, 0x7E, 0x12, 0x34, 0x56]);
        assert_eq!(descramble(&scramble(&bits)), bits);
    }

    /// The HDLC bitstream opens and closes with unstuffed flags.
    #[test]
    fn hdlc_flags_frame_the_body() {
        let frame = sample_packet().encode_with_fcs();
        let bits = hdlc_bits(&frame, 4);
        let flag = bytes_to_bits(&[FLAG]);
        assert_eq!(&bits[..8], flag.as_slice());
        assert_eq!(&bits[bits.len() - 8..], flag.as_slice());
        // Recover the body between preamble and closing flag.
        let body = &bits[4 * 8..bits.len() - 8];
        assert_eq!(bits_to_bytes(&unstuff_bits(body)), frame);
    }

    /// Byte/bit conversion is MSB first.
    #[test]
    fn bit_order_msb_first() {
        assert_eq!(bytes_to_bits(&[0b1010_0001]), vec![1, 0, 1, 0, 0, 0, 0, 1]);
        assert_eq!(bits_to_bytes(&[1, 0, 1, 0, 0, 0, 0, 1]), vec![0b1010_0001]);
    }
}
