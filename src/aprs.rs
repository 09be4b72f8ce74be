//! APRS payload codec module.
//!
//! Builds and parses the APRS PDUs carried in AX.25 UI info fields:
//! positions with the base91 telemetry extension, `T#` telemetry reports,
//! the PARM/UNIT/EQNS/BITS telemetry configuration group, messages with
//! acks and rejects, and the APRSD heard-list response. Everything is
//! integer fixed-point.

use crate::{error, telemetry::DataPoint};

/// Maximum length of an APRS message body.
pub const MAX_MESSAGE: usize = 67;

/// Telemetry sequence numbers wrap at this value in the base91 extension.
pub const TELEMETRY_SEQ_MODULUS: u16 = 8280;

/// Scales the five analog telemetry channels out of a snapshot:
/// battery volts, solar volts, battery mW, solar mW, pressure.
///
/// The scaling here must stay in step with the EQNS packet built by
/// [`encode_telemetry_config`].
pub fn scale_telemetry(point: &DataPoint) -> [u8; 5] {
    let vsol = if point.pac_vsol != 0 {
        point.pac_vsol
    } else {
        point.adc_vsol
    };
    [
        (point.vbat_mv() / 20).min(255) as u8,
        (vsol / 20).min(255) as u8,
        ((i32::from(point.pac_pbat) / 10 + 128).clamp(0, 255)) as u8,
        ((i32::from(point.pac_psol) / 10 + 128).clamp(0, 255)) as u8,
        (point.bme_i1.press / 5000).min(255) as u8,
    ]
}

/// The eight digital telemetry bits: the low byte of the error flags.
pub fn telemetry_bits(point: &DataPoint) -> u8 {
    (point.sys_error.bits() & 0xFF) as u8
}

/// Encodes a value 0..8280 as an APRS base91 pair.
fn base91_pair(value: u16) -> [u8; 2] {
    let value = value % TELEMETRY_SEQ_MODULUS;
    [(value / 91) as u8 + 33, (value % 91) as u8 + 33]
}

/// Packs binary data into printable base91 text: two bytes become three
/// characters, a trailing odd byte becomes two.
pub fn base91_encode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() / 2 * 3 + 2);
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        let mut v = u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        let mut triple = [0u8; 3];
        for c in triple.iter_mut().rev() {
            *c = (v % 91) as u8 + 33;
            v /= 91;
        }
        out.push_str(std::str::from_utf8(&triple).unwrap_or_default());
    }
    if let [last] = chunks.remainder() {
        let pair = base91_pair(u16::from(*last));
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    out
}

/// Reverses [`base91_encode_bytes`]. Returns `None` on characters outside
/// the base91 alphabet.
pub fn base91_decode_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u32> = text
        .bytes()
        .map(|b| {
            if (33..124).contains(&b) {
                Some(u32::from(b - 33))
            } else {
                None
            }
        })
        .collect::<Option<_>>()?;

    let mut out = Vec::with_capacity(digits.len() / 3 * 2 + 1);
    let mut chunks = digits.chunks_exact(3);
    for triple in &mut chunks {
        let v = triple[0] * 91 * 91 + triple[1] * 91 + triple[2];
        if v > u32::from(u16::MAX) {
            return None;
        }
        out.extend_from_slice(&(v as u16).to_be_bytes());
    }
    match chunks.remainder() {
        [] => {}
        [a, b] => {
            let v = a * 91 + b;
            if v > 0xFF {
                return None;
            }
            out.push(v as u8);
        }
        _ => return None,
    }
    Some(out)
}

fn format_latitude(lat_1e7: i32) -> String {
    let hemisphere = if lat_1e7 < 0 { 'S' } else { 'N' };
    let abs = i64::from(lat_1e7).unsigned_abs();
    let degrees = abs / 10_000_000;
    let minutes_hundredths = (abs % 10_000_000) * 6 / 1000;
    format!(
        "{:02}{:02}.{:02}{}",
        degrees,
        minutes_hundredths / 100,
        minutes_hundredths % 100,
        hemisphere
    )
}

fn format_longitude(lon_1e7: i32) -> String {
    let hemisphere = if lon_1e7 < 0 { 'W' } else { 'E' };
    let abs = i64::from(lon_1e7).unsigned_abs();
    let degrees = abs / 10_000_000;
    let minutes_hundredths = (abs % 10_000_000) * 6 / 1000;
    format!(
        "{:03}{:02}.{:02}{}",
        degrees,
        minutes_hundredths / 100,
        minutes_hundredths % 100,
        hemisphere
    )
}

/// Encodes a position report with altitude and the base91 telemetry
/// extension.
pub fn encode_position(
    point: &DataPoint,
    symbol_table: char,
    symbol_code: char,
    telemetry_seq: u16,
) -> Vec<u8> {
    let feet = u64::from(point.gps_alt) * 3281 / 1000;
    let analog = scale_telemetry(point);
    let bits = telemetry_bits(point);

    let mut info = format!(
        "!{}{}{}{}/A={:06}",
        format_latitude(point.gps_lat),
        symbol_table,
        format_longitude(point.gps_lon),
        symbol_code,
        feet,
    );

    info.push('|');
    for pair in [base91_pair(telemetry_seq)]
        .into_iter()
        .chain(analog.iter().map(|&a| base91_pair(u16::from(a))))
        .chain([base91_pair(u16::from(bits))])
    {
        info.push(pair[0] as char);
        info.push(pair[1] as char);
    }
    info.push('|');

    info.into_bytes()
}

/// Encodes a standalone `T#` telemetry report.
pub fn encode_telemetry_report(point: &DataPoint, seq: u16) -> Vec<u8> {
    let analog = scale_telemetry(point);
    let bits = telemetry_bits(point);
    format!(
        "T#{:03},{:03},{:03},{:03},{:03},{:03},{:08b}",
        seq % 1000,
        analog[0],
        analog[1],
        analog[2],
        analog[3],
        analog[4],
        bits
    )
    .into_bytes()
}

/// The four telemetry configuration PDU kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryConfig {
    /// Channel names.
    Parm,
    /// Channel units.
    Unit,
    /// Channel scaling coefficients.
    Eqns,
    /// Digital bit sense and project title.
    Bits,
}

/// Builds one telemetry configuration PDU, addressed to our own callsign.
///
/// The EQNS coefficients are the inverse of [`scale_telemetry`].
pub fn encode_telemetry_config(
    own_call: &str,
    kind: TelemetryConfig,
    title: &str,
) -> Vec<u8> {
    let body = match kind {
        TelemetryConfig::Parm => "PARM.Vbat,Vsol,Pbat,Psol,Press".to_owned(),
        TelemetryConfig::Unit => "UNIT.V,V,mW,mW,kPa".to_owned(),
        TelemetryConfig::Eqns => {
            "EQNS.0,0.02,0,0,0.02,0,0,10,-1280,0,10,-1280,0,0.5,0".to_owned()
        }
        TelemetryConfig::Bits => format!("BITS.11111111,{title}"),
    };
    format!(":{own_call:<9}:{body}").into_bytes()
}

/// Encodes an APRS message, optionally numbered to request an ack.
pub fn encode_message(
    addressee: &str,
    text: &str,
    number: Option<u16>,
) -> Result<Vec<u8>, error::Codec> {
    if text.is_empty() || text.len() > MAX_MESSAGE {
        return Err(error::Codec::PacketTooLong {
            len: text.len(),
            max: MAX_MESSAGE,
        });
    }
    let mut info = format!(":{addressee:<9}:{text}");
    if let Some(number) = number {
        info.push_str(&format!("{{{:03}", number % 1000));
    }
    Ok(info.into_bytes())
}

/// Encodes the ack for a received message number.
pub fn encode_ack(addressee: &str, number: &str) -> Vec<u8> {
    format!(":{addressee:<9}:ack{number}").into_bytes()
}

/// Encodes the reject for a received message number.
pub fn encode_rej(addressee: &str, number: &str) -> Vec<u8> {
    format!(":{addressee:<9}:rej{number}").into_bytes()
}

/// Encodes the APRSD response listing directly heard stations.
pub fn encode_aprsd_response(addressee: &str, heard: &[String]) -> Vec<u8> {
    let list = heard.join(" ");
    format!(":{addressee:<9}:Directs={list}").into_bytes()
}

/// A decoded APRS PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// A message addressed to `addressee`.
    Message {
        /// The addressee callsign, trailing spaces trimmed.
        addressee: String,
        /// Message body without the number suffix.
        text: String,
        /// Message number, if the sender requested an ack.
        number: Option<String>,
    },
    /// An ack for a message number we sent.
    Ack {
        /// The addressee callsign.
        addressee: String,
        /// The acked message number.
        number: String,
    },
    /// A reject for a message number we sent.
    Rej {
        /// The addressee callsign.
        addressee: String,
        /// The rejected message number.
        number: String,
    },
    /// A position report. Coordinates in 1e-7 degrees.
    Position {
        /// Latitude, in 1e-7 degrees.
        lat: i32,
        /// Longitude, in 1e-7 degrees.
        lon: i32,
    },
    /// A `T#` telemetry report, kept as raw text.
    Telemetry {
        /// The report body after `T#`.
        raw: String,
    },
    /// Anything else.
    Other,
}

fn parse_coordinate(text: &[u8], degree_digits: usize) -> Option<(i64, usize)> {
    // DDMM.mm or DDDMM.mm plus hemisphere.
    let len = degree_digits + 6;
    if text.len() < len {
        return None;
    }
    let s = std::str::from_utf8(&text[..len - 1]).ok()?;
    let degrees: i64 = s[..degree_digits].parse().ok()?;
    let minutes: i64 = s[degree_digits..degree_digits + 2].parse().ok()?;
    if s.as_bytes()[degree_digits + 2] != b'.' {
        return None;
    }
    let hundredths: i64 = s[degree_digits + 3..degree_digits + 5].parse().ok()?;
    if minutes >= 60 {
        return None;
    }

    let minutes_hundredths = minutes * 100 + hundredths;
    let value = degrees * 10_000_000 + minutes_hundredths * 10_000_000 / 6000;
    let sign = match text[len - 1] {
        b'N' | b'E' => 1,
        b'S' | b'W' => -1,
        _ => return None,
    };
    Some((sign * value, len))
}

fn parse_position(info: &[u8]) -> Option<Pdu> {
    let body = &info[1..];
    let (lat, used) = parse_coordinate(body, 2)?;
    // Skip the symbol table character.
    let body = &body[used + 1..];
    let (lon, _) = parse_coordinate(body, 3)?;
    Some(Pdu::Position {
        lat: lat as i32,
        lon: lon as i32,
    })
}

fn parse_message(info: &[u8]) -> Option<Pdu> {
    if info.len() < 11 || info[10] != b':' {
        return None;
    }
    let addressee = std::str::from_utf8(&info[1..10]).ok()?.trim_end().to_owned();
    let body = std::str::from_utf8(&info[11..]).ok()?;

    if let Some(number) = body.strip_prefix("ack") {
        return Some(Pdu::Ack {
            addressee,
            number: number.trim_end_matches('}').to_owned(),
        });
    }
    if let Some(number) = body.strip_prefix("rej") {
        return Some(Pdu::Rej {
            addressee,
            number: number.trim_end_matches('}').to_owned(),
        });
    }

    // The number suffix is `{NNN`; tolerate a stray closing brace.
    let (text, number) = match body.rfind('{') {
        Some(index) => {
            let number = body[index + 1..].trim_end_matches('}');
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_alphanumeric()) {
                (&body[..index], Some(number.to_owned()))
            } else {
                (body, None)
            }
        }
        None => (body, None),
    };

    Some(Pdu::Message {
        addressee,
        text: text.to_owned(),
        number,
    })
}

/// Classifies an info field into a typed PDU.
pub fn decode_info(info: &[u8]) -> Pdu {
    match info.first() {
        Some(b':') => parse_message(info).unwrap_or(Pdu::Other),
        Some(b'!') | Some(b'=') => parse_position(info).unwrap_or(Pdu::Other),
        Some(b'T') if info.get(1) == Some(&b'#') => match std::str::from_utf8(&info[2..]) {
            Ok(raw) => Pdu::Telemetry {
                raw: raw.to_owned(),
            },
            Err(_) => Pdu::Other,
        },
        _ => Pdu::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::GpsState;

    fn snapshot() -> DataPoint {
        let mut point = DataPoint::empty(10);
        point.gps_state = GpsState::LockedOn;
        point.gps_lat = 490_583_333; // 49° 03.50' N
        point.gps_lon = -720_291_666; // 072° 01.75' W
        point.gps_alt = 2000;
        point.pac_vbat = 4000;
        point.pac_vsol = 1000;
        point.pac_pbat = -250;
        point.pac_psol = 300;
        point.bme_i1.press = 1_013_250;
        point
    }

    /// Checks the canonical uncompressed position format.
    #[test]
    fn position_format() {
        let info = encode_position(&snapshot(), '/', 'O', 0);
        let text = String::from_utf8(info).unwrap();
        assert!(
            text.starts_with("!4903.49N/07201.74WO/A=006562"),
            "unexpected position: {text}"
        );
        assert_eq!(text.matches('|').count(), 2);
    }

    /// The position round-trips through the decoder within coordinate
    /// resolution.
    #[test]
    fn position_round_trip() {
        let point = snapshot();
        let info = encode_position(&point, '/', 'O', 0);
        match decode_info(&info) {
            Pdu::Position { lat, lon } => {
                assert!((lat - point.gps_lat).abs() < 2000);
                assert!((lon - point.gps_lon).abs() < 2000);
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    /// Checks the `T#` telemetry report shape.
    #[test]
    fn telemetry_report_format() {
        let text = String::from_utf8(encode_telemetry_report(&snapshot(), 7)).unwrap();
        assert!(text.starts_with("T#007,200,050,103,158,202,"));
        assert_eq!(text.split(',').count(), 7);
    }

    /// Telemetry scaling matches the advertised EQNS coefficients.
    #[test]
    fn telemetry_scaling() {
        let analog = scale_telemetry(&snapshot());
        // 4000 mV * 0.02 V/count inverse: 4000 / 20 = 200.
        assert_eq!(analog[0], 200);
        assert_eq!(analog[1], 50);
        // -250 mW -> -250/10 + 128 = 103.
        assert_eq!(analog[2], 103);
        assert_eq!(analog[3], 158);
        // 101325 Pa in 0.1 Pa units / 5000 = 202.
        assert_eq!(analog[4], 202);
    }

    /// The telemetry configuration group is addressed to our own call.
    #[test]
    fn telemetry_config_group() {
        for (kind, tag) in [
            (TelemetryConfig::Parm, "PARM."),
            (TelemetryConfig::Unit, "UNIT."),
            (TelemetryConfig::Eqns, "EQNS."),
            (TelemetryConfig::Bits, "BITS."),
        ] {
            let text =
                String::from_utf8(encode_telemetry_config("DL7AD-12", kind, "picoballoon"))
                    .unwrap();
            assert!(text.starts_with(":DL7AD-12 :"), "bad addressee: {text}");
            assert!(text.contains(tag), "missing {tag} in {text}");
        }
    }

    /// Message encode/decode round-trip including the number.
    #[test]
    fn message_round_trip() {
        let info = encode_message("DL7AD-12", "hello", Some(7)).unwrap();
        assert_eq!(info, b":DL7AD-12 :hello{007");
        match decode_info(&info) {
            Pdu::Message {
                addressee,
                text,
                number,
            } => {
                assert_eq!(addressee, "DL7AD-12");
                assert_eq!(text, "hello");
                assert_eq!(number.as_deref(), Some("007"));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    /// The parser accepts the `{NNN}` form with a stray closing brace.
    #[test]
    fn message_with_closing_brace() {
        match decode_info(b":DL7AD-12 :hello{007}") {
            Pdu::Message { number, text, .. } => {
                assert_eq!(number.as_deref(), Some("007"));
                assert_eq!(text, "hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    /// Acks parse into their own PDU kind.
    #[test]
    fn ack_round_trip() {
        let info = encode_ack("DK3SB", "007");
        assert_eq!(info, b":DK3SB    :ack007");
        match decode_info(&info) {
            Pdu::Ack { addressee, number } => {
                assert_eq!(addressee, "DK3SB");
                assert_eq!(number, "007");
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    /// Messages over 67 characters are rejected at encode time.
    #[test]
    fn oversize_message_rejected() {
        let text = "x".repeat(MAX_MESSAGE + 1);
        assert!(encode_message("DL7AD-12", &text, None).is_err());
    }

    /// The APRSD response lists heard stations.
    #[test]
    fn aprsd_response() {
        let heard = vec!["DK3SB".to_owned(), "ON4ABC-7".to_owned()];
        let info = encode_aprsd_response("DK3SB", &heard);
        assert_eq!(info, b":DK3SB    :Directs=DK3SB ON4ABC-7");
    }

    /// Binary base91 packing round-trips, even and odd lengths.
    #[test]
    fn base91_round_trip() {
        for data in [&b"\x00\x01\xFF\xFE"[..], &b"\xAA\xBB\xCC"[..], &b""[..]] {
            let text = base91_encode_bytes(data);
            assert!(text.bytes().all(|b| (33..124).contains(&b)));
            assert_eq!(base91_decode_bytes(&text).unwrap(), data);
        }
    }
}
