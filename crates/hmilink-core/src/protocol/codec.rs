//! Payload decoding helpers
//!
//! Numeric returns are 1-4 bytes little-endian; values shorter than 4 bytes
//! are sign-extended. Unsolicited pushes carry NUL-terminated variable names.

use byteorder::{BigEndian, ByteOrder};

/// Decode a 1-4 byte little-endian signed integer, sign-extending short values
pub fn decode_signed_le(payload: &[u8]) -> Option<i32> {
    if payload.is_empty() || payload.len() > 4 {
        return None;
    }

    let mut value: u32 = 0;
    for (i, b) in payload.iter().enumerate() {
        value |= (*b as u32) << (8 * i);
    }

    // Fill the missing high bytes from the sign bit of the last byte received
    if payload.len() < 4 {
        let fill: u8 = if payload[payload.len() - 1] & 0x80 != 0 {
            0xFF
        } else {
            0x00
        };
        for i in payload.len()..4 {
            value |= (fill as u32) << (8 * i);
        }
    }

    Some(value as i32)
}

/// Split a payload at its first NUL into (name, rest-after-NUL).
///
/// Returns `None` when the NUL is missing or the name would be empty.
pub fn split_nul(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = payload.iter().position(|&b| b == 0)?;
    if at == 0 {
        return None;
    }
    Some((&payload[..at], &payload[at + 1..]))
}

/// Decode a 5-byte touch coordinate payload: x hi/lo, y hi/lo, press state
pub fn decode_coordinates(payload: &[u8]) -> Option<(u16, u16, bool)> {
    if payload.len() != 5 {
        return None;
    }
    let x = BigEndian::read_u16(&payload[0..2]);
    let y = BigEndian::read_u16(&payload[2..4]);
    Some((x, y, payload[4] != 0))
}

/// Identity reported by the display's `connect` handshake banner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    pub device_model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub flash_size: String,
}

/// Parse a `comok` banner, e.g.
/// `comok 2,30601-0,NX4827T043_011R,52,61488,D264B8204F0E1828,16777216`.
///
/// Field layout after the two status fields: model, firmware version, MCU
/// code (skipped), serial number, flash size.
pub fn parse_connect_info(text: &str) -> Option<ConnectInfo> {
    if !text.starts_with("comok") {
        return None;
    }
    let fields: Vec<&str> = text.split(',').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(ConnectInfo {
        device_model: fields[2].trim().to_string(),
        firmware_version: fields[3].trim().to_string(),
        serial_number: fields[5].trim().to_string(),
        flash_size: fields[6].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_signed_positive_single_byte() {
        assert_eq!(decode_signed_le(&[0x01]), Some(1));
    }

    #[test]
    fn test_decode_signed_negative_single_byte() {
        assert_eq!(decode_signed_le(&[0xFF]), Some(-1));
    }

    #[test]
    fn test_decode_signed_full_width() {
        assert_eq!(decode_signed_le(&[0x01, 0x02, 0x03, 0x04]), Some(0x04030201));
    }

    #[test]
    fn test_decode_signed_two_byte_negative() {
        assert_eq!(decode_signed_le(&[0xFE, 0xFF]), Some(-2));
    }

    #[test]
    fn test_decode_signed_rejects_bad_lengths() {
        assert_eq!(decode_signed_le(&[]), None);
        assert_eq!(decode_signed_le(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_split_nul() {
        let payload = b"temp1\0\x01";
        let (name, rest) = split_nul(payload).unwrap();
        assert_eq!(name, b"temp1");
        assert_eq!(rest, &[0x01]);
    }

    #[test]
    fn test_split_nul_missing_or_empty() {
        assert!(split_nul(b"temp1").is_none());
        assert!(split_nul(b"\0x").is_none());
    }

    #[test]
    fn test_decode_coordinates() {
        let (x, y, pressed) = decode_coordinates(&[0x01, 0x2C, 0x00, 0x64, 0x01]).unwrap();
        assert_eq!(x, 300);
        assert_eq!(y, 100);
        assert!(pressed);
        assert!(decode_coordinates(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_parse_connect_info() {
        let info = parse_connect_info(
            "comok 2,30601-0,NX4827T043_011R,52,61488,D264B8204F0E1828,16777216",
        )
        .unwrap();
        assert_eq!(info.device_model, "NX4827T043_011R");
        assert_eq!(info.firmware_version, "52");
        assert_eq!(info.serial_number, "D264B8204F0E1828");
        assert_eq!(info.flash_size, "16777216");
    }

    #[test]
    fn test_parse_connect_info_rejects_other_banners() {
        assert!(parse_connect_info("comfail 1,2,3,4,5,6,7").is_none());
        assert!(parse_connect_info("comok 1,2").is_none());
    }
}
