//! UTF-16LE payload helpers.
//!
//! String-typed registry values are stored as little-endian 16-bit code
//! units, NUL-terminated (double-NUL for multi-strings). These helpers
//! convert between that byte layout, `u16` unit vectors and Rust strings,
//! and normalize terminators on write.

use crate::constants::{REG_MULTI_SZ, is_string_type};

/// Encodes a string as UTF-16LE bytes including a single NUL terminator.
pub fn utf16le_bytes_with_nul(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Reassembles UTF-16LE bytes into code units. A trailing odd byte is
/// dropped, matching how the platform APIs truncate odd byte counts.
pub fn units_from_utf16le(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn utf16le_from_units(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 2);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decodes UTF-16LE bytes into a string, stopping at the first NUL
/// terminator. Unpaired surrogates are replaced.
pub fn string_from_utf16le(bytes: &[u8]) -> String {
    let units = units_from_utf16le(bytes);
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Normalizes terminators on a wide string payload before it enters the
/// store: a single NUL for `REG_SZ`/`REG_EXPAND_SZ`, a double NUL for
/// `REG_MULTI_SZ`. Non-string types pass through untouched.
pub fn ensure_wide_terminated(value_type: u32, data: Vec<u8>) -> Vec<u8> {
    if !is_string_type(value_type) {
        return data;
    }
    let mut units = units_from_utf16le(&data);
    if units.last() != Some(&0) {
        units.push(0);
    }
    if value_type == REG_MULTI_SZ && (units.len() < 2 || units[units.len() - 2] != 0) {
        units.push(0);
    }
    utf16le_from_units(&units)
}

/// Decodes the raw bytes of a registry text file. A UTF-16LE byte-order mark
/// selects wide decoding; anything else is treated as UTF-8.
pub fn decode_reg_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let units = units_from_utf16le(&bytes[2..]);
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Encodes registry text as UTF-16LE prefixed with a byte-order mark, the
/// format `regedit` itself emits.
pub fn encode_utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2 + 2);
    out.extend_from_slice(&[0xFF, 0xFE]);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{REG_BINARY, REG_SZ};

    #[test]
    fn round_trip_preserves_code_units_and_terminator() {
        let bytes = utf16le_bytes_with_nul("wrapped-ok");
        assert_eq!(bytes.len(), 22);
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
        assert_eq!(string_from_utf16le(&bytes), "wrapped-ok");
    }

    #[test]
    fn embedded_nul_survives_unit_round_trip() {
        let units = [0x41u16, 0x00, 0x42];
        let bytes = utf16le_from_units(&units);
        assert_eq!(units_from_utf16le(&bytes), units);
        // Display decoding stops at the embedded NUL by design.
        assert_eq!(string_from_utf16le(&bytes), "A");
    }

    #[test]
    fn terminator_normalization() {
        let unterminated = utf16le_from_units(&[0x61, 0x62]);
        let fixed = ensure_wide_terminated(REG_SZ, unterminated);
        assert_eq!(units_from_utf16le(&fixed), [0x61, 0x62, 0]);

        let multi = utf16le_from_units(&[0x61, 0]);
        let fixed = ensure_wide_terminated(REG_MULTI_SZ, multi);
        assert_eq!(units_from_utf16le(&fixed), [0x61, 0, 0]);

        let empty_multi = ensure_wide_terminated(REG_MULTI_SZ, Vec::new());
        assert_eq!(units_from_utf16le(&empty_multi), [0, 0]);

        let binary = ensure_wide_terminated(REG_BINARY, vec![1, 2, 3]);
        assert_eq!(binary, vec![1, 2, 3]);
    }

    #[test]
    fn reg_text_decoding_detects_bom() {
        let wide = encode_utf16le_with_bom("Hello 世界");
        assert_eq!(decode_reg_text(&wide), "Hello 世界");
        assert_eq!(decode_reg_text("plain utf-8".as_bytes()), "plain utf-8");
    }
}
