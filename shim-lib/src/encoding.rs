//! Narrow/wide boundary conversions for the ANSI API spellings.
//!
//! The store only ever holds UTF-16LE string payloads. Narrow writes are
//! transcoded (CP_ACP) on the way in and query results are transcoded back on
//! the way out, with the terminator rules re-applied on both sides so no
//! narrow payload can leak into the store and no wide payload into a narrow
//! buffer.

use windows_sys::Win32::Globalization::{CP_ACP, MultiByteToWideChar, WideCharToMultiByte};

use shared::constants::{REG_MULTI_SZ, is_string_type};
use shared::wide::{ensure_wide_terminated, units_from_utf16le, utf16le_from_units};

/// CP_ACP to UTF-16 conversion of a sized byte range (embedded NULs pass
/// through).
pub fn ansi_to_wide_units(bytes: &[u8]) -> Vec<u16> {
    if bytes.is_empty() {
        return Vec::new();
    }
    unsafe {
        let needed = MultiByteToWideChar(
            CP_ACP,
            0,
            bytes.as_ptr(),
            bytes.len() as i32,
            std::ptr::null_mut(),
            0,
        );
        if needed <= 0 {
            return Vec::new();
        }
        let mut out = vec![0u16; needed as usize];
        let written = MultiByteToWideChar(
            CP_ACP,
            0,
            bytes.as_ptr(),
            bytes.len() as i32,
            out.as_mut_ptr(),
            needed,
        );
        out.truncate(written.max(0) as usize);
        out
    }
}

/// UTF-16 to CP_ACP conversion of a sized unit range.
pub fn wide_units_to_ansi(units: &[u16]) -> Vec<u8> {
    if units.is_empty() {
        return Vec::new();
    }
    unsafe {
        let needed = WideCharToMultiByte(
            CP_ACP,
            0,
            units.as_ptr(),
            units.len() as i32,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
            std::ptr::null_mut(),
        );
        if needed <= 0 {
            return Vec::new();
        }
        let mut out = vec![0u8; needed as usize];
        let written = WideCharToMultiByte(
            CP_ACP,
            0,
            units.as_ptr(),
            units.len() as i32,
            out.as_mut_ptr(),
            needed,
            std::ptr::null(),
            std::ptr::null_mut(),
        );
        out.truncate(written.max(0) as usize);
        out
    }
}

/// Reads a NUL-terminated narrow string and converts it through CP_ACP.
/// `None` for a null pointer (callers map that to the default value / empty
/// subkey as the API dictates).
pub unsafe fn ansi_cstr_to_string(ptr: *const u8) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        let bytes = std::slice::from_raw_parts(ptr, len);
        Some(String::from_utf16_lossy(&ansi_to_wide_units(bytes)))
    }
}

/// Reads a NUL-terminated wide string. `None` for a null pointer.
pub unsafe fn wide_cstr_to_string(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(ptr, len);
        Some(String::from_utf16_lossy(units))
    }
}

/// Normalizes an incoming narrow payload for storage: string types are
/// transcoded to UTF-16LE with correct terminators, everything else is kept
/// verbatim.
pub fn ensure_wide_string_data(value_type: u32, data: &[u8]) -> Vec<u8> {
    if !is_string_type(value_type) {
        return data.to_vec();
    }
    if data.is_empty() {
        return ensure_wide_terminated(value_type, Vec::new());
    }
    let units = ansi_to_wide_units(data);
    ensure_wide_terminated(value_type, utf16le_from_units(&units))
}

/// Converts a stored wide payload for a narrow-spelling query result,
/// re-applying the terminator rules in the narrow encoding.
pub fn wide_to_ansi_bytes_for_query(value_type: u32, wide_bytes: &[u8]) -> Vec<u8> {
    if !is_string_type(value_type) {
        return wide_bytes.to_vec();
    }
    if wide_bytes.is_empty() {
        return vec![0];
    }
    let units = units_from_utf16le(wide_bytes);
    let mut out = wide_units_to_ansi(&units);
    if out.last() != Some(&0) {
        out.push(0);
    }
    if value_type == REG_MULTI_SZ && (out.len() < 2 || out[out.len() - 2] != 0) {
        out.push(0);
    }
    out
}
