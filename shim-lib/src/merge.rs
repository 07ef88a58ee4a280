//! Live half of the merge engine: combines overlay rows with the real
//! registry behind a pass-through handle.
//!
//! Overlay rows come first (tombstones shadow), real entries fill in behind,
//! and the result is sorted case-insensitively. Real enumeration grows its
//! scratch buffer on `ERROR_MORE_DATA` and stops at a hard ordinal bound so
//! a broken provider cannot spin forever.

use windows_sys::Win32::Foundation::{ERROR_MORE_DATA, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
use windows_sys::Win32::System::Registry::HKEY;

use shared::constants::MAX_ENUM_ORDINAL;
use shared::merge::NameMerge;

use crate::detours::orig;
use crate::overlay;

fn enum_real_value_name(real: HKEY, index: u32) -> Option<String> {
    let mut buf: Vec<u16> = vec![0; 256];
    loop {
        let mut cch = buf.len() as u32;
        let rc = unsafe {
            orig::enum_value_w(
                real,
                index,
                buf.as_mut_ptr(),
                &mut cch,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        match rc {
            ERROR_MORE_DATA => {
                let new_len = (cch as usize + 1).max(buf.len() * 2);
                buf.resize(new_len, 0);
            }
            ERROR_SUCCESS => return Some(String::from_utf16_lossy(&buf[..cch as usize])),
            ERROR_NO_MORE_ITEMS => return None,
            _ => return None,
        }
    }
}

fn enum_real_subkey_name(real: HKEY, index: u32) -> Option<String> {
    let mut buf: Vec<u16> = vec![0; 256];
    loop {
        let mut cch = buf.len() as u32;
        let rc = unsafe {
            orig::enum_key_ex_w(
                real,
                index,
                buf.as_mut_ptr(),
                &mut cch,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        match rc {
            ERROR_MORE_DATA => {
                let new_len = (cch as usize + 1).max(buf.len() * 2);
                buf.resize(new_len, 0);
            }
            ERROR_SUCCESS => return Some(String::from_utf16_lossy(&buf[..cch as usize])),
            ERROR_NO_MORE_ITEMS => return None,
            _ => return None,
        }
    }
}

/// Effective value-name set for `path`. A store failure degrades to the
/// real-only view. The whole computation counts as internal dispatch, so
/// none of its sub-reads trace.
pub fn merged_value_names(path: &str, real: HKEY) -> Vec<String> {
    let _dispatch = crate::trace::InternalDispatchGuard::enter();
    let mut merge = NameMerge::new();
    let rows = overlay::with_store(|s| s.list_values(path).unwrap_or_default()).unwrap_or_default();
    for row in &rows {
        merge.add_local(&row.name, row.is_deleted);
    }

    if !real.is_null() {
        let mut index = 0u32;
        while index <= MAX_ENUM_ORDINAL {
            let Some(name) = enum_real_value_name(real, index) else {
                break;
            };
            merge.add_real(&name);
            index += 1;
        }
    }
    merge.into_sorted()
}

/// Effective immediate-subkey set for `path`.
pub fn merged_subkey_names(path: &str, real: HKEY) -> Vec<String> {
    let _dispatch = crate::trace::InternalDispatchGuard::enter();
    let mut merge = NameMerge::new();
    let rows = overlay::with_store(|s| s.list_immediate_subkeys(path).unwrap_or_default())
        .unwrap_or_default();
    for row in &rows {
        merge.add_local(&row.name, row.is_deleted);
    }

    if !real.is_null() {
        let mut index = 0u32;
        while index <= MAX_ENUM_ORDINAL {
            let Some(name) = enum_real_subkey_name(real, index) else {
                break;
            };
            merge.add_real(&name);
            index += 1;
        }
    }
    merge.into_sorted()
}
