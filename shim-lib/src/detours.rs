//! The API interceptors: detours over the registry surface that dispatch
//! between the overlay and pass-through handling.
//!
//! Per-call dispatch:
//! 1. A thread re-entering a hook (bypass region active) forwards straight
//!    to the original function.
//! 2. The starting handle resolves to a canonical path: our virtual handle,
//!    the well-known `HKLM` root, or a tracked real handle. Anything else is
//!    foreign and passes through unchanged.
//! 3. Subkey strings are canonicalized and joined onto the starting path.
//! 4. Reads consult the overlay first and defer to the real registry behind
//!    the pass-through handle; writes and deletes go to the overlay only.
//!
//! Both spellings of every entry point are hooked (`full` scope, the
//! default) so a virtual handle produced by one spelling can never reach an
//! unhooked callee under the other.

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

use once_cell::sync::Lazy;
use windows_sys::Win32::Foundation::{
    ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER, ERROR_MORE_DATA, ERROR_NO_MORE_ITEMS,
    ERROR_REGISTRY_IO_FAILED, ERROR_SUCCESS, ERROR_UNSUPPORTED_TYPE, FILETIME,
};
use windows_sys::Win32::System::Environment::ExpandEnvironmentStringsW;
use windows_sys::Win32::System::Registry::{
    HKEY, HKEY_LOCAL_MACHINE, KEY_READ, REG_CREATED_NEW_KEY, REG_OPENED_EXISTING_KEY,
    RRF_NOEXPAND, RRF_ZEROONFAILURE, RegCloseKey,
};

use shared::constants::{
    ENV_HOOK_MODE, ENV_HOOK_MODE_LEGACY, HKLM_ROOT, REG_BINARY, REG_DWORD, REG_EXPAND_SZ,
    REG_MULTI_SZ, REG_NONE, REG_QWORD, REG_SZ, is_string_type,
};
use shared::keypath::{canonicalize_subkey, join_key_path};
use shared::store::StoredValue;
use shared::wide::{ensure_wide_terminated, units_from_utf16le, utf16le_bytes_with_nul, utf16le_from_units};

use crate::call_guard::CallGuard;
use crate::encoding::{
    ansi_cstr_to_string, ensure_wide_string_data, wide_cstr_to_string, wide_to_ansi_bytes_for_query,
    wide_units_to_ansi,
};
use crate::handles::{
    VirtualKey, as_virtual, drain_virtual_keys, is_hklm_root, new_virtual_key, real_key_path,
    register_real_key, unregister_real_key,
};
use crate::manager::{HookEntry, HookManager, acquire_engine, release_engine};
use crate::merge::{merged_subkey_names, merged_value_names};
use crate::overlay;
use crate::trace;

// ---------------------------------------------------------------------------
// Original-function plumbing.
//
// Each hooked API keeps its trampoline pointer in an `AtomicPtr`, published
// before the patch goes live. The callers below are the only way our own
// code reaches the real registry; a null pointer (API not hooked in this
// scope) falls back to the unpatched import.

macro_rules! original_fn {
    ($static_name:ident, $caller:ident, $direct:path,
     ($($arg:ident : $argty:ty),*)) => {
        pub(super) static $static_name: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

        pub(crate) unsafe fn $caller($($arg: $argty),*) -> u32 {
            let p = $static_name.load(Ordering::Acquire);
            if p.is_null() {
                let f: unsafe extern "system" fn($($argty),*) -> u32 =
                    mem::transmute($direct as *const c_void);
                f($($arg),*)
            } else {
                let f: unsafe extern "system" fn($($argty),*) -> u32 = mem::transmute(p);
                f($($arg),*)
            }
        }
    };
}

pub(crate) mod orig {
    use super::*;
    use windows_sys::Win32::System::Registry as reg;

    original_fn!(OPEN_KEY_EX_W, open_key_ex_w, reg::RegOpenKeyExW,
        (hkey: HKEY, sub: *const u16, options: u32, sam: u32, out: *mut HKEY));
    original_fn!(OPEN_KEY_W, open_key_w, reg::RegOpenKeyW,
        (hkey: HKEY, sub: *const u16, out: *mut HKEY));
    original_fn!(CREATE_KEY_EX_W, create_key_ex_w, reg::RegCreateKeyExW,
        (hkey: HKEY, sub: *const u16, reserved: u32, class: *const u16, options: u32,
         sam: u32, security: *const c_void, out: *mut HKEY, disposition: *mut u32));
    original_fn!(CREATE_KEY_W, create_key_w, reg::RegCreateKeyW,
        (hkey: HKEY, sub: *const u16, out: *mut HKEY));
    original_fn!(CLOSE_KEY, close_key, reg::RegCloseKey, (hkey: HKEY));
    original_fn!(QUERY_VALUE_EX_W, query_value_ex_w, reg::RegQueryValueExW,
        (hkey: HKEY, name: *const u16, reserved: *const u32, vtype: *mut u32,
         data: *mut u8, cb: *mut u32));
    original_fn!(QUERY_VALUE_W, query_value_w, reg::RegQueryValueW,
        (hkey: HKEY, sub: *const u16, data: *mut u16, cb: *mut i32));
    original_fn!(GET_VALUE_W, get_value_w, reg::RegGetValueW,
        (hkey: HKEY, sub: *const u16, name: *const u16, flags: u32, vtype: *mut u32,
         data: *mut c_void, cb: *mut u32));
    original_fn!(SET_VALUE_EX_W, set_value_ex_w, reg::RegSetValueExW,
        (hkey: HKEY, name: *const u16, reserved: u32, vtype: u32, data: *const u8, cb: u32));
    original_fn!(SET_VALUE_W, set_value_w, reg::RegSetValueW,
        (hkey: HKEY, sub: *const u16, vtype: u32, data: *const u16, cb: u32));
    original_fn!(SET_KEY_VALUE_W, set_key_value_w, reg::RegSetKeyValueW,
        (hkey: HKEY, sub: *const u16, name: *const u16, vtype: u32,
         data: *const c_void, cb: u32));
    original_fn!(DELETE_VALUE_W, delete_value_w, reg::RegDeleteValueW,
        (hkey: HKEY, name: *const u16));
    original_fn!(DELETE_KEY_W, delete_key_w, reg::RegDeleteKeyW,
        (hkey: HKEY, sub: *const u16));
    original_fn!(DELETE_KEY_EX_W, delete_key_ex_w, reg::RegDeleteKeyExW,
        (hkey: HKEY, sub: *const u16, sam: u32, reserved: u32));
    original_fn!(ENUM_VALUE_W, enum_value_w, reg::RegEnumValueW,
        (hkey: HKEY, index: u32, name: *mut u16, cch_name: *mut u32, reserved: *const u32,
         vtype: *mut u32, data: *mut u8, cb: *mut u32));
    original_fn!(ENUM_KEY_EX_W, enum_key_ex_w, reg::RegEnumKeyExW,
        (hkey: HKEY, index: u32, name: *mut u16, cch_name: *mut u32, reserved: *const u32,
         class: *mut u16, cch_class: *mut u32, last_write: *mut FILETIME));
    original_fn!(ENUM_KEY_W, enum_key_w, reg::RegEnumKeyW,
        (hkey: HKEY, index: u32, name: *mut u16, cch_name: u32));
    original_fn!(QUERY_INFO_KEY_W, query_info_key_w, reg::RegQueryInfoKeyW,
        (hkey: HKEY, class: *mut u16, cch_class: *mut u32, reserved: *const u32,
         subkeys: *mut u32, max_subkey_len: *mut u32, max_class_len: *mut u32,
         values: *mut u32, max_value_name_len: *mut u32, max_value_len: *mut u32,
         security_len: *mut u32, last_write: *mut FILETIME));

    original_fn!(OPEN_KEY_EX_A, open_key_ex_a, reg::RegOpenKeyExA,
        (hkey: HKEY, sub: *const u8, options: u32, sam: u32, out: *mut HKEY));
    original_fn!(OPEN_KEY_A, open_key_a, reg::RegOpenKeyA,
        (hkey: HKEY, sub: *const u8, out: *mut HKEY));
    original_fn!(CREATE_KEY_EX_A, create_key_ex_a, reg::RegCreateKeyExA,
        (hkey: HKEY, sub: *const u8, reserved: u32, class: *const u8, options: u32,
         sam: u32, security: *const c_void, out: *mut HKEY, disposition: *mut u32));
    original_fn!(CREATE_KEY_A, create_key_a, reg::RegCreateKeyA,
        (hkey: HKEY, sub: *const u8, out: *mut HKEY));
    original_fn!(QUERY_VALUE_EX_A, query_value_ex_a, reg::RegQueryValueExA,
        (hkey: HKEY, name: *const u8, reserved: *const u32, vtype: *mut u32,
         data: *mut u8, cb: *mut u32));
    original_fn!(QUERY_VALUE_A, query_value_a, reg::RegQueryValueA,
        (hkey: HKEY, sub: *const u8, data: *mut u8, cb: *mut i32));
    original_fn!(GET_VALUE_A, get_value_a, reg::RegGetValueA,
        (hkey: HKEY, sub: *const u8, name: *const u8, flags: u32, vtype: *mut u32,
         data: *mut c_void, cb: *mut u32));
    original_fn!(SET_VALUE_EX_A, set_value_ex_a, reg::RegSetValueExA,
        (hkey: HKEY, name: *const u8, reserved: u32, vtype: u32, data: *const u8, cb: u32));
    original_fn!(SET_VALUE_A, set_value_a, reg::RegSetValueA,
        (hkey: HKEY, sub: *const u8, vtype: u32, data: *const u8, cb: u32));
    original_fn!(SET_KEY_VALUE_A, set_key_value_a, reg::RegSetKeyValueA,
        (hkey: HKEY, sub: *const u8, name: *const u8, vtype: u32,
         data: *const c_void, cb: u32));
    original_fn!(DELETE_VALUE_A, delete_value_a, reg::RegDeleteValueA,
        (hkey: HKEY, name: *const u8));
    original_fn!(DELETE_KEY_A, delete_key_a, reg::RegDeleteKeyA,
        (hkey: HKEY, sub: *const u8));
    original_fn!(ENUM_VALUE_A, enum_value_a, reg::RegEnumValueA,
        (hkey: HKEY, index: u32, name: *mut u8, cch_name: *mut u32, reserved: *const u32,
         vtype: *mut u32, data: *mut u8, cb: *mut u32));
    original_fn!(ENUM_KEY_EX_A, enum_key_ex_a, reg::RegEnumKeyExA,
        (hkey: HKEY, index: u32, name: *mut u8, cch_name: *mut u32, reserved: *const u32,
         class: *mut u8, cch_class: *mut u32, last_write: *mut FILETIME));
    original_fn!(ENUM_KEY_A, enum_key_a, reg::RegEnumKeyA,
        (hkey: HKEY, index: u32, name: *mut u8, cch_name: u32));
    original_fn!(QUERY_INFO_KEY_A, query_info_key_a, reg::RegQueryInfoKeyA,
        (hkey: HKEY, class: *mut u8, cch_class: *mut u32, reserved: *const u32,
         subkeys: *mut u32, max_subkey_len: *mut u32, max_class_len: *mut u32,
         values: *mut u32, max_value_name_len: *mut u32, max_value_len: *mut u32,
         security_len: *mut u32, last_write: *mut FILETIME));
}

// ---------------------------------------------------------------------------
// Handle resolution.

enum Start {
    Virtual(&'static VirtualKey),
    Root,
    Tracked(String, HKEY),
    Foreign,
}

fn resolve_start(h: HKEY) -> Start {
    if let Some(vk) = as_virtual(h) {
        return Start::Virtual(vk);
    }
    if is_hklm_root(h) {
        return Start::Root;
    }
    if let Some(path) = real_key_path(h) {
        return Start::Tracked(path, h);
    }
    Start::Foreign
}

impl Start {
    fn is_foreign(&self) -> bool {
        matches!(self, Start::Foreign)
    }

    fn path(&self) -> String {
        match self {
            Start::Virtual(vk) => vk.path().to_string(),
            Start::Root => HKLM_ROOT.to_string(),
            Start::Tracked(path, _) => path.clone(),
            Start::Foreign => String::new(),
        }
    }

    /// Handle for pass-through reads, or null when the path has no real
    /// counterpart.
    fn real(&self) -> HKEY {
        match self {
            Start::Virtual(vk) => vk.real(),
            Start::Root => HKEY_LOCAL_MACHINE,
            Start::Tracked(_, h) => *h,
            Start::Foreign => ptr::null_mut(),
        }
    }
}

/// Joins the starting path with an optional canonicalized subkey.
fn target_path(start: &Start, sub: Option<&str>) -> String {
    match sub {
        Some(s) => join_key_path(&start.path(), &canonicalize_subkey(s)),
        None => start.path(),
    }
}

/// Opens the real key behind a canonical path for read/enum merging. Done
/// through the original function, so nothing re-enters the dispatch.
unsafe fn open_real_key(full_path: &str) -> HKEY {
    let rel = full_path.strip_prefix(HKLM_ROOT).unwrap_or("");
    let rel = rel.strip_prefix('\\').unwrap_or(rel);
    let mut out: HKEY = ptr::null_mut();
    let rc = if rel.is_empty() {
        orig::open_key_ex_w(HKEY_LOCAL_MACHINE, ptr::null(), 0, KEY_READ, &mut out)
    } else {
        let wide: Vec<u16> = rel.encode_utf16().chain(std::iter::once(0)).collect();
        orig::open_key_ex_w(HKEY_LOCAL_MACHINE, wide.as_ptr(), 0, KEY_READ, &mut out)
    };
    if rc == ERROR_SUCCESS { out } else { ptr::null_mut() }
}

unsafe fn close_real_key(real: HKEY) {
    if !real.is_null() && !is_hklm_root(real) {
        orig::close_key(real);
    }
}

// ---------------------------------------------------------------------------
// Overlay access.

enum OverlayLookup {
    Hit(StoredValue),
    Tombstone,
    Miss,
    Unavailable,
}

fn lookup_value(path: &str, name: &str) -> OverlayLookup {
    match overlay::with_store(|s| s.get_value(path, name)) {
        Some(Ok(Some(v))) if v.is_deleted => OverlayLookup::Tombstone,
        Some(Ok(Some(v))) => OverlayLookup::Hit(v),
        Some(Ok(None)) => OverlayLookup::Miss,
        Some(Err(_)) | None => OverlayLookup::Unavailable,
    }
}

/// Key-existence probe used by open: local evidence plus tombstone state.
/// `None` means the store is unavailable.
fn lookup_key(path: &str) -> Option<(bool, bool)> {
    overlay::with_store(|s| {
        let deleted = s.is_key_deleted(path).ok()?;
        let exists = s.key_exists_locally(path).ok()?;
        Some((exists, deleted))
    })
    .flatten()
}

// ---------------------------------------------------------------------------
// Output helpers.

/// The query buffer contract: NULL buffer reports the required size with
/// success, a short buffer reports `ERROR_MORE_DATA` plus the required size,
/// an adequate one is filled.
unsafe fn write_data_out(data: &[u8], lpdata: *mut u8, lpcb: *mut u32) -> u32 {
    let needed = data.len() as u32;
    if lpcb.is_null() {
        return if lpdata.is_null() {
            ERROR_SUCCESS
        } else {
            ERROR_INVALID_PARAMETER
        };
    }
    if lpdata.is_null() {
        *lpcb = needed;
        return ERROR_SUCCESS;
    }
    if *lpcb < needed {
        *lpcb = needed;
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(data.as_ptr(), lpdata, data.len());
    *lpcb = needed;
    ERROR_SUCCESS
}

/// Writes a wide name into an enum output buffer. `cch` is the buffer
/// capacity in characters including the terminator on input, the written
/// length excluding it on output.
unsafe fn write_wide_name_out(name: &str, lpname: *mut u16, lpcch: *mut u32) -> u32 {
    if lpname.is_null() || lpcch.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if (*lpcch as usize) < units.len() + 1 {
        *lpcch = units.len() as u32;
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(units.as_ptr(), lpname, units.len());
    *lpname.add(units.len()) = 0;
    *lpcch = units.len() as u32;
    ERROR_SUCCESS
}

/// Narrow-spelling variant of [`write_wide_name_out`].
unsafe fn write_ansi_name_out(name: &str, lpname: *mut u8, lpcch: *mut u32) -> u32 {
    if lpname.is_null() || lpcch.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    let bytes = wide_units_to_ansi(&units);
    if (*lpcch as usize) < bytes.len() + 1 {
        *lpcch = bytes.len() as u32;
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), lpname, bytes.len());
    *lpname.add(bytes.len()) = 0;
    *lpcch = bytes.len() as u32;
    ERROR_SUCCESS
}

unsafe fn zero_filetime(ft: *mut FILETIME) {
    if !ft.is_null() {
        (*ft).dwLowDateTime = 0;
        (*ft).dwHighDateTime = 0;
    }
}

// ---------------------------------------------------------------------------
// Shared operation cores.

/// Open/create dispatch once the caller's strings are canonical.
unsafe fn open_or_create(
    api: &'static str,
    start: &Start,
    sub: Option<&str>,
    create: bool,
    out: *mut HKEY,
    disposition: *mut u32,
) -> u32 {
    if out.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let full = target_path(start, sub);

    // Always try to open the real key as well, so later reads and
    // enumerations can merge.
    let real = open_real_key(&full);

    let Some((exists_locally, deleted)) = lookup_key(&full) else {
        // Store failure: degrade to the raw real handle when there is one.
        if !real.is_null() {
            register_real_key(real, &full);
            *out = real;
            trace::api_event(api, if create { "create_key" } else { "open_key" }, &full, "", "rc=0 passthrough");
            return ERROR_SUCCESS;
        }
        return ERROR_REGISTRY_IO_FAILED;
    };

    if create {
        let put_ok = overlay::with_store(|s| s.put_key(&full).is_ok()).unwrap_or(false);
        if !put_ok {
            if !real.is_null() {
                register_real_key(real, &full);
                *out = real;
                return ERROR_SUCCESS;
            }
            return ERROR_REGISTRY_IO_FAILED;
        }
        if !disposition.is_null() {
            *disposition = if !exists_locally && real.is_null() {
                REG_CREATED_NEW_KEY
            } else {
                REG_OPENED_EXISTING_KEY
            };
        }
        *out = new_virtual_key(full.clone(), real);
        trace::api_event(api, "create_key", &full, "", "rc=0");
        return ERROR_SUCCESS;
    }

    if deleted {
        close_real_key(real);
        trace::api_event(api, "open_key", &full, "", "rc=2 tombstoned");
        return ERROR_FILE_NOT_FOUND;
    }
    if !exists_locally && real.is_null() {
        trace::api_event(api, "open_key", &full, "", "rc=2");
        return ERROR_FILE_NOT_FOUND;
    }
    *out = new_virtual_key(full.clone(), real);
    trace::api_event(api, "open_key", &full, "", "rc=0");
    ERROR_SUCCESS
}

/// Overlay-only write core. Writes never touch the real registry, so a
/// store failure surfaces instead of falling through.
unsafe fn set_value_core(
    api: &'static str,
    path: &str,
    name: &str,
    value_type: u32,
    data: Vec<u8>,
) -> u32 {
    let ok = overlay::with_store(|s| s.put_value(path, name, value_type, &data).is_ok())
        .unwrap_or(false);
    if ok {
        trace::api_event(
            api,
            "set_value",
            path,
            name,
            &trace::format_value_for_trace(true, value_type, &data, false),
        );
        ERROR_SUCCESS
    } else {
        ERROR_REGISTRY_IO_FAILED
    }
}

unsafe fn delete_value_core(api: &'static str, path: &str, name: &str) -> u32 {
    let ok = overlay::with_store(|s| s.delete_value(path, name).is_ok()).unwrap_or(false);
    if ok {
        trace::api_event(api, "delete_value", path, name, "rc=0");
        ERROR_SUCCESS
    } else {
        ERROR_REGISTRY_IO_FAILED
    }
}

unsafe fn delete_key_core(api: &'static str, path: &str) -> u32 {
    let ok = overlay::with_store(|s| s.delete_key_tree(path).is_ok()).unwrap_or(false);
    if ok {
        trace::api_event(api, "delete_key", path, "", "rc=0");
        ERROR_SUCCESS
    } else {
        ERROR_REGISTRY_IO_FAILED
    }
}

/// Fetches the payload behind a merged value name: overlay row when live,
/// otherwise the real registry via the original API. Runs as internal
/// dispatch so the sub-reads never emit their own trace lines.
unsafe fn fetch_value(path: &str, real: HKEY, name: &str) -> Option<(u32, Vec<u8>)> {
    let _dispatch = trace::InternalDispatchGuard::enter();
    match lookup_value(path, name) {
        OverlayLookup::Hit(v) => Some((v.value_type, v.data)),
        OverlayLookup::Tombstone => None,
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            if real.is_null() {
                return None;
            }
            let name_w: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let mut buf: Vec<u8> = vec![0; 256];
            loop {
                let mut vtype = 0u32;
                let mut cb = buf.len() as u32;
                let rc = orig::query_value_ex_w(
                    real,
                    name_w.as_ptr(),
                    ptr::null(),
                    &mut vtype,
                    buf.as_mut_ptr(),
                    &mut cb,
                );
                match rc {
                    ERROR_MORE_DATA => {
                        // Guarantee growth even against a provider that
                        // reports a stale size.
                        let new_len = (cb as usize).max(buf.len() * 2);
                        buf.resize(new_len, 0);
                    }
                    ERROR_SUCCESS => {
                        buf.truncate(cb as usize);
                        return Some((vtype, buf));
                    }
                    _ => return None,
                }
            }
        }
    }
}

/// Longest payload among the merged values, for `RegQueryInfoKey`.
unsafe fn max_value_data_len(path: &str, real: HKEY, names: &[String], ansi: bool) -> u32 {
    let mut max = 0u32;
    for name in names {
        if let Some((vtype, data)) = fetch_value(path, real, name) {
            let len = if ansi && is_string_type(vtype) {
                wide_to_ansi_bytes_for_query(vtype, &data).len()
            } else {
                data.len()
            };
            max = max.max(len as u32);
        }
    }
    max
}

fn expand_environment(data: &[u8]) -> Vec<u8> {
    let mut units = units_from_utf16le(data);
    if units.last() != Some(&0) {
        units.push(0);
    }
    unsafe {
        let needed = ExpandEnvironmentStringsW(units.as_ptr(), ptr::null_mut(), 0);
        if needed == 0 {
            return data.to_vec();
        }
        let mut out = vec![0u16; needed as usize];
        let written = ExpandEnvironmentStringsW(units.as_ptr(), out.as_mut_ptr(), needed);
        if written == 0 || written > needed {
            return data.to_vec();
        }
        out.truncate(written as usize);
        utf16le_from_units(&out)
    }
}

/// `RRF_RT_*` filter check against the effective type.
fn type_allowed(flags: u32, value_type: u32) -> bool {
    let mask = flags & 0xFFFF;
    if mask == 0 || mask == 0xFFFF {
        return true;
    }
    let bit = match value_type {
        REG_NONE => 0x0001,
        REG_SZ => 0x0002,
        REG_EXPAND_SZ => 0x0004,
        REG_BINARY => 0x0008,
        REG_DWORD => 0x0010,
        REG_MULTI_SZ => 0x0020,
        REG_QWORD => 0x0040,
        _ => 0,
    };
    mask & bit != 0
}

// ---------------------------------------------------------------------------
// Wide detours.

unsafe extern "system" fn hook_reg_open_key_ex_w(
    hkey: HKEY,
    sub: *const u16,
    options: u32,
    sam: u32,
    out: *mut HKEY,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::open_key_ex_w(hkey, sub, options, sam, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::open_key_ex_w(hkey, sub, options, sam, out);
    }
    let sub_str = wide_cstr_to_string(sub);
    open_or_create("RegOpenKeyExW", &start, sub_str.as_deref(), false, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_open_key_w(hkey: HKEY, sub: *const u16, out: *mut HKEY) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::open_key_w(hkey, sub, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::open_key_w(hkey, sub, out);
    }
    let sub_str = wide_cstr_to_string(sub);
    open_or_create("RegOpenKeyW", &start, sub_str.as_deref(), false, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_create_key_ex_w(
    hkey: HKEY,
    sub: *const u16,
    reserved: u32,
    class: *const u16,
    options: u32,
    sam: u32,
    security: *const c_void,
    out: *mut HKEY,
    disposition: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::create_key_ex_w(hkey, sub, reserved, class, options, sam, security, out, disposition);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::create_key_ex_w(hkey, sub, reserved, class, options, sam, security, out, disposition);
    }
    let sub_str = wide_cstr_to_string(sub);
    open_or_create("RegCreateKeyExW", &start, sub_str.as_deref(), true, out, disposition)
}

unsafe extern "system" fn hook_reg_create_key_w(hkey: HKEY, sub: *const u16, out: *mut HKEY) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::create_key_w(hkey, sub, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::create_key_w(hkey, sub, out);
    }
    let sub_str = wide_cstr_to_string(sub);
    open_or_create("RegCreateKeyW", &start, sub_str.as_deref(), true, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_close_key(hkey: HKEY) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::close_key(hkey);
    };
    if let Some(vk) = as_virtual(hkey) {
        // Release the real sub-handle; the virtual record itself stays
        // addressable until shim teardown (closing races are benign then).
        let real = vk.take_real();
        close_real_key(real);
        return ERROR_SUCCESS;
    }
    if is_hklm_root(hkey) {
        return ERROR_SUCCESS;
    }
    unregister_real_key(hkey);
    orig::close_key(hkey)
}

unsafe extern "system" fn hook_reg_query_value_ex_w(
    hkey: HKEY,
    name: *const u16,
    reserved: *const u32,
    vtype: *mut u32,
    data: *mut u8,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_value_ex_w(hkey, name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_value_ex_w(hkey, name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let real = start.real();
    let name_str = wide_cstr_to_string(name).unwrap_or_default();

    match lookup_value(&path, &name_str) {
        OverlayLookup::Tombstone => {
            trace::read_result("RegQueryValueExW", &path, &name_str, ERROR_FILE_NOT_FOUND, false, 0, None, 0)
        }
        OverlayLookup::Hit(v) => {
            if !vtype.is_null() {
                *vtype = v.value_type;
            }
            let rc = write_data_out(&v.data, data, cb);
            trace::read_result(
                "RegQueryValueExW",
                &path,
                &name_str,
                rc,
                true,
                v.value_type,
                if data.is_null() { None } else { Some(v.data.as_slice()) },
                v.data.len() as u32,
            )
        }
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            if real.is_null() {
                return ERROR_FILE_NOT_FOUND;
            }
            let rc = orig::query_value_ex_w(real, name, reserved, vtype, data, cb);
            let cb_out = if cb.is_null() { 0 } else { *cb };
            trace::read_result("RegQueryValueExW", &path, &name_str, rc, false, 0, None, cb_out)
        }
    }
}

unsafe extern "system" fn hook_reg_query_value_w(
    hkey: HKEY,
    sub: *const u16,
    data: *mut u16,
    cb: *mut i32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_value_w(hkey, sub, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_value_w(hkey, sub, data, cb);
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    query_default_value_legacy("RegQueryValueW", &start, &full, false, data as *mut u8, cb)
}

/// The legacy default-value query: absent values read back as an empty
/// string, absent keys as `ERROR_FILE_NOT_FOUND`.
unsafe fn query_default_value_legacy(
    api: &'static str,
    _start: &Start,
    full: &str,
    ansi: bool,
    data: *mut u8,
    cb: *mut i32,
) -> u32 {
    let empty_string = || if ansi { vec![0u8] } else { vec![0u8, 0] };
    let payload = match lookup_value(full, "") {
        OverlayLookup::Tombstone => return ERROR_FILE_NOT_FOUND,
        OverlayLookup::Hit(v) => {
            if ansi {
                wide_to_ansi_bytes_for_query(v.value_type, &v.data)
            } else {
                v.data
            }
        }
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            let exists_locally = lookup_key(full)
                .map(|(exists, deleted)| exists && !deleted)
                .unwrap_or(false);
            let sub_real = open_real_key(full);
            if sub_real.is_null() && !exists_locally {
                return ERROR_FILE_NOT_FOUND;
            }
            // Defer to the real default value when the key exists for real;
            // an overlay-only key reads back as an empty string.
            let result = if sub_real.is_null() {
                empty_string()
            } else {
                match fetch_value(full, sub_real, "") {
                    Some((vtype, bytes)) => {
                        if ansi {
                            wide_to_ansi_bytes_for_query(vtype, &bytes)
                        } else {
                            bytes
                        }
                    }
                    None => empty_string(),
                }
            };
            close_real_key(sub_real);
            result
        }
    };

    if cb.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let needed = payload.len() as i32;
    if data.is_null() {
        *cb = needed;
        trace::api_event(api, "query_value", full, "", "rc=0 size_only");
        return ERROR_SUCCESS;
    }
    if *cb < needed {
        *cb = needed;
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
    *cb = needed;
    trace::api_event(api, "query_value", full, "", "rc=0");
    ERROR_SUCCESS
}

unsafe extern "system" fn hook_reg_get_value_w(
    hkey: HKEY,
    sub: *const u16,
    name: *const u16,
    flags: u32,
    vtype: *mut u32,
    data: *mut c_void,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::get_value_w(hkey, sub, name, flags, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::get_value_w(hkey, sub, name, flags, vtype, data, cb);
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let name_str = wide_cstr_to_string(name).unwrap_or_default();

    match lookup_value(&full, &name_str) {
        OverlayLookup::Tombstone => ERROR_FILE_NOT_FOUND,
        OverlayLookup::Hit(v) => {
            get_value_serve("RegGetValueW", &full, &name_str, v, flags, false, vtype, data as *mut u8, cb)
        }
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            let real = start.real();
            if real.is_null() {
                return ERROR_FILE_NOT_FOUND;
            }
            orig::get_value_w(real, sub, name, flags, vtype, data, cb)
        }
    }
}

/// Serves a `RegGetValue` request from an overlay row: expansion, type
/// filter, buffer contract, optional zero-on-failure.
unsafe fn get_value_serve(
    api: &'static str,
    path: &str,
    name: &str,
    value: StoredValue,
    flags: u32,
    ansi: bool,
    vtype_out: *mut u32,
    data_out: *mut u8,
    cb: *mut u32,
) -> u32 {
    let mut vtype = value.value_type;
    let mut payload = value.data;
    if vtype == REG_EXPAND_SZ && flags & RRF_NOEXPAND == 0 {
        payload = expand_environment(&payload);
        vtype = REG_SZ;
    }
    if !type_allowed(flags, vtype) {
        return ERROR_UNSUPPORTED_TYPE;
    }
    if ansi && is_string_type(vtype) {
        payload = wide_to_ansi_bytes_for_query(vtype, &payload);
    }
    if !vtype_out.is_null() {
        *vtype_out = vtype;
    }
    let capacity = if cb.is_null() { 0 } else { *cb };
    let rc = write_data_out(&payload, data_out, cb);
    if rc != ERROR_SUCCESS && flags & RRF_ZEROONFAILURE != 0 && !data_out.is_null() {
        ptr::write_bytes(data_out, 0, capacity as usize);
    }
    trace::read_result(
        api,
        path,
        name,
        rc,
        true,
        vtype,
        if data_out.is_null() { None } else { Some(payload.as_slice()) },
        payload.len() as u32,
    )
}

unsafe extern "system" fn hook_reg_set_value_ex_w(
    hkey: HKEY,
    name: *const u16,
    reserved: u32,
    vtype: u32,
    data: *const u8,
    cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_value_ex_w(hkey, name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_value_ex_w(hkey, name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let name_str = wide_cstr_to_string(name).unwrap_or_default();
    let raw = if data.is_null() || cb == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, cb as usize).to_vec()
    };
    let payload = ensure_wide_terminated(vtype, raw);
    set_value_core("RegSetValueExW", &path, &name_str, vtype, payload)
}

unsafe extern "system" fn hook_reg_set_value_w(
    hkey: HKEY,
    sub: *const u16,
    vtype: u32,
    data: *const u16,
    _cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_value_w(hkey, sub, vtype, data, _cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_value_w(hkey, sub, vtype, data, _cb);
    }
    if vtype != REG_SZ {
        return ERROR_INVALID_PARAMETER;
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let text = wide_cstr_to_string(data).unwrap_or_default();
    set_value_core("RegSetValueW", &full, "", REG_SZ, utf16le_bytes_with_nul(&text))
}

unsafe extern "system" fn hook_reg_set_key_value_w(
    hkey: HKEY,
    sub: *const u16,
    name: *const u16,
    vtype: u32,
    data: *const c_void,
    cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_key_value_w(hkey, sub, name, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_key_value_w(hkey, sub, name, vtype, data, cb);
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let name_str = wide_cstr_to_string(name).unwrap_or_default();
    let raw = if data.is_null() || cb == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data as *const u8, cb as usize).to_vec()
    };
    let payload = ensure_wide_terminated(vtype, raw);
    set_value_core("RegSetKeyValueW", &full, &name_str, vtype, payload)
}

unsafe extern "system" fn hook_reg_delete_value_w(hkey: HKEY, name: *const u16) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::delete_value_w(hkey, name);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::delete_value_w(hkey, name);
    }
    let path = start.path();
    let name_str = wide_cstr_to_string(name).unwrap_or_default();
    delete_value_core("RegDeleteValueW", &path, &name_str)
}

unsafe extern "system" fn hook_reg_delete_key_w(hkey: HKEY, sub: *const u16) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::delete_key_w(hkey, sub);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::delete_key_w(hkey, sub);
    }
    if sub.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    delete_key_core("RegDeleteKeyW", &full)
}

unsafe extern "system" fn hook_reg_delete_key_ex_w(
    hkey: HKEY,
    sub: *const u16,
    sam: u32,
    reserved: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::delete_key_ex_w(hkey, sub, sam, reserved);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::delete_key_ex_w(hkey, sub, sam, reserved);
    }
    if sub.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let sub_str = wide_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    delete_key_core("RegDeleteKeyExW", &full)
}

unsafe extern "system" fn hook_reg_enum_value_w(
    hkey: HKEY,
    index: u32,
    name: *mut u16,
    cch_name: *mut u32,
    reserved: *const u32,
    vtype: *mut u32,
    data: *mut u8,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_value_w(hkey, index, name, cch_name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_value_w(hkey, index, name, cch_name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let real = start.real();
    let names = merged_value_names(&path, real);
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    let (value_type, payload) = fetch_value(&path, real, entry_name).unwrap_or((REG_NONE, Vec::new()));

    let rc = write_wide_name_out(entry_name, name, cch_name);
    if rc != ERROR_SUCCESS {
        return rc;
    }
    if !vtype.is_null() {
        *vtype = value_type;
    }
    let rc = if cb.is_null() {
        if data.is_null() {
            ERROR_SUCCESS
        } else {
            ERROR_INVALID_PARAMETER
        }
    } else {
        write_data_out(&payload, data, cb)
    };
    trace::api_event(
        "RegEnumValueW",
        "enum_value",
        &path,
        entry_name,
        &format!("idx={index} rc={rc}"),
    );
    rc
}

unsafe extern "system" fn hook_reg_enum_key_ex_w(
    hkey: HKEY,
    index: u32,
    name: *mut u16,
    cch_name: *mut u32,
    reserved: *const u32,
    class: *mut u16,
    cch_class: *mut u32,
    last_write: *mut FILETIME,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_key_ex_w(hkey, index, name, cch_name, reserved, class, cch_class, last_write);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_key_ex_w(hkey, index, name, cch_name, reserved, class, cch_class, last_write);
    }
    let path = start.path();
    let names = merged_subkey_names(&path, start.real());
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    let rc = write_wide_name_out(entry_name, name, cch_name);
    if rc != ERROR_SUCCESS {
        return rc;
    }
    if !class.is_null() && !cch_class.is_null() {
        if *cch_class > 0 {
            *class = 0;
        }
        *cch_class = 0;
    }
    zero_filetime(last_write);
    trace::api_event("RegEnumKeyExW", "enum_key", &path, entry_name, &format!("idx={index} rc=0"));
    ERROR_SUCCESS
}

unsafe extern "system" fn hook_reg_enum_key_w(
    hkey: HKEY,
    index: u32,
    name: *mut u16,
    cch_name: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_key_w(hkey, index, name, cch_name);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_key_w(hkey, index, name, cch_name);
    }
    let path = start.path();
    let names = merged_subkey_names(&path, start.real());
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    if name.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let units: Vec<u16> = entry_name.encode_utf16().collect();
    if (cch_name as usize) < units.len() + 1 {
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(units.as_ptr(), name, units.len());
    *name.add(units.len()) = 0;
    ERROR_SUCCESS
}

unsafe extern "system" fn hook_reg_query_info_key_w(
    hkey: HKEY,
    class: *mut u16,
    cch_class: *mut u32,
    reserved: *const u32,
    subkeys: *mut u32,
    max_subkey_len: *mut u32,
    max_class_len: *mut u32,
    values: *mut u32,
    max_value_name_len: *mut u32,
    max_value_len: *mut u32,
    security_len: *mut u32,
    last_write: *mut FILETIME,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_info_key_w(
            hkey, class, cch_class, reserved, subkeys, max_subkey_len, max_class_len, values,
            max_value_name_len, max_value_len, security_len, last_write,
        );
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_info_key_w(
            hkey, class, cch_class, reserved, subkeys, max_subkey_len, max_class_len, values,
            max_value_name_len, max_value_len, security_len, last_write,
        );
    }
    let path = start.path();
    let real = start.real();
    query_info_core(
        &path, real, false, class as *mut u8, cch_class, subkeys, max_subkey_len, max_class_len,
        values, max_value_name_len, max_value_len, security_len, last_write,
    )
}

/// Counts and maxima over the merged view, shared by both spellings.
unsafe fn query_info_core(
    path: &str,
    real: HKEY,
    ansi: bool,
    _class: *mut u8,
    cch_class: *mut u32,
    subkeys_out: *mut u32,
    max_subkey_len: *mut u32,
    max_class_len: *mut u32,
    values_out: *mut u32,
    max_value_name_len: *mut u32,
    max_value_len: *mut u32,
    security_len: *mut u32,
    last_write: *mut FILETIME,
) -> u32 {
    let subkeys = merged_subkey_names(path, real);
    let values = merged_value_names(path, real);

    if !subkeys_out.is_null() {
        *subkeys_out = subkeys.len() as u32;
    }
    if !max_subkey_len.is_null() {
        *max_subkey_len = subkeys
            .iter()
            .map(|n| n.encode_utf16().count() as u32)
            .max()
            .unwrap_or(0);
    }
    if !max_class_len.is_null() {
        *max_class_len = 0;
    }
    if !values_out.is_null() {
        *values_out = values.len() as u32;
    }
    if !max_value_name_len.is_null() {
        *max_value_name_len = values
            .iter()
            .map(|n| n.encode_utf16().count() as u32)
            .max()
            .unwrap_or(0);
    }
    if !max_value_len.is_null() {
        *max_value_len = max_value_data_len(path, real, &values, ansi);
    }
    if !cch_class.is_null() {
        *cch_class = 0;
    }
    if !security_len.is_null() {
        *security_len = 0;
    }
    zero_filetime(last_write);
    ERROR_SUCCESS
}

// ---------------------------------------------------------------------------
// Narrow (ANSI) detours. Strings transcode at this boundary; the shared
// cores only ever see wide-normalized data.

unsafe extern "system" fn hook_reg_open_key_ex_a(
    hkey: HKEY,
    sub: *const u8,
    options: u32,
    sam: u32,
    out: *mut HKEY,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::open_key_ex_a(hkey, sub, options, sam, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::open_key_ex_a(hkey, sub, options, sam, out);
    }
    let sub_str = ansi_cstr_to_string(sub);
    open_or_create("RegOpenKeyExA", &start, sub_str.as_deref(), false, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_open_key_a(hkey: HKEY, sub: *const u8, out: *mut HKEY) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::open_key_a(hkey, sub, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::open_key_a(hkey, sub, out);
    }
    let sub_str = ansi_cstr_to_string(sub);
    open_or_create("RegOpenKeyA", &start, sub_str.as_deref(), false, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_create_key_ex_a(
    hkey: HKEY,
    sub: *const u8,
    reserved: u32,
    class: *const u8,
    options: u32,
    sam: u32,
    security: *const c_void,
    out: *mut HKEY,
    disposition: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::create_key_ex_a(hkey, sub, reserved, class, options, sam, security, out, disposition);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::create_key_ex_a(hkey, sub, reserved, class, options, sam, security, out, disposition);
    }
    let sub_str = ansi_cstr_to_string(sub);
    open_or_create("RegCreateKeyExA", &start, sub_str.as_deref(), true, out, disposition)
}

unsafe extern "system" fn hook_reg_create_key_a(hkey: HKEY, sub: *const u8, out: *mut HKEY) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::create_key_a(hkey, sub, out);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::create_key_a(hkey, sub, out);
    }
    let sub_str = ansi_cstr_to_string(sub);
    open_or_create("RegCreateKeyA", &start, sub_str.as_deref(), true, out, ptr::null_mut())
}

unsafe extern "system" fn hook_reg_query_value_ex_a(
    hkey: HKEY,
    name: *const u8,
    reserved: *const u32,
    vtype: *mut u32,
    data: *mut u8,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_value_ex_a(hkey, name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_value_ex_a(hkey, name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let real = start.real();
    let name_str = ansi_cstr_to_string(name).unwrap_or_default();

    match lookup_value(&path, &name_str) {
        OverlayLookup::Tombstone => ERROR_FILE_NOT_FOUND,
        OverlayLookup::Hit(v) => {
            let payload = wide_to_ansi_bytes_for_query(v.value_type, &v.data);
            if !vtype.is_null() {
                *vtype = v.value_type;
            }
            let rc = write_data_out(&payload, data, cb);
            trace::read_result(
                "RegQueryValueExA",
                &path,
                &name_str,
                rc,
                true,
                v.value_type,
                if data.is_null() { None } else { Some(payload.as_slice()) },
                payload.len() as u32,
            )
        }
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            if real.is_null() {
                return ERROR_FILE_NOT_FOUND;
            }
            orig::query_value_ex_a(real, name, reserved, vtype, data, cb)
        }
    }
}

unsafe extern "system" fn hook_reg_query_value_a(
    hkey: HKEY,
    sub: *const u8,
    data: *mut u8,
    cb: *mut i32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_value_a(hkey, sub, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_value_a(hkey, sub, data, cb);
    }
    let sub_str = ansi_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    query_default_value_legacy("RegQueryValueA", &start, &full, true, data, cb)
}

unsafe extern "system" fn hook_reg_get_value_a(
    hkey: HKEY,
    sub: *const u8,
    name: *const u8,
    flags: u32,
    vtype: *mut u32,
    data: *mut c_void,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::get_value_a(hkey, sub, name, flags, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::get_value_a(hkey, sub, name, flags, vtype, data, cb);
    }
    let sub_str = ansi_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let name_str = ansi_cstr_to_string(name).unwrap_or_default();

    match lookup_value(&full, &name_str) {
        OverlayLookup::Tombstone => ERROR_FILE_NOT_FOUND,
        OverlayLookup::Hit(v) => {
            get_value_serve("RegGetValueA", &full, &name_str, v, flags, true, vtype, data as *mut u8, cb)
        }
        OverlayLookup::Miss | OverlayLookup::Unavailable => {
            let real = start.real();
            if real.is_null() {
                return ERROR_FILE_NOT_FOUND;
            }
            orig::get_value_a(real, sub, name, flags, vtype, data, cb)
        }
    }
}

unsafe extern "system" fn hook_reg_set_value_ex_a(
    hkey: HKEY,
    name: *const u8,
    reserved: u32,
    vtype: u32,
    data: *const u8,
    cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_value_ex_a(hkey, name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_value_ex_a(hkey, name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let name_str = ansi_cstr_to_string(name).unwrap_or_default();
    let raw = if data.is_null() || cb == 0 {
        &[] as &[u8]
    } else {
        std::slice::from_raw_parts(data, cb as usize)
    };
    let payload = ensure_wide_string_data(vtype, raw);
    set_value_core("RegSetValueExA", &path, &name_str, vtype, payload)
}

unsafe extern "system" fn hook_reg_set_value_a(
    hkey: HKEY,
    sub: *const u8,
    vtype: u32,
    data: *const u8,
    _cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_value_a(hkey, sub, vtype, data, _cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_value_a(hkey, sub, vtype, data, _cb);
    }
    if vtype != REG_SZ {
        return ERROR_INVALID_PARAMETER;
    }
    let sub_str = ansi_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let text = ansi_cstr_to_string(data).unwrap_or_default();
    set_value_core("RegSetValueA", &full, "", REG_SZ, utf16le_bytes_with_nul(&text))
}

unsafe extern "system" fn hook_reg_set_key_value_a(
    hkey: HKEY,
    sub: *const u8,
    name: *const u8,
    vtype: u32,
    data: *const c_void,
    cb: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::set_key_value_a(hkey, sub, name, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::set_key_value_a(hkey, sub, name, vtype, data, cb);
    }
    let sub_str = ansi_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    let name_str = ansi_cstr_to_string(name).unwrap_or_default();
    let raw = if data.is_null() || cb == 0 {
        &[] as &[u8]
    } else {
        std::slice::from_raw_parts(data as *const u8, cb as usize)
    };
    let payload = ensure_wide_string_data(vtype, raw);
    set_value_core("RegSetKeyValueA", &full, &name_str, vtype, payload)
}

unsafe extern "system" fn hook_reg_delete_value_a(hkey: HKEY, name: *const u8) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::delete_value_a(hkey, name);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::delete_value_a(hkey, name);
    }
    let path = start.path();
    let name_str = ansi_cstr_to_string(name).unwrap_or_default();
    delete_value_core("RegDeleteValueA", &path, &name_str)
}

unsafe extern "system" fn hook_reg_delete_key_a(hkey: HKEY, sub: *const u8) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::delete_key_a(hkey, sub);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::delete_key_a(hkey, sub);
    }
    if sub.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let sub_str = ansi_cstr_to_string(sub);
    let full = target_path(&start, sub_str.as_deref());
    delete_key_core("RegDeleteKeyA", &full)
}

unsafe extern "system" fn hook_reg_enum_value_a(
    hkey: HKEY,
    index: u32,
    name: *mut u8,
    cch_name: *mut u32,
    reserved: *const u32,
    vtype: *mut u32,
    data: *mut u8,
    cb: *mut u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_value_a(hkey, index, name, cch_name, reserved, vtype, data, cb);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_value_a(hkey, index, name, cch_name, reserved, vtype, data, cb);
    }
    let path = start.path();
    let real = start.real();
    let names = merged_value_names(&path, real);
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    let (value_type, wide_payload) =
        fetch_value(&path, real, entry_name).unwrap_or((REG_NONE, Vec::new()));
    let payload = wide_to_ansi_bytes_for_query(value_type, &wide_payload);

    let rc = write_ansi_name_out(entry_name, name, cch_name);
    if rc != ERROR_SUCCESS {
        return rc;
    }
    if !vtype.is_null() {
        *vtype = value_type;
    }
    if cb.is_null() {
        if data.is_null() {
            ERROR_SUCCESS
        } else {
            ERROR_INVALID_PARAMETER
        }
    } else {
        write_data_out(&payload, data, cb)
    }
}

unsafe extern "system" fn hook_reg_enum_key_ex_a(
    hkey: HKEY,
    index: u32,
    name: *mut u8,
    cch_name: *mut u32,
    reserved: *const u32,
    class: *mut u8,
    cch_class: *mut u32,
    last_write: *mut FILETIME,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_key_ex_a(hkey, index, name, cch_name, reserved, class, cch_class, last_write);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_key_ex_a(hkey, index, name, cch_name, reserved, class, cch_class, last_write);
    }
    let path = start.path();
    let names = merged_subkey_names(&path, start.real());
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    let rc = write_ansi_name_out(entry_name, name, cch_name);
    if rc != ERROR_SUCCESS {
        return rc;
    }
    if !class.is_null() && !cch_class.is_null() {
        if *cch_class > 0 {
            *class = 0;
        }
        *cch_class = 0;
    }
    zero_filetime(last_write);
    ERROR_SUCCESS
}

unsafe extern "system" fn hook_reg_enum_key_a(
    hkey: HKEY,
    index: u32,
    name: *mut u8,
    cch_name: u32,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::enum_key_a(hkey, index, name, cch_name);
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::enum_key_a(hkey, index, name, cch_name);
    }
    let path = start.path();
    let names = merged_subkey_names(&path, start.real());
    let Some(entry_name) = names.get(index as usize) else {
        return ERROR_NO_MORE_ITEMS;
    };
    if name.is_null() {
        return ERROR_INVALID_PARAMETER;
    }
    let units: Vec<u16> = entry_name.encode_utf16().collect();
    let bytes = wide_units_to_ansi(&units);
    if (cch_name as usize) < bytes.len() + 1 {
        return ERROR_MORE_DATA;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), name, bytes.len());
    *name.add(bytes.len()) = 0;
    ERROR_SUCCESS
}

unsafe extern "system" fn hook_reg_query_info_key_a(
    hkey: HKEY,
    class: *mut u8,
    cch_class: *mut u32,
    reserved: *const u32,
    subkeys: *mut u32,
    max_subkey_len: *mut u32,
    max_class_len: *mut u32,
    values: *mut u32,
    max_value_name_len: *mut u32,
    max_value_len: *mut u32,
    security_len: *mut u32,
    last_write: *mut FILETIME,
) -> u32 {
    let Some(_guard) = CallGuard::enter() else {
        return orig::query_info_key_a(
            hkey, class, cch_class, reserved, subkeys, max_subkey_len, max_class_len, values,
            max_value_name_len, max_value_len, security_len, last_write,
        );
    };
    let start = resolve_start(hkey);
    if start.is_foreign() {
        return orig::query_info_key_a(
            hkey, class, cch_class, reserved, subkeys, max_subkey_len, max_class_len, values,
            max_value_name_len, max_value_len, security_len, last_write,
        );
    }
    let path = start.path();
    let real = start.real();
    query_info_core(
        &path, real, true, class, cch_class, subkeys, max_subkey_len, max_class_len, values,
        max_value_name_len, max_value_len, security_len, last_write,
    )
}

// ---------------------------------------------------------------------------
// Installation.

#[derive(PartialEq)]
enum HookScope {
    Off,
    WideOnly,
    Full,
}

fn hook_scope() -> HookScope {
    let Some(mode) = crate::env::var_compat(ENV_HOOK_MODE, ENV_HOOK_MODE_LEGACY) else {
        // Default to full wide+ANSI coverage to avoid mixed-callsite handle
        // issues where a virtual HKEY created by *W is consumed by an
        // unhooked *A API.
        return HookScope::Full;
    };
    match mode.to_lowercase().as_str() {
        "off" | "none" | "disabled" => HookScope::Off,
        "core" | "minimal" | "wide" | "unicode" => HookScope::WideOnly,
        _ => HookScope::Full,
    }
}

static MANAGER: Lazy<Mutex<Option<HookManager>>> = Lazy::new(|| Mutex::new(None));

fn entry(
    func: &'static str,
    detour: *const u8,
    original: &'static AtomicPtr<c_void>,
    required: bool,
) -> HookEntry {
    HookEntry {
        func,
        detour,
        original,
        required,
    }
}

/// Installs the interceptor surface according to the configured scope.
/// Returns true on success, including the diagnostic `off` scope that
/// installs nothing.
pub fn install_all_hooks() -> bool {
    let scope = hook_scope();
    if scope == HookScope::Off {
        return true;
    }
    if !acquire_engine() {
        return false;
    }

    let mut mgr = HookManager::new();

    // Wide core: every handle-producing and handle-consuming W entry point,
    // so virtual handles never leak into unhooked advapi32 code.
    mgr.add(entry("RegOpenKeyExW", hook_reg_open_key_ex_w as *const u8, &orig::OPEN_KEY_EX_W, true));
    mgr.add(entry("RegCreateKeyExW", hook_reg_create_key_ex_w as *const u8, &orig::CREATE_KEY_EX_W, true));
    mgr.add(entry("RegCloseKey", hook_reg_close_key as *const u8, &orig::CLOSE_KEY, true));
    mgr.add(entry("RegGetValueW", hook_reg_get_value_w as *const u8, &orig::GET_VALUE_W, true));
    mgr.add(entry("RegSetValueExW", hook_reg_set_value_ex_w as *const u8, &orig::SET_VALUE_EX_W, true));
    mgr.add(entry("RegQueryValueExW", hook_reg_query_value_ex_w as *const u8, &orig::QUERY_VALUE_EX_W, true));
    mgr.add(entry("RegDeleteValueW", hook_reg_delete_value_w as *const u8, &orig::DELETE_VALUE_W, true));
    mgr.add(entry("RegDeleteKeyW", hook_reg_delete_key_w as *const u8, &orig::DELETE_KEY_W, true));
    mgr.add(entry("RegOpenKeyW", hook_reg_open_key_w as *const u8, &orig::OPEN_KEY_W, true));
    mgr.add(entry("RegCreateKeyW", hook_reg_create_key_w as *const u8, &orig::CREATE_KEY_W, true));
    mgr.add(entry("RegQueryValueW", hook_reg_query_value_w as *const u8, &orig::QUERY_VALUE_W, true));
    mgr.add(entry("RegSetValueW", hook_reg_set_value_w as *const u8, &orig::SET_VALUE_W, true));
    mgr.add(entry("RegEnumValueW", hook_reg_enum_value_w as *const u8, &orig::ENUM_VALUE_W, true));
    mgr.add(entry("RegEnumKeyExW", hook_reg_enum_key_ex_w as *const u8, &orig::ENUM_KEY_EX_W, true));
    mgr.add(entry("RegEnumKeyW", hook_reg_enum_key_w as *const u8, &orig::ENUM_KEY_W, true));
    mgr.add(entry("RegQueryInfoKeyW", hook_reg_query_info_key_w as *const u8, &orig::QUERY_INFO_KEY_W, true));
    // Optional on older systems.
    mgr.add(entry("RegSetKeyValueW", hook_reg_set_key_value_w as *const u8, &orig::SET_KEY_VALUE_W, false));
    mgr.add(entry("RegDeleteKeyExW", hook_reg_delete_key_ex_w as *const u8, &orig::DELETE_KEY_EX_W, false));

    if scope == HookScope::Full {
        mgr.add(entry("RegOpenKeyExA", hook_reg_open_key_ex_a as *const u8, &orig::OPEN_KEY_EX_A, true));
        mgr.add(entry("RegCreateKeyExA", hook_reg_create_key_ex_a as *const u8, &orig::CREATE_KEY_EX_A, true));
        mgr.add(entry("RegSetValueExA", hook_reg_set_value_ex_a as *const u8, &orig::SET_VALUE_EX_A, true));
        mgr.add(entry("RegQueryValueExA", hook_reg_query_value_ex_a as *const u8, &orig::QUERY_VALUE_EX_A, true));
        mgr.add(entry("RegDeleteValueA", hook_reg_delete_value_a as *const u8, &orig::DELETE_VALUE_A, true));
        mgr.add(entry("RegDeleteKeyA", hook_reg_delete_key_a as *const u8, &orig::DELETE_KEY_A, true));
        mgr.add(entry("RegGetValueA", hook_reg_get_value_a as *const u8, &orig::GET_VALUE_A, true));
        mgr.add(entry("RegOpenKeyA", hook_reg_open_key_a as *const u8, &orig::OPEN_KEY_A, true));
        mgr.add(entry("RegCreateKeyA", hook_reg_create_key_a as *const u8, &orig::CREATE_KEY_A, true));
        mgr.add(entry("RegQueryValueA", hook_reg_query_value_a as *const u8, &orig::QUERY_VALUE_A, true));
        mgr.add(entry("RegSetValueA", hook_reg_set_value_a as *const u8, &orig::SET_VALUE_A, true));
        mgr.add(entry("RegEnumValueA", hook_reg_enum_value_a as *const u8, &orig::ENUM_VALUE_A, true));
        mgr.add(entry("RegEnumKeyExA", hook_reg_enum_key_ex_a as *const u8, &orig::ENUM_KEY_EX_A, true));
        mgr.add(entry("RegEnumKeyA", hook_reg_enum_key_a as *const u8, &orig::ENUM_KEY_A, true));
        mgr.add(entry("RegQueryInfoKeyA", hook_reg_query_info_key_a as *const u8, &orig::QUERY_INFO_KEY_A, true));
        // Optional on older systems.
        mgr.add(entry("RegSetKeyValueA", hook_reg_set_key_value_a as *const u8, &orig::SET_KEY_VALUE_A, false));
    }

    let ok = mgr.install_all();
    if ok {
        *MANAGER.lock().unwrap_or_else(|p| p.into_inner()) = Some(mgr);
    } else {
        release_engine();
    }
    ok
}

/// Teardown: disable the patches first, then close shared state, then
/// reclaim. Idempotent, and safe against threads still mid-call (their
/// trampolines survive unless we hold the last engine reference).
pub fn uninstall_all_hooks() {
    let mut slot = MANAGER.lock().unwrap_or_else(|p| p.into_inner());
    let Some(mut mgr) = slot.take() else {
        return;
    };
    mgr.disable_all();
    overlay::close_store();
    for real in drain_virtual_keys() {
        if !is_hklm_root(real) {
            unsafe { RegCloseKey(real) };
        }
    }
    if release_engine() {
        mgr.release_all();
    } else {
        std::mem::forget(mgr);
    }
}
