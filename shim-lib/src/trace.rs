//! Debug trace transport: UTF-8 lines over the launcher's named pipe.
//!
//! Enabled by the API filter environment variable; without it every call is
//! a cheap early-out. Lines are independent and loss is tolerated: on a
//! write failure the pipe handle is dropped and reopened lazily on the next
//! traced call.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_MORE_DATA, ERROR_SUCCESS, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING, WriteFile};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, TlsAlloc, TlsGetValue, TlsSetValue,
};

use shared::constants::{
    ENV_DEBUG_APIS, ENV_DEBUG_APIS_LEGACY, ENV_DEBUG_PIPE, ENV_DEBUG_PIPE_LEGACY, REG_BINARY,
    REG_DWORD, REG_EXPAND_SZ, REG_MULTI_SZ, REG_NONE, REG_QWORD, REG_SZ,
};
use shared::wide::units_from_utf16le;

use crate::encoding::ansi_to_wide_units;

/// Payloads above this size are summarized instead of dumped.
const MAX_TRACE_DATA_BYTES: usize = 1024;

/// Per-thread internal-dispatch depth, in a raw Win32 TLS slot like the
/// call guard. Sub-steps of a hooked operation (real-registry reads feeding
/// the merge, payload fetches behind an enumeration ordinal) run with the
/// depth raised, so only the outermost operation emits a trace line.
static DISPATCH_SLOT: Lazy<u32> = Lazy::new(|| unsafe { TlsAlloc() });

fn dispatch_depth() -> usize {
    unsafe { TlsGetValue(*DISPATCH_SLOT) as usize }
}

/// RAII token raising the internal-dispatch depth for this thread.
pub struct InternalDispatchGuard {
    _not_send: PhantomData<*const ()>,
}

impl InternalDispatchGuard {
    pub fn enter() -> Self {
        unsafe {
            let _ = TlsSetValue(*DISPATCH_SLOT, (dispatch_depth() + 1) as *const c_void);
        }
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for InternalDispatchGuard {
    fn drop(&mut self) {
        unsafe {
            let depth = dispatch_depth().saturating_sub(1);
            let _ = TlsSetValue(*DISPATCH_SLOT, depth as *const c_void);
        }
    }
}

struct Filter {
    all: bool,
    tokens: Vec<String>,
}

static FILTER: Lazy<Filter> = Lazy::new(|| {
    let mut filter = Filter {
        all: false,
        tokens: Vec::new(),
    };
    let Some(csv) = crate::env::var_compat(ENV_DEBUG_APIS, ENV_DEBUG_APIS_LEGACY) else {
        return filter;
    };
    for raw in csv.split(',') {
        let token = normalize_api_token(raw);
        if token.is_empty() {
            continue;
        }
        if token == "all" {
            filter.all = true;
            filter.tokens.clear();
            break;
        }
        filter.tokens.push(token);
    }
    filter
});

struct Pipe {
    handle: HANDLE,
}
unsafe impl Send for Pipe {}

static PIPE: Lazy<Mutex<Pipe>> = Lazy::new(|| {
    Mutex::new(Pipe {
        handle: INVALID_HANDLE_VALUE,
    })
});

fn normalize_api_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn strip_ansi_wide_suffix(token: &str) -> &str {
    if token.len() > 1 && (token.ends_with('a') || token.ends_with('w')) {
        &token[..token.len() - 1]
    } else {
        token
    }
}

/// Filter match is spelling-insensitive (`RegOpenKey` covers the `A`/`W` and
/// `Ex` variants alike).
pub fn should_trace(api: &str) -> bool {
    let filter = &*FILTER;
    if filter.all {
        return true;
    }
    if filter.tokens.is_empty() {
        return false;
    }
    let api_norm = normalize_api_token(api);
    let api_base = strip_ansi_wide_suffix(&api_norm);
    filter.tokens.iter().any(|token| {
        let token_base = strip_ansi_wide_suffix(token);
        token_base == api_base
            || (api_base.len() == token_base.len() + 2
                && api_base.starts_with(token_base)
                && api_base.ends_with("ex"))
    })
}

fn connect_pipe(pipe: &mut Pipe) {
    if pipe.handle != INVALID_HANDLE_VALUE {
        return;
    }
    let Some(path) = crate::env::var_compat(ENV_DEBUG_PIPE, ENV_DEBUG_PIPE_LEGACY) else {
        return;
    };
    let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        let handle = CreateFileW(
            wide.as_ptr(),
            GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            std::ptr::null_mut(),
        );
        if handle != INVALID_HANDLE_VALUE {
            pipe.handle = handle;
        }
    }
}

fn sanitize(value: &str, max_chars: usize) -> String {
    let mut out: String = value
        .chars()
        .take(max_chars)
        .map(|c| if matches!(c, '\r' | '\n' | '\t') { ' ' } else { c })
        .collect();
    if value.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

fn hex_encode(data: &[u8], max_bytes: usize) -> String {
    let used = data.len().min(max_bytes);
    let mut out = String::with_capacity(used * 2 + 3);
    for b in &data[..used] {
        out.push_str(&format!("{b:02X}"));
    }
    if used < data.len() {
        out.push_str("...");
    }
    out
}

pub fn format_reg_type(value_type: u32) -> String {
    match value_type {
        REG_NONE => "REG_NONE".to_string(),
        REG_SZ => "REG_SZ".to_string(),
        REG_EXPAND_SZ => "REG_EXPAND_SZ".to_string(),
        REG_BINARY => "REG_BINARY".to_string(),
        REG_DWORD => "REG_DWORD".to_string(),
        REG_MULTI_SZ => "REG_MULTI_SZ".to_string(),
        REG_QWORD => "REG_QWORD".to_string(),
        other => format!("REG_{other}"),
    }
}

fn decode_string(data: &[u8], ansi: bool) -> String {
    if ansi {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        String::from_utf16_lossy(&ansi_to_wide_units(&data[..end]))
    } else {
        let units = units_from_utf16le(data);
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        String::from_utf16_lossy(&units[..end])
    }
}

fn decode_multi_string(data: &[u8], ansi: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    if ansi {
        for chunk in data.split(|&b| b == 0) {
            if chunk.is_empty() {
                break;
            }
            parts.push(String::from_utf16_lossy(&ansi_to_wide_units(chunk)));
        }
    } else {
        let units = units_from_utf16le(data);
        for chunk in units.split(|&u| u == 0) {
            if chunk.is_empty() {
                break;
            }
            parts.push(String::from_utf16_lossy(chunk));
        }
    }
    if parts.is_empty() {
        "<empty>".to_string()
    } else {
        parts
            .iter()
            .map(|p| sanitize(p, 256))
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Readable preview of a value payload: typed rendering for the known types,
/// a hex dump for everything else.
pub fn format_value_for_trace(type_known: bool, value_type: u32, data: &[u8], ansi: bool) -> String {
    if data.is_empty() {
        return "<empty>".to_string();
    }
    if !type_known {
        return format!("hex:{}", hex_encode(data, data.len()));
    }
    match value_type {
        REG_DWORD if data.len() >= 4 => {
            let v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            format!("dword:{v}")
        }
        REG_QWORD if data.len() >= 8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[..8]);
            format!("qword:{}", u64::from_le_bytes(b))
        }
        REG_SZ | REG_EXPAND_SZ => format!("str:\"{}\"", sanitize(&decode_string(data, ansi), 512)),
        REG_MULTI_SZ => format!("multi:\"{}\"", decode_multi_string(data, ansi)),
        _ => format!("hex:{}", hex_encode(data, data.len())),
    }
}

/// Emits one trace line. Nested emission from internal dispatch is
/// suppressed; connection and write failures are swallowed and the pipe is
/// retried on the next call.
pub fn api_event(api: &str, op: &str, key: &str, name: &str, value: &str) {
    if dispatch_depth() > 0 || !should_trace(api) {
        return;
    }

    let now = chrono::Local::now();
    let line = format!(
        "({}) [{}:{}] api={} op={} key=\"{}\" name=\"{}\" value=\"{}\"\n",
        now.format("%H:%M:%S%.3f"),
        unsafe { GetCurrentProcessId() },
        unsafe { GetCurrentThreadId() },
        api,
        op,
        sanitize(if key.is_empty() { "-" } else { key }, 140),
        sanitize(if name.is_empty() { "-" } else { name }, 140),
        sanitize(if value.is_empty() { "-" } else { value }, 600),
    );

    let mut pipe = PIPE.lock().unwrap_or_else(|p| p.into_inner());
    connect_pipe(&mut pipe);
    if pipe.handle == INVALID_HANDLE_VALUE {
        return;
    }
    let bytes = line.as_bytes();
    let mut written = 0u32;
    let ok = unsafe {
        WriteFile(
            pipe.handle,
            bytes.as_ptr(),
            bytes.len() as u32,
            &mut written,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        unsafe { CloseHandle(pipe.handle) };
        pipe.handle = INVALID_HANDLE_VALUE;
    }
}

/// Traces a query result and hands the status back, so call sites can wrap
/// their return expression.
pub fn read_result(
    api: &str,
    key: &str,
    name: &str,
    status: u32,
    type_known: bool,
    value_type: u32,
    data: Option<&[u8]>,
    cb: u32,
) -> u32 {
    if dispatch_depth() > 0 || !should_trace(api) {
        return status;
    }
    let mut value = format!("rc={status}");
    if type_known {
        value.push_str(&format!(" type={}", format_reg_type(value_type)));
    }
    value.push_str(&format!(" cb={cb}"));
    match data {
        Some(data) if status == ERROR_SUCCESS && !data.is_empty() => {
            if data.len() <= MAX_TRACE_DATA_BYTES {
                value.push_str(" data=");
                value.push_str(&format_value_for_trace(
                    type_known,
                    value_type,
                    data,
                    api.ends_with('A'),
                ));
            } else {
                value.push_str(" <data_present>");
            }
        }
        _ if status == ERROR_SUCCESS => value.push_str(" <size_only>"),
        _ if status == ERROR_MORE_DATA => value.push_str(" <more_data>"),
        _ => {}
    }
    api_event(api, "query_value", key, name, &value);
    status
}
