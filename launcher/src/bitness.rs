//! Architecture-match check between the launcher and the target.
//!
//! A 32-bit launcher cannot inject its shim into a 64-bit target (and vice
//! versa); the WOW64 state of both processes must agree before resume.

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Threading::{GetCurrentProcess, IsWow64Process};

fn query_wow64(process: HANDLE) -> Option<bool> {
    let mut wow64 = 0i32;
    let ok = unsafe { IsWow64Process(process, &mut wow64) };
    if ok == 0 { None } else { Some(wow64 != 0) }
}

/// True when the bitness of the two processes provably differs. Hosts where
/// the query is unavailable are treated as matching, like the legacy check.
pub fn is_bitness_mismatched(target: HANDLE) -> bool {
    let Some(self_wow64) = query_wow64(unsafe { GetCurrentProcess() }) else {
        return false;
    };
    let Some(target_wow64) = query_wow64(target) else {
        return false;
    };
    self_wow64 != target_wow64
}
