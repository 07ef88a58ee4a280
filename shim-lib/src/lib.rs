//! The injected shim: virtualizes `HKLM` for the hosting process.
//!
//! Once the hooks are installed, every registry call against `HKLM` is served
//! from the per-target overlay store merged with the live system registry;
//! the real `HKLM` is never written. The DLL is loaded by the launcher via a
//! remote `LoadLibraryW` thread while the target is still suspended.
#![cfg(windows)]
#![allow(non_snake_case)]
#![allow(unsafe_op_in_unsafe_fn)]

mod call_guard;
mod detours;
mod encoding;
mod env;
mod handles;
mod hooks;
mod manager;
mod merge;
mod overlay;
mod trace;

use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use windows_sys::Win32::Foundation::HINSTANCE;
use windows_sys::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};
use windows_sys::Win32::System::Threading::{EVENT_MODIFY_STATE, OpenEventW, SetEvent};

use shared::constants::{ENV_HOOK_READY_EVENT, ENV_HOOK_READY_EVENT_LEGACY};

/// 0 = installing, 1 = hooks active, -1 = install failed.
static HOOKS_INSTALLED: AtomicI32 = AtomicI32::new(0);

/// Signals the launcher-created rendezvous event, if one was exported. The
/// launcher tolerates the event being absent or the wait timing out.
fn signal_hook_ready() {
    let Some(name) = env::var_compat(ENV_HOOK_READY_EVENT, ENV_HOOK_READY_EVENT_LEGACY) else {
        return;
    };
    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        let event = OpenEventW(EVENT_MODIFY_STATE, 0, wide.as_ptr());
        if !event.is_null() {
            SetEvent(event);
            windows_sys::Win32::Foundation::CloseHandle(event);
        }
    }
}

/// Minimal work under loader lock; hook installation runs on its own thread.
/// The install thread must not touch the store: it opens lazily on the first
/// hooked call instead (registry access during DLL init is common and the
/// loader lock is still a hazard here).
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(hinst: HINSTANCE, reason: u32, _reserved: *mut c_void) -> i32 {
    match reason {
        DLL_PROCESS_ATTACH => unsafe {
            DisableThreadLibraryCalls(hinst);

            thread::spawn(|| {
                let ok = detours::install_all_hooks();
                HOOKS_INSTALLED.store(if ok { 1 } else { -1 }, Ordering::Release);
                if ok {
                    signal_hook_ready();
                }
            });
        },

        DLL_PROCESS_DETACH => {
            if HOOKS_INSTALLED.swap(0, Ordering::AcqRel) == 1 {
                detours::uninstall_all_hooks();
            }
        }

        _ => {}
    }
    1
}
