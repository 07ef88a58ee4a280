// Re-entrancy guard that works inside the loader lock.
//
//   * Avoids Rust `thread_local!` (no NULL TLS issues during DllMain).
//   * One Win32 TLS slot shared by every detour.
//   * A dummy non-NULL pointer (0x1) marks "this thread is inside a hook".
//   * Cleared via RAII on every return path.
//
// A detour that cannot enter the guard is re-entering: it must forward to
// the original function without touching the overlay, otherwise a nested
// registry call made by advapi32 itself (or by our own pass-through) would
// recurse back into the dispatch logic.

use core::ffi::c_void;
use std::marker::PhantomData;
use std::ptr;

use once_cell::sync::Lazy;
use windows_sys::Win32::System::Threading::{TlsAlloc, TlsGetValue, TlsSetValue};

/// TLS slot index allocated once per process, the first time any detour
/// fires. `TlsAlloc` is loader-lock safe.
static TLS_SLOT: Lazy<u32> = Lazy::new(|| unsafe { TlsAlloc() });

/// Never dereferenced, only compared against NULL.
const SENTINEL: *const c_void = 1usize as *const c_void;

/// RAII token returned by [`CallGuard::enter`].
pub struct CallGuard {
    _not_send: PhantomData<*const ()>,
}

impl CallGuard {
    /// `Some` on first entry for this thread, `None` when the thread is
    /// already executing inside a hook (bypass region active).
    #[inline(always)]
    pub fn enter() -> Option<Self> {
        unsafe {
            let slot = *TLS_SLOT;
            if !TlsGetValue(slot).is_null() {
                return None;
            }
            if TlsSetValue(slot, SENTINEL) != 0 {
                Some(Self {
                    _not_send: PhantomData,
                })
            } else {
                // If the slot cannot be set, pretend we re-entered so the
                // caller falls back to the original API.
                None
            }
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        unsafe {
            // Failure here leaves the flag set; the thread then permanently
            // short-circuits to the real API, which is safe.
            let _ = TlsSetValue(*TLS_SLOT, ptr::null());
        }
    }
}
