//! Hook bookkeeping: the per-API specs, the live patches, and the
//! ref-counted engine lifecycle shared with any other injected subsystem.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::hooks::Hook;

/// Every module spelling a registry API may be bound through. All candidates
/// are patched so a virtual handle created through one spelling can never
/// reach an unpatched callee under another. Hooking additional registry
/// provider modules has destabilized wrapped apps, so the list stays narrow.
pub const CANDIDATE_MODULES: &[&str] = &["advapi32", "Advapi32.dll"];

/// One function to intercept.
///
/// `original` receives the trampoline pointer during installation so the
/// detour can call the real implementation.
pub struct HookEntry {
    pub func: &'static str,
    pub detour: *const u8,
    pub original: &'static AtomicPtr<c_void>,
    /// Required entries fail the install when unpatchable; optional ones
    /// (exports missing on older systems) are skipped silently.
    pub required: bool,
}

unsafe impl Send for HookEntry {}
unsafe impl Sync for HookEntry {}

/// Collects entries, installs them across every candidate module, and
/// disables/releases them on teardown.
pub struct HookManager {
    spec: Vec<HookEntry>,
    live: Vec<Hook>,
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            spec: Vec::new(),
            live: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: HookEntry) {
        self.spec.push(entry);
    }

    /// Installs every spec entry in two phases: prepare all trampolines and
    /// publish the original-function pointers, then flip the patches live.
    /// No detour can run before its original pointer is visible.
    ///
    /// Each API is looked up in all candidate modules; duplicate resolutions
    /// of the same address are patched once. Returns false when a required
    /// entry could not be installed anywhere.
    pub fn install_all(&mut self) -> bool {
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut ok = true;

        for entry in &self.spec {
            let mut hooked_any = false;
            for module in CANDIDATE_MODULES {
                let Some(target) = crate::hooks::resolve_export(module, entry.func) else {
                    continue;
                };
                if claimed.contains(&(target as usize)) {
                    // Same export reached under another module spelling; the
                    // first patch already covers it.
                    hooked_any = true;
                    continue;
                }
                match unsafe { Hook::prepare(target, entry.detour) } {
                    Ok(hook) => {
                        claimed.insert(target as usize);
                        if entry.original.load(Ordering::Acquire).is_null() {
                            entry
                                .original
                                .store(hook.original() as *mut _, Ordering::Release);
                        }
                        self.live.push(hook);
                        hooked_any = true;
                    }
                    Err(_reason) => {
                        // Unpatchable prologue: leave this occurrence alone.
                    }
                }
            }
            if entry.required && !hooked_any {
                ok = false;
            }
        }

        if !ok {
            self.release_all();
            return false;
        }

        for hook in &mut self.live {
            if unsafe { hook.enable() }.is_err() {
                ok = false;
            }
        }
        if !ok {
            self.disable_all();
            self.release_all();
        }
        ok
    }

    /// Restores every patched entry, newest first. Trampolines stay mapped
    /// for threads still running through them.
    pub fn disable_all(&mut self) {
        for hook in self.live.iter_mut().rev() {
            unsafe { hook.disable() };
        }
    }

    /// Frees the trampolines. Only sound once every thread has left them.
    pub fn release_all(&mut self) {
        while let Some(hook) = self.live.pop() {
            unsafe { hook.release() };
        }
    }
}

// Engine lifecycle. The registry hooks and any co-injected add-on share the
// patch engine; ref-counting keeps one subsystem's teardown from yanking
// trampolines out from under another.

static ENGINE_REFS: Mutex<u32> = Mutex::new(0);

pub fn acquire_engine() -> bool {
    let mut refs = ENGINE_REFS.lock().unwrap_or_else(|p| p.into_inner());
    *refs += 1;
    true
}

/// Returns true when this release dropped the last reference and shared
/// resources may be reclaimed.
pub fn release_engine() -> bool {
    let mut refs = ENGINE_REFS.lock().unwrap_or_else(|p| p.into_inner());
    if *refs > 0 {
        *refs -= 1;
    }
    *refs == 0
}
