//! Virtual key handles and the bookkeeping that keeps them distinguishable
//! from every real `HKEY`.
//!
//! A virtual handle is the address of a leaked [`VirtualKey`] record carrying
//! a magic word; identity is established by membership in a process-wide set,
//! never by dereferencing an unverified pointer. Records are immortal while
//! hooks are active: a concurrent thread may still present a handle value
//! after another thread closed it, so reclamation waits for shim teardown.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};

use once_cell::sync::Lazy;
use windows_sys::Win32::System::Registry::{HKEY, HKEY_LOCAL_MACHINE};

const KEY_MAGIC: u32 = 0x4D4C_4B48; // "HKLM"

pub struct VirtualKey {
    magic: u32,
    path: String,
    /// Real OS handle opened to the same path for pass-through, or 0.
    real: AtomicIsize,
}

impl VirtualKey {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn real(&self) -> HKEY {
        self.real.load(Ordering::Acquire) as HKEY
    }

    /// Detaches the real sub-handle so close can release it exactly once.
    pub fn take_real(&self) -> HKEY {
        self.real.swap(0, Ordering::AcqRel) as HKEY
    }
}

static VIRTUAL_KEYS: Lazy<Mutex<HashSet<usize>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static REAL_KEYS: Lazy<Mutex<HashMap<usize, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn is_hklm_root(h: HKEY) -> bool {
    h == HKEY_LOCAL_MACHINE
}

/// Manufactures a fresh virtual handle owning `path` and (optionally) a real
/// pass-through handle. The record is leaked on purpose; see module docs.
pub fn new_virtual_key(path: String, real: HKEY) -> HKEY {
    let record = Box::new(VirtualKey {
        magic: KEY_MAGIC,
        path,
        real: AtomicIsize::new(real as isize),
    });
    let addr = Box::into_raw(record) as usize;
    VIRTUAL_KEYS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(addr);
    addr as HKEY
}

/// Resolves a handle to its record if (and only if) we manufactured it.
pub fn as_virtual(h: HKEY) -> Option<&'static VirtualKey> {
    let addr = h as usize;
    let known = VIRTUAL_KEYS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .contains(&addr);
    if !known {
        return None;
    }
    let record = unsafe { &*(addr as *const VirtualKey) };
    debug_assert_eq!(record.magic, KEY_MAGIC);
    Some(record)
}

/// Remembers the canonical path behind a real OS handle we opened (or saw
/// being opened) so later calls on it can be virtualized.
pub fn register_real_key(h: HKEY, path: &str) {
    if h.is_null() || is_hklm_root(h) {
        return;
    }
    REAL_KEYS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(h as usize, path.to_string());
}

pub fn unregister_real_key(h: HKEY) {
    if h.is_null() {
        return;
    }
    REAL_KEYS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&(h as usize));
}

pub fn real_key_path(h: HKEY) -> Option<String> {
    REAL_KEYS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(&(h as usize))
        .cloned()
}

/// Teardown-only reclamation. Must run after hooks are removed; returns the
/// real handles that still need closing (through the now-unhooked API).
pub fn drain_virtual_keys() -> Vec<HKEY> {
    let addrs: Vec<usize> = {
        let mut set = VIRTUAL_KEYS.lock().unwrap_or_else(|p| p.into_inner());
        set.drain().collect()
    };
    let mut reals = Vec::new();
    for addr in addrs {
        let record = unsafe { Box::from_raw(addr as *mut VirtualKey) };
        let real = record.take_real();
        if !real.is_null() {
            reals.push(real);
        }
    }
    reals
}
