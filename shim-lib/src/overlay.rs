//! Process-wide overlay store instance.
//!
//! Opened lazily on the first hooked call, never during DLL init: the
//! install thread can run while the loader lock is held and the store open
//! touches the filesystem. A failed open is remembered so every later call
//! degrades to pass-through instead of retrying.

use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use shared::constants::{DEFAULT_DB_FILE, ENV_DB_PATH, ENV_DB_PATH_LEGACY};
use shared::store::OverlayStore;

enum StoreState {
    Unopened,
    Failed,
    Open(OverlayStore),
}

static STORE: Lazy<Mutex<StoreState>> = Lazy::new(|| Mutex::new(StoreState::Unopened));

fn db_path() -> PathBuf {
    if let Some(path) = crate::env::var_compat(ENV_DB_PATH, ENV_DB_PATH_LEGACY) {
        return PathBuf::from(path);
    }
    // Fallback: HKLM.sqlite in the current working directory.
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_DB_FILE)
}

/// Runs `f` against the store, opening it first if needed. `None` means the
/// store is unavailable (open failed earlier); the caller falls back to the
/// pass-through path or surfaces a generic failure.
///
/// The outer lock also serializes logically-grouped store calls from
/// concurrent hook threads.
pub fn with_store<R>(f: impl FnOnce(&OverlayStore) -> R) -> Option<R> {
    let mut state = STORE.lock().unwrap_or_else(|p| p.into_inner());
    if matches!(*state, StoreState::Unopened) {
        *state = match OverlayStore::open(db_path()) {
            Ok(store) => StoreState::Open(store),
            Err(_) => StoreState::Failed,
        };
    }
    match &*state {
        StoreState::Open(store) => Some(f(store)),
        _ => None,
    }
}

/// Drops the store (checkpointing the WAL). Idempotent; teardown can race a
/// thread mid-call, which simply sees the store as unavailable afterwards.
pub fn close_store() {
    let mut state = STORE.lock().unwrap_or_else(|p| p.into_inner());
    *state = StoreState::Failed;
}
