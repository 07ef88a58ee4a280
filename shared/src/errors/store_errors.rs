use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the overlay store. Callers inside the shim map any of
/// these to a single generic registry status code; out-of-process callers may
/// print the detail.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store path is not representable: {path}")]
    BadPath { path: PathBuf },
}
