use thiserror::Error;

use crate::errors::StoreError;

/// Failures while importing or exporting registry text. The parser itself is
/// permissive (malformed lines are skipped); only store and I/O problems are
/// reported as errors.
#[derive(Error, Debug)]
pub enum RegFileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read registry file: {0}")]
    Io(#[from] std::io::Error),
}
