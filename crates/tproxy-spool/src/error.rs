use thiserror::Error;

/// Errors surfaced by [`crate::TaskQueue`] operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
}
