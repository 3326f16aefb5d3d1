//! Crate-wide error taxonomy.
//!
//! Every terminal state a collaborator can observe is one of the kinds
//! below. We use a closed `enum` rather than `anyhow::Error` here because
//! the public surface promises a *taxonomy*, not just "something went
//! wrong" - callers branch on `Error::IntegrityError { .. }` vs.
//! `Error::NotFound { .. }` to decide whether to retry, abort, or surface
//! to a human.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {fingerprint} failed integrity check: stored bytes hash to {actual}")]
    IntegrityError { fingerprint: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("quota exceeded: {0}")]
    QuotaError(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid_input(what: impl Into<String>) -> Self {
        Error::InvalidInput(what.into())
    }
}

/// Attaches a path to an I/O error without discarding its `ErrorKind`,
/// since a bare `std::io::Error` from deep inside a tree walk or restore
/// otherwise gives no clue which file it came from.
pub trait ErrorContext<T> {
    fn with_path(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|err| {
            Error::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {}", path.display(), err),
            ))
        })
    }
}
