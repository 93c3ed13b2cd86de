//! Crate-wide error type.
//!
//! Mirrors the teacher's `SpinelDBError` shape: one variant per failure
//! class, `#[from]` conversions for the I/O/parsing errors that cross
//! component boundaries, and `Display` messages suitable for both logs and
//! (truncated) client-facing error pages.

use std::io;

#[derive(thiserror::Error, Debug, Clone)]
pub enum AcngError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("malformed http: {0}")]
    MalformedHttp(String),

    #[error("cache integrity error: {0}")]
    CacheIntegrity(String),

    #[error("upstream error: {status} {message}")]
    Upstream { status: u16, message: String },

    #[error("mirror exhausted: all backends blacklisted for {repo}")]
    MirrorExhausted { repo: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found in resolver table")]
    NoRoute,

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for AcngError {
    fn from(e: io::Error) -> Self {
        AcngError::Io(e.to_string())
    }
}

impl AcngError {
    /// The HTTP status code a client should see for this error, when the
    /// failure was not already recorded as a `tRemoteStatus` on a file-item.
    pub fn status_code(&self) -> u16 {
        match self {
            AcngError::MalformedHttp(_) | AcngError::Rejected(_) => 400,
            AcngError::RangeNotSatisfiable => 416,
            AcngError::NoRoute => 404,
            AcngError::Upstream { status, .. } => *status,
            AcngError::MirrorExhausted { .. } => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, AcngError>;
