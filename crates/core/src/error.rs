//! Error types shared across the compute runtime crates.
//!
//! Mirrors the rest of the workspace: one `thiserror`-derived enum per
//! crate boundary, struct-like variants carrying a human-readable
//! `message` where no more specific field applies.

use thiserror::Error;

/// Errors that can occur while resolving or describing host-side
/// request context (the `ctx`-shaped value the proxy hands the runtime).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The request context was missing a field the runtime requires.
    #[error("invalid request context: {message}")]
    InvalidContext {
        /// Description of the missing or malformed field.
        message: String,
    },

    /// A byte buffer exceeded a caller-imposed bound.
    #[error("buffer overflow: attempted to read {requested} bytes, but only {available} available")]
    BufferOverflow {
        /// Number of bytes requested.
        requested: usize,
        /// Number of bytes actually available.
        available: usize,
    },

    /// Generic I/O failure bubbled up from a host-provided resource.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the I/O failure.
        message: String,
    },
}
