//! Crate-wide error type.
//!
//! Every fallible operation in the crate returns [`Result`].  The error kinds
//! are deliberately few: each one maps to a distinct failure contract of the
//! BGZF wire format, the offset index, or the concurrency harness.  Codec
//! failures surface synchronously; pipeline failures are stored with their
//! batch and re-raised on the next `next_record`; writer-pool flush failures
//! are latched and re-raised on the next user-visible call on that writer.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Header bytes do not match the BGZF shape, BSIZE is out of range, or a
    /// GZI index failed validation (non-monotone entries, stored (0,0),
    /// oversized count).
    #[error("Invalid BGZF data: {0}")]
    InvalidFormat(String),

    /// EOF in the middle of a block, a missing terminator block, or a GZI
    /// file shorter than its declared entry count.
    #[error("Truncated BGZF stream ({0})")]
    Truncated(String),

    /// A virtual-offset seek target pointing past the end of its block.
    #[error("Virtual offset {offset} exceeds uncompressed block length {block_len}")]
    InvalidPointer { offset: u16, block_len: usize },

    /// A value that cannot be represented in its wire field.
    #[error("{what} {value} out of range (max {max})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        max: u64,
    },

    /// The cooperative cancellation flag was observed at a batch checkpoint.
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking wait ended because the other side of a channel went away.
    #[error("Blocking wait interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// API misuse: writing after close, attaching an indexer after the first
    /// block, iterating a pileup twice, and similar ordering violations.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A configuration switch rejected by the active variant.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl From<Error> for io::Error {
    /// Lossy adapter for the `std::io` trait impls; the full message is
    /// preserved, the kind maps to the closest `io::ErrorKind`.
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(inner) => inner,
            Error::Truncated(_) => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
            Error::InvalidFormat(_) => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl Error {
    pub(crate) fn invalid_format(msg: impl Into<String>) -> Self {
        Error::InvalidFormat(msg.into())
    }

    pub(crate) fn truncated(msg: impl Into<String>) -> Self {
        Error::Truncated(msg.into())
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_values() {
        let e = Error::OutOfRange {
            what: "block address",
            value: 1 << 50,
            max: (1 << 48) - 1,
        };
        let msg = e.to_string();
        assert!(msg.contains("block address"));
        assert!(msg.contains(&(1u64 << 50).to_string()));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
