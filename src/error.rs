//! Failure kinds and exit-code mapping.
//!
//! Every fallible path returns [`Error`]; the binary prints a single-line
//! message and converts the kind into a process exit code (`0` success,
//! `1` interrupted, `10` fatal).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for usage, I/O and store failures.
pub const EXIT_FATAL: i32 = 10;
/// Exit code when a scan was interrupted.
pub const EXIT_INTERRUPTED: i32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad command line or out-of-range parameter.
    #[error("{0}")]
    Usage(String),

    /// A stream could not be opened for scanning. Carries an access-control
    /// hint since block devices usually need an ACL grant.
    #[error("cannot open {path}: {source}\ntry: sudo setfacl -m u:$USER:r {path}")]
    StreamOpen {
        path: String,
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// Store-layer failure (prepare/step, schema mismatch, refused path).
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    /// Refused store path or non-store file where a store was expected.
    #[error("{0}")]
    Store(String),

    /// Merge or import between stores with different blocksizes.
    #[error("incompatible blocksize: {ours} KiB vs {theirs} KiB")]
    Blocksize { ours: u32, theirs: u32 },

    /// The scan was cancelled by an interrupt.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FATAL,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::Interrupted.exit_code(), 1);
        assert_eq!(Error::usage("bad").exit_code(), 10);
        assert_eq!(
            Error::Blocksize { ours: 16, theirs: 8 }.exit_code(),
            10
        );
    }

    #[test]
    fn blocksize_message_names_both_sides() {
        let msg = Error::Blocksize { ours: 16, theirs: 8 }.to_string();
        assert!(msg.contains("16"));
        assert!(msg.contains("8"));
    }
}
