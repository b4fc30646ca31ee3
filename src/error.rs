//! # Error Handling
//!
//! A single crate-wide error enum covering every failure mode of the store.
//! Using one enum keeps function signatures simple and lets callers handle
//! errors uniformly (log and retry, or propagate).
//!
//! Cursor exhaustion is deliberately *not* an error: `move_to_next()` returns
//! `Ok(false)` and count probes that find zero rows return a valid negative
//! answer. Only genuine failures travel through [`Error`].

use thiserror::Error;

/// All errors that can occur in feature store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied value was rejected: an unknown feature or feature
    /// set id, malformed query parameters, or an attribute blob referencing
    /// a schema id the registry has never seen.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted in a state that does not permit it, e.g.
    /// reading a column from a cursor that is not positioned on a row.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The database schema version does not match what this build supports.
    ///
    /// Opening a store created by a newer version fails with this rather
    /// than risking silent misinterpretation of the tables.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A binary attribute payload was truncated or otherwise unreadable.
    #[error("i/o error: {0}")]
    Io(String),

    /// The underlying SQL engine reported a failure.
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly,
    /// so storage-layer code stays free of manual conversions.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidArgument("no such feature set 42".to_string());
        assert_eq!(err.to_string(), "invalid argument: no such feature set 42");

        let err = Error::IllegalState("cursor is not positioned on a row".to_string());
        assert_eq!(
            err.to_string(),
            "illegal state: cursor is not positioned on a row"
        );
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
