//! Error Types
//!
//! Three layers of failure show up in tablekeep:
//!
//! - [`EngineError`]: what the transactional storage engine reports back
//!   (missing keys, missing tables, replication trouble, conflicts).
//! - [`KeyError`]: a structured or schedule key that cannot be decoded.
//! - [`Error`]: the crate-level error returned by the router, the expiry
//!   subsystem and the [`Store`](crate::store::Store) facade.
//!
//! The table acquisition loop waits out transient engine failures
//! ([`EngineError::is_transient`]); every other failure reaches the caller.

use thiserror::Error;

/// Errors reported by the storage engine collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The key is not present in the table
    #[error("key not found")]
    NotFound,

    /// A no-overwrite put found an existing key
    #[error("key already exists")]
    KeyExists,

    /// The table has not been created (yet)
    #[error("table {0} does not exist")]
    NoSuchTable(String),

    /// The engine cannot serve the request right now
    #[error("engine busy: {0}")]
    Busy(String),

    /// The handle was invalidated by a replication topology change
    #[error("handle invalidated by replication topology change")]
    TopologyChanged,

    /// A read-modify-write lock was lost before commit
    #[error("transaction conflict on locked key")]
    Conflict,

    /// A write was attempted on a read-only (client) node
    #[error("write refused: node is not master")]
    ReadOnly,
}

impl EngineError {
    /// Stable code logged next to the description.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound => "NOTFOUND",
            EngineError::KeyExists => "KEYEXIST",
            EngineError::NoSuchTable(_) => "NOSUCHTABLE",
            EngineError::Busy(_) => "BUSY",
            EngineError::TopologyChanged => "HANDLE_DEAD",
            EngineError::Conflict => "CONFLICT",
            EngineError::ReadOnly => "READONLY",
        }
    }

    /// Failures a retry loop may wait out (table not replicated yet, busy).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::NoSuchTable(_) | EngineError::Busy(_))
    }

    /// True when the handle that produced this error must never be reused.
    pub fn is_topology_change(&self) -> bool {
        matches!(self, EngineError::TopologyChanged)
    }
}

/// Errors produced while decoding keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Input ended in the middle of an element
    #[error("truncated key: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// A string element is larger than the decode buffer
    #[error("string element too long: {len} bytes (max: {max})")]
    StringTooLong { len: usize, max: usize },

    /// The element tag is not an integer, string or array
    #[error("unsupported element tag: {0:#04x}")]
    UnsupportedTag(u8),

    /// Arrays nested deeper than the decoder allows
    #[error("maximum nesting depth exceeded: {0}")]
    TooDeep(usize),

    /// A schedule key with the wrong width
    #[error("invalid schedule key length: {len} bytes (expected {expected})")]
    ScheduleKeyLength { len: usize, expected: usize },

    /// The encoder failed to write an element
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Key(#[from] KeyError),

    /// Two schedule entries with the same composite key
    #[error(
        "duplicate schedule entry (expire_at={expire_at}, sequence={sequence}, originator={originator})"
    )]
    DuplicateSchedule {
        expire_at: i64,
        sequence: u32,
        originator: u32,
    },

    /// The process is shutting down and no handle could be acquired
    #[error("shutting down")]
    ShuttingDown,
}

impl Error {
    /// Returns the engine error, if this is one.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            Error::Engine(e) => Some(e),
            _ => None,
        }
    }

    /// Stable code for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Engine(e) => e.code(),
            Error::Key(_) => "MALFORMED_KEY",
            Error::DuplicateSchedule { .. } => "KEYEXIST",
            Error::ShuttingDown => "SHUTDOWN",
        }
    }

    /// True when the error came from a handle killed by a topology change.
    pub fn is_topology_change(&self) -> bool {
        self.engine().is_some_and(EngineError::is_topology_change)
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_classification() {
        assert!(EngineError::NoSuchTable("t.db".into()).is_transient());
        assert!(EngineError::Busy("recovering".into()).is_transient());
        assert!(!EngineError::TopologyChanged.is_transient());
        assert!(EngineError::TopologyChanged.is_topology_change());
        assert!(!EngineError::NotFound.is_topology_change());
    }

    #[test]
    fn test_crate_error_wraps_engine_error() {
        let err: Error = EngineError::TopologyChanged.into();
        assert!(err.is_topology_change());
        assert_eq!(err.engine(), Some(&EngineError::TopologyChanged));

        let err = Error::ShuttingDown;
        assert!(!err.is_topology_change());
        assert_eq!(err.engine(), None);
        assert_eq!(err.code(), "SHUTDOWN");
        assert_eq!(Error::from(EngineError::NotFound).code(), "NOTFOUND");
    }

    #[test]
    fn test_error_messages() {
        let err = Error::DuplicateSchedule {
            expire_at: 10,
            sequence: 2,
            originator: 3,
        };
        assert_eq!(
            err.to_string(),
            "duplicate schedule entry (expire_at=10, sequence=2, originator=3)"
        );
        assert_eq!(
            KeyError::StringTooLong { len: 600, max: 511 }.to_string(),
            "string element too long: 600 bytes (max: 511)"
        );
    }
}
