use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Cross-component error taxonomy.
///
/// Programmer faults (lock misuse, ack monotonicity violations, dangling
/// durability iterators) do not appear here: they abort via `panic!`.
/// Expected per-operation outcomes travel as [`Status`] values instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("temporary failure: {0}")]
    Temporary(&'static str),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Enumerated status returned by every vbucket operation.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Status {
    /// Operation applied.
    Success,
    /// Key absent (or logically deleted / expired where the operation
    /// demands presence).
    KeyNotFound,
    /// Key already present, or a CAS / conflict-resolution mismatch.
    KeyExists,
    /// Preconditions for `replace`/`add` style operations unmet.
    NotStored,
    /// Key is CAS-locked and the supplied CAS does not open it.
    Locked,
    /// Lock acquisition would block; retry later.
    LockedTmpFail,
    /// Memory ceiling reached; retryable after eviction.
    NoMem,
    /// A background disk fetch is required; caller resumes asynchronously.
    WouldBlock,
    /// A caller-supplied predicate rejected the operation.
    PredicateFailed,
    /// Requested range is not serviceable by this vbucket.
    Ranged,
    /// Connection should be dropped (fatal per-client condition).
    Disconnect,
}

impl Status {
    /// True only for [`Status::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// True for statuses the caller may retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Status::NoMem | Status::WouldBlock | Status::LockedTmpFail
        )
    }

    /// Short name used in stats output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::KeyNotFound => "key_not_found",
            Status::KeyExists => "key_exists",
            Status::NotStored => "not_stored",
            Status::Locked => "locked",
            Status::LockedTmpFail => "locked_tmp_fail",
            Status::NoMem => "no_mem",
            Status::WouldBlock => "would_block",
            Status::PredicateFailed => "predicate_failed",
            Status::Ranged => "ranged",
            Status::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(Status::NoMem.is_transient());
        assert!(Status::WouldBlock.is_transient());
        assert!(Status::LockedTmpFail.is_transient());
        assert!(!Status::KeyExists.is_transient());
        assert!(!Status::Success.is_transient());
    }
}
