use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaindbErrorCode {
    Io,
    Engine,
    InvalidConfig,
    InvalidState,
    Timeout,
    CheckpointRequired,
    CommitConflict,
    JournalInsert,
    PolicyDenied,
    Integrity,
}

impl ChaindbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChaindbErrorCode::Io => "io",
            ChaindbErrorCode::Engine => "engine",
            ChaindbErrorCode::InvalidConfig => "invalid_config",
            ChaindbErrorCode::InvalidState => "invalid_state",
            ChaindbErrorCode::Timeout => "timeout",
            ChaindbErrorCode::CheckpointRequired => "checkpoint_required",
            ChaindbErrorCode::CommitConflict => "commit_conflict",
            ChaindbErrorCode::JournalInsert => "journal_insert",
            ChaindbErrorCode::PolicyDenied => "policy_denied",
            ChaindbErrorCode::Integrity => "integrity",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChaindbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid state: {message}")]
    InvalidState { message: String },
    /// A query exceeded the per-transaction time budget set via `start_timing`.
    #[error("transaction timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    /// The query was interrupted so a checkpoint coordinator can drain.
    /// Callers are expected to roll back and retry.
    #[error("transaction abandoned for checkpoint")]
    CheckpointRequired,
    /// The engine rejected COMMIT because of a conflicting concurrent commit.
    /// The commit lock is still held; the caller must call `rollback`.
    #[error("commit conflict (engine code {code})")]
    CommitConflict { code: i32 },
    #[error("journal insert failed: {message}")]
    JournalInsert { message: String },
    #[error("query denied by authorization policy: {message}")]
    PolicyDenied { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
}

impl ChaindbError {
    pub fn code(&self) -> ChaindbErrorCode {
        match self {
            ChaindbError::Io(_) => ChaindbErrorCode::Io,
            ChaindbError::Engine(_) => ChaindbErrorCode::Engine,
            ChaindbError::InvalidConfig { .. } => ChaindbErrorCode::InvalidConfig,
            ChaindbError::InvalidState { .. } => ChaindbErrorCode::InvalidState,
            ChaindbError::Timeout { .. } => ChaindbErrorCode::Timeout,
            ChaindbError::CheckpointRequired => ChaindbErrorCode::CheckpointRequired,
            ChaindbError::CommitConflict { .. } => ChaindbErrorCode::CommitConflict,
            ChaindbError::JournalInsert { .. } => ChaindbErrorCode::JournalInsert,
            ChaindbError::PolicyDenied { .. } => ChaindbErrorCode::PolicyDenied,
            ChaindbError::Integrity { .. } => ChaindbErrorCode::Integrity,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        ChaindbError::InvalidState {
            message: message.into(),
        }
    }
}

/// True when the engine refused a statement because the authorizer denied it.
pub(crate) fn is_auth_denied(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_AUTH)
}

/// Extracts the engine code when COMMIT failed on a conflicting concurrent
/// commit. `SQLITE_BUSY_SNAPSHOT` is the concurrent-begin signal; the plain
/// busy family is folded in for engines without concurrent transactions.
pub(crate) fn commit_conflict_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_BUSY_SNAPSHOT
                || e.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
            Some(e.extended_code)
        }
        _ => None,
    }
}

/// Maps an engine error from a read/write call site, surfacing authorizer
/// denials as their own kind.
pub(crate) fn map_query_error(err: rusqlite::Error) -> ChaindbError {
    if is_auth_denied(&err) {
        ChaindbError::PolicyDenied {
            message: err.to_string(),
        }
    } else {
        ChaindbError::Engine(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChaindbError, ChaindbErrorCode};
    use std::time::Duration;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ChaindbErrorCode::CommitConflict.as_str(), "commit_conflict");
        assert_eq!(
            ChaindbErrorCode::CheckpointRequired.as_str(),
            "checkpoint_required"
        );
        assert_eq!(ChaindbErrorCode::PolicyDenied.as_str(), "policy_denied");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = ChaindbError::Timeout {
            elapsed: Duration::from_micros(1500),
        };
        assert_eq!(err.code(), ChaindbErrorCode::Timeout);
        assert_eq!(err.code_str(), "timeout");

        let err = ChaindbError::CommitConflict { code: 517 };
        assert_eq!(err.code_str(), "commit_conflict");
    }
}
