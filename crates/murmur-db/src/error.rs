use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// A unique column already holds this value.
    #[error("{0} already exists")]
    Conflict(String),

    #[error("record not found")]
    NotFound,

    /// The row exists but is no longer in a state that allows the change.
    #[error("record is no longer active")]
    StaleRecord,

    #[error("database lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    /// Failures of the storage engine itself that may clear on retry: a busy
    /// or locked database, I/O trouble, or a file that cannot be opened.
    /// Query bugs and constraint failures are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Poisoned => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn failure(code: i32) -> DbError {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(ffi::Error::new(code), None))
    }

    #[test]
    fn engine_trouble_is_transient() {
        assert!(failure(ffi::SQLITE_BUSY).is_transient());
        assert!(failure(ffi::SQLITE_LOCKED).is_transient());
        assert!(failure(ffi::SQLITE_IOERR).is_transient());
        assert!(failure(ffi::SQLITE_CANTOPEN).is_transient());
        assert!(DbError::Poisoned.is_transient());
    }

    #[test]
    fn query_and_logic_failures_are_not_transient() {
        assert!(!failure(ffi::SQLITE_CONSTRAINT).is_transient());
        assert!(!failure(ffi::SQLITE_MISMATCH).is_transient());
        assert!(!DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_transient());
        assert!(!DbError::Sqlite(rusqlite::Error::InvalidColumnName("x".into())).is_transient());
        assert!(!DbError::StaleRecord.is_transient());
        assert!(!DbError::Conflict("email".into()).is_transient());
    }
}
