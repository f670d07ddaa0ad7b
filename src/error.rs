//! # Status Codes
//!
//! Caller-facing error statuses for LoamDB operations. Internal layers use
//! `eyre::Result` and raise domain failures as [`DbError`] values wrapped in
//! the report; the public API surfaces them unchanged so callers can match
//! on the condition with [`DbError::of`].
//!
//! Expected conditions (`KeyNotFound`, `DuplicateKey`) are never logged on
//! the way out; resource and corruption failures carry their context chain.

use thiserror::Error;

/// Operation status surfaced through the public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The requested key does not exist in the database.
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists and neither `OVERWRITE` nor `DUPLICATE`
    /// was requested.
    #[error("duplicate key")]
    DuplicateKey,

    /// A cursor in the nil state was used where a position is required.
    #[error("cursor is nil")]
    CursorIsNil,

    /// An argument failed validation (unknown database, wrong key length,
    /// cursor from another database, ...).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A query referenced a predicate plugin that was never registered.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// The query text could not be parsed, or the aggregate does not apply
    /// to the database's key type.
    #[error("parser error: {0}")]
    ParserError(String),

    /// The index is corrupt or an internal invariant was violated. The
    /// index is unusable after this is raised.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Extracts the status from a report, if the failure originated as one.
    pub fn of(report: &eyre::Report) -> Option<&DbError> {
        report.downcast_ref::<DbError>()
    }

    pub fn invalid(msg: impl Into<String>) -> eyre::Report {
        eyre::Report::new(DbError::InvalidParameter(msg.into()))
    }

    pub fn internal(msg: impl Into<String>) -> eyre::Report {
        eyre::Report::new(DbError::Internal(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> eyre::Result<()> {
        Err(DbError::DuplicateKey.into())
    }

    #[test]
    fn status_roundtrips_through_report() {
        let err = fails().unwrap_err();
        assert_eq!(DbError::of(&err), Some(&DbError::DuplicateKey));
    }

    #[test]
    fn foreign_reports_have_no_status() {
        let err = eyre::eyre!("plain failure");
        assert_eq!(DbError::of(&err), None);
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(DbError::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            DbError::PluginNotFound("even".into()).to_string(),
            "plugin not found: even"
        );
    }
}
