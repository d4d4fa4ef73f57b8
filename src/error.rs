// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crate-wide error type.
//!
//! Crypto, storage and migration failures all surface as [`EngineError`].
//! Unlock and decrypt failures are deliberately indistinguishable in the
//! message presented to users (see [`EngineError::user_message`]).

use crate::models::PrivacyMode;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Wrong passphrase or corrupt ciphertext. Never retried automatically.
    #[error("could not decrypt value")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid crypto params: {0}")]
    InvalidCryptoParams(String),

    /// Record missing or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("category slug '{0}' already exists")]
    SlugConflict(String),

    #[error("future dates are not allowed")]
    FutureDateRejected,

    #[error("accent color must be a hex color like #12AB34")]
    InvalidHexColor,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("category {0} can't be deleted")]
    ProtectedCategory(String),

    #[error("encryption is locked")]
    Locked,

    #[error("operation requires {expected} mode, current mode is {actual}")]
    ModeMismatch {
        expected: PrivacyMode,
        actual: PrivacyMode,
    },

    #[error("unsupported migration: {from} -> {to}")]
    UnsupportedMigration { from: PrivacyMode, to: PrivacyMode },

    #[error("a migration is already running for user {0}")]
    MigrationInProgress(String),

    /// One record failed mid-sequence. `completed` records were already
    /// transformed and stay transformed.
    #[error("migration stopped after {completed} records: {source}")]
    MigrationPartialFailure {
        completed: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Text that is safe to show to the user.
    ///
    /// Key and ciphertext problems collapse into one message so the UI can't
    /// be used as an oracle for which side was wrong.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::DecryptionFailed
            | EngineError::InvalidCryptoParams(_)
            | EngineError::EncryptionFailed
            | EngineError::Locked => {
                "Failed to unlock. Check your passphrase and try again.".to_string()
            }
            EngineError::MigrationPartialFailure { completed, source } => format!(
                "Migration stopped after {completed} records ({}). Retry to continue.",
                source.user_message()
            ),
            EngineError::Redb(_)
            | EngineError::RedbDatabase(_)
            | EngineError::RedbTransaction(_)
            | EngineError::RedbTable(_)
            | EngineError::RedbStorage(_)
            | EngineError::RedbCommit(_)
            | EngineError::Io(_)
            | EngineError::Serde(_) => "Local storage error.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_failures_share_one_message() {
        let wrong_key = EngineError::DecryptionFailed.user_message();
        let bad_params = EngineError::InvalidCryptoParams("salt".into()).user_message();
        assert_eq!(wrong_key, bad_params);
        assert!(!wrong_key.contains("salt"));
    }

    #[test]
    fn partial_failure_reports_progress() {
        let err = EngineError::MigrationPartialFailure {
            completed: 3,
            source: Box::new(EngineError::Remote("timeout".into())),
        };
        assert!(err.to_string().contains("after 3 records"));
        assert!(err.user_message().contains("3 records"));
    }

    #[test]
    fn constructors_set_message() {
        let nf = EngineError::not_found("Category c-1");
        assert!(matches!(nf, EngineError::NotFound(ref m) if m == "Category c-1"));

        let bad = EngineError::invalid("Title is required.");
        assert_eq!(bad.to_string(), "invalid input: Title is required.");
    }
}
