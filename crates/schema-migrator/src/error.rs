//! Migration error types.

use std::time::Duration;

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Stable discriminant of a [`MigrationError`].
///
/// Callers branch on the kind and still reach the root cause through
/// [`std::error::Error::source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The ledger table could not be created.
    CreateLedgerTable,
    /// The batch index on the ledger table could not be created.
    CreateLedgerIndex,
    /// Applied ledger rows could not be read.
    FetchApplied,
    /// A transaction could not be opened.
    BeginTransaction,
    /// A forward statement failed.
    Statement,
    /// A ledger row could not be inserted.
    RecordInsert,
    /// Rollback was requested with an empty ledger.
    NothingToRollback,
    /// A reverse statement failed.
    Rollback,
    /// A ledger row could not be deleted.
    RecordDelete,
    /// The transaction could not be committed.
    Commit,
    /// A ledger row could not be decoded.
    InvalidRecord,
    /// Invalid configuration.
    Config,
    /// The store could not be reached.
    Connection,
    /// The instance lock was not acquired in time.
    LockTimeout,
    /// A run exceeded its deadline.
    Timeout,
}

/// Migration error type.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Ledger table creation failed.
    #[error("Failed to create ledger table: {source}")]
    CreateLedgerTable {
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Ledger index creation failed.
    #[error("Failed to create index on ledger table: {source}")]
    CreateLedgerIndex {
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Reading applied migrations failed.
    #[error("Failed to fetch applied migrations: {source}")]
    FetchApplied {
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Opening a transaction failed.
    #[error("Failed to begin database transaction: {source}")]
    BeginTransaction {
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// A forward statement failed while applying a migration.
    #[error("Migration {id} failed: {source}")]
    Statement {
        /// Migration identifier.
        id: String,
        /// The statement that failed.
        statement: String,
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Recording an applied migration failed.
    #[error("Failed to record migration {id} in ledger: {source}")]
    RecordInsert {
        /// Migration identifier.
        id: String,
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Rollback requested but the ledger is empty.
    #[error("No applied migrations to roll back")]
    NothingToRollback,

    /// A reverse statement failed while rolling back a migration.
    #[error("Rollback of migration {id} failed: {source}")]
    Rollback {
        /// Migration identifier.
        id: String,
        /// The statement that failed.
        statement: String,
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Removing a ledger row failed.
    #[error("Failed to remove migration {id} from ledger: {source}")]
    RecordDelete {
        /// Migration identifier.
        id: String,
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// Committing the transaction failed.
    #[error("Failed to commit transaction: {source}")]
    Commit {
        /// Underlying store error.
        #[source]
        source: sqlx::Error,
    },

    /// A ledger row holds a value that cannot be decoded.
    #[error("Invalid ledger record: {0}")]
    InvalidRecord(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// The migrator lock was not acquired within the configured timeout.
    #[error("Failed to acquire migration lock within {0:?}")]
    LockTimeout(Duration),

    /// A run did not finish within the configured timeout.
    #[error("Migration run timed out after {0:?}")]
    Timeout(Duration),
}

impl MigrationError {
    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// The kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CreateLedgerTable { .. } => ErrorKind::CreateLedgerTable,
            Self::CreateLedgerIndex { .. } => ErrorKind::CreateLedgerIndex,
            Self::FetchApplied { .. } => ErrorKind::FetchApplied,
            Self::BeginTransaction { .. } => ErrorKind::BeginTransaction,
            Self::Statement { .. } => ErrorKind::Statement,
            Self::RecordInsert { .. } => ErrorKind::RecordInsert,
            Self::NothingToRollback => ErrorKind::NothingToRollback,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::RecordDelete { .. } => ErrorKind::RecordDelete,
            Self::Commit { .. } => ErrorKind::Commit,
            Self::InvalidRecord(_) => ErrorKind::InvalidRecord,
            Self::Config(_) => ErrorKind::Config,
            Self::Connection(_) => ErrorKind::Connection,
            Self::LockTimeout(_) => ErrorKind::LockTimeout,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// The migration identifier the error is attributed to, if any.
    #[must_use]
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            Self::Statement { id, .. }
            | Self::RecordInsert { id, .. }
            | Self::Rollback { id, .. }
            | Self::RecordDelete { id, .. } => Some(id),
            _ => None,
        }
    }
}
