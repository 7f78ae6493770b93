//! Migration types and utilities.

use crate::builder::MigrationBuilder;
use std::fmt;

/// Prefix marking a reverse statement as an inert placeholder.
pub const COMMENT_MARKER: &str = "--";

/// A unit of schema change.
///
/// Anything exposing an identifier, a description and two ordered statement
/// sequences can be registered with the [`Migrator`](crate::Migrator). The
/// migrator only reads these values.
pub trait Migration: Send + Sync {
    /// Unique identifier, also the apply order key (e.g. `20240101120000_users`).
    fn id(&self) -> &str;

    /// Free text stored in the ledger alongside the identifier.
    fn description(&self) -> &str;

    /// Forward statements, executed first to last.
    fn up(&self) -> &[String];

    /// Reverse statements, executed first to last.
    ///
    /// By convention these already undo the most recent change first.
    fn down(&self) -> &[String];
}

impl fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id())
            .field("description", &self.description())
            .field("up", &self.up().len())
            .field("down", &self.down().len())
            .finish()
    }
}

/// Forward statements that are actually sent to the store.
pub(crate) fn forward_statements(migration: &dyn Migration) -> impl Iterator<Item = &str> {
    migration
        .up()
        .iter()
        .map(String::as_str)
        .filter(|statement| !statement.trim().is_empty())
}

/// Reverse statements that are actually sent to the store.
pub(crate) fn reverse_statements(migration: &dyn Migration) -> impl Iterator<Item = &str> {
    migration
        .down()
        .iter()
        .map(String::as_str)
        .filter(|statement| is_executable_reverse(statement))
}

fn is_executable_reverse(statement: &str) -> bool {
    let trimmed = statement.trim();
    !trimmed.is_empty() && !trimmed.starts_with(COMMENT_MARKER)
}

/// A migration made of literal SQL statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    id: String,
    description: String,
    up: Vec<String>,
    down: Vec<String>,
}

impl SqlMigration {
    /// Create a hand-authored migration.
    #[must_use]
    pub fn new<U, D>(id: impl Into<String>, description: impl Into<String>, up: U, down: D) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            id: id.into(),
            description: description.into(),
            up: up.into_iter().map(Into::into).collect(),
            down: down.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a migration builder.
    #[must_use]
    pub fn builder(id: impl Into<String>, description: impl Into<String>) -> MigrationBuilder {
        MigrationBuilder::new(id, description)
    }

    /// Whether every reverse statement is an inert placeholder.
    #[must_use]
    pub fn is_irreversible(&self) -> bool {
        !self.down.iter().any(|s| is_executable_reverse(s))
    }
}

impl Migration for SqlMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn up(&self) -> &[String] {
        &self.up
    }

    fn down(&self) -> &[String] {
        &self.down
    }
}

impl fmt::Display for SqlMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.id, self.description)
    }
}
