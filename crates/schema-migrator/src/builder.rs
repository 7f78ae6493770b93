//! Fluent statement builder.
//!
//! Every structural operation appends one forward statement and prepends one
//! reverse statement, so the reverse sequence of the built migration undoes
//! the most recent change first. Operations whose original definition is lost
//! (dropped tables, columns, indexes and constraints) get an inert comment
//! placeholder instead of a reverse statement.

use crate::migration::{SqlMigration, COMMENT_MARKER};
use std::collections::VecDeque;

/// One reverse step recorded by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reversal {
    /// Statement that undoes the forward change.
    Sql(String),
    /// The forward change cannot be undone.
    Irreversible(String),
}

impl Reversal {
    /// Render as a reverse statement; irreversible steps become comments.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Sql(sql) => sql.clone(),
            Self::Irreversible(reason) => format!("{COMMENT_MARKER} {reason}"),
        }
    }
}

/// Builder for [`SqlMigration`] values.
#[derive(Debug)]
pub struct MigrationBuilder {
    id: String,
    description: String,
    up: Vec<String>,
    down: VecDeque<Reversal>,
}

impl MigrationBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            up: Vec::new(),
            down: VecDeque::new(),
        }
    }

    fn push(mut self, up: Option<String>, down: Option<Reversal>) -> Self {
        if let Some(up) = up {
            self.up.push(up);
        }
        if let Some(down) = down {
            self.down.push_front(down);
        }
        self
    }

    fn pair(self, up: String, down: String) -> Self {
        self.push(Some(up), Some(Reversal::Sql(down)))
    }

    fn lossy(self, up: String, reason: String) -> Self {
        self.push(Some(up), Some(Reversal::Irreversible(reason)))
    }

    /// Create a table from column definitions.
    #[must_use]
    pub fn create_table(self, table: &str, columns: &[&str]) -> Self {
        let up = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);",
            columns.join(",\n    ")
        );
        self.pair(up, format!("DROP TABLE IF EXISTS {table};"))
    }

    /// Drop a table.
    #[must_use]
    pub fn drop_table(self, table: &str) -> Self {
        self.lossy(
            format!("DROP TABLE IF EXISTS {table};"),
            format!("Cannot restore dropped table {table}"),
        )
    }

    /// Add a column; the first word of the definition is the column name.
    #[must_use]
    pub fn add_column(self, table: &str, column_def: &str) -> Self {
        let up = format!("ALTER TABLE {table} ADD COLUMN {column_def};");
        match column_def.split_whitespace().next() {
            Some(column) => self.pair(up, format!("ALTER TABLE {table} DROP COLUMN {column};")),
            None => self.lossy(up, format!("Cannot drop unnamed column on {table}")),
        }
    }

    /// Drop a column.
    #[must_use]
    pub fn drop_column(self, table: &str, column: &str) -> Self {
        self.lossy(
            format!("ALTER TABLE {table} DROP COLUMN {column};"),
            format!("Cannot restore dropped column {table}.{column} without definition"),
        )
    }

    /// Rename a column.
    #[must_use]
    pub fn rename_column(self, table: &str, old_name: &str, new_name: &str) -> Self {
        self.pair(
            format!("ALTER TABLE {table} RENAME COLUMN {old_name} TO {new_name};"),
            format!("ALTER TABLE {table} RENAME COLUMN {new_name} TO {old_name};"),
        )
    }

    /// Change a column definition.
    #[must_use]
    pub fn change_column(self, table: &str, column: &str, new_definition: &str) -> Self {
        self.lossy(
            format!("ALTER TABLE {table} ALTER COLUMN {column} {new_definition};"),
            format!("Cannot reverse column change for {table}.{column}"),
        )
    }

    /// Create an index.
    #[must_use]
    pub fn create_index(self, index: &str, table: &str, columns: &[&str]) -> Self {
        self.pair(
            format!("CREATE INDEX {index} ON {table} ({});", columns.join(", ")),
            format!("DROP INDEX IF EXISTS {index};"),
        )
    }

    /// Create a unique index.
    #[must_use]
    pub fn create_unique_index(self, index: &str, table: &str, columns: &[&str]) -> Self {
        self.pair(
            format!(
                "CREATE UNIQUE INDEX {index} ON {table} ({});",
                columns.join(", ")
            ),
            format!("DROP INDEX IF EXISTS {index};"),
        )
    }

    /// Drop an index.
    #[must_use]
    pub fn drop_index(self, index: &str) -> Self {
        self.lossy(
            format!("DROP INDEX IF EXISTS {index};"),
            format!("Cannot restore dropped index {index} without definition"),
        )
    }

    /// Add a foreign key named `fk_<table>_<column>`.
    #[must_use]
    pub fn add_foreign_key(
        self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Self {
        let constraint = format!("fk_{table}_{column}");
        self.add_foreign_key_named(table, &constraint, column, ref_table, ref_column)
    }

    /// Add a foreign key with an explicit constraint name.
    #[must_use]
    pub fn add_foreign_key_named(
        self,
        table: &str,
        constraint: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Self {
        self.pair(
            format!(
                "ALTER TABLE {table} ADD CONSTRAINT {constraint} FOREIGN KEY ({column}) REFERENCES {ref_table}({ref_column});"
            ),
            drop_constraint(table, constraint),
        )
    }

    /// Drop a foreign key.
    #[must_use]
    pub fn drop_foreign_key(self, table: &str, constraint: &str) -> Self {
        self.lossy(
            drop_constraint(table, constraint),
            format!("Cannot restore dropped foreign key {constraint}"),
        )
    }

    /// Add a primary key constraint.
    #[must_use]
    pub fn add_primary_key(self, table: &str, constraint: &str, columns: &[&str]) -> Self {
        self.pair(
            format!(
                "ALTER TABLE {table} ADD CONSTRAINT {constraint} PRIMARY KEY ({});",
                columns.join(", ")
            ),
            drop_constraint(table, constraint),
        )
    }

    /// Add a check constraint.
    #[must_use]
    pub fn add_check(self, table: &str, constraint: &str, condition: &str) -> Self {
        self.pair(
            format!("ALTER TABLE {table} ADD CONSTRAINT {constraint} CHECK ({condition});"),
            drop_constraint(table, constraint),
        )
    }

    /// Append a forward statement with no reverse.
    #[must_use]
    pub fn raw_up(self, sql: impl Into<String>) -> Self {
        self.push(Some(sql.into()), None)
    }

    /// Prepend a reverse statement with no forward.
    #[must_use]
    pub fn raw_down(self, sql: impl Into<String>) -> Self {
        self.push(None, Some(Reversal::Sql(sql.into())))
    }

    /// Append a forward statement and prepend its reverse.
    #[must_use]
    pub fn raw(self, up: impl Into<String>, down: impl Into<String>) -> Self {
        self.pair(up.into(), down.into())
    }

    /// Mark the most recent forward change as impossible to undo.
    #[must_use]
    pub fn irreversible(self, reason: impl Into<String>) -> Self {
        self.push(None, Some(Reversal::Irreversible(reason.into())))
    }

    /// Reverse steps recorded so far, most recent first.
    #[must_use]
    pub fn reversals(&self) -> &VecDeque<Reversal> {
        &self.down
    }

    /// Build the migration.
    #[must_use]
    pub fn build(self) -> SqlMigration {
        let down: Vec<String> = self.down.iter().map(Reversal::render).collect();
        SqlMigration::new(self.id, self.description, self.up, down)
    }
}

fn drop_constraint(table: &str, constraint: &str) -> String {
    format!("ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {constraint};")
}
