//! The `schema_migrations` ledger.
//!
//! A row's presence is the only record that a migration is applied. Rows are
//! inserted and deleted inside the same transaction as the statements they
//! describe and are never updated in place.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyConnection, AnyPool, Row};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// A ledger row: one applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Migration identifier.
    pub id: String,
    /// Description captured when the migration was applied.
    pub description: String,
    /// Insertion time assigned by the store.
    pub applied_at: DateTime<Utc>,
    /// Batch the migration was applied in.
    pub batch: i64,
}

impl AppliedMigration {
    /// Apply order: ascending batch, then ascending identifier.
    #[must_use]
    pub fn apply_order(&self, other: &Self) -> Ordering {
        self.batch
            .cmp(&other.batch)
            .then_with(|| self.id.cmp(&other.id))
    }

    fn from_row(row: &AnyRow) -> Result<Self> {
        let decode = |e: sqlx::Error| MigrationError::FetchApplied { source: e };
        let id: String = row.try_get("id").map_err(decode)?;
        let applied_at: String = row.try_get("applied_at").map_err(decode)?;

        Ok(Self {
            applied_at: parse_timestamp(&applied_at).ok_or_else(|| {
                MigrationError::InvalidRecord(format!(
                    "migration {id} has unreadable applied_at {applied_at:?}"
                ))
            })?,
            description: row.try_get("description").map_err(decode)?,
            batch: row.try_get("batch").map_err(decode)?,
            id,
        })
    }
}

impl fmt::Display for AppliedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} [batch {}] ({})",
            self.id,
            self.description,
            self.batch,
            self.applied_at.to_rfc3339()
        )
    }
}

// PostgreSQL renders `timestamp::text` with microseconds, SQLite's
// CURRENT_TIMESTAMP has none; rows written by other tools may hold RFC 3339.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
        .or_else(|_| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|dt| dt.with_timezone(&Utc))
        })
        .ok()
}

/// Batch number for the next `up` run: one past the highest batch present.
///
/// A ledger already holding `i64::MAX` has no next batch.
pub fn next_batch(applied: &[AppliedMigration]) -> Result<i64> {
    let highest = applied.iter().map(|m| m.batch).max().unwrap_or(0);
    highest.checked_add(1).ok_or_else(|| {
        MigrationError::InvalidRecord(format!("batch {highest} leaves no next batch number"))
    })
}

/// Rows to roll back for `steps`, most recently applied first.
///
/// `steps <= 0` or more steps than rows selects every row.
#[must_use]
pub fn rollback_plan(mut applied: Vec<AppliedMigration>, steps: i64) -> Vec<AppliedMigration> {
    applied.sort_by(|a, b| b.apply_order(a));

    let take = usize::try_from(steps)
        .ok()
        .filter(|&n| n > 0 && n <= applied.len())
        .unwrap_or(applied.len());
    applied.truncate(take);
    applied
}

/// SQL access to the ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
    index: String,
}

impl Ledger {
    /// Ledger for the table named in `config`.
    #[must_use]
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            table: config.full_table_name(),
            index: config.batch_index_name(),
        }
    }

    /// Fully qualified table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// DDL for the ledger table.
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id VARCHAR(255) PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                batch INTEGER NOT NULL
            )
            "#,
            table = self.table,
        )
    }

    /// DDL for the batch index.
    #[must_use]
    pub fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(batch)",
            self.index, self.table
        )
    }

    /// Create the table and its index if missing. Safe to call repeatedly.
    pub async fn bootstrap(&self, pool: &AnyPool) -> Result<()> {
        sqlx::query(&self.create_table_sql())
            .execute(pool)
            .await
            .map_err(|source| MigrationError::CreateLedgerTable { source })?;

        sqlx::query(&self.create_index_sql())
            .execute(pool)
            .await
            .map_err(|source| MigrationError::CreateLedgerIndex { source })?;

        debug!(table = %self.table, "Ledger ready");
        Ok(())
    }

    /// Every ledger row in apply order.
    pub async fn fetch_applied(&self, pool: &AnyPool) -> Result<Vec<AppliedMigration>> {
        let sql = format!(
            "SELECT id, description, CAST(applied_at AS TEXT) AS applied_at, CAST(batch AS BIGINT) AS batch
             FROM {}
             ORDER BY batch, id",
            self.table
        );

        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(|source| MigrationError::FetchApplied { source })?;

        let mut applied = rows
            .iter()
            .map(AppliedMigration::from_row)
            .collect::<Result<Vec<_>>>()?;

        // Store collations may disagree with byte order on identifiers.
        applied.sort_by(AppliedMigration::apply_order);
        Ok(applied)
    }

    /// Record `id` as applied in `batch`; `applied_at` is left to the store.
    pub async fn insert(
        &self,
        conn: &mut AnyConnection,
        id: &str,
        description: &str,
        batch: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (id, description, batch) VALUES ($1, $2, $3)",
            self.table
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(description)
            .bind(batch)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Remove the row for `id`.
    pub async fn delete(
        &self,
        conn: &mut AnyConnection,
        id: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);

        sqlx::query(&sql).bind(id).execute(conn).await?;
        Ok(())
    }
}
