//! Migration runner.
//!
//! One [`Migrator`] owns the registered migrations and the pool. A single
//! async mutex serializes every public operation on an instance, so an `up`
//! and a `down` on the same migrator never interleave. Separate processes
//! sharing one ledger are not coordinated; a racing apply surfaces as a
//! [`MigrationError::RecordInsert`] from the ledger's primary key.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::ledger::{self, AppliedMigration, Ledger};
use crate::migration::{self, Migration};
use crate::pool::DatabasePool;
use sqlx::{Any, AnyConnection, Executor, Transaction};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

type Registry = Vec<Arc<dyn Migration>>;

/// Migration runner.
pub struct Migrator {
    pool: Arc<DatabasePool>,
    ledger: Ledger,
    config: Arc<MigrationConfig>,
    migrations: Mutex<Registry>,
}

impl Migrator {
    /// Create a new migrator.
    pub async fn new(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        let pool = DatabasePool::new(&config).await?;
        Self::with_pool(Arc::new(pool), config)
    }

    /// Create a migrator with an existing pool.
    ///
    /// The config is validated the same way as in [`Migrator::new`].
    pub fn with_pool(pool: Arc<DatabasePool>, config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            ledger: Ledger::new(&config),
            config: Arc::new(config),
            migrations: Mutex::new(Vec::new()),
        })
    }

    /// Add migrations to the candidate set.
    ///
    /// Identifiers are not checked here; a duplicate fails `up` at the ledger.
    pub async fn register(&self, migrations: impl IntoIterator<Item = Arc<dyn Migration>>) {
        let mut registry = self.migrations.lock().await;
        let before = registry.len();
        registry.extend(migrations);
        debug!(
            added = registry.len() - before,
            total = registry.len(),
            "Registered migrations"
        );
    }

    /// Add one migration to the candidate set.
    pub async fn register_one<M: Migration + 'static>(&self, migration: M) {
        self.register([Arc::new(migration) as Arc<dyn Migration>]).await;
    }

    /// Number of registered migrations.
    pub async fn registered(&self) -> usize {
        self.migrations.lock().await.len()
    }

    /// Apply every registered migration missing from the ledger as one batch.
    ///
    /// Either all of them and their ledger rows are committed, or none are.
    pub async fn up(&self) -> Result<ApplyReport> {
        let registry = self.lock().await?;
        self.with_deadline(self.apply(&registry)).await
    }

    /// Roll back the `steps` most recently applied migrations in one transaction.
    ///
    /// `steps <= 0` or `steps` beyond the number of applied migrations rolls
    /// back everything.
    pub async fn down(&self, steps: i64) -> Result<RollbackReport> {
        let registry = self.lock().await?;
        self.with_deadline(self.rollback(&registry, steps)).await
    }

    /// Ledger rows ordered by batch, then identifier.
    pub async fn status(&self) -> Result<Vec<AppliedMigration>> {
        let _registry = self.lock().await?;
        self.fetch_applied().await
    }

    /// Identifiers `up` would apply, in apply order.
    pub async fn pending(&self) -> Result<Vec<String>> {
        let registry = self.lock().await?;
        let applied = self.fetch_applied().await?;
        Ok(pending_migrations(&registry, &applied)
            .into_iter()
            .map(|m| m.id().to_string())
            .collect())
    }

    /// Report problems with the registered set and the ledger without changing either.
    pub async fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let registry = self.lock().await?;
        let applied = self.fetch_applied().await?;

        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        for migration in registry.iter() {
            if migration.id().trim().is_empty() {
                issues.push(ValidationIssue::EmptyId);
            } else if !seen.insert(migration.id()) {
                issues.push(ValidationIssue::DuplicateId(migration.id().to_string()));
            }
        }

        for record in &applied {
            if !seen.contains(record.id.as_str()) {
                issues.push(ValidationIssue::Unregistered(record.id.clone()));
            }
        }

        Ok(issues)
    }

    /// Get the database pool.
    #[must_use]
    pub fn pool(&self) -> Arc<DatabasePool> {
        Arc::clone(&self.pool)
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        let timeout = self.config.lock_timeout;
        tokio::time::timeout(timeout, self.migrations.lock())
            .await
            .map_err(|_| MigrationError::LockTimeout(timeout))
    }

    // Dropping the inner future drops any open transaction, which rolls it back.
    async fn with_deadline<T>(&self, run: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.migration_timeout;
        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| MigrationError::Timeout(timeout))?
    }

    async fn fetch_applied(&self) -> Result<Vec<AppliedMigration>> {
        self.ledger.bootstrap(self.pool.inner()).await?;
        self.ledger.fetch_applied(self.pool.inner()).await
    }

    async fn begin(&self) -> Result<Transaction<'static, Any>> {
        self.pool
            .inner()
            .begin()
            .await
            .map_err(|source| MigrationError::BeginTransaction { source })
    }

    async fn apply(&self, registry: &[Arc<dyn Migration>]) -> Result<ApplyReport> {
        let applied = self.fetch_applied().await?;
        let pending = pending_migrations(registry, &applied);
        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(ApplyReport::default());
        }

        let batch = ledger::next_batch(&applied)?;
        info!(batch, count = pending.len(), "Applying migration batch");
        let start = Instant::now();

        let mut tx = self.begin().await?;
        let mut report = ApplyReport {
            batch: Some(batch),
            applied: Vec::with_capacity(pending.len()),
        };

        for migration in pending {
            if let Err(e) = self.apply_one(&mut *tx, &**migration, batch).await {
                error!(batch, id = migration.id(), error = %e, "Migration failed, rolling back batch");
                abort(tx).await;
                return Err(e);
            }
            report.applied.push(migration.id().to_string());
        }

        tx.commit()
            .await
            .map_err(|source| MigrationError::Commit { source })?;

        info!(
            batch,
            count = report.applied.len(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Migration batch applied"
        );
        Ok(report)
    }

    async fn apply_one(
        &self,
        conn: &mut AnyConnection,
        migration: &dyn Migration,
        batch: i64,
    ) -> Result<()> {
        debug!(id = migration.id(), "Applying migration");

        for statement in migration::forward_statements(migration) {
            debug!(id = migration.id(), statement, "Executing");
            (&mut *conn)
                .execute(statement)
                .await
                .map_err(|source| MigrationError::Statement {
                    id: migration.id().to_string(),
                    statement: statement.to_string(),
                    source,
                })?;
        }

        self.ledger
            .insert(conn, migration.id(), migration.description(), batch)
            .await
            .map_err(|source| MigrationError::RecordInsert {
                id: migration.id().to_string(),
                source,
            })
    }

    async fn rollback(
        &self,
        registry: &[Arc<dyn Migration>],
        steps: i64,
    ) -> Result<RollbackReport> {
        let applied = self.fetch_applied().await?;
        if applied.is_empty() {
            return Err(MigrationError::NothingToRollback);
        }

        let plan = ledger::rollback_plan(applied, steps);
        let by_id: HashMap<&str, &dyn Migration> = registry
            .iter()
            .map(|m| (m.id(), Arc::as_ref(m)))
            .collect();

        info!(steps, count = plan.len(), "Rolling back migrations");
        let start = Instant::now();

        let mut tx = self.begin().await?;
        let mut report = RollbackReport::default();

        for record in &plan {
            let migration = by_id.get(record.id.as_str()).copied();
            if let Err(e) = self.rollback_one(&mut *tx, record, migration).await {
                error!(id = %record.id, batch = record.batch, error = %e, "Rollback failed");
                abort(tx).await;
                return Err(e);
            }
            if migration.is_none() {
                report.unregistered.push(record.id.clone());
            }
            report.rolled_back.push(record.id.clone());
        }

        tx.commit()
            .await
            .map_err(|source| MigrationError::Commit { source })?;

        info!(
            count = report.rolled_back.len(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Rollback complete"
        );
        Ok(report)
    }

    async fn rollback_one(
        &self,
        conn: &mut AnyConnection,
        record: &AppliedMigration,
        migration: Option<&dyn Migration>,
    ) -> Result<()> {
        match migration {
            Some(migration) => {
                debug!(id = %record.id, batch = record.batch, "Reverting migration");
                for statement in migration::reverse_statements(migration) {
                    debug!(id = %record.id, statement, "Executing");
                    (&mut *conn)
                        .execute(statement)
                        .await
                        .map_err(|source| MigrationError::Rollback {
                            id: record.id.clone(),
                            statement: statement.to_string(),
                            source,
                        })?;
                }
            }
            None => warn!(
                id = %record.id,
                batch = record.batch,
                "Migration is not registered, removing ledger row without reverting"
            ),
        }

        self.ledger
            .delete(conn, &record.id)
            .await
            .map_err(|source| MigrationError::RecordDelete {
                id: record.id.clone(),
                source,
            })
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("table", &self.ledger.table())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Registered migrations without a ledger row, sorted by identifier.
fn pending_migrations<'a>(
    registry: &'a [Arc<dyn Migration>],
    applied: &[AppliedMigration],
) -> Vec<&'a Arc<dyn Migration>> {
    let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();

    let mut pending: Vec<_> = registry
        .iter()
        .filter(|m| !applied_ids.contains(m.id()))
        .collect();
    // Stable, so duplicates keep registration order and the second one hits the ledger key.
    pending.sort_by(|a, b| a.id().cmp(b.id()));
    pending
}

async fn abort(tx: Transaction<'static, Any>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Explicit rollback failed; connection will roll back on release");
    }
}

/// Outcome of [`Migrator::up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Batch assigned to this run; `None` when nothing was pending.
    pub batch: Option<i64>,
    /// Applied identifiers in apply order.
    pub applied: Vec<String>,
}

impl ApplyReport {
    /// Whether the run applied nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Outcome of [`Migrator::down`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Rolled-back identifiers in rollback order.
    pub rolled_back: Vec<String>,
    /// Rolled-back identifiers that had no registered migration; only their
    /// ledger rows were removed.
    pub unregistered: Vec<String>,
}

/// Validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Two registered migrations share an identifier.
    DuplicateId(String),
    /// A registered migration has a blank identifier.
    EmptyId,
    /// A ledger row has no registered migration; rolling it back runs nothing.
    Unregistered(String),
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "Duplicate migration id: {id}"),
            Self::EmptyId => write!(f, "Migration with empty id"),
            Self::Unregistered(id) => write!(f, "Applied migration {id} is not registered"),
        }
    }
}
