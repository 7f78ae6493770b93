//! Migration configuration.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the ledger table expected by existing deployments.
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// Database type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL database.
    #[default]
    PostgreSQL,
    /// SQLite database.
    SQLite,
}

impl DatabaseType {
    /// Parse from a database URL.
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PostgreSQL => write!(f, "postgresql"),
            Self::SQLite => write!(f, "sqlite"),
        }
    }
}

/// Migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Database type (auto-detected from the URL by the builder).
    #[serde(default)]
    pub database_type: DatabaseType,

    /// Schema holding the ledger table (PostgreSQL only).
    #[serde(default)]
    pub schema: Option<String>,

    /// Ledger table name.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Connection timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Upper bound for one `up` or `down` run, transaction included.
    ///
    /// On expiry the open transaction is dropped and rolled back. SQLite
    /// cannot interrupt a statement already running in its worker thread,
    /// so until that statement finishes the database stays locked and the
    /// next run fails with "database is locked" while creating the ledger.
    #[serde(with = "humantime_serde", default = "default_migration_timeout")]
    pub migration_timeout: Duration,

    /// Maximum connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for the migrator's instance lock.
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub lock_timeout: Duration,
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_migration_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_connections() -> u32 {
    5
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            database_type: DatabaseType::PostgreSQL,
            schema: None,
            table_name: default_table_name(),
            connect_timeout: default_connect_timeout(),
            migration_timeout: default_migration_timeout(),
            max_connections: default_max_connections(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> MigrationConfigBuilder {
        MigrationConfigBuilder::new()
    }

    /// Build a configuration from `DATABASE_URL`, `MIGRATIONS_TABLE` and
    /// `MIGRATIONS_SCHEMA`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| MigrationError::config("DATABASE_URL is not set"))?;

        let mut builder = Self::builder().database_url(url);
        if let Ok(table) = std::env::var("MIGRATIONS_TABLE") {
            builder = builder.table_name(table);
        }
        if let Ok(schema) = std::env::var("MIGRATIONS_SCHEMA") {
            builder = builder.schema(schema);
        }
        builder.build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(MigrationError::config("Database URL is required"));
        }

        if !is_identifier(&self.table_name) {
            return Err(MigrationError::config(format!(
                "Invalid ledger table name: {:?}",
                self.table_name
            )));
        }

        if let Some(schema) = &self.schema {
            if !is_identifier(schema) {
                return Err(MigrationError::config(format!(
                    "Invalid schema name: {schema:?}"
                )));
            }
        }

        if self.max_connections == 0 {
            return Err(MigrationError::config(
                "Max connections must be greater than 0",
            ));
        }

        if self.lock_timeout.is_zero() || self.migration_timeout.is_zero() {
            return Err(MigrationError::config("Timeouts must be non-zero"));
        }

        Ok(())
    }

    /// Get the full table name with schema.
    #[must_use]
    pub fn full_table_name(&self) -> String {
        match (&self.schema, self.database_type) {
            (Some(schema), DatabaseType::PostgreSQL) => format!("{schema}.{}", self.table_name),
            _ => self.table_name.clone(),
        }
    }

    /// Name of the secondary index on the batch column.
    #[must_use]
    pub fn batch_index_name(&self) -> String {
        format!("idx_{}_batch", self.table_name)
    }
}

// Table and schema names are interpolated into DDL, so only plain identifiers pass.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for migration configuration.
#[derive(Debug, Default)]
pub struct MigrationConfigBuilder {
    config: MigrationConfig,
}

impl MigrationConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database URL.
    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        // Auto-detect database type if possible
        if let Some(db_type) = DatabaseType::from_url(&url) {
            self.config.database_type = db_type;
        }
        self.config.database_url = url;
        self
    }

    /// Set the database type.
    #[must_use]
    pub fn database_type(mut self, db_type: DatabaseType) -> Self {
        self.config.database_type = db_type;
        self
    }

    /// Set the schema name.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = Some(schema.into());
        self
    }

    /// Set the ledger table name.
    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = name.into();
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-run timeout.
    #[must_use]
    pub fn migration_timeout(mut self, timeout: Duration) -> Self {
        self.config.migration_timeout = timeout;
        self
    }

    /// Set maximum connections.
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the lock timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<MigrationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
