//! Database connection pool management.

use crate::config::{DatabaseType, MigrationConfig};
use crate::error::{MigrationError, Result};
use serde::Serialize;
use sqlx::{any::AnyPoolOptions, AnyPool};
use tracing::debug;

/// Database connection pool.
pub struct DatabasePool {
    pool: AnyPool,
    database_type: DatabaseType,
    max_connections: u32,
}

impl DatabasePool {
    /// Create a new database pool.
    pub async fn new(config: &MigrationConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        // Every connection to an in-memory SQLite database sees its own database.
        let max_connections = if is_in_memory_sqlite(config) {
            1
        } else {
            config.max_connections
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;

        debug!(
            database_type = %config.database_type,
            max_connections,
            "Connected migration pool"
        );

        Ok(Self {
            pool,
            database_type: config.database_type,
            max_connections,
        })
    }

    /// Wrap a pool owned by the caller.
    #[must_use]
    pub fn from_pool(pool: AnyPool, database_type: DatabaseType) -> Self {
        let max_connections = pool.options().get_max_connections();
        Self {
            pool,
            database_type,
            max_connections,
        }
    }

    /// Get a reference to the underlying pool.
    #[must_use]
    pub fn inner(&self) -> &AnyPool {
        &self.pool
    }

    /// Get the database type.
    #[must_use]
    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_connections: self.max_connections,
        }
    }

    /// Test the connection.
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;

        Ok(())
    }
}

fn is_in_memory_sqlite(config: &MigrationConfig) -> bool {
    config.database_type == DatabaseType::SQLite
        && (config.database_url.contains(":memory:") || config.database_url.contains("mode=memory"))
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("database_type", &self.database_type)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Current number of connections.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum connections allowed.
    pub max_connections: u32,
}

impl PoolStats {
    /// Get the number of active connections.
    #[must_use]
    pub fn active(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }
}
