//! # Schema Migrator
//!
//! Applies and reverses ordered SQL schema changes, recording applied changes
//! in a `schema_migrations` ledger so that re-running is always safe.
//!
//! This crate provides:
//! - Batched apply: every pending migration of one run commits or fails together
//! - Rollback in strict reverse apply order, also in one transaction
//! - A fluent statement builder that pairs each change with its reverse
//! - Support for PostgreSQL and SQLite through sqlx's `Any` driver
//!
//! ## Example
//!
//! ```rust,no_run
//! use schema_migrator::{MigrationConfig, Migrator, SqlMigration};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::builder()
//!         .database_url("postgres://localhost/app")
//!         .build()?;
//!
//!     let migrator = Migrator::new(config).await?;
//!     migrator
//!         .register_one(
//!             SqlMigration::builder("20240101120000", "create users")
//!                 .create_table("users", &["id BIGINT PRIMARY KEY", "email TEXT NOT NULL"])
//!                 .create_unique_index("uq_users_email", "users", &["email"])
//!                 .build(),
//!         )
//!         .await;
//!
//!     let report = migrator.up().await?;
//!     println!("applied {:?} in batch {:?}", report.applied, report.batch);
//!
//!     migrator.down(1).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod pool;

pub use builder::{MigrationBuilder, Reversal};
pub use config::{DatabaseType, MigrationConfig, MigrationConfigBuilder};
pub use error::{ErrorKind, MigrationError, Result};
pub use ledger::AppliedMigration;
pub use migration::{Migration, SqlMigration};
pub use migrator::{ApplyReport, Migrator, RollbackReport, ValidationIssue};
pub use pool::{DatabasePool, PoolStats};

/// Re-export sqlx types for convenience
pub use sqlx;
