//! Integration tests for the migrator against a SQLite ledger.
//!
//! Every test gets its own database file in a temporary directory.

use schema_migrator::{
    AppliedMigration, DatabasePool, ErrorKind, Migration, MigrationConfig, Migrator,
    SqlMigration, ValidationIssue,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Counts to five million; takes long enough to outlast short deadlines.
const SLOW_STATEMENT: &str = "CREATE TABLE slow AS \
    WITH RECURSIVE counter(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM counter WHERE x < 5000000) \
    SELECT MAX(x) AS total FROM counter";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test helper to create a SQLite config in a fresh directory
fn test_config(dir: &TempDir) -> MigrationConfig {
    let path = dir.path().join("ledger.db");
    MigrationConfig::builder()
        .database_url(format!("sqlite://{}?mode=rwc", path.display()))
        .build()
        .expect("valid sqlite config")
}

async fn setup() -> (TempDir, Migrator) {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let migrator = Migrator::new(test_config(&dir))
        .await
        .expect("migrator connects");

    sqlx::query("CREATE TABLE trail (seq INTEGER PRIMARY KEY AUTOINCREMENT, event TEXT NOT NULL)")
        .execute(migrator.pool().inner())
        .await
        .expect("trail table");

    (dir, migrator)
}

fn sql(id: &str, up: &[&str], down: &[&str]) -> Arc<dyn Migration> {
    Arc::new(SqlMigration::new(
        id,
        format!("migration {id}"),
        up.iter().copied(),
        down.iter().copied(),
    ))
}

/// A migration that writes its own id to the trail table in both directions.
fn traced(id: &str) -> Arc<dyn Migration> {
    Arc::new(SqlMigration::new(
        id,
        format!("traced {id}"),
        [format!("INSERT INTO trail (event) VALUES ('up:{id}')")],
        [format!("INSERT INTO trail (event) VALUES ('down:{id}')")],
    ))
}

async fn trail(migrator: &Migrator) -> Vec<String> {
    sqlx::query_scalar::<_, String>("SELECT event FROM trail ORDER BY seq")
        .fetch_all(migrator.pool().inner())
        .await
        .expect("read trail")
}

async fn object_exists(migrator: &Migrator, kind: &str, name: &str) -> bool {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = $1 AND name = $2",
    )
    .bind(kind)
    .bind(name)
    .fetch_one(migrator.pool().inner())
    .await
    .expect("query sqlite_master");
    count > 0
}

async fn table_exists(migrator: &Migrator, name: &str) -> bool {
    object_exists(migrator, "table", name).await
}

async fn applied_ids(migrator: &Migrator) -> Vec<String> {
    migrator
        .status()
        .await
        .expect("status")
        .into_iter()
        .map(|r| r.id)
        .collect()
}

#[tokio::test]
async fn test_up_applies_batch_and_down_reverts_highest_id() {
    let (_dir, migrator) = setup().await;

    migrator
        .register([
            sql("1", &["CREATE TABLE t (id INT)"], &["DROP TABLE t"]),
            sql(
                "2",
                &["ALTER TABLE t ADD COLUMN name TEXT"],
                &["ALTER TABLE t DROP COLUMN name"],
            ),
        ])
        .await;

    let report = migrator.up().await.unwrap();
    assert_eq!(report.batch, Some(1));
    assert_eq!(report.applied, ["1", "2"]);

    let status = migrator.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|r| r.batch == 1));
    assert_eq!(status[0].description, "migration 1");

    let report = migrator.down(1).await.unwrap();
    assert_eq!(report.rolled_back, ["2"]);
    assert!(report.unregistered.is_empty());

    assert_eq!(applied_ids(&migrator).await, ["1"]);
    assert!(table_exists(&migrator, "t").await);

    let name_columns = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM pragma_table_info('t') WHERE name = 'name'",
    )
    .fetch_one(migrator.pool().inner())
    .await
    .unwrap();
    assert_eq!(name_columns, 0);
}

#[tokio::test]
async fn test_up_is_idempotent() {
    let (_dir, migrator) = setup().await;
    migrator.register([traced("a"), traced("b")]).await;

    let first = migrator.up().await.unwrap();
    assert_eq!(first.batch, Some(1));

    let second = migrator.up().await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.batch, None);

    let status = migrator.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|r| r.batch == 1));
    assert_eq!(trail(&migrator).await, ["up:a", "up:b"]);
}

#[tokio::test]
async fn test_up_on_empty_registry_is_noop() {
    let (_dir, migrator) = setup().await;

    let report = migrator.up().await.unwrap();
    assert!(report.is_noop());
    assert!(migrator.status().await.unwrap().is_empty());
    assert!(table_exists(&migrator, "schema_migrations").await);
}

#[tokio::test]
async fn test_apply_order_ignores_registration_order() {
    let (_dir, migrator) = setup().await;
    migrator
        .register([traced("20240103"), traced("20240101"), traced("20240102")])
        .await;

    let report = migrator.up().await.unwrap();
    assert_eq!(report.applied, ["20240101", "20240102", "20240103"]);
    assert_eq!(
        trail(&migrator).await,
        ["up:20240101", "up:20240102", "up:20240103"]
    );
}

#[tokio::test]
async fn test_rollback_order_is_reverse_of_apply_order() {
    let (_dir, migrator) = setup().await;

    migrator.register([traced("b"), traced("a")]).await;
    assert_eq!(migrator.up().await.unwrap().batch, Some(1));

    migrator.register([traced("d"), traced("c")]).await;
    assert_eq!(migrator.up().await.unwrap().batch, Some(2));

    let batches: Vec<i64> = migrator
        .status()
        .await
        .unwrap()
        .iter()
        .map(|r| r.batch)
        .collect();
    assert_eq!(batches, [1, 1, 2, 2]);

    let report = migrator.down(0).await.unwrap();
    assert_eq!(report.rolled_back, ["d", "c", "b", "a"]);

    let events = trail(&migrator).await;
    assert_eq!(
        &events[4..],
        ["down:d", "down:c", "down:b", "down:a"]
    );
    assert!(migrator.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_statement_rolls_back_whole_batch() {
    let (_dir, migrator) = setup().await;

    migrator
        .register([
            sql("a", &["CREATE TABLE ta (id INT)"], &["DROP TABLE ta"]),
            sql("b", &["THIS IS NOT SQL"], &[]),
            sql("c", &["CREATE TABLE tc (id INT)"], &["DROP TABLE tc"]),
        ])
        .await;

    let err = migrator.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Statement);
    assert_eq!(err.migration_id(), Some("b"));
    assert!(std::error::Error::source(&err).is_some());

    assert!(migrator.status().await.unwrap().is_empty());
    assert!(!table_exists(&migrator, "ta").await);
    assert!(!table_exists(&migrator, "tc").await);
}

#[tokio::test]
async fn test_batch_numbers_follow_highest_existing_batch() {
    let (_dir, migrator) = setup().await;

    for id in ["1", "2", "3"] {
        migrator.register([traced(id)]).await;
        migrator.up().await.unwrap();
    }

    migrator.down(1).await.unwrap();
    migrator.register([traced("4")]).await;
    assert_eq!(migrator.up().await.unwrap().batch, Some(3));

    sqlx::query("INSERT INTO schema_migrations (id, description, batch) VALUES ('manual', 'inserted by hand', 7)")
        .execute(migrator.pool().inner())
        .await
        .unwrap();

    migrator.register([traced("5")]).await;
    assert_eq!(migrator.up().await.unwrap().batch, Some(8));
}

#[tokio::test]
async fn test_down_steps_clamping() {
    let (_dir, migrator) = setup().await;
    migrator
        .register([traced("1"), traced("2"), traced("3")])
        .await;

    migrator.up().await.unwrap();
    assert_eq!(migrator.down(5).await.unwrap().rolled_back.len(), 3);

    migrator.up().await.unwrap();
    assert_eq!(migrator.down(-1).await.unwrap().rolled_back.len(), 3);

    migrator.up().await.unwrap();
    assert_eq!(migrator.down(3).await.unwrap().rolled_back.len(), 3);

    migrator.up().await.unwrap();
    let report = migrator.down(2).await.unwrap();
    assert_eq!(report.rolled_back, ["3", "2"]);
    assert_eq!(applied_ids(&migrator).await, ["1"]);
}

#[tokio::test]
async fn test_down_on_empty_ledger_fails() {
    let (_dir, migrator) = setup().await;
    migrator.register([traced("1")]).await;

    for steps in [0, 1, 10] {
        let err = migrator.down(steps).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToRollback);
    }
    assert!(trail(&migrator).await.is_empty());
}

#[tokio::test]
async fn test_down_removes_unregistered_rows_without_statements() {
    let (dir, migrator) = setup().await;
    migrator
        .register([
            sql("1", &["CREATE TABLE t1 (id INT)"], &["DROP TABLE t1"]),
            sql("2", &["CREATE TABLE t2 (id INT)"], &["DROP TABLE t2"]),
        ])
        .await;
    migrator.up().await.unwrap();

    // A restarted process that only knows about the first migration.
    let restarted = Migrator::new(test_config(&dir)).await.unwrap();
    restarted
        .register([sql("1", &["CREATE TABLE t1 (id INT)"], &["DROP TABLE t1"])])
        .await;

    let issues = restarted.validate().await.unwrap();
    assert_eq!(issues, [ValidationIssue::Unregistered("2".to_string())]);

    let report = restarted.down(0).await.unwrap();
    assert_eq!(report.rolled_back, ["2", "1"]);
    assert_eq!(report.unregistered, ["2"]);

    assert!(restarted.status().await.unwrap().is_empty());
    assert!(table_exists(&restarted, "t2").await);
    assert!(!table_exists(&restarted, "t1").await);
}

#[tokio::test]
async fn test_builder_migration_reverts_in_undo_order() {
    let (_dir, migrator) = setup().await;

    migrator
        .register_one(
            SqlMigration::builder("20240101000001", "people with indexed name")
                .create_table("people", &["id INTEGER PRIMARY KEY"])
                .add_column("people", "name TEXT")
                .create_index("idx_people_name", "people", &["name"])
                .build(),
        )
        .await;

    migrator.up().await.unwrap();
    assert!(table_exists(&migrator, "people").await);
    assert!(object_exists(&migrator, "index", "idx_people_name").await);

    // SQLite refuses to drop an indexed column, so this only passes when the
    // index is dropped before the column.
    migrator.down(0).await.unwrap();
    assert!(!object_exists(&migrator, "index", "idx_people_name").await);
    assert!(!table_exists(&migrator, "people").await);
}

#[tokio::test]
async fn test_irreversible_placeholders_are_skipped() {
    let (_dir, migrator) = setup().await;

    migrator
        .register([sql("1", &["CREATE TABLE legacy (id INT)"], &["DROP TABLE legacy"])])
        .await;
    migrator
        .register_one(
            SqlMigration::builder("2", "drop legacy")
                .drop_table("legacy")
                .build(),
        )
        .await;
    migrator.up().await.unwrap();
    assert!(!table_exists(&migrator, "legacy").await);

    let report = migrator.down(1).await.unwrap();
    assert_eq!(report.rolled_back, ["2"]);
    assert_eq!(applied_ids(&migrator).await, ["1"]);
    assert!(!table_exists(&migrator, "legacy").await);
}

#[tokio::test]
async fn test_failed_reverse_statement_keeps_everything_applied() {
    let (_dir, migrator) = setup().await;

    migrator
        .register([
            sql("a", &["CREATE TABLE ta (id INT)"], &["NOT A STATEMENT"]),
            sql("b", &["CREATE TABLE tb (id INT)"], &["DROP TABLE tb"]),
        ])
        .await;
    migrator.up().await.unwrap();

    // b is reverted first, then a fails and takes b's rollback with it.
    let err = migrator.down(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rollback);
    assert_eq!(err.migration_id(), Some("a"));

    assert_eq!(applied_ids(&migrator).await, ["a", "b"]);
    assert!(table_exists(&migrator, "tb").await);
}

#[tokio::test]
async fn test_duplicate_ids_fail_at_ledger() {
    let (_dir, migrator) = setup().await;
    migrator
        .register([
            sql("1", &["CREATE TABLE first_copy (id INT)"], &[]),
            sql("1", &["CREATE TABLE second_copy (id INT)"], &[]),
        ])
        .await;

    let issues = migrator.validate().await.unwrap();
    assert_eq!(issues, [ValidationIssue::DuplicateId("1".to_string())]);

    let err = migrator.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecordInsert);
    assert_eq!(err.migration_id(), Some("1"));

    assert!(migrator.status().await.unwrap().is_empty());
    assert!(!table_exists(&migrator, "first_copy").await);
}

#[tokio::test]
async fn test_pending_lists_unapplied_in_apply_order() {
    let (_dir, migrator) = setup().await;
    migrator.register([traced("2"), traced("1")]).await;
    assert_eq!(migrator.pending().await.unwrap(), ["1", "2"]);

    migrator.up().await.unwrap();
    assert!(migrator.pending().await.unwrap().is_empty());

    migrator.register([traced("3")]).await;
    assert_eq!(migrator.pending().await.unwrap(), ["3"]);
    assert_eq!(migrator.registered().await, 3);
}

#[tokio::test]
async fn test_status_reports_store_timestamps() {
    let (_dir, migrator) = setup().await;
    migrator.register([traced("1")]).await;
    migrator.up().await.unwrap();

    let status = migrator.status().await.unwrap();
    let age = chrono::Utc::now() - status[0].applied_at;
    assert!(age.num_hours().abs() < 24, "applied_at too far off: {age}");
}

/// Migrations do not have to come from the builder.
struct Generated {
    id: String,
    up: Vec<String>,
    down: Vec<String>,
}

impl Migration for Generated {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "generated seed rows"
    }

    fn up(&self) -> &[String] {
        &self.up
    }

    fn down(&self) -> &[String] {
        &self.down
    }
}

#[tokio::test]
async fn test_custom_migration_type() {
    let (_dir, migrator) = setup().await;

    let up = (1..=3)
        .map(|n| format!("INSERT INTO trail (event) VALUES ('seed:{n}')"))
        .collect();
    migrator
        .register_one(Generated {
            id: "seed".to_string(),
            up,
            down: vec!["DELETE FROM trail WHERE event LIKE 'seed:%'".to_string()],
        })
        .await;

    migrator.up().await.unwrap();
    assert_eq!(trail(&migrator).await, ["seed:1", "seed:2", "seed:3"]);
    assert_eq!(
        migrator.status().await.unwrap()[0].description,
        "generated seed rows"
    );

    migrator.down(0).await.unwrap();
    assert!(trail(&migrator).await.is_empty());
}

#[tokio::test]
async fn test_custom_ledger_table_name() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.db");
    let config = MigrationConfig::builder()
        .database_url(format!("sqlite://{}?mode=rwc", path.display()))
        .table_name("ledger_custom")
        .build()
        .unwrap();

    let migrator = Migrator::new(config).await.unwrap();
    migrator
        .register([sql("1", &["CREATE TABLE x (id INT)"], &["DROP TABLE x"])])
        .await;
    migrator.up().await.unwrap();

    assert!(table_exists(&migrator, "ledger_custom").await);
    assert!(object_exists(&migrator, "index", "idx_ledger_custom_batch").await);
    assert!(!table_exists(&migrator, "schema_migrations").await);
    assert_eq!(applied_ids(&migrator).await, ["1"]);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = MigrationConfig {
        database_url: "sqlite::memory:".to_string(),
        max_connections: 0,
        ..Default::default()
    };

    let err = Migrator::new(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn test_with_pool_rejects_invalid_table_name() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pool = Arc::new(DatabasePool::new(&config).await.unwrap());

    let hostile = MigrationConfig {
        table_name: "t; DROP TABLE victim; --".to_string(),
        ..config.clone()
    };
    let err = Migrator::with_pool(Arc::clone(&pool), hostile).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let migrator = Migrator::with_pool(pool, config).unwrap();
    assert!(migrator.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_index_creation_failure_is_reported_separately() {
    let (_dir, migrator) = setup().await;

    sqlx::query("CREATE TABLE idx_schema_migrations_batch (id INT)")
        .execute(migrator.pool().inner())
        .await
        .unwrap();
    migrator
        .register([sql("1", &["CREATE TABLE t (id INT)"], &["DROP TABLE t"])])
        .await;

    let err = migrator.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreateLedgerIndex);
    assert!(table_exists(&migrator, "schema_migrations").await);
    assert!(!table_exists(&migrator, "t").await);
}

#[tokio::test]
async fn test_table_creation_failure_is_reported_separately() {
    let (_dir, migrator) = setup().await;

    // An index already holding the ledger's name blocks the table.
    sqlx::query("CREATE INDEX schema_migrations ON trail(event)")
        .execute(migrator.pool().inner())
        .await
        .unwrap();

    let err = migrator.status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreateLedgerTable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_wait_is_bounded() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = MigrationConfig {
        lock_timeout: Duration::from_millis(100),
        ..test_config(&dir)
    };
    let migrator = Arc::new(Migrator::new(config).await.unwrap());
    migrator
        .register([sql("slow", &[SLOW_STATEMENT], &["DROP TABLE slow"])])
        .await;

    let running = {
        let migrator = Arc::clone(&migrator);
        tokio::spawn(async move { migrator.up().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = migrator.status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.applied, ["slow"]);
    assert_eq!(applied_ids(&migrator).await, ["slow"]);
}

/// Status once SQLite has finished any statement abandoned by a timeout.
async fn settled_status(migrator: &Migrator) -> Vec<AppliedMigration> {
    for _ in 0..100 {
        if let Ok(rows) = migrator.status().await {
            return rows;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("ledger stayed locked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_deadline_leaves_ledger_untouched() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = MigrationConfig {
        migration_timeout: Duration::from_millis(200),
        ..test_config(&dir)
    };
    let migrator = Migrator::new(config).await.unwrap();
    migrator
        .register([
            sql("1", &["CREATE TABLE first (id INT)"], &["DROP TABLE first"]),
            sql("2", &[SLOW_STATEMENT], &["DROP TABLE slow"]),
        ])
        .await;

    let err = migrator.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert!(settled_status(&migrator).await.is_empty());
    assert!(!table_exists(&migrator, "first").await);
    assert!(!table_exists(&migrator, "slow").await);
}
