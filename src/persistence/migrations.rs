//! Ordered, named schema migrations applied at most once per store.
//!
//! Every migration runs inside `BEGIN IMMEDIATE`, so the applied check,
//! the body and the bookkeeping row commit together. Row counts of all user
//! tables are compared before and after the body; a drop beyond the allowed
//! loss rolls the whole migration back.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use futures_util::future::LocalBoxFuture;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::{AppError, Result};

use super::db::Store;
use super::encode_ts;

/// Reserved table recording applied migration names.
pub const MIGRATIONS_TABLE: &str = "_migrations";

const BOOTSTRAP: &str = r"
CREATE TABLE IF NOT EXISTS _migrations (
    name        TEXT PRIMARY KEY NOT NULL,
    applied     INTEGER NOT NULL DEFAULT 0,
    applied_at  TEXT
);
";

/// Procedure body: arbitrary work on the migration's transaction.
///
/// Bodies must tolerate being retried after a rollback. The future is not
/// `Send`; bodies always run on the migrating task.
pub type ProcedureFn = for<'c> fn(
    &'c mut SqliteConnection,
) -> LocalBoxFuture<'c, std::result::Result<(), sqlx::Error>>;

/// The body of a migration.
#[derive(Clone, Copy)]
pub enum MigrationKind {
    /// One or more SQL statements executed as a batch.
    Statement(&'static str),
    /// Rust code run against the open transaction.
    Procedure(ProcedureFn),
}

impl fmt::Debug for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement(sql) => f.debug_tuple("Statement").field(sql).finish(),
            Self::Procedure(_) => f.write_str("Procedure(..)"),
        }
    }
}

/// A named schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Unique name; the idempotency key.
    pub name: &'static str,
    /// What the migration does.
    pub kind: MigrationKind,
}

/// Names applied and skipped by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order.
    pub applied: Vec<String>,
    /// Migrations already applied (by this or another process).
    pub skipped: Vec<String>,
}

/// Applies migrations with a row-loss guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationRunner {
    allowed_loss: i64,
}

impl MigrationRunner {
    /// Runner that tolerates no row loss.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit each table to lose up to `rows` rows per migration.
    #[must_use]
    pub fn with_allowed_loss(mut self, rows: i64) -> Self {
        self.allowed_loss = rows.max(0);
        self
    }

    /// Apply every unapplied migration in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DataLoss` if a migration drops rows beyond the
    /// allowed loss, `AppError::LockContention` if the write lock cannot be
    /// taken, or `AppError::Db` if a body fails. The failing migration is
    /// rolled back and left unmarked; later migrations are not attempted.
    pub async fn run(&self, store: &Store, migrations: &[Migration]) -> Result<MigrationReport> {
        let mut conn = store.acquire().await?;

        store.begin_immediate(&mut conn, "migrations.bootstrap").await?;
        if let Err(err) = sqlx::raw_sql(BOOTSTRAP).execute(&mut *conn).await {
            rollback(&mut conn, "bootstrap").await;
            return Err(err.into());
        }
        sqlx::raw_sql("COMMIT").execute(&mut *conn).await?;

        let mut report = MigrationReport::default();
        for migration in migrations {
            if is_applied(&mut conn, migration.name).await? {
                report.skipped.push(migration.name.to_owned());
                continue;
            }

            store.begin_immediate(&mut conn, migration.name).await?;
            match self.apply_locked(&mut conn, migration).await {
                Ok(true) => {
                    sqlx::raw_sql("COMMIT").execute(&mut *conn).await?;
                    info!(store = store.name(), migration = migration.name, "migration applied");
                    report.applied.push(migration.name.to_owned());
                }
                Ok(false) => {
                    rollback(&mut conn, migration.name).await;
                    report.skipped.push(migration.name.to_owned());
                }
                Err(err) => {
                    rollback(&mut conn, migration.name).await;
                    error!(store = store.name(), migration = migration.name, %err, "migration aborted");
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    /// Apply one migration inside an open write transaction.
    ///
    /// Returns `false` if another process applied it first.
    async fn apply_locked(&self, conn: &mut SqliteConnection, migration: &Migration) -> Result<bool> {
        if is_applied(conn, migration.name).await? {
            return Ok(false);
        }

        let before = snapshot_counts(conn).await?;
        match migration.kind {
            MigrationKind::Statement(sql) => {
                sqlx::raw_sql(sql).execute(&mut *conn).await?;
            }
            MigrationKind::Procedure(body) => body(&mut *conn).await?,
        }
        let after = snapshot_counts(conn).await?;

        for (table, &before_count) in &before {
            let after_count = after.get(table).copied().unwrap_or(0);
            if before_count - after_count > self.allowed_loss {
                return Err(AppError::DataLoss {
                    migration: migration.name.to_owned(),
                    table: table.clone(),
                    before: before_count,
                    after: after_count,
                });
            }
        }

        sqlx::query(
            "INSERT INTO _migrations (name, applied, applied_at) VALUES (?1, 1, ?2)
             ON CONFLICT(name) DO UPDATE SET applied = 1, applied_at = excluded.applied_at",
        )
        .bind(migration.name)
        .bind(encode_ts(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }
}

async fn is_applied(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let applied: Option<i64> = sqlx::query_scalar("SELECT applied FROM _migrations WHERE name = ?1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(applied == Some(1))
}

/// Row count of every user table, keyed by table name.
async fn snapshot_counts(conn: &mut SqliteConnection) -> Result<BTreeMap<String, i64>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1
         ORDER BY name",
    )
    .bind(MIGRATIONS_TABLE)
    .fetch_all(&mut *conn)
    .await?;

    let mut counts = BTreeMap::new();
    for table in tables {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        counts.insert(table, count);
    }
    Ok(counts)
}

async fn rollback(conn: &mut SqliteConnection, migration: &str) {
    if let Err(err) = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await {
        warn!(migration, %err, "rollback failed");
    }
}
