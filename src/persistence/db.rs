//! `SQLite` store connection, lock-contention retry and WAL checkpointing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::{AppError, Result};

use super::migrations::{Migration, MigrationRunner};

/// Connections per file-backed pool.
const MAX_CONNECTIONS: u32 = 4;

/// Side files `SQLite` keeps next to a WAL-mode database.
const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Whether a `sqlx` error is a transient lock/busy condition.
#[must_use]
pub fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            // Extended result codes keep the primary code in the low byte.
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(5 | 6)) {
                return true;
            }
            let message = db.message().to_ascii_lowercase();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || message.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Bounded backoff applied to locked stores.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
    warn_after: Duration,
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            attempts: config.lock_retries.max(1),
            backoff: Duration::from_millis(config.lock_backoff_ms),
            warn_after: Duration::from_millis(config.contention_warn_ms),
        }
    }
}

impl RetryPolicy {
    /// Sleep before the next attempt, or give up with the mapped error.
    async fn backoff_or_fail(
        &self,
        store: &str,
        op: &str,
        attempt: u32,
        err: sqlx::Error,
    ) -> Result<()> {
        if !is_lock_contention(&err) {
            return Err(AppError::from(err));
        }
        if attempt >= self.attempts {
            warn!(store, op, attempt, %err, "store still locked, giving up");
            return Err(AppError::LockContention(format!(
                "{store}: {op} still locked after {attempt} attempts: {err}"
            )));
        }
        let delay = self.backoff * attempt;
        debug!(store, op, attempt, delay_ms = millis(delay), "store locked, retrying");
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn note_elapsed(&self, store: &str, op: &str, attempts: u32, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.warn_after {
            warn!(
                store,
                op,
                attempts,
                elapsed_ms = millis(elapsed),
                "slow store operation under contention"
            );
        }
    }

    async fn run<T, F, Fut>(&self, store: &str, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    self.note_elapsed(store, op, attempt, started);
                    return Ok(value);
                }
                Err(err) => self.backoff_or_fail(store, op, attempt, err).await?,
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A named, file-backed `SQLite` store with migrations applied.
#[derive(Clone)]
pub struct Store {
    name: Arc<str>,
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Store {
    /// Open (creating on first use) the store at `path`, enable WAL, and
    /// apply `migrations`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the parent directory cannot be created,
    /// `AppError::LockContention` if the file stays locked, or any error
    /// raised by the migration runner.
    pub async fn open(
        name: &str,
        path: &Path,
        migrations: &[Migration],
        config: &StorageConfig,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                AppError::Io(format!("failed to create store dir {}: {err}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let retry = RetryPolicy::from(config);
        let pool = retry
            .run(name, "connect", || {
                SqlitePoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .connect_with(options.clone())
            })
            .await?;

        let store = Self {
            name: Arc::from(name),
            pool,
            retry,
        };
        MigrationRunner::new().run(&store, migrations).await?;
        info!(store = name, path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open a private in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or a migration fails.
    pub async fn open_in_memory(name: &str, migrations: &[Migration]) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single long-lived connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self {
            name: Arc::from(name),
            pool,
            retry: RetryPolicy::from(&StorageConfig::default()),
        };
        MigrationRunner::new().run(&store, migrations).await?;
        Ok(store)
    }

    /// Store name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a database operation, retrying lock contention with backoff.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockContention` once the retry budget is spent, or
    /// `AppError::Db` for any other database failure.
    pub async fn with_retry<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        self.retry.run(&self.name, op, f).await
    }

    /// Acquire a pooled connection, retrying lock contention.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockContention` if the pool stays exhausted.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        let pool = &self.pool;
        self.with_retry("acquire", || pool.acquire()).await
    }

    /// Start a write transaction on `conn`, retrying while another writer
    /// holds the lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockContention` once the retry budget is spent.
    pub async fn begin_immediate(&self, conn: &mut SqliteConnection, op: &str) -> Result<()> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match sqlx::raw_sql("BEGIN IMMEDIATE").execute(&mut *conn).await {
                Ok(_) => {
                    self.retry.note_elapsed(&self.name, op, attempt, started);
                    return Ok(());
                }
                Err(err) => {
                    self.retry
                        .backoff_or_fail(&self.name, op, attempt, err)
                        .await?;
                }
            }
        }
    }

    /// Close the pool, flushing connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Merge WAL contents into every `*.db` file in `dir` and remove the side
/// files, leaving a self-contained directory snapshot.
///
/// Returns the database files that were checkpointed.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory cannot be read,
/// `AppError::LockContention` if another connection blocks the checkpoint,
/// or `AppError::Db` on any other database failure.
pub async fn checkpoint_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", dir.display())))?;

    let mut databases = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "db") && path.is_file() {
            databases.push(path);
        }
    }
    databases.sort();

    for path in &databases {
        checkpoint_file(path).await?;
    }
    info!(dir = %dir.display(), count = databases.len(), "stores checkpointed");
    Ok(databases)
}

async fn checkpoint_file(path: &Path) -> Result<()> {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal)
        .connect()
        .await?;

    let (busy, _log_frames, _checkpointed): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&mut conn)
            .await?;
    if busy != 0 {
        conn.close().await.ok();
        return Err(AppError::LockContention(format!(
            "checkpoint of {} blocked by an open reader",
            path.display()
        )));
    }

    // Leaving WAL mode removes the log once this is the only connection.
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode=DELETE")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;
    if !mode.eq_ignore_ascii_case("delete") {
        return Err(AppError::LockContention(format!(
            "{} is still in {mode} mode; another process has it open",
            path.display()
        )));
    }

    for suffix in SIDE_FILE_SUFFIXES {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let side = PathBuf::from(side);
        match tokio::fs::metadata(&side).await {
            Ok(meta) if suffix == "-wal" && meta.len() > 0 => {
                return Err(AppError::Db(format!(
                    "{} still holds un-checkpointed frames",
                    side.display()
                )));
            }
            Ok(_) => tokio::fs::remove_file(&side).await?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(AppError::from(err)),
        }
    }
    debug!(path = %path.display(), "store checkpointed");
    Ok(())
}
