//! Spawn ledger repository for `SQLite` persistence.
//!
//! Rows are append-only. Status writes are compare-and-set on the current
//! status so concurrent writers from other processes cannot move a spawn out
//! of a terminal state.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::models::spawn::{Spawn, SpawnFilter, SpawnStatus};
use crate::Result;

use super::db::Store;
use super::{decode_opt_ts, decode_ts, encode_ts};

/// Repository wrapper around the ledger store for spawn records.
#[derive(Clone)]
pub struct SpawnRepo {
    store: Store,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SpawnRow {
    id: String,
    agent_id: String,
    parent_spawn_id: Option<String>,
    channel_id: Option<String>,
    session_id: Option<String>,
    status: String,
    pid: Option<i64>,
    created_at: String,
    ended_at: Option<String>,
}

impl SpawnRow {
    /// Convert a database row into the domain model.
    fn into_spawn(self) -> Result<Spawn> {
        Ok(Spawn {
            status: self.status.parse()?,
            created_at: decode_ts("created_at", &self.created_at)?,
            ended_at: decode_opt_ts("ended_at", self.ended_at.as_deref())?,
            id: self.id,
            agent_id: self.agent_id,
            parent_spawn_id: self.parent_spawn_id,
            channel_id: self.channel_id,
            session_id: self.session_id,
            pid: self.pid,
        })
    }
}

const SELECT_SPAWN: &str = "SELECT id, agent_id, parent_spawn_id, channel_id, session_id,
     status, pid, created_at, ended_at FROM spawn";

impl SpawnRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert a spawn and bump its agent's counter in one transaction.
    ///
    /// Returns `false` (and inserts nothing) if the agent does not exist or
    /// is archived.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn insert_with_agent_bump(&self, spawn: &Spawn) -> Result<bool> {
        let pool = self.store.pool();
        let created_at = encode_ts(spawn.created_at);
        let created_at = created_at.as_str();

        self.store
            .with_retry("spawn.create", move || async move {
                let mut tx = pool.begin().await?;
                let bumped = sqlx::query(
                    "UPDATE agent SET spawn_count = spawn_count + 1, last_active_at = ?1
                     WHERE id = ?2 AND archived = 0",
                )
                .bind(created_at)
                .bind(&spawn.agent_id)
                .execute(&mut *tx)
                .await?;
                if bumped.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                sqlx::query(
                    "INSERT INTO spawn (id, agent_id, parent_spawn_id, channel_id, session_id,
                     status, pid, created_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                )
                .bind(&spawn.id)
                .bind(&spawn.agent_id)
                .bind(&spawn.parent_spawn_id)
                .bind(&spawn.channel_id)
                .bind(&spawn.session_id)
                .bind(spawn.status.as_str())
                .bind(spawn.pid)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(true)
            })
            .await
    }

    /// Retrieve a spawn by exact identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Spawn>> {
        let sql = format!("{SELECT_SPAWN} WHERE id = ?1");
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let row = self
            .store
            .with_retry("spawn.get", move || async move {
                sqlx::query_as::<_, SpawnRow>(sql)
                    .bind(id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        row.map(SpawnRow::into_spawn).transpose()
    }

    /// Spawns whose identifier starts with `prefix`, at most `limit` rows.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_by_prefix(&self, prefix: &str, limit: u32) -> Result<Vec<Spawn>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let sql = format!("{SELECT_SPAWN} WHERE id LIKE ?1 ESCAPE '\\' ORDER BY id LIMIT ?2");
        let pattern = format!("{escaped}%");
        let (sql, pattern, pool) = (sql.as_str(), pattern.as_str(), self.store.pool());
        let rows = self
            .store
            .with_retry("spawn.find_by_prefix", move || async move {
                sqlx::query_as::<_, SpawnRow>(sql)
                    .bind(pattern)
                    .bind(i64::from(limit))
                    .fetch_all(pool)
                    .await
            })
            .await?;
        rows.into_iter().map(SpawnRow::into_spawn).collect()
    }

    /// Record the OS process id. Returns `false` if the spawn does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_pid(&self, id: &str, pid: i64) -> Result<bool> {
        let pool = self.store.pool();
        let result = self
            .store
            .with_retry("spawn.set_pid", move || async move {
                sqlx::query("UPDATE spawn SET pid = ?1 WHERE id = ?2")
                    .bind(pid)
                    .bind(id)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a spawn from `expected` to `next`, stamping `ended_at` when given.
    ///
    /// Returns `false` if the row was no longer in `expected`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        expected: SpawnStatus,
        next: SpawnStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let pool = self.store.pool();
        let ended_at = ended_at.map(encode_ts);
        let ended_at = ended_at.as_deref();
        let result = self
            .store
            .with_retry("spawn.update_status", move || async move {
                sqlx::query(
                    "UPDATE spawn SET status = ?1, ended_at = COALESCE(?2, ended_at)
                     WHERE id = ?3 AND status = ?4",
                )
                .bind(next.as_str())
                .bind(ended_at)
                .bind(id)
                .bind(expected.as_str())
                .execute(pool)
                .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Link a session only if the spawn has none yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_session_if_unlinked(&self, id: &str, session_id: &str) -> Result<bool> {
        let pool = self.store.pool();
        let result = self
            .store
            .with_retry("spawn.link_session", move || async move {
                sqlx::query("UPDATE spawn SET session_id = ?1 WHERE id = ?2 AND session_id IS NULL")
                    .bind(session_id)
                    .bind(id)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The spawn currently linked to `session_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_by_session(&self, session_id: &str) -> Result<Option<String>> {
        let pool = self.store.pool();
        self.store
            .with_retry("spawn.find_by_session", move || async move {
                sqlx::query_scalar::<_, String>("SELECT id FROM spawn WHERE session_id = ?1 LIMIT 1")
                    .bind(session_id)
                    .fetch_optional(pool)
                    .await
            })
            .await
    }

    /// List spawns matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, filter: &SpawnFilter) -> Result<Vec<Spawn>> {
        let pool = self.store.pool();
        let rows = self
            .store
            .with_retry("spawn.list", move || async move {
                let mut query = list_query(filter);
                query.build_query_as::<SpawnRow>().fetch_all(pool).await
            })
            .await?;
        rows.into_iter().map(SpawnRow::into_spawn).collect()
    }

    /// Direct children of a spawn, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Spawn>> {
        let sql = format!("{SELECT_SPAWN} WHERE parent_spawn_id = ?1 ORDER BY created_at, id");
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let rows = self
            .store
            .with_retry("spawn.children", move || async move {
                sqlx::query_as::<_, SpawnRow>(sql)
                    .bind(parent_id)
                    .fetch_all(pool)
                    .await
            })
            .await?;
        rows.into_iter().map(SpawnRow::into_spawn).collect()
    }

    /// All spawns currently `running`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_running(&self) -> Result<Vec<Spawn>> {
        let sql = format!("{SELECT_SPAWN} WHERE status = 'running' ORDER BY created_at, id");
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let rows = self
            .store
            .with_retry("spawn.list_running", move || async move {
                sqlx::query_as::<_, SpawnRow>(sql).fetch_all(pool).await
            })
            .await?;
        rows.into_iter().map(SpawnRow::into_spawn).collect()
    }
}

/// `SELECT` for [`SpawnRepo::list`], rebuilt on every retry attempt.
fn list_query(filter: &SpawnFilter) -> QueryBuilder<'_, Sqlite> {
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(SELECT_SPAWN);
    query.push(" WHERE 1 = 1");
    if let Some(agent_id) = &filter.agent_id {
        query.push(" AND agent_id = ").push_bind(agent_id);
    }
    if let Some(channel_id) = &filter.channel_id {
        query.push(" AND channel_id = ").push_bind(channel_id);
    }
    if let Some(parent) = &filter.parent_spawn_id {
        query.push(" AND parent_spawn_id = ").push_bind(parent);
    }
    if !filter.statuses.is_empty() {
        query.push(" AND status IN (");
        let mut separated = query.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    query.push(" ORDER BY created_at DESC, id DESC");
    if let Some(limit) = filter.limit {
        query.push(" LIMIT ").push_bind(i64::from(limit));
    }
    query
}
