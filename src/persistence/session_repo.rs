//! Session index repository for the `sessions` store.

use chrono::{DateTime, Utc};

use crate::models::transcript::SessionRecord;
use crate::Result;

use super::db::Store;
use super::{decode_opt_ts, decode_ts, encode_ts};

/// Repository wrapper around the sessions store.
#[derive(Clone)]
pub struct SessionRepo {
    store: Store,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    spawn_id: String,
    provider: String,
    path: String,
    linked_at: String,
    size_bytes: Option<i64>,
    modified_at: Option<String>,
    finalized_at: Option<String>,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            linked_at: decode_ts("linked_at", &self.linked_at)?,
            modified_at: decode_opt_ts("modified_at", self.modified_at.as_deref())?,
            finalized_at: decode_opt_ts("finalized_at", self.finalized_at.as_deref())?,
            session_id: self.session_id,
            spawn_id: self.spawn_id,
            provider: self.provider,
            path: self.path,
            size_bytes: self.size_bytes,
        })
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record a link. An existing row for the same session is left untouched.
    ///
    /// Returns `true` if a new row was inserted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn record_link(&self, record: &SessionRecord) -> Result<bool> {
        let pool = self.store.pool();
        let linked_at = encode_ts(record.linked_at);
        let modified_at = record.modified_at.map(encode_ts);
        let (linked_at, modified_at) = (linked_at.as_str(), modified_at.as_deref());

        let result = self
            .store
            .with_retry("session.record_link", move || async move {
                sqlx::query(
                    "INSERT INTO session_index (session_id, spawn_id, provider, path, linked_at,
                     size_bytes, modified_at, finalized_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
                     ON CONFLICT(session_id) DO NOTHING",
                )
                .bind(&record.session_id)
                .bind(&record.spawn_id)
                .bind(&record.provider)
                .bind(&record.path)
                .bind(linked_at)
                .bind(record.size_bytes)
                .bind(modified_at)
                .execute(pool)
                .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retrieve the index row for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let pool = self.store.pool();
        let row = self
            .store
            .with_retry("session.get", move || async move {
                sqlx::query_as::<_, SessionRow>("SELECT * FROM session_index WHERE session_id = ?1")
                    .bind(session_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        row.map(SessionRow::into_record).transpose()
    }

    /// Retrieve the index row for a spawn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_for_spawn(&self, spawn_id: &str) -> Result<Option<SessionRecord>> {
        let pool = self.store.pool();
        let row = self
            .store
            .with_retry("session.get_for_spawn", move || async move {
                sqlx::query_as::<_, SessionRow>("SELECT * FROM session_index WHERE spawn_id = ?1 LIMIT 1")
                    .bind(spawn_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        row.map(SessionRow::into_record).transpose()
    }

    /// Refresh transcript statistics and mark the session finalized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_finalized(
        &self,
        session_id: &str,
        size_bytes: i64,
        modified_at: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = self.store.pool();
        let modified_at = encode_ts(modified_at);
        let finalized_at = encode_ts(Utc::now());
        let (modified_at, finalized_at) = (modified_at.as_str(), finalized_at.as_str());

        let result = self
            .store
            .with_retry("session.finalize", move || async move {
                sqlx::query(
                    "UPDATE session_index SET size_bytes = ?1, modified_at = ?2, finalized_at = ?3
                     WHERE session_id = ?4",
                )
                .bind(size_bytes)
                .bind(modified_at)
                .bind(finalized_at)
                .bind(session_id)
                .execute(pool)
                .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
