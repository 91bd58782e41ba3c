//! Agent repository for `SQLite` persistence.

use chrono::Utc;

use crate::models::agent::Agent;
use crate::Result;

use super::db::Store;
use super::{decode_ts, encode_ts};

/// Repository wrapper around the ledger store for agent records.
#[derive(Clone)]
pub struct AgentRepo {
    store: Store,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    identity: String,
    config_ref: Option<String>,
    created_at: String,
    last_active_at: String,
    spawn_count: i64,
    archived: i64,
}

impl AgentRow {
    /// Convert a database row into the domain model.
    fn into_agent(self) -> Result<Agent> {
        Ok(Agent {
            created_at: decode_ts("created_at", &self.created_at)?,
            last_active_at: decode_ts("last_active_at", &self.last_active_at)?,
            id: self.id,
            identity: self.identity,
            config_ref: self.config_ref,
            spawn_count: self.spawn_count,
            archived: self.archived != 0,
        })
    }
}

const SELECT_AGENT: &str = "SELECT id, identity, config_ref, created_at, last_active_at,
     spawn_count, archived FROM agent";

impl AgentRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert a new agent record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including a duplicate identity).
    pub async fn create(&self, agent: &Agent) -> Result<Agent> {
        let pool = self.store.pool();
        let created_at = encode_ts(agent.created_at);
        let last_active_at = encode_ts(agent.last_active_at);
        let (created_at, last_active_at) = (created_at.as_str(), last_active_at.as_str());

        self.store
            .with_retry("agent.create", move || async move {
                sqlx::query(
                    "INSERT INTO agent (id, identity, config_ref, created_at, last_active_at,
                     spawn_count, archived)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&agent.id)
                .bind(&agent.identity)
                .bind(&agent.config_ref)
                .bind(created_at)
                .bind(last_active_at)
                .bind(agent.spawn_count)
                .bind(i64::from(agent.archived))
                .execute(pool)
                .await
            })
            .await?;

        Ok(agent.clone())
    }

    /// Retrieve an agent by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Agent>> {
        let sql = format!("{SELECT_AGENT} WHERE id = ?1");
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let row = self
            .store
            .with_retry("agent.get", move || async move {
                sqlx::query_as::<_, AgentRow>(sql)
                    .bind(id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        row.map(AgentRow::into_agent).transpose()
    }

    /// Retrieve an agent by its unique identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_identity(&self, identity: &str) -> Result<Option<Agent>> {
        let sql = format!("{SELECT_AGENT} WHERE identity = ?1");
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let row = self
            .store
            .with_retry("agent.get_by_identity", move || async move {
                sqlx::query_as::<_, AgentRow>(sql)
                    .bind(identity)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        row.map(AgentRow::into_agent).transpose()
    }

    /// List agents ordered by identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, include_archived: bool) -> Result<Vec<Agent>> {
        let sql = if include_archived {
            format!("{SELECT_AGENT} ORDER BY identity")
        } else {
            format!("{SELECT_AGENT} WHERE archived = 0 ORDER BY identity")
        };
        let (sql, pool) = (sql.as_str(), self.store.pool());
        let rows = self
            .store
            .with_retry("agent.list", move || async move {
                sqlx::query_as::<_, AgentRow>(sql).fetch_all(pool).await
            })
            .await?;
        rows.into_iter().map(AgentRow::into_agent).collect()
    }

    /// Soft-delete an agent. Returns `false` if the agent does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_archived(&self, id: &str) -> Result<bool> {
        let pool = self.store.pool();
        let now = encode_ts(Utc::now());
        let now = now.as_str();
        let result = self
            .store
            .with_retry("agent.archive", move || async move {
                sqlx::query("UPDATE agent SET archived = 1, last_active_at = ?1 WHERE id = ?2")
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
