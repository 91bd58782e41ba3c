//! Agent identity model.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durable agent identity that spawns are launched on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Agent {
    /// Durable record identifier.
    pub id: String,
    /// Unique human-facing identity (e.g., `reviewer`).
    pub identity: String,
    /// Launch profile name; falls back to the identity when unset.
    pub config_ref: Option<String>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time a spawn was created for this agent.
    pub last_active_at: DateTime<Utc>,
    /// Number of spawns ever created for this agent.
    pub spawn_count: i64,
    /// Soft-delete flag; archived agents cannot launch new spawns.
    pub archived: bool,
}

impl Agent {
    /// Construct a new agent with a generated identifier.
    #[must_use]
    pub fn new(identity: String, config_ref: Option<String>) -> Self {
        // Stored with microsecond precision; keep the in-memory copy equal.
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: Uuid::new_v4().to_string(),
            identity,
            config_ref,
            created_at: now,
            last_active_at: now,
            spawn_count: 0,
            archived: false,
        }
    }
}
