//! Spawn model and lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Number of trailing id characters used as the correlation marker.
pub const MARKER_LEN: usize = 8;

/// Lifecycle status for a spawn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    /// Row created, process not yet confirmed.
    Pending,
    /// Process launched and pid recorded.
    Running,
    /// Process exited with code 0.
    Completed,
    /// Process exited non-zero, never launched, or vanished.
    Failed,
    /// Exceeded the configured run time.
    Timeout,
    /// Aborted by an operator. Final; later writes are ignored.
    Killed,
}

impl SpawnStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Timeout,
        Self::Killed,
    ];

    /// Whether the status is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Killed
        )
    }

    /// Database and CLI representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Re-applying the current status is not a transition and returns `false`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (
                    Self::Pending | Self::Running,
                    Self::Completed | Self::Failed | Self::Timeout | Self::Killed
                )
        )
    }

    /// Parse a pipe-delimited status filter such as `running|pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any element is not a known status.
    pub fn parse_filter(raw: &str) -> Result<Vec<Self>, AppError> {
        let mut statuses = Vec::new();
        for part in raw.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let status = part.parse::<Self>()?;
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpawnStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Config(format!("invalid spawn status: {s}")))
    }
}

/// One tracked invocation of an external worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Spawn {
    /// Time-ordered unique identifier (`UUIDv7`).
    pub id: String,
    /// Owning agent identifier.
    pub agent_id: String,
    /// Parent spawn, if launched from inside another spawn.
    pub parent_spawn_id: Option<String>,
    /// Opaque correlation channel passed through from the caller.
    pub channel_id: Option<String>,
    /// Provider transcript id once linked.
    pub session_id: Option<String>,
    /// Current lifecycle status.
    pub status: SpawnStatus,
    /// OS process id once launch is confirmed.
    pub pid: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the spawn enters a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Spawn {
    /// Construct a new pending spawn with a time-ordered identifier.
    #[must_use]
    pub fn new(
        agent_id: String,
        parent_spawn_id: Option<String>,
        channel_id: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            agent_id,
            parent_spawn_id,
            channel_id,
            session_id,
            status: SpawnStatus::Pending,
            pid: None,
            created_at: Utc::now().trunc_subsecs(6),
            ended_at: None,
        }
    }

    /// Correlation marker embedded in the worker's input context.
    #[must_use]
    pub fn marker(&self) -> &str {
        marker_for(&self.id)
    }
}

/// Derive the correlation marker for a spawn id.
#[must_use]
pub fn marker_for(spawn_id: &str) -> &str {
    let start = spawn_id
        .char_indices()
        .rev()
        .nth(MARKER_LEN - 1)
        .map_or(0, |(idx, _)| idx);
    &spawn_id[start..]
}

/// Filters accepted by the ledger's listing query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnFilter {
    /// Restrict to one agent (resolved agent id).
    pub agent_id: Option<String>,
    /// Restrict to one correlation channel.
    pub channel_id: Option<String>,
    /// Restrict to direct children of a spawn.
    pub parent_spawn_id: Option<String>,
    /// Match any of these statuses; empty means all.
    pub statuses: Vec<SpawnStatus>,
    /// Maximum rows returned.
    pub limit: Option<u32>,
}
