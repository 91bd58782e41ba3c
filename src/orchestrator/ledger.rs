//! Spawn ledger: the state machine over spawn rows.
//!
//! `pending -> running -> {completed, failed, timeout, killed}`. Terminal
//! statuses are absorbing; writes against a `killed` spawn are ignored
//! silently, writes against any other terminal spawn are ignored with a
//! warning. Each transition into a terminal status submits exactly one
//! finalization task.

use std::collections::{HashSet, VecDeque};

use chrono::{SubsecRound, Utc};
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::models::spawn::{Spawn, SpawnFilter, SpawnStatus};
use crate::persistence::spawn_repo::SpawnRepo;
use crate::{AppError, Result};

use super::finalizer::FinalizerHandle;
use super::process;
use super::registry::AgentRegistry;

/// Rows fetched when resolving an id prefix; two is enough to detect ambiguity.
const PREFIX_PROBE: u32 = 2;

/// Compare-and-set attempts; status can advance at most twice, so a third
/// read always observes a settled row.
const CAS_ATTEMPTS: usize = 3;

/// Durable record of every spawn and its transitions.
#[derive(Clone)]
pub struct SpawnLedger {
    spawns: SpawnRepo,
    registry: AgentRegistry,
    max_depth: usize,
    lineage_limit: usize,
    finalizer: Option<FinalizerHandle>,
}

impl SpawnLedger {
    /// Create a ledger using the depth limits from `config`.
    #[must_use]
    pub fn new(spawns: SpawnRepo, registry: AgentRegistry, config: &GlobalConfig) -> Self {
        Self {
            spawns,
            registry,
            max_depth: usize::try_from(config.max_spawn_depth).unwrap_or(usize::MAX),
            lineage_limit: config.lineage_limit(),
            finalizer: None,
        }
    }

    /// Submit terminal transitions to `finalizer`.
    #[must_use]
    pub fn with_finalizer(mut self, finalizer: FinalizerHandle) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Underlying repository.
    #[must_use]
    pub fn repo(&self) -> &SpawnRepo {
        &self.spawns
    }

    /// Create a `pending` spawn for an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` if the agent is unknown or archived,
    /// the parent does not exist, or the parent is already at the maximum
    /// depth. Returns `AppError::Corruption` if the parent's lineage is broken.
    pub async fn create(
        &self,
        agent: &str,
        parent_spawn_id: Option<&str>,
        channel_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Spawn> {
        let agent = self.registry.get(agent).await.map_err(into_precondition)?;
        if agent.archived {
            return Err(AppError::Precondition(format!(
                "agent {} is archived",
                agent.identity
            )));
        }

        let parent = match parent_spawn_id {
            Some(id) => {
                let parent = self.get(id).await.map_err(into_precondition)?;
                let depth = self.depth(&parent.id).await?;
                if depth + 1 > self.max_depth {
                    return Err(AppError::Precondition(format!(
                        "spawn depth {} exceeds maximum {}",
                        depth + 1,
                        self.max_depth
                    )));
                }
                Some(parent.id)
            }
            None => None,
        };

        let spawn = Spawn::new(
            agent.id.clone(),
            parent,
            channel_id.map(ToOwned::to_owned),
            session_id.map(ToOwned::to_owned),
        );
        if !self.spawns.insert_with_agent_bump(&spawn).await? {
            return Err(AppError::Precondition(format!(
                "agent {} was archived or removed",
                agent.identity
            )));
        }
        self.registry.invalidate(&agent.id);

        info!(
            spawn_id = spawn.id,
            agent_id = spawn.agent_id,
            parent_spawn_id = spawn.parent_spawn_id.as_deref(),
            "spawn created"
        );
        Ok(spawn)
    }

    /// Resolve a spawn by exact id or unique id prefix.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if nothing matches, or
    /// `AppError::Ambiguous` if the prefix matches several spawns.
    pub async fn get(&self, id_or_prefix: &str) -> Result<Spawn> {
        if let Some(spawn) = self.spawns.get_by_id(id_or_prefix).await? {
            return Ok(spawn);
        }
        if id_or_prefix.is_empty() {
            return Err(AppError::NotFound("empty spawn id".into()));
        }
        let mut matches = self.spawns.find_by_prefix(id_or_prefix, PREFIX_PROBE).await?;
        match matches.len() {
            0 => Err(AppError::NotFound(format!("spawn {id_or_prefix} not found"))),
            1 => Ok(matches.remove(0)),
            _ => Err(AppError::Ambiguous(format!(
                "spawn prefix {id_or_prefix} matches several spawns"
            ))),
        }
    }

    /// Record the OS process id once launch is confirmed. Status is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist.
    pub async fn set_pid(&self, spawn_id: &str, pid: u32) -> Result<()> {
        if !self.spawns.set_pid(spawn_id, i64::from(pid)).await? {
            return Err(AppError::NotFound(format!("spawn {spawn_id} not found")));
        }
        debug!(spawn_id, pid, "pid recorded");
        Ok(())
    }

    /// Move a spawn to `status`, returning the row as it now stands.
    ///
    /// Writes against terminal spawns are ignored; the returned row shows the
    /// status that won.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist, or
    /// `AppError::Db` for a backwards transition such as `running -> pending`.
    pub async fn update_status(&self, spawn_id: &str, status: SpawnStatus) -> Result<Spawn> {
        let mut current = self.require(spawn_id).await?;
        for _ in 0..CAS_ATTEMPTS {
            if current.status == SpawnStatus::Killed {
                debug!(spawn_id, requested = %status, "spawn was killed; write ignored");
                return Ok(current);
            }
            if current.status == status {
                return Ok(current);
            }
            if current.status.is_terminal() {
                warn!(
                    spawn_id,
                    current = %current.status,
                    requested = %status,
                    "spawn already terminal; write ignored"
                );
                return Ok(current);
            }
            if !current.status.can_transition_to(status) {
                return Err(AppError::Db(format!(
                    "invalid spawn status transition {} -> {status}",
                    current.status
                )));
            }

            let ended_at = status.is_terminal().then(|| Utc::now().trunc_subsecs(6));
            if self
                .spawns
                .compare_and_set_status(spawn_id, current.status, status, ended_at)
                .await?
            {
                info!(spawn_id, from = %current.status, to = %status, "spawn status updated");
                current.status = status;
                current.ended_at = ended_at.or(current.ended_at);
                if status.is_terminal() {
                    self.finalize(spawn_id);
                }
                return Ok(current);
            }

            // Lost a race with another writer; re-read and decide again.
            current = self.require(spawn_id).await?;
        }
        Ok(current)
    }

    /// Signal the recorded pid and force the spawn to `killed`.
    ///
    /// Aborting an already-terminal spawn logs a warning and returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` / `AppError::Ambiguous` if the id does not
    /// resolve to one spawn.
    pub async fn abort(&self, id_or_prefix: &str) -> Result<Spawn> {
        let spawn = self.get(id_or_prefix).await?;
        if spawn.status.is_terminal() {
            warn!(spawn_id = spawn.id, status = %spawn.status, "abort ignored; spawn already terminal");
            return Ok(spawn);
        }
        if let Some(pid) = spawn.pid {
            let signalled = process::terminate(pid);
            info!(spawn_id = spawn.id, pid, signalled, "abort signal sent");
        }
        self.update_status(&spawn.id, SpawnStatus::Killed).await
    }

    /// Attach a session id unless one is already linked.
    ///
    /// Returns `true` if this call made the link.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist.
    pub async fn link_session(&self, spawn_id: &str, session_id: &str) -> Result<bool> {
        let spawn = self.require(spawn_id).await?;
        if let Some(existing) = &spawn.session_id {
            if existing != session_id {
                warn!(spawn_id, existing, session_id, "spawn already linked; keeping existing link");
            }
            return Ok(false);
        }
        let linked = self.spawns.set_session_if_unlinked(spawn_id, session_id).await?;
        if linked {
            info!(spawn_id, session_id, "session linked");
        }
        Ok(linked)
    }

    /// List spawns, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, filter: &SpawnFilter) -> Result<Vec<Spawn>> {
        self.spawns.list(filter).await
    }

    /// All `running` spawns, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_running(&self) -> Result<Vec<Spawn>> {
        self.spawns.list_running().await
    }

    /// Parent chain from `spawn_id` up to its root, starting with the spawn itself.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist, or
    /// `AppError::Corruption` on a cycle, a dangling parent, or a chain longer
    /// than the safety bound.
    pub async fn lineage(&self, spawn_id: &str) -> Result<Vec<Spawn>> {
        let mut current = self.require(spawn_id).await?;
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        loop {
            if !seen.insert(current.id.clone()) {
                return Err(AppError::Corruption(format!(
                    "lineage of {spawn_id} revisits {}",
                    current.id
                )));
            }
            if chain.len() >= self.lineage_limit {
                return Err(AppError::Corruption(format!(
                    "lineage of {spawn_id} exceeds {} generations",
                    self.lineage_limit
                )));
            }
            let parent_id = current.parent_spawn_id.clone();
            chain.push(current);
            let Some(parent_id) = parent_id else {
                return Ok(chain);
            };
            current = self.spawns.get_by_id(&parent_id).await?.ok_or_else(|| {
                AppError::Corruption(format!(
                    "lineage of {spawn_id} references missing spawn {parent_id}"
                ))
            })?;
        }
    }

    /// Generations between `spawn_id` and its root; a root has depth 0.
    ///
    /// # Errors
    ///
    /// See [`lineage`](Self::lineage).
    pub async fn depth(&self, spawn_id: &str) -> Result<usize> {
        Ok(self.lineage(spawn_id).await?.len() - 1)
    }

    /// Direct children, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist.
    pub async fn children(&self, spawn_id: &str) -> Result<Vec<Spawn>> {
        let spawn = self.require(spawn_id).await?;
        self.spawns.children(&spawn.id).await
    }

    /// Every spawn below `spawn_id`, breadth first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Corruption` on a cycle or a subtree deeper than the
    /// safety bound.
    pub async fn descendants(&self, spawn_id: &str) -> Result<Vec<Spawn>> {
        let root = self.require(spawn_id).await?;
        let mut seen = HashSet::from([root.id.clone()]);
        let mut queue = VecDeque::from([(root.id, 0usize)]);
        let mut found = Vec::new();
        while let Some((id, level)) = queue.pop_front() {
            if level >= self.lineage_limit {
                return Err(AppError::Corruption(format!(
                    "subtree of {spawn_id} exceeds {} generations",
                    self.lineage_limit
                )));
            }
            for child in self.spawns.children(&id).await? {
                if !seen.insert(child.id.clone()) {
                    return Err(AppError::Corruption(format!(
                        "subtree of {spawn_id} revisits {}",
                        child.id
                    )));
                }
                queue.push_back((child.id.clone(), level + 1));
                found.push(child);
            }
        }
        Ok(found)
    }

    async fn require(&self, spawn_id: &str) -> Result<Spawn> {
        self.spawns
            .get_by_id(spawn_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("spawn {spawn_id} not found")))
    }

    fn finalize(&self, spawn_id: &str) {
        match &self.finalizer {
            Some(finalizer) => {
                if !finalizer.submit(spawn_id) {
                    warn!(spawn_id, "session finalization not queued");
                }
            }
            None => debug!(spawn_id, "no finalizer attached; skipping session finalization"),
        }
    }
}

fn into_precondition(err: AppError) -> AppError {
    match err {
        AppError::NotFound(msg) | AppError::Ambiguous(msg) => AppError::Precondition(msg),
        other => other,
    }
}
