//! Agent registry with a bounded, explicitly invalidated lookup cache.
//!
//! The cache is per-process. Writes made by other processes become visible
//! once the entry is evicted or invalidated locally.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tracing::{debug, info};

use crate::models::agent::Agent;
use crate::persistence::agent_repo::AgentRepo;
use crate::{AppError, Result};

/// Least-recently-used agents keyed by id, with an identity alias index.
///
/// A zero capacity disables caching entirely.
#[derive(Debug)]
struct LookupCache {
    by_id: Option<LruCache<String, Agent>>,
    ids: HashMap<String, String>,
}

impl LookupCache {
    fn new(capacity: usize) -> Self {
        Self {
            by_id: NonZeroUsize::new(capacity).map(LruCache::new),
            ids: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Agent> {
        let cache = self.by_id.as_mut()?;
        let id = self.ids.get(key).map_or(key, String::as_str);
        cache.get(id).cloned()
    }

    fn insert(&mut self, agent: &Agent) {
        let Some(cache) = self.by_id.as_mut() else {
            return;
        };
        if let Some((evicted_id, evicted)) = cache.push(agent.id.clone(), agent.clone()) {
            if evicted_id != agent.id {
                self.ids.remove(&evicted.identity);
            }
        }
        self.ids.insert(agent.identity.clone(), agent.id.clone());
    }

    /// Drop an agent by id or identity.
    fn remove(&mut self, key: &str) {
        let Some(cache) = self.by_id.as_mut() else {
            return;
        };
        let id = self.ids.get(key).cloned().unwrap_or_else(|| key.to_owned());
        if let Some(agent) = cache.pop(&id) {
            self.ids.remove(&agent.identity);
        }
    }

    fn len(&self) -> usize {
        self.by_id.as_ref().map_or(0, LruCache::len)
    }
}

/// Durable agent identities with cached name resolution.
#[derive(Clone)]
pub struct AgentRegistry {
    repo: AgentRepo,
    cache: Arc<Mutex<LookupCache>>,
}

impl AgentRegistry {
    /// Create a registry caching up to `capacity` agents.
    #[must_use]
    pub fn new(repo: AgentRepo, capacity: usize) -> Self {
        Self {
            repo,
            cache: Arc::new(Mutex::new(LookupCache::new(capacity))),
        }
    }

    /// Register an agent, or return the existing live agent with that identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` for an empty identity or one that
    /// belongs to an archived agent, or `AppError::Db` on persistence failure.
    pub async fn register(&self, identity: &str, config_ref: Option<&str>) -> Result<Agent> {
        let identity = identity.trim();
        if identity.is_empty() || identity.chars().any(char::is_whitespace) {
            return Err(AppError::Precondition(format!(
                "invalid agent identity: {identity:?}"
            )));
        }

        if let Some(existing) = self.repo.get_by_identity(identity).await? {
            return self.existing_registration(existing);
        }

        let agent = Agent::new(identity.to_owned(), config_ref.map(ToOwned::to_owned));
        match self.repo.create(&agent).await {
            Ok(created) => {
                info!(agent_id = created.id, identity, "agent registered");
                self.invalidate(&created.id);
                Ok(created)
            }
            Err(err) => {
                // Another process may have registered the same identity.
                match self.repo.get_by_identity(identity).await? {
                    Some(existing) => self.existing_registration(existing),
                    None => Err(err),
                }
            }
        }
    }

    fn existing_registration(&self, existing: Agent) -> Result<Agent> {
        if existing.archived {
            return Err(AppError::Precondition(format!(
                "agent {} is archived",
                existing.identity
            )));
        }
        debug!(agent_id = existing.id, "agent already registered");
        self.remember(&existing);
        Ok(existing)
    }

    /// Resolve an agent by identity or id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no agent matches.
    pub async fn get(&self, identity_or_id: &str) -> Result<Agent> {
        self.find(identity_or_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("agent {identity_or_id} not found")))
    }

    /// Resolve an agent by identity or id, returning `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lookup query fails.
    pub async fn find(&self, identity_or_id: &str) -> Result<Option<Agent>> {
        let cached = self.lock().get(identity_or_id);
        if cached.is_some() {
            return Ok(cached);
        }

        let agent = match self.repo.get_by_identity(identity_or_id).await? {
            Some(agent) => Some(agent),
            None => self.repo.get_by_id(identity_or_id).await?,
        };
        if let Some(agent) = &agent {
            self.remember(agent);
        }
        Ok(agent)
    }

    /// List agents ordered by identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, include_archived: bool) -> Result<Vec<Agent>> {
        self.repo.list(include_archived).await
    }

    /// Soft-delete an agent. Archiving twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no agent matches.
    pub async fn archive(&self, identity_or_id: &str) -> Result<Agent> {
        let agent = self.get(identity_or_id).await?;
        self.repo.set_archived(&agent.id).await?;
        self.invalidate(&agent.id);
        info!(agent_id = agent.id, identity = agent.identity, "agent archived");
        self.get(&agent.id).await
    }

    /// Drop a cached entry after a local write.
    pub fn invalidate(&self, identity_or_id: &str) {
        self.lock().remove(identity_or_id);
    }

    /// Number of agents currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn remember(&self, agent: &Agent) {
        self.lock().insert(agent);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LookupCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
