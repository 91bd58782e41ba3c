//! Explicit registry of store names and their migrations.
//!
//! Built once at startup and handed to every component that needs a store.

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::{AppError, Result};

use super::db::{self, Store};
use super::migrations::Migration;
use super::schema::{LEDGER_MIGRATIONS, LEDGER_STORE, SESSIONS_STORE, SESSION_MIGRATIONS};

#[derive(Debug, Clone)]
struct StoreEntry {
    name: String,
    migrations: &'static [Migration],
}

/// Named stores living under one data directory.
#[derive(Debug, Clone)]
pub struct StorageCatalog {
    data_dir: PathBuf,
    storage: StorageConfig,
    stores: Vec<StoreEntry>,
}

impl StorageCatalog {
    /// Empty catalog rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, storage: StorageConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            storage,
            stores: Vec::new(),
        }
    }

    /// Catalog with the `ledger` and `sessions` stores registered.
    #[must_use]
    pub fn standard(data_dir: impl Into<PathBuf>, storage: StorageConfig) -> Self {
        Self::new(data_dir, storage)
            .register(LEDGER_STORE, LEDGER_MIGRATIONS)
            .register(SESSIONS_STORE, SESSION_MIGRATIONS)
    }

    /// Register a store; a later registration of the same name replaces it.
    #[must_use]
    pub fn register(mut self, name: &str, migrations: &'static [Migration]) -> Self {
        self.stores.retain(|entry| entry.name != name);
        self.stores.push(StoreEntry {
            name: name.to_owned(),
            migrations,
        });
        self
    }

    /// Directory holding the store files.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Registered store names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.iter().map(|entry| entry.name.as_str())
    }

    /// Backing file for a store.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.db"))
    }

    /// Open a registered store, applying its migrations.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unregistered name, or any error from
    /// [`Store::open`].
    pub async fn open(&self, name: &str) -> Result<Store> {
        let entry = self
            .stores
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| AppError::Config(format!("unknown store: {name}")))?;
        Store::open(name, &self.path_for(name), entry.migrations, &self.storage).await
    }

    /// Checkpoint every store in the data directory.
    ///
    /// # Errors
    ///
    /// See [`db::checkpoint_dir`].
    pub async fn checkpoint(&self) -> Result<Vec<PathBuf>> {
        db::checkpoint_dir(&self.data_dir).await
    }
}
