//! Composition root: opens the stores and wires every component once.

use std::sync::Arc;

use tracing::info;

use crate::audit::{AuditLogger, JsonlAuditWriter};
use crate::config::GlobalConfig;
use crate::orchestrator::failure_detector::FailureDetector;
use crate::orchestrator::finalizer::Finalizer;
use crate::orchestrator::ledger::SpawnLedger;
use crate::orchestrator::process::{OsProcessProbe, ProcessProbe};
use crate::orchestrator::registry::AgentRegistry;
use crate::orchestrator::session_linker::{FsTranscriptSource, SessionLinker, TranscriptSource};
use crate::orchestrator::spawner::Orchestrator;
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::schema::{LEDGER_STORE, SESSIONS_STORE};
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::spawn_repo::SpawnRepo;
use crate::persistence::{StorageCatalog, Store};
use crate::Result;

/// Prefix of the finalizer's daily error log.
const FINALIZE_LOG_PREFIX: &str = "finalize";
/// Prefix of the detector's daily audit log.
const DETECTOR_LOG_PREFIX: &str = "detector";

/// Every supervision component, wired against one data directory.
pub struct Warden {
    config: Arc<GlobalConfig>,
    catalog: StorageCatalog,
    stores: Vec<Store>,
    registry: AgentRegistry,
    ledger: SpawnLedger,
    linker: SessionLinker,
    detector: Arc<FailureDetector>,
    orchestrator: Orchestrator,
    finalizer: Finalizer,
}

impl Warden {
    /// Open the stores under `config.data_dir` with OS process probing and
    /// filesystem transcripts.
    ///
    /// # Errors
    ///
    /// Returns any storage or migration error from opening the stores.
    pub async fn open(config: GlobalConfig) -> Result<Self> {
        let source = Arc::new(FsTranscriptSource::new(config.linker.marker_scan_lines)?);
        Self::open_with(config, Arc::new(OsProcessProbe), source).await
    }

    /// Open with explicit liveness and transcript collaborators.
    ///
    /// # Errors
    ///
    /// Returns any storage or migration error from opening the stores.
    pub async fn open_with(
        config: GlobalConfig,
        probe: Arc<dyn ProcessProbe>,
        source: Arc<dyn TranscriptSource>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let catalog = StorageCatalog::standard(config.data_dir.clone(), config.storage.clone());
        let ledger_store = catalog.open(LEDGER_STORE).await?;
        let sessions_store = catalog.open(SESSIONS_STORE).await?;

        let spawns = SpawnRepo::new(ledger_store.clone());
        let registry = AgentRegistry::new(
            AgentRepo::new(ledger_store.clone()),
            config.registry_cache_capacity,
        );
        let linker = SessionLinker::new(
            spawns.clone(),
            SessionRepo::new(sessions_store.clone()),
            source,
            config.transcripts.clone(),
            &config.linker,
        );

        let finalize_log: Arc<dyn AuditLogger> =
            Arc::new(JsonlAuditWriter::new(config.log_dir(), FINALIZE_LOG_PREFIX)?);
        let finalizer = Finalizer::start(linker.clone(), &config.finalizer, finalize_log);

        let ledger = SpawnLedger::new(spawns, registry.clone(), &config)
            .with_finalizer(finalizer.handle());
        let detector_log: Arc<dyn AuditLogger> =
            Arc::new(JsonlAuditWriter::new(config.log_dir(), DETECTOR_LOG_PREFIX)?);
        let detector = Arc::new(
            FailureDetector::new(ledger.clone(), linker.clone(), probe, &config.detector)
                .with_audit(detector_log),
        );
        let orchestrator = Orchestrator::new(registry.clone(), ledger.clone(), Arc::clone(&config));

        info!(data_dir = %config.data_dir.display(), "warden ready");
        Ok(Self {
            config,
            catalog,
            stores: vec![ledger_store, sessions_store],
            registry,
            ledger,
            linker,
            detector,
            orchestrator,
            finalizer,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// Store catalog for the data directory.
    #[must_use]
    pub fn catalog(&self) -> &StorageCatalog {
        &self.catalog
    }

    /// Agent registry.
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Spawn ledger.
    #[must_use]
    pub fn ledger(&self) -> &SpawnLedger {
        &self.ledger
    }

    /// Session linker.
    #[must_use]
    pub fn linker(&self) -> &SessionLinker {
        &self.linker
    }

    /// Shared failure detector, for [`spawn_detector_task`](crate::orchestrator::failure_detector::spawn_detector_task).
    #[must_use]
    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    /// Launch orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Drain pending finalizations and close the stores.
    pub async fn shutdown(self) {
        self.finalizer.shutdown().await;
        for store in &self.stores {
            store.close().await;
        }
        info!("warden shut down");
    }
}
