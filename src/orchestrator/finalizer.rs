//! Session finalization worker pool.
//!
//! Terminal ledger transitions hand a [`FinalizeTask`] to a bounded queue
//! served by a few tokio workers. Finalization is best-effort: failures are
//! logged and written to the error sink, never surfaced to the ledger write
//! that triggered them.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::FinalizerConfig;

use super::session_linker::{FinalizeOutcome, SessionLinker};

/// One queued finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeTask {
    /// Spawn that reached a terminal status.
    pub spawn_id: String,
}

/// Cloneable submission side of the pool.
#[derive(Clone)]
pub struct FinalizerHandle {
    tx: mpsc::Sender<FinalizeTask>,
    cancel: CancellationToken,
}

impl FinalizerHandle {
    /// Queue a finalization. Returns `false` if the queue is full or the pool
    /// has shut down.
    pub fn submit(&self, spawn_id: &str) -> bool {
        if self.cancel.is_cancelled() {
            warn!(spawn_id, "finalizer stopped; task dropped");
            return false;
        }
        match self.tx.try_send(FinalizeTask {
            spawn_id: spawn_id.to_owned(),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(spawn_id, "finalizer queue full; task dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(spawn_id, "finalizer queue closed; task dropped");
                false
            }
        }
    }
}

/// Running worker pool.
pub struct Finalizer {
    handle: FinalizerHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Finalizer {
    /// Start `config.workers` workers sharing one bounded queue.
    #[must_use]
    pub fn start(
        linker: SessionLinker,
        config: &FinalizerConfig,
        sink: Arc<dyn AuditLogger>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let linker = linker.clone();
                let sink = Arc::clone(&sink);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(worker, &rx, &linker, sink.as_ref(), &cancel).await;
                })
            })
            .collect();

        info!(workers = worker_count, capacity, "finalizer started");
        Self {
            handle: FinalizerHandle { tx, cancel },
            workers,
        }
    }

    /// Submission handle for the ledger.
    #[must_use]
    pub fn handle(&self) -> FinalizerHandle {
        self.handle.clone()
    }

    /// Stop accepting tasks, drain what is queued, and wait for the workers.
    pub async fn shutdown(self) {
        self.handle.cancel.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(%err, "finalizer worker panicked");
            }
        }
        info!("finalizer stopped");
    }
}

async fn run_worker(
    worker: usize,
    rx: &Mutex<mpsc::Receiver<FinalizeTask>>,
    linker: &SessionLinker,
    sink: &dyn AuditLogger,
    cancel: &CancellationToken,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                task = rx.recv() => task,
                () = cancel.cancelled() => rx.try_recv().ok(),
            }
        };
        let Some(task) = task else {
            debug!(worker, "finalizer worker exiting");
            break;
        };
        finalize_one(linker, sink, &task).await;
    }
}

async fn finalize_one(linker: &SessionLinker, sink: &dyn AuditLogger, task: &FinalizeTask) {
    let spawn_id = task.spawn_id.as_str();
    match linker.finalize(spawn_id).await {
        Ok(FinalizeOutcome::Finalized { session_id }) => {
            debug!(spawn_id, session_id, "session indexed");
        }
        Ok(FinalizeOutcome::Unlinked) => {
            debug!(spawn_id, "no session to finalize");
        }
        Ok(FinalizeOutcome::Missing { session_id }) => {
            warn!(spawn_id, session_id, "linked transcript is missing");
            record(
                sink,
                AuditEntry::new(AuditEventType::FinalizeFailed)
                    .with_spawn(spawn_id.to_owned())
                    .with_session(session_id)
                    .with_error("transcript missing".into()),
            );
        }
        Err(err) => {
            warn!(spawn_id, %err, "session finalization failed");
            record(
                sink,
                AuditEntry::new(AuditEventType::FinalizeFailed)
                    .with_spawn(spawn_id.to_owned())
                    .with_error(err.to_string()),
            );
        }
    }
}

fn record(sink: &dyn AuditLogger, entry: AuditEntry) {
    if let Err(err) = sink.log_entry(entry) {
        warn!(%err, "failed to write finalizer error log");
    }
}
