//! Failure detector: classifies `running` spawns that stopped making progress.
//!
//! The detector reads only the ledger, the OS process table and transcript
//! timestamps, so it reaches the same verdicts whether or not the
//! orchestrator that launched a spawn is still alive. Orphans (no pid, or a
//! pid that no longer exists) are moved to `failed`. Timeouts, stalls and
//! missing sessions are reported; only timeouts can be enforced, and only
//! when `enforce_timeouts` is set.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::DetectorConfig;
use crate::models::detection::{Detection, DetectionReport, FailureKind};
use crate::models::spawn::Spawn;
use crate::Result;

use super::ledger::SpawnLedger;
use super::process::{self, ProcessProbe};
use super::session_linker::SessionLinker;

/// Periodic health scan over the spawn ledger.
pub struct FailureDetector {
    ledger: SpawnLedger,
    linker: SessionLinker,
    probe: Arc<dyn ProcessProbe>,
    timeout: TimeDelta,
    stall: TimeDelta,
    enforce_timeouts: bool,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl FailureDetector {
    /// Create a detector with thresholds from `config`.
    #[must_use]
    pub fn new(
        ledger: SpawnLedger,
        linker: SessionLinker,
        probe: Arc<dyn ProcessProbe>,
        config: &DetectorConfig,
    ) -> Self {
        Self {
            ledger,
            linker,
            probe,
            timeout: to_delta(config.timeout()),
            stall: to_delta(config.stall()),
            enforce_timeouts: config.enforce_timeouts,
            audit: None,
        }
    }

    /// Record applied transitions in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Scan every `running` spawn now.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ledger cannot be read or written.
    pub async fn scan(&self) -> Result<DetectionReport> {
        self.scan_at(Utc::now()).await
    }

    /// Scan every `running` spawn as of `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ledger cannot be read or written.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<DetectionReport> {
        let running = self.ledger.list_running().await?;
        let mut report = DetectionReport {
            scanned: running.len(),
            detections: Vec::new(),
        };

        for spawn in running {
            let Some((kind, idle)) = self.classify(&spawn, now).await? else {
                continue;
            };
            let applied = self.apply(&spawn, kind).await?;
            let detection = Detection {
                spawn_id: spawn.id.clone(),
                agent_id: spawn.agent_id.clone(),
                kind,
                age_seconds: (now - spawn.created_at).num_seconds(),
                idle_seconds: idle.map(|d| d.num_seconds()),
                applied,
            };
            info!(
                spawn_id = detection.spawn_id,
                kind = %kind,
                age_seconds = detection.age_seconds,
                idle_seconds = detection.idle_seconds,
                applied,
                "spawn flagged"
            );
            report.detections.push(detection);
        }

        debug!(
            scanned = report.scanned,
            flagged = report.detections.len(),
            "failure scan complete"
        );
        Ok(report)
    }

    /// Classification and idle time, or `None` for a healthy spawn.
    async fn classify(
        &self,
        spawn: &Spawn,
        now: DateTime<Utc>,
    ) -> Result<Option<(FailureKind, Option<TimeDelta>)>> {
        let Some(pid) = spawn.pid else {
            return Ok(Some((FailureKind::NoPid, None)));
        };
        if !self.probe.is_alive(pid) {
            return Ok(Some((FailureKind::DeadProcess, None)));
        }

        let age = now - spawn.created_at;
        if age > self.timeout {
            return Ok(Some((FailureKind::Timeout, None)));
        }

        let session_id = match &spawn.session_id {
            Some(id) => Some(id.clone()),
            None => match self.linker.link(&spawn.id).await {
                Ok(linked) => linked,
                Err(err) => {
                    warn!(spawn_id = spawn.id, %err, "session link attempt failed");
                    None
                }
            },
        };

        let Some(session_id) = session_id else {
            return Ok((age > self.stall).then_some((FailureKind::NoSession, None)));
        };
        match self.linker.last_activity(&session_id).await? {
            Some(last) => {
                let idle = now - last;
                Ok((idle > self.stall).then_some((FailureKind::Stalled, Some(idle))))
            }
            None => Ok((age > self.stall).then_some((FailureKind::Stalled, None))),
        }
    }

    /// Enforce a classification where policy allows; returns whether the
    /// spawn now carries the enforced status.
    async fn apply(&self, spawn: &Spawn, kind: FailureKind) -> Result<bool> {
        let Some(target) = kind.enforced_status() else {
            return Ok(false);
        };
        let event = match kind {
            FailureKind::Timeout if self.enforce_timeouts => {
                if let Some(pid) = spawn.pid {
                    process::terminate(pid);
                }
                AuditEventType::TimeoutEnforced
            }
            FailureKind::Timeout => return Ok(false),
            _ => AuditEventType::OrphanFailed,
        };

        let updated = self.ledger.update_status(&spawn.id, target).await?;
        let applied = updated.status == target;
        if applied {
            if let Some(audit) = &self.audit {
                let entry = AuditEntry::new(event)
                    .with_spawn(spawn.id.clone())
                    .with_reason(kind.as_str().to_owned());
                if let Err(err) = audit.log_entry(entry) {
                    warn!(spawn_id = spawn.id, %err, "failed to write detector audit entry");
                }
            }
        } else {
            debug!(spawn_id = spawn.id, status = %updated.status, "spawn settled before enforcement");
        }
        Ok(applied)
    }
}

/// Run [`FailureDetector::scan`] every `interval` until `cancel` fires.
#[must_use]
pub fn spawn_detector_task(
    detector: Arc<FailureDetector>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("failure detector shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                match detector.scan().await {
                    Ok(report) if report.detections.is_empty() => {}
                    Ok(report) => {
                        let applied = report.applied().count();
                        info!(
                            scanned = report.scanned,
                            flagged = report.detections.len(),
                            applied,
                            "failure scan flagged spawns"
                        );
                    }
                    Err(err) => warn!(%err, "failure scan failed"),
                }
            }
        }
        .instrument(info_span!("failure_detector")),
    )
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

