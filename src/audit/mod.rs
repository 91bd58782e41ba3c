//! Structured audit logging for supervision side effects.
//!
//! Provides the [`AuditLogger`] trait and associated types. The primary
//! implementation, [`JsonlAuditWriter`], appends JSONL records to
//! daily-rotating files in `<data_dir>/logs/`. The finalizer pool uses it as
//! its error sink; the failure detector records every transition it applies.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type classification for audit log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Session finalization failed after a terminal transition.
    FinalizeFailed,
    /// Detector moved an orphaned spawn to `failed`.
    OrphanFailed,
    /// Detector enforced a timeout (opt-in policy).
    TimeoutEnforced,
}

/// A structured record of a supervision event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Spawn the event concerns.
    pub spawn_id: Option<String>,
    /// Linked session, when known.
    pub session_id: Option<String>,
    /// Detector classification or other short label.
    pub reason: Option<String>,
    /// Error text for failure events.
    pub error: Option<String>,
}

impl AuditEntry {
    /// Construct a minimal audit entry for the given event type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            spawn_id: None,
            session_id: None,
            reason: None,
            error: None,
        }
    }

    /// Set the spawn identifier for this entry.
    #[must_use]
    pub fn with_spawn(mut self, spawn_id: String) -> Self {
        self.spawn_id = Some(spawn_id);
        self
    }

    /// Set the session identifier for this entry.
    #[must_use]
    pub fn with_session(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the reason label for this entry.
    #[must_use]
    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Set the error text for this entry.
    #[must_use]
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Writes structured audit entries to a persistent sink.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;
