//! Transcript files and the session index built from them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transcript file discovered in a provider directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFile {
    /// Provider that wrote the transcript.
    pub provider: String,
    /// Absolute path to the file.
    pub path: PathBuf,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
    /// Creation time, or modification time where the platform lacks it.
    pub created_at: DateTime<Utc>,
}

/// A transcript linked to a spawn, persisted in the `sessions` store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Provider-native transcript id.
    pub session_id: String,
    /// Spawn that produced the transcript.
    pub spawn_id: String,
    /// Provider label.
    pub provider: String,
    /// Transcript location.
    pub path: String,
    /// When the link was made.
    pub linked_at: DateTime<Utc>,
    /// Transcript size at last refresh.
    pub size_bytes: Option<i64>,
    /// Transcript modification time at last refresh.
    pub modified_at: Option<DateTime<Utc>>,
    /// Set once the owning spawn reached a terminal status and was indexed.
    pub finalized_at: Option<DateTime<Utc>>,
}
