//! Failure detector classifications.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::spawn::SpawnStatus;

/// Why a running spawn was flagged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Launch never confirmed; no pid was recorded.
    NoPid,
    /// The recorded pid no longer exists.
    DeadProcess,
    /// Running longer than the timeout threshold.
    Timeout,
    /// Linked transcript has not been written for the stall threshold.
    Stalled,
    /// No transcript linked although the stall threshold has passed.
    NoSession,
}

impl FailureKind {
    /// Whether liveness proves the spawn dead, so the detector may apply it.
    #[must_use]
    pub fn is_orphan(self) -> bool {
        matches!(self, Self::NoPid | Self::DeadProcess)
    }

    /// Status the spawn moves to when this classification is enforced.
    #[must_use]
    pub fn enforced_status(self) -> Option<SpawnStatus> {
        match self {
            Self::NoPid | Self::DeadProcess => Some(SpawnStatus::Failed),
            Self::Timeout => Some(SpawnStatus::Timeout),
            Self::Stalled | Self::NoSession => None,
        }
    }

    /// Report label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPid => "no_pid",
            Self::DeadProcess => "dead_process",
            Self::Timeout => "timeout",
            Self::Stalled => "stalled",
            Self::NoSession => "no_session",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flagged spawn from a detector scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Detection {
    /// Flagged spawn.
    pub spawn_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Classification.
    pub kind: FailureKind,
    /// Seconds since the spawn was created.
    pub age_seconds: i64,
    /// Seconds since the transcript was last written, if linked.
    pub idle_seconds: Option<i64>,
    /// Whether the detector moved the spawn to a terminal status.
    pub applied: bool,
}

/// Result of one detector scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionReport {
    /// Running spawns inspected.
    pub scanned: usize,
    /// Flagged spawns, in scan order.
    pub detections: Vec<Detection>,
}

impl DetectionReport {
    /// Detections the scan enforced.
    pub fn applied(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(|d| d.applied)
    }

    /// Detections left for an operator to act on.
    pub fn candidates(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(|d| !d.applied)
    }

    /// Find the detection for a spawn.
    #[must_use]
    pub fn for_spawn(&self, spawn_id: &str) -> Option<&Detection> {
        self.detections.iter().find(|d| d.spawn_id == spawn_id)
    }
}
