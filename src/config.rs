//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Storage engine tuning: lock retry budget and `SQLite` busy handling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Attempts made on a locked store before surfacing a fatal error.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    /// Backoff unit; attempt `n` sleeps `n * lock_backoff_ms`.
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
    /// `SQLite` busy handler timeout applied to each connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Operations slower than this are logged as contention warnings.
    #[serde(default = "default_contention_warn_ms")]
    pub contention_warn_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            contention_warn_ms: default_contention_warn_ms(),
        }
    }
}

fn default_lock_retries() -> u32 {
    5
}

fn default_lock_backoff_ms() -> u64 {
    50
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_contention_warn_ms() -> u64 {
    100
}

/// Failure detector thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DetectorConfig {
    /// Running spawns older than this are timeout candidates.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Transcript idle time (or session-less age) that marks a stall candidate.
    #[serde(default = "default_stall_seconds")]
    pub stall_seconds: u64,
    /// Interval between scans for the background watch task.
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    /// Opt-in: terminate timeout candidates instead of only reporting them.
    #[serde(default)]
    pub enforce_timeouts: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            stall_seconds: default_stall_seconds(),
            scan_interval_seconds: default_scan_interval_seconds(),
            enforce_timeouts: false,
        }
    }
}

impl DetectorConfig {
    /// Timeout threshold as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Stall threshold as a [`Duration`].
    #[must_use]
    pub fn stall(&self) -> Duration {
        Duration::from_secs(self.stall_seconds)
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_stall_seconds() -> u64 {
    180
}

fn default_scan_interval_seconds() -> u64 {
    30
}

/// Session linker tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LinkerConfig {
    /// Lines read from the head of a transcript when looking for a marker.
    #[serde(default = "default_marker_scan_lines")]
    pub marker_scan_lines: usize,
    /// Maximum creation-time distance accepted by the timestamp fallback.
    #[serde(default = "default_timestamp_tolerance_ms")]
    pub timestamp_tolerance_ms: u64,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            marker_scan_lines: default_marker_scan_lines(),
            timestamp_tolerance_ms: default_timestamp_tolerance_ms(),
        }
    }
}

fn default_marker_scan_lines() -> usize {
    50
}

fn default_timestamp_tolerance_ms() -> u64 {
    1000
}

/// Session finalization worker pool.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FinalizerConfig {
    /// Number of worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue length; tasks beyond it are dropped with a warning.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

/// Rules for sanitizing the worker process environment.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EnvironmentConfig {
    /// Variables removed verbatim.
    #[serde(default = "default_strip_vars")]
    pub strip_vars: Vec<String>,
    /// Variables removed when their name starts with one of these prefixes.
    #[serde(default = "default_strip_prefixes")]
    pub strip_prefixes: Vec<String>,
    /// Variables whose values name virtual-environment roots; `PATH`
    /// entries under those roots are dropped.
    #[serde(default = "default_venv_markers")]
    pub venv_markers: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            strip_vars: default_strip_vars(),
            strip_prefixes: default_strip_prefixes(),
            venv_markers: default_venv_markers(),
        }
    }
}

fn default_strip_vars() -> Vec<String> {
    [
        "VIRTUAL_ENV",
        "VIRTUAL_ENV_PROMPT",
        "CONDA_PREFIX",
        "CONDA_DEFAULT_ENV",
        "PYTHONHOME",
        "PYTHONPATH",
        "CARGO_MANIFEST_DIR",
        "CARGO_PKG_NAME",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_strip_prefixes() -> Vec<String> {
    vec!["AGENT_WARDEN_".into(), "CONDA_PREFIX_".into()]
}

fn default_venv_markers() -> Vec<String> {
    vec!["VIRTUAL_ENV".into(), "CONDA_PREFIX".into()]
}

/// A directory of transcripts written by one provider.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptDir {
    /// Provider label (e.g., `claude`, `codex`).
    pub provider: String,
    /// Directory searched for transcripts.
    pub dir: PathBuf,
    /// Glob relative to `dir`.
    #[serde(default = "default_transcript_pattern")]
    pub pattern: String,
}

fn default_transcript_pattern() -> String {
    "**/*.jsonl".into()
}

/// How to launch a worker for an agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchProfile {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed before any context is delivered.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the supervisor's current directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Identity context delivered on stdin ahead of the task.
    #[serde(default)]
    pub context: Option<String>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the store files and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Deepest permitted spawn tree (root is depth 0).
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: u32,
    /// Lineage walks longer than `max_spawn_depth * factor` are corruption.
    #[serde(default = "default_lineage_safety_factor")]
    pub lineage_safety_factor: u32,
    /// Entries kept in the agent registry's lookup cache.
    #[serde(default = "default_registry_cache_capacity")]
    pub registry_cache_capacity: usize,
    /// Storage engine tuning.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Failure detector thresholds.
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Session linker tuning.
    #[serde(default)]
    pub linker: LinkerConfig,
    /// Finalization worker pool.
    #[serde(default)]
    pub finalizer: FinalizerConfig,
    /// Worker environment sanitization.
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Transcript directories scanned by the session linker.
    #[serde(default)]
    pub transcripts: Vec<TranscriptDir>,
    /// Launch profiles keyed by name.
    #[serde(default)]
    pub profiles: HashMap<String, LaunchProfile>,
    /// File this configuration was loaded from; passed on to workers so
    /// nested launches read the same profiles.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".agent-warden")
}

fn default_max_spawn_depth() -> u32 {
    5
}

fn default_lineage_safety_factor() -> u32 {
    4
}

fn default_registry_cache_capacity() -> usize {
    64
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.source_path = Some(std::path::absolute(path).unwrap_or_else(|_| path.to_owned()));
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory for per-spawn output logs and the finalizer error log.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Upper bound on any lineage walk before it is treated as corruption.
    ///
    /// Always admits a full chain of `max_spawn_depth + 1` spawns, whatever
    /// the safety factor.
    #[must_use]
    pub fn lineage_limit(&self) -> usize {
        let limit = self
            .max_spawn_depth
            .saturating_mul(self.lineage_safety_factor)
            .max(self.max_spawn_depth.saturating_add(1));
        usize::try_from(limit).unwrap_or(usize::MAX)
    }

    /// Resolve the launch profile for an agent.
    ///
    /// Looks up `config_ref` first, then a profile named after the identity,
    /// then `default`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` if no profile matches.
    pub fn resolve_profile(&self, identity: &str, config_ref: Option<&str>) -> Result<&LaunchProfile> {
        if let Some(name) = config_ref {
            return self.profiles.get(name).ok_or_else(|| {
                AppError::Precondition(format!(
                    "agent {identity} references unknown profile {name}"
                ))
            });
        }
        self.profiles
            .get(identity)
            .or_else(|| self.profiles.get("default"))
            .ok_or_else(|| AppError::Precondition(format!("no launch profile for agent {identity}")))
    }

    fn validate(&self) -> Result<()> {
        if self.max_spawn_depth == 0 {
            return Err(AppError::Config(
                "max_spawn_depth must be greater than zero".into(),
            ));
        }
        if self.lineage_safety_factor == 0 {
            return Err(AppError::Config(
                "lineage_safety_factor must be greater than zero".into(),
            ));
        }
        if self.storage.lock_retries == 0 {
            return Err(AppError::Config(
                "storage.lock_retries must be greater than zero".into(),
            ));
        }
        if self.detector.stall_seconds >= self.detector.timeout_seconds {
            return Err(AppError::Config(
                "detector.stall_seconds must be shorter than detector.timeout_seconds".into(),
            ));
        }
        if self.finalizer.workers == 0 || self.finalizer.queue_capacity == 0 {
            return Err(AppError::Config(
                "finalizer.workers and finalizer.queue_capacity must be greater than zero".into(),
            ));
        }
        for (name, profile) in &self.profiles {
            if profile.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "profile {name} has an empty command"
                )));
            }
        }
        Ok(())
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_spawn_depth: default_max_spawn_depth(),
            lineage_safety_factor: default_lineage_safety_factor(),
            registry_cache_capacity: default_registry_cache_capacity(),
            storage: StorageConfig::default(),
            detector: DetectorConfig::default(),
            linker: LinkerConfig::default(),
            finalizer: FinalizerConfig::default(),
            environment: EnvironmentConfig::default(),
            transcripts: Vec::new(),
            profiles: HashMap::new(),
            source_path: None,
        }
    }
}
