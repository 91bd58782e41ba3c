//! Session linker: matches a spawn to the transcript its worker wrote.
//!
//! Workers choose their own transcript ids, so the link is recovered after
//! the fact. A transcript whose first lines echo the spawn's correlation
//! marker wins; otherwise the transcript created nearest to the spawn, within
//! a small tolerance window, is taken. An existing link is never replaced.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{LinkerConfig, TranscriptDir};
use crate::models::spawn::Spawn;
use crate::models::transcript::{SessionRecord, TranscriptFile};
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::spawn_repo::SpawnRepo;
use crate::{AppError, Result};

/// Render the marker line embedded in a worker's input context.
#[must_use]
pub fn format_marker(marker: &str) -> String {
    format!("[warden:{marker}]")
}

/// Supplier of transcript files for one or more providers.
///
/// Implementations perform blocking I/O; the linker calls them from a
/// blocking task.
pub trait TranscriptSource: Send + Sync {
    /// Transcript files under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory pattern is invalid or unreadable.
    fn list_transcript_files(&self, dir: &TranscriptDir) -> Result<Vec<TranscriptFile>>;

    /// The correlation marker found in the first lines of `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read.
    fn read_marker(&self, path: &Path) -> Result<Option<String>>;

    /// The provider's own id for the transcript at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no id can be derived.
    fn native_id(&self, path: &Path) -> Result<String>;
}

/// Filesystem-backed transcript source.
#[derive(Debug, Clone)]
pub struct FsTranscriptSource {
    scan_lines: usize,
    marker: Regex,
}

impl FsTranscriptSource {
    /// Create a source that reads at most `scan_lines` lines per file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the marker pattern fails to compile.
    pub fn new(scan_lines: usize) -> Result<Self> {
        let marker = Regex::new(r"\[warden:([0-9A-Za-z-]{8})\]")
            .map_err(|err| AppError::Config(format!("invalid marker pattern: {err}")))?;
        Ok(Self { scan_lines, marker })
    }
}

impl TranscriptSource for FsTranscriptSource {
    fn list_transcript_files(&self, dir: &TranscriptDir) -> Result<Vec<TranscriptFile>> {
        let pattern = dir.dir.join(&dir.pattern);
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern).map_err(|err| {
            AppError::Config(format!("invalid transcript pattern {pattern}: {err}"))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    debug!(%err, "skipping unreadable transcript entry");
                    continue;
                }
            };
            let Ok(meta) = path.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified_at: DateTime<Utc> = meta.modified()?.into();
            let created_at = meta.created().map_or(modified_at, DateTime::<Utc>::from);
            files.push(TranscriptFile {
                provider: dir.provider.clone(),
                path,
                modified_at,
                created_at,
            });
        }
        Ok(files)
    }

    fn read_marker(&self, path: &Path) -> Result<Option<String>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut buf = Vec::new();
        for _ in 0..self.scan_lines {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            if let Some(found) = self.marker.captures(&line).and_then(|c| c.get(1)) {
                return Ok(Some(found.as_str().to_owned()));
            }
        }
        Ok(None)
    }

    fn native_id(&self, path: &Path) -> Result<String> {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                AppError::NotFound(format!("no transcript id for {}", path.display()))
            })
    }
}

/// A transcript considered for linking.
#[derive(Debug, Clone)]
struct Candidate {
    file: TranscriptFile,
    session_id: String,
    marker: Option<String>,
}

/// Result of finalizing a spawn's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No transcript could be linked.
    Unlinked,
    /// Linked, but the transcript file is gone.
    Missing {
        /// Linked session.
        session_id: String,
    },
    /// Index row refreshed.
    Finalized {
        /// Linked session.
        session_id: String,
    },
}

/// Links spawns to transcripts and maintains the session index.
#[derive(Clone)]
pub struct SessionLinker {
    spawns: SpawnRepo,
    sessions: SessionRepo,
    source: Arc<dyn TranscriptSource>,
    dirs: Arc<[TranscriptDir]>,
    tolerance: Duration,
}

impl SessionLinker {
    /// Create a linker over the configured transcript directories.
    #[must_use]
    pub fn new(
        spawns: SpawnRepo,
        sessions: SessionRepo,
        source: Arc<dyn TranscriptSource>,
        dirs: Vec<TranscriptDir>,
        config: &LinkerConfig,
    ) -> Self {
        Self {
            spawns,
            sessions,
            source,
            dirs: dirs.into(),
            tolerance: Duration::from_millis(config.timestamp_tolerance_ms),
        }
    }

    /// Session index repository.
    #[must_use]
    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }

    /// Link `spawn_id` to its transcript, returning the linked session id.
    ///
    /// Safe to call repeatedly: an existing link is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the spawn does not exist, or a storage
    /// or I/O error from the scan.
    pub async fn link(&self, spawn_id: &str) -> Result<Option<String>> {
        let spawn = self.require(spawn_id).await?;
        if let Some(existing) = spawn.session_id {
            return Ok(Some(existing));
        }

        let candidates = self.candidates(spawn.created_at).await?;
        let Some(choice) = self.choose(&spawn, candidates).await? else {
            debug!(spawn_id, marker = spawn.marker(), "no transcript matched");
            return Ok(None);
        };

        if !self
            .spawns
            .set_session_if_unlinked(&spawn.id, &choice.session_id)
            .await?
        {
            // Another writer linked first; its link stands.
            return Ok(self.require(spawn_id).await?.session_id);
        }

        let record = SessionRecord {
            session_id: choice.session_id.clone(),
            spawn_id: spawn.id.clone(),
            provider: choice.file.provider.clone(),
            path: choice.file.path.to_string_lossy().into_owned(),
            linked_at: Utc::now().trunc_subsecs(6),
            size_bytes: None,
            modified_at: Some(choice.file.modified_at),
            finalized_at: None,
        };
        self.sessions.record_link(&record).await?;
        info!(
            spawn_id,
            session_id = choice.session_id,
            by_marker = choice.marker.is_some(),
            "session linked"
        );
        Ok(Some(choice.session_id))
    }

    /// Link if needed, then refresh the session index row from the transcript.
    ///
    /// # Errors
    ///
    /// Returns a storage or I/O error; an unlinked spawn or a vanished
    /// transcript is reported in the outcome instead.
    pub async fn finalize(&self, spawn_id: &str) -> Result<FinalizeOutcome> {
        let Some(session_id) = self.link(spawn_id).await? else {
            return Ok(FinalizeOutcome::Unlinked);
        };
        let Some((provider, path)) = self.locate(&session_id).await? else {
            return Ok(FinalizeOutcome::Missing { session_id });
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FinalizeOutcome::Missing { session_id });
            }
            Err(err) => return Err(err.into()),
        };
        let modified_at: DateTime<Utc> = meta.modified()?.into();

        if self.sessions.get(&session_id).await?.is_none() {
            let record = SessionRecord {
                session_id: session_id.clone(),
                spawn_id: spawn_id.to_owned(),
                provider,
                path: path.to_string_lossy().into_owned(),
                linked_at: Utc::now().trunc_subsecs(6),
                size_bytes: None,
                modified_at: None,
                finalized_at: None,
            };
            self.sessions.record_link(&record).await?;
        }
        let size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
        self.sessions
            .mark_finalized(&session_id, size, modified_at)
            .await?;
        debug!(spawn_id, session_id, size, "session finalized");
        Ok(FinalizeOutcome::Finalized { session_id })
    }

    /// Last write time of a linked transcript, if it can be found.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the index lookup.
    pub async fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let Some((_, path)) = self.locate(session_id).await? else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => Ok(Some(modified.into())),
            Err(err) => {
                debug!(session_id, %err, "transcript not readable");
                Ok(None)
            }
        }
    }

    async fn require(&self, spawn_id: &str) -> Result<Spawn> {
        self.spawns
            .get_by_id(spawn_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("spawn {spawn_id} not found")))
    }

    /// Provider and path of a session, from the index or a directory scan.
    async fn locate(&self, session_id: &str) -> Result<Option<(String, PathBuf)>> {
        if let Some(record) = self.sessions.get(session_id).await? {
            return Ok(Some((record.provider, PathBuf::from(record.path))));
        }
        let source = Arc::clone(&self.source);
        let dirs = Arc::clone(&self.dirs);
        let wanted = session_id.to_owned();
        run_blocking(move || {
            for dir in dirs.iter() {
                for file in source.list_transcript_files(dir)? {
                    if source.native_id(&file.path).is_ok_and(|id| id == wanted) {
                        return Ok(Some((file.provider, file.path)));
                    }
                }
            }
            Ok(None)
        })
        .await
    }

    /// Transcripts written since shortly before `created_at`, with markers read.
    async fn candidates(&self, created_at: DateTime<Utc>) -> Result<Vec<Candidate>> {
        let source = Arc::clone(&self.source);
        let dirs = Arc::clone(&self.dirs);
        let horizon = created_at - self.tolerance;
        run_blocking(move || {
            let mut found = Vec::new();
            for dir in dirs.iter() {
                for file in source.list_transcript_files(dir)? {
                    if file.modified_at < horizon {
                        continue;
                    }
                    let session_id = match source.native_id(&file.path) {
                        Ok(id) => id,
                        Err(err) => {
                            debug!(path = %file.path.display(), %err, "transcript has no id");
                            continue;
                        }
                    };
                    let marker = match source.read_marker(&file.path) {
                        Ok(marker) => marker,
                        Err(err) => {
                            warn!(path = %file.path.display(), %err, "failed to read transcript");
                            continue;
                        }
                    };
                    found.push(Candidate {
                        file,
                        session_id,
                        marker,
                    });
                }
            }
            Ok(found)
        })
        .await
    }

    /// Marker match first, then nearest creation time within tolerance.
    async fn choose(&self, spawn: &Spawn, candidates: Vec<Candidate>) -> Result<Option<Candidate>> {
        let marker = spawn.marker();
        let (mut by_marker, mut untagged): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .filter(|c| c.marker.as_deref().is_none_or(|m| m == marker))
            .partition(|c| c.marker.is_some());

        by_marker.sort_by_key(|c| c.file.created_at);
        for candidate in by_marker {
            if self.is_free(spawn, &candidate.session_id).await? {
                return Ok(Some(candidate));
            }
        }

        let tolerance = chrono::Duration::from_std(self.tolerance)
            .unwrap_or_else(|_| chrono::Duration::zero());
        untagged.retain(|c| (c.file.created_at - spawn.created_at).abs() <= tolerance);
        untagged.sort_by_key(|c| (c.file.created_at - spawn.created_at).abs());
        for candidate in untagged {
            if self.is_free(spawn, &candidate.session_id).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Whether `session_id` is not yet linked to a different spawn.
    async fn is_free(&self, spawn: &Spawn, session_id: &str) -> Result<bool> {
        Ok(self
            .spawns
            .find_by_session(session_id)
            .await?
            .is_none_or(|owner| owner == spawn.id))
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| AppError::Io(format!("transcript scan task failed: {err}")))?
}
