//! Shared fixtures for integration tests.
//!
//! Builds a [`Warden`] over a temporary data directory with a controllable
//! process probe, plus helpers for writing transcripts and poking the
//! ledger store from "another process".

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agent_warden::audit::{AuditEntry, AuditLogger};
use agent_warden::config::{GlobalConfig, LaunchProfile, TranscriptDir};
use agent_warden::models::agent::Agent;
use agent_warden::models::spawn::{Spawn, SpawnStatus};
use agent_warden::models::transcript::TranscriptFile;
use agent_warden::orchestrator::process::ProcessProbe;
use agent_warden::orchestrator::session_linker::{FsTranscriptSource, TranscriptSource};
use agent_warden::persistence::schema::LEDGER_STORE;
use agent_warden::Warden;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Probe whose answers are set by the test.
#[derive(Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<i64>>,
}

impl FakeProbe {
    pub fn set_alive(&self, pid: i64) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn set_dead(&self, pid: i64) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: i64) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

/// Audit sink that keeps entries in memory.
#[derive(Default)]
pub struct MemorySink {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger for MemorySink {
    fn log_entry(&self, entry: AuditEntry) -> agent_warden::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Transcript source over a fixed list of files, for exact timestamps.
pub struct StaticSource {
    pub files: Vec<(TranscriptFile, Option<String>)>,
}

impl TranscriptSource for StaticSource {
    fn list_transcript_files(&self, dir: &TranscriptDir) -> agent_warden::Result<Vec<TranscriptFile>> {
        Ok(self
            .files
            .iter()
            .filter(|(file, _)| file.provider == dir.provider)
            .map(|(file, _)| file.clone())
            .collect())
    }

    fn read_marker(&self, path: &Path) -> agent_warden::Result<Option<String>> {
        Ok(self
            .files
            .iter()
            .find(|(file, _)| file.path == path)
            .and_then(|(_, marker)| marker.clone()))
    }

    fn native_id(&self, path: &Path) -> agent_warden::Result<String> {
        Ok(path
            .file_stem()
            .expect("stem")
            .to_string_lossy()
            .into_owned())
    }
}

pub struct Harness {
    pub warden: Warden,
    pub probe: Arc<FakeProbe>,
    pub temp: TempDir,
}

impl Harness {
    pub fn transcripts_dir(&self) -> PathBuf {
        transcripts_dir(self.temp.path())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.warden.catalog().path_for(LEDGER_STORE)
    }

    /// Independent pool on the ledger file, standing in for another process.
    pub async fn raw_ledger(&self) -> SqlitePool {
        SqlitePool::connect(&format!("sqlite://{}", self.ledger_path().display()))
            .await
            .expect("raw ledger connection")
    }

    pub async fn agent(&self, identity: &str) -> Agent {
        self.warden
            .registry()
            .register(identity, None)
            .await
            .expect("register agent")
    }

    /// Create a spawn and move it to `running` with `pid`.
    pub async fn running_spawn(&self, agent: &Agent, pid: Option<u32>) -> Spawn {
        let ledger = self.warden.ledger();
        let spawn = ledger
            .create(&agent.identity, None, None, None)
            .await
            .expect("create spawn");
        if let Some(pid) = pid {
            ledger.set_pid(&spawn.id, pid).await.expect("set pid");
        }
        ledger
            .update_status(&spawn.id, SpawnStatus::Running)
            .await
            .expect("mark running")
    }

    pub async fn shutdown(self) {
        self.warden.shutdown().await;
    }
}

pub fn transcripts_dir(root: &Path) -> PathBuf {
    root.join("transcripts")
}

/// Configuration rooted in `root` with a `sh` default profile.
pub fn test_config(root: &Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.data_dir = root.join("data");
    config.transcripts = vec![TranscriptDir {
        provider: "claude".into(),
        dir: transcripts_dir(root),
        pattern: "**/*.jsonl".into(),
    }];
    config.finalizer.workers = 1;
    config.profiles.insert(
        "default".into(),
        LaunchProfile {
            command: "sh".into(),
            args: vec!["-c".into(), "cat".into()],
            cwd: Some(root.to_owned()),
            context: Some("You are a test agent.".into()),
        },
    );
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut GlobalConfig)) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    tweak(&mut config);
    std::fs::create_dir_all(transcripts_dir(temp.path())).expect("transcripts dir");

    let probe = Arc::new(FakeProbe::default());
    let source = Arc::new(FsTranscriptSource::new(config.linker.marker_scan_lines).expect("source"));
    let warden = Warden::open_with(config, Arc::clone(&probe) as Arc<dyn ProcessProbe>, source)
        .await
        .expect("open warden");
    Harness {
        warden,
        probe,
        temp,
    }
}

/// Write a transcript whose first line optionally carries `marker`.
pub fn write_transcript(dir: &Path, name: &str, marker: Option<&str>) -> PathBuf {
    let path = dir.join(format!("{name}.jsonl"));
    let first = match marker {
        Some(marker) => format!("{{\"type\":\"user\",\"text\":\"[warden:{marker}]\"}}\n"),
        None => "{\"type\":\"user\",\"text\":\"hello\"}\n".to_owned(),
    };
    std::fs::write(&path, format!("{first}{{\"type\":\"assistant\"}}\n")).expect("write transcript");
    path
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
