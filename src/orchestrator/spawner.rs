//! Launch orchestrator: one supervised run of an external worker process.
//!
//! Preconditions (agent, profile, executable, working directory) are checked
//! before any ledger row exists. Once the row is created, every exit path
//! ends in a terminal status write: exit code 0 maps to `completed`,
//! anything else to `failed`. If the run future is dropped or panics before
//! that write, a drop guard issues it from a detached task.

use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{EnvironmentConfig, GlobalConfig, LaunchProfile};
use crate::models::agent::Agent;
use crate::models::spawn::{Spawn, SpawnStatus};
use crate::{AppError, Result};

use super::ledger::SpawnLedger;
use super::registry::AgentRegistry;
use super::session_linker::format_marker;

/// Spawn id of the current worker; nested launches use it as their parent.
pub const SPAWN_ID_VAR: &str = "AGENT_WARDEN_SPAWN_ID";
/// Identity of the agent the current worker runs as.
pub const AGENT_VAR: &str = "AGENT_WARDEN_AGENT";
/// Data directory shared with nested launches.
pub const DATA_DIR_VAR: &str = "AGENT_WARDEN_DATA_DIR";
/// Configuration file shared with nested launches.
pub const CONFIG_VAR: &str = "AGENT_WARDEN_CONFIG";

/// A request to run one task as an agent.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Agent identity or id.
    pub agent: String,
    /// Task text delivered on stdin after the context.
    pub task: String,
    /// Parent spawn, for nested launches.
    pub parent_spawn_id: Option<String>,
    /// Opaque correlation channel.
    pub channel_id: Option<String>,
}

/// How a supervised run ended.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Ledger row after the terminal write.
    pub spawn: Spawn,
    /// Worker exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
}

/// Everything resolved before the ledger row is created.
struct Prepared {
    agent: Agent,
    profile: LaunchProfile,
    program: PathBuf,
    cwd: PathBuf,
}

/// Runs workers end to end against the ledger.
#[derive(Clone)]
pub struct Orchestrator {
    registry: AgentRegistry,
    ledger: SpawnLedger,
    config: Arc<GlobalConfig>,
}

impl Orchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(registry: AgentRegistry, ledger: SpawnLedger, config: Arc<GlobalConfig>) -> Self {
        Self {
            registry,
            ledger,
            config,
        }
    }

    /// Launch the worker, block until it exits, and record the outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` (with no ledger row created) for an
    /// unknown or archived agent, a missing profile, or an executable that
    /// cannot be found. Returns `AppError::Process` if the worker cannot be
    /// started; the spawn is then already marked `failed`.
    pub async fn run(&self, request: LaunchRequest) -> Result<LaunchOutcome> {
        let prepared = self.prepare(&request).await?;
        let spawn = self
            .ledger
            .create(
                &prepared.agent.id,
                request.parent_spawn_id.as_deref(),
                request.channel_id.as_deref(),
                None,
            )
            .await?;

        let span = info_span!("launch", spawn_id = spawn.id, agent = prepared.agent.identity);
        async {
            let mut guard = FinalStatusGuard::new(self.ledger.clone(), spawn.id.clone());
            let exited = self.supervise(&spawn, &prepared, &request.task).await;

            let status = match &exited {
                Ok(Some(0)) => SpawnStatus::Completed,
                _ => SpawnStatus::Failed,
            };
            let written = self.ledger.update_status(&spawn.id, status).await;
            guard.disarm();

            let exit_code = exited?;
            let spawn = written?;
            info!(exit_code, status = %spawn.status, "worker finished");
            Ok(LaunchOutcome { spawn, exit_code })
        }
        .instrument(span)
        .await
    }

    async fn prepare(&self, request: &LaunchRequest) -> Result<Prepared> {
        let agent = match self.registry.get(&request.agent).await {
            Ok(agent) => agent,
            Err(AppError::NotFound(msg)) => return Err(AppError::Precondition(msg)),
            Err(err) => return Err(err),
        };
        if agent.archived {
            return Err(AppError::Precondition(format!(
                "agent {} is archived",
                agent.identity
            )));
        }

        let profile = self
            .config
            .resolve_profile(&agent.identity, agent.config_ref.as_deref())?
            .clone();
        let program = which::which(&profile.command).map_err(|err| {
            AppError::Precondition(format!("executable {} not found: {err}", profile.command))
        })?;

        let cwd = match &profile.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            return Err(AppError::Precondition(format!(
                "working directory {} does not exist",
                cwd.display()
            )));
        }

        Ok(Prepared {
            agent,
            profile,
            program,
            cwd,
        })
    }

    /// Start the worker, record pid and `running`, feed stdin, wait.
    async fn supervise(&self, spawn: &Spawn, prepared: &Prepared, task: &str) -> Result<Option<i32>> {
        let log_dir = self.config.log_dir();
        tokio::fs::create_dir_all(&log_dir).await?;
        let log_path = log_dir.join(format!("{}.log", spawn.id));
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;

        let data_dir =
            std::path::absolute(&self.config.data_dir).unwrap_or_else(|_| self.config.data_dir.clone());

        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.profile.args)
            .current_dir(&prepared.cwd)
            .env_clear()
            .envs(sanitize_env(std::env::vars_os(), &self.config.environment))
            .env(SPAWN_ID_VAR, &spawn.id)
            .env(AGENT_VAR, &prepared.agent.identity)
            .env(DATA_DIR_VAR, data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // The prefix strip removes the parent's own setting; re-inject it.
        if let Some(path) = &self.config.source_path {
            cmd.env(CONFIG_VAR, path);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Process(format!(
                "failed to start {}: {err}",
                prepared.program.display()
            ))
        })?;
        info!(pid = child.id(), log = %log_path.display(), "worker started");

        match self.track(spawn, prepared, task, &mut child).await {
            Ok(code) => Ok(code),
            Err(err) => {
                if let Err(kill_err) = child.start_kill() {
                    debug!(%kill_err, "worker already gone");
                }
                Err(err)
            }
        }
    }

    async fn track(
        &self,
        spawn: &Spawn,
        prepared: &Prepared,
        task: &str,
        child: &mut Child,
    ) -> Result<Option<i32>> {
        if let Some(pid) = child.id() {
            self.ledger.set_pid(&spawn.id, pid).await?;
        }
        let running = self.ledger.update_status(&spawn.id, SpawnStatus::Running).await?;

        if running.status == SpawnStatus::Killed {
            // Aborted while pending, before a pid was recorded to signal.
            warn!("spawn aborted before start; stopping worker");
            drop(child.stdin.take());
            if let Err(err) = child.start_kill() {
                debug!(%err, "worker already gone");
            }
        } else if let Some(mut stdin) = child.stdin.take() {
            let payload = render_context(spawn.marker(), prepared.profile.context.as_deref(), task);
            match stdin.write_all(payload.as_bytes()).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    warn!("worker closed stdin before reading its context");
                }
                Err(err) => return Err(err.into()),
            }
            // Dropping stdin delivers EOF.
            drop(stdin);
        }

        let status = child
            .wait()
            .await
            .map_err(|err| AppError::Process(format!("failed to wait for worker: {err}")))?;
        Ok(status.code())
    }
}

/// Writes `failed` for a spawn whose run ended without its terminal write.
struct FinalStatusGuard {
    ledger: Option<SpawnLedger>,
    spawn_id: String,
}

impl FinalStatusGuard {
    fn new(ledger: SpawnLedger, spawn_id: String) -> Self {
        Self {
            ledger: Some(ledger),
            spawn_id,
        }
    }

    fn disarm(&mut self) {
        self.ledger = None;
    }
}

impl Drop for FinalStatusGuard {
    fn drop(&mut self) {
        let Some(ledger) = self.ledger.take() else {
            return;
        };
        let spawn_id = std::mem::take(&mut self.spawn_id);
        warn!(spawn_id, "run interrupted; marking spawn failed");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = ledger.update_status(&spawn_id, SpawnStatus::Failed).await {
                        warn!(spawn_id, %err, "failed to record interrupted run");
                    }
                });
            }
            Err(_) => warn!(spawn_id, "no runtime; failure detector will settle the spawn"),
        }
    }
}

/// Build the stdin payload: marker line, identity context, blank line, task.
#[must_use]
pub fn render_context(marker: &str, context: Option<&str>, task: &str) -> String {
    let mut payload = format_marker(marker);
    payload.push('\n');
    if let Some(context) = context.map(str::trim_end).filter(|c| !c.is_empty()) {
        payload.push_str(context);
        payload.push('\n');
    }
    payload.push('\n');
    payload.push_str(task);
    if !task.ends_with('\n') {
        payload.push('\n');
    }
    payload
}

/// Filter the inherited environment for a child worker.
///
/// Drops `strip_vars`, any key starting with one of `strip_prefixes`, and
/// `PATH` entries under the roots named by `venv_markers`.
pub fn sanitize_env<I>(vars: I, config: &EnvironmentConfig) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let vars: Vec<(OsString, OsString)> = vars.into_iter().collect();
    let venv_roots: Vec<PathBuf> = vars
        .iter()
        .filter(|(key, value)| {
            !value.is_empty()
                && config
                    .venv_markers
                    .iter()
                    .any(|marker| key.to_string_lossy() == marker.as_str())
        })
        .map(|(_, value)| PathBuf::from(value))
        .collect();

    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key.to_string_lossy().into_owned();
            if config.strip_vars.iter().any(|v| name == v.as_str())
                || config
                    .strip_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix.as_str()))
            {
                return None;
            }
            if name.eq_ignore_ascii_case("PATH") && !venv_roots.is_empty() {
                let kept = std::env::split_paths(&value)
                    .filter(|entry| !venv_roots.iter().any(|root| entry.starts_with(root)));
                let joined = std::env::join_paths(kept).unwrap_or_else(|_| value.clone());
                return Some((key, joined));
            }
            Some((key, value))
        })
        .collect()
}
