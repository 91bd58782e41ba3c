#![forbid(unsafe_code)]

//! `agent-warden`: command-line shim over the supervision library.
//!
//! Loads configuration, opens the stores, dispatches one subcommand and
//! prints its result. `watch` keeps the failure detector running until a
//! shutdown signal arrives.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_warden::models::spawn::{Spawn, SpawnFilter, SpawnStatus};
use agent_warden::orchestrator::failure_detector::spawn_detector_task;
use agent_warden::orchestrator::spawner::{LaunchRequest, CONFIG_VAR, DATA_DIR_VAR, SPAWN_ID_VAR};
use agent_warden::persistence::StorageCatalog;
use agent_warden::{AppError, GlobalConfig, Result, Warden};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-warden", about = "Supervise and audit agent worker processes", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = CONFIG_VAR)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration.
    #[arg(long, env = DATA_DIR_VAR)]
    data_dir: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an agent identity.
    Register {
        /// Unique identity.
        identity: String,
        /// Launch profile name.
        #[arg(long)]
        config_ref: Option<String>,
    },
    /// List registered agents.
    Agents {
        /// Include archived agents.
        #[arg(long)]
        all: bool,
    },
    /// Archive an agent.
    Archive {
        /// Agent identity or id.
        agent: String,
    },
    /// Run one task as an agent and wait for the worker to exit.
    Run {
        /// Agent identity or id.
        agent: String,
        /// Task text; read from stdin when omitted.
        task: Option<String>,
        /// Parent spawn, inherited from the environment inside a worker.
        #[arg(long, env = SPAWN_ID_VAR)]
        parent: Option<String>,
        /// Correlation channel.
        #[arg(long)]
        channel: Option<String>,
    },
    /// List spawns, newest first.
    List {
        /// Agent identity or id.
        #[arg(long)]
        agent: Option<String>,
        /// Correlation channel.
        #[arg(long)]
        channel: Option<String>,
        /// Statuses, pipe-delimited (e.g. `running|pending`).
        #[arg(long)]
        status: Option<String>,
        /// Parent spawn.
        #[arg(long)]
        parent: Option<String>,
        /// Maximum rows.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show one spawn by id or unique prefix.
    Show {
        /// Spawn id or prefix.
        spawn: String,
    },
    /// Print the parent chain of a spawn, or its subtree.
    Lineage {
        /// Spawn id or prefix.
        spawn: String,
        /// Print descendants instead of ancestors.
        #[arg(long)]
        descendants: bool,
    },
    /// Signal a spawn's worker and mark it killed.
    Abort {
        /// Spawn id or prefix.
        spawn: String,
    },
    /// Run one failure scan.
    Scan,
    /// Run failure scans until interrupted.
    Watch {
        /// Seconds between scans; defaults to the configured interval.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Link a spawn to its transcript, or to an explicit session id.
    Link {
        /// Spawn id or prefix.
        spawn: String,
        /// Session id to link instead of searching transcripts.
        #[arg(long)]
        session: Option<String>,
    },
    /// Merge write-ahead logs so the data directory can be copied.
    Checkpoint,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    if matches!(args.command, Command::Checkpoint) {
        let catalog = StorageCatalog::standard(config.data_dir.clone(), config.storage.clone());
        for path in catalog.checkpoint().await? {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let warden = Warden::open(config).await?;
    let result = dispatch(&warden, args.command).await;
    warden.shutdown().await;
    result
}

async fn dispatch(warden: &Warden, command: Command) -> Result<()> {
    match command {
        Command::Register {
            identity,
            config_ref,
        } => print_json(&warden.registry().register(&identity, config_ref.as_deref()).await?),
        Command::Agents { all } => {
            for agent in warden.registry().list(all).await? {
                let archived = if agent.archived { " (archived)" } else { "" };
                println!(
                    "{}  {}  spawns={}{archived}",
                    agent.id, agent.identity, agent.spawn_count
                );
            }
            Ok(())
        }
        Command::Archive { agent } => print_json(&warden.registry().archive(&agent).await?),
        Command::Run {
            agent,
            task,
            parent,
            channel,
        } => {
            let task = match task {
                Some(task) => task,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let outcome = warden
                .orchestrator()
                .run(LaunchRequest {
                    agent,
                    task,
                    parent_spawn_id: parent.filter(|p| !p.is_empty()),
                    channel_id: channel,
                })
                .await?;
            print_spawn(&outcome.spawn);
            if outcome.spawn.status == SpawnStatus::Completed {
                Ok(())
            } else {
                Err(AppError::Process(format!(
                    "worker exited with {}",
                    outcome
                        .exit_code
                        .map_or_else(|| "a signal".to_owned(), |code| format!("code {code}"))
                )))
            }
        }
        Command::List {
            agent,
            channel,
            status,
            parent,
            limit,
        } => {
            let agent_id = match agent {
                Some(agent) => Some(warden.registry().get(&agent).await?.id),
                None => None,
            };
            let filter = SpawnFilter {
                agent_id,
                channel_id: channel,
                parent_spawn_id: parent,
                statuses: status
                    .as_deref()
                    .map(SpawnStatus::parse_filter)
                    .transpose()?
                    .unwrap_or_default(),
                limit,
            };
            for spawn in warden.ledger().list(&filter).await? {
                print_spawn(&spawn);
            }
            Ok(())
        }
        Command::Show { spawn } => print_json(&warden.ledger().get(&spawn).await?),
        Command::Lineage {
            spawn,
            descendants,
        } => {
            let spawn = warden.ledger().get(&spawn).await?;
            let chain = if descendants {
                warden.ledger().descendants(&spawn.id).await?
            } else {
                warden.ledger().lineage(&spawn.id).await?
            };
            for spawn in &chain {
                print_spawn(spawn);
            }
            Ok(())
        }
        Command::Abort { spawn } => {
            print_spawn(&warden.ledger().abort(&spawn).await?);
            Ok(())
        }
        Command::Scan => print_json(&warden.detector().scan().await?),
        Command::Watch { interval } => {
            let interval = Duration::from_secs(
                interval.unwrap_or(warden.config().detector.scan_interval_seconds),
            );
            let cancel = CancellationToken::new();
            let task = spawn_detector_task(Arc::clone(warden.detector()), interval, cancel.clone());
            info!(interval_secs = interval.as_secs(), "watching for failed spawns");
            shutdown_signal().await;
            cancel.cancel();
            task.await
                .map_err(|err| AppError::Process(format!("detector task failed: {err}")))
        }
        Command::Link { spawn, session } => {
            let spawn = warden.ledger().get(&spawn).await?;
            let linked = match session {
                Some(session) => {
                    warden.ledger().link_session(&spawn.id, &session).await?;
                    warden.ledger().get(&spawn.id).await?.session_id
                }
                None => warden.linker().link(&spawn.id).await?,
            };
            match linked {
                Some(session) => println!("{} -> {session}", spawn.id),
                None => println!("{} unlinked", spawn.id),
            }
            Ok(())
        }
        Command::Checkpoint => Ok(()),
    }
}

fn print_spawn(spawn: &Spawn) {
    println!(
        "{}  {:<9}  agent={}  parent={}  session={}",
        spawn.id,
        spawn.status,
        spawn.agent_id,
        spawn.parent_spawn_id.as_deref().unwrap_or("-"),
        spawn.session_id.as_deref().unwrap_or("-"),
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Config(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
