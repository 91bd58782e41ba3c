use std::path::PathBuf;
use std::time::Duration;

use agent_warden::{config::GlobalConfig, AppError};

fn sample_toml() -> &'static str {
    r#"
data_dir = "/var/lib/warden"
max_spawn_depth = 3
lineage_safety_factor = 2

[storage]
lock_retries = 7
lock_backoff_ms = 20

[detector]
timeout_seconds = 900
stall_seconds = 120
enforce_timeouts = true

[linker]
marker_scan_lines = 10
timestamp_tolerance_ms = 500

[[transcripts]]
provider = "claude"
dir = "/home/dev/.claude/projects"

[[transcripts]]
provider = "codex"
dir = "/home/dev/.codex/sessions"
pattern = "*/*.json"

[profiles.default]
command = "claude"
args = ["--print"]

[profiles.reviewer]
command = "codex"
cwd = "/srv/repo"
context = "You review pull requests."
"#
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config.data_dir, PathBuf::from(".agent-warden"));
    assert_eq!(config.max_spawn_depth, 5);
    assert_eq!(config.lineage_limit(), 20);
    assert_eq!(config.storage.lock_retries, 5);
    assert_eq!(config.storage.lock_backoff_ms, 50);
    assert_eq!(config.detector.timeout(), Duration::from_secs(600));
    assert_eq!(config.detector.stall(), Duration::from_secs(180));
    assert!(!config.detector.enforce_timeouts);
    assert_eq!(config.linker.timestamp_tolerance_ms, 1000);
    assert!(config.transcripts.is_empty());
    assert!(config.profiles.is_empty());
    assert_eq!(config.log_dir(), PathBuf::from(".agent-warden").join("logs"));
}

#[test]
fn lineage_limit_admits_a_full_chain() {
    let config = GlobalConfig::from_toml_str("max_spawn_depth = 1\nlineage_safety_factor = 1")
        .expect("factor of one is accepted");
    assert_eq!(config.lineage_limit(), 2);

    let config = GlobalConfig::from_toml_str("max_spawn_depth = 3\nlineage_safety_factor = 1")
        .expect("valid");
    assert_eq!(config.lineage_limit(), 4);
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.data_dir, PathBuf::from("/var/lib/warden"));
    assert_eq!(config.lineage_limit(), 6);
    assert_eq!(config.storage.lock_retries, 7);
    assert_eq!(config.storage.busy_timeout_ms, 250, "unset keys keep defaults");
    assert!(config.detector.enforce_timeouts);
    assert_eq!(config.linker.marker_scan_lines, 10);

    assert_eq!(config.transcripts.len(), 2);
    assert_eq!(config.transcripts[0].pattern, "**/*.jsonl");
    assert_eq!(config.transcripts[1].pattern, "*/*.json");

    let reviewer = &config.profiles["reviewer"];
    assert_eq!(reviewer.command, "codex");
    assert_eq!(reviewer.cwd, Some(PathBuf::from("/srv/repo")));
    assert!(reviewer.args.is_empty());
}

#[test]
fn default_environment_strips_runtime_variables() {
    let config = GlobalConfig::default();
    let env = &config.environment;

    assert!(env.strip_vars.iter().any(|v| v == "VIRTUAL_ENV"));
    assert!(env.strip_vars.iter().any(|v| v == "PYTHONPATH"));
    assert!(env.strip_prefixes.iter().any(|p| p == "AGENT_WARDEN_"));
    assert!(env.venv_markers.iter().any(|m| m == "CONDA_PREFIX"));
}

#[test]
fn profile_resolution_prefers_config_ref_then_identity_then_default() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    let by_ref = config
        .resolve_profile("anything", Some("reviewer"))
        .expect("config_ref resolves");
    assert_eq!(by_ref.command, "codex");

    let by_identity = config
        .resolve_profile("reviewer", None)
        .expect("identity resolves");
    assert_eq!(by_identity.command, "codex");

    let fallback = config
        .resolve_profile("planner", None)
        .expect("default resolves");
    assert_eq!(fallback.command, "claude");
}

#[test]
fn unknown_config_ref_is_a_precondition_error() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    let err = config
        .resolve_profile("planner", Some("missing"))
        .expect_err("unknown profile must fail");
    assert!(matches!(err, AppError::Precondition(_)));
}

#[test]
fn missing_default_profile_is_a_precondition_error() {
    let config = GlobalConfig::default();
    let err = config
        .resolve_profile("planner", None)
        .expect_err("no profiles configured");
    assert!(matches!(err, AppError::Precondition(_)));
}

#[test]
fn stall_must_be_shorter_than_timeout() {
    let toml = r"
[detector]
timeout_seconds = 60
stall_seconds = 60
";
    let err = GlobalConfig::from_toml_str(toml).expect_err("stall == timeout is invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_depth_is_rejected() {
    let err = GlobalConfig::from_toml_str("max_spawn_depth = 0").expect_err("zero depth");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn empty_profile_command_is_rejected() {
    let toml = r#"
[profiles.default]
command = "  "
"#;
    let err = GlobalConfig::from_toml_str(toml).expect_err("blank command");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("max_spawn_depth = [").expect_err("bad toml");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_remembers_the_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("warden.toml");
    std::fs::write(&path, "max_spawn_depth = 2\n").expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.max_spawn_depth, 2);
    assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
    assert!(GlobalConfig::from_toml_str("").expect("parse").source_path.is_none());
}

#[test]
fn load_from_missing_path_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(temp.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)));
}
