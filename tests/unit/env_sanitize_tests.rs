use std::ffi::OsString;

use agent_warden::config::EnvironmentConfig;
use agent_warden::orchestrator::spawner::{render_context, sanitize_env};

fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
    pairs
        .iter()
        .map(|(k, v)| (OsString::from(k), OsString::from(v)))
        .collect()
}

fn lookup<'a>(env: &'a [(OsString, OsString)], key: &str) -> Option<&'a OsString> {
    env.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

#[test]
fn strips_listed_variables_and_prefixes() {
    let env = sanitize_env(
        vars(&[
            ("HOME", "/home/dev"),
            ("PYTHONPATH", "/opt/lib"),
            ("AGENT_WARDEN_SPAWN_ID", "parent"),
            ("CONDA_PREFIX_1", "/opt/conda"),
            ("LANG", "C.UTF-8"),
        ]),
        &EnvironmentConfig::default(),
    );

    assert_eq!(lookup(&env, "HOME"), Some(&OsString::from("/home/dev")));
    assert!(lookup(&env, "LANG").is_some());
    assert!(lookup(&env, "PYTHONPATH").is_none());
    assert!(lookup(&env, "AGENT_WARDEN_SPAWN_ID").is_none());
    assert!(lookup(&env, "CONDA_PREFIX_1").is_none());
}

#[cfg(unix)]
#[test]
fn removes_virtualenv_entries_from_path() {
    let env = sanitize_env(
        vars(&[
            ("VIRTUAL_ENV", "/work/.venv"),
            ("PATH", "/work/.venv/bin:/usr/local/bin:/usr/bin"),
        ]),
        &EnvironmentConfig::default(),
    );

    assert!(lookup(&env, "VIRTUAL_ENV").is_none());
    assert_eq!(
        lookup(&env, "PATH"),
        Some(&OsString::from("/usr/local/bin:/usr/bin"))
    );
}

#[cfg(unix)]
#[test]
fn path_is_untouched_without_active_environment() {
    let env = sanitize_env(
        vars(&[("PATH", "/work/.venv/bin:/usr/bin")]),
        &EnvironmentConfig::default(),
    );
    assert_eq!(
        lookup(&env, "PATH"),
        Some(&OsString::from("/work/.venv/bin:/usr/bin"))
    );
}

#[test]
fn custom_rules_apply() {
    let config = EnvironmentConfig {
        strip_vars: vec!["SECRET".into()],
        strip_prefixes: vec!["CI_".into()],
        venv_markers: Vec::new(),
    };
    let env = sanitize_env(
        vars(&[("SECRET", "x"), ("CI_JOB", "7"), ("PYTHONPATH", "/opt")]),
        &config,
    );
    assert_eq!(env.len(), 1);
    assert!(lookup(&env, "PYTHONPATH").is_some());
}

#[test]
fn context_payload_layout() {
    let payload = render_context("89abcdef", Some("You are the planner.\n"), "Plan the release");
    assert_eq!(
        payload,
        "[warden:89abcdef]\nYou are the planner.\n\nPlan the release\n"
    );

    let bare = render_context("89abcdef", None, "go\n");
    assert_eq!(bare, "[warden:89abcdef]\n\ngo\n");
}
