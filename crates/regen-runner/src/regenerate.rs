use crate::httpd::HttpServer;
use crate::process::{contract_env, render_argv, run_command, Captured};
use crate::workspace;
use anyhow::{Context, Result};
use regen_core::{ensure_dir, RegenConfig, RunKey, ENV_REGENERATE_WITHOUT_LLM};
use std::fs;

/// Offline regeneration: replay the recorded interactions through the
/// test entry point without contacting the live model. Verifies that the
/// surrounding scaffolding still produces a consistent sequence; writes
/// nothing.
pub fn replay_offline(config: &RegenConfig, key: &RunKey) -> Result<Captured> {
    let argv = render_argv(&config.replay_command, &[("test", &key.task.test_name)]);
    let mut env = contract_env(config, key);
    env.insert(ENV_REGENERATE_WITHOUT_LLM.to_string(), "true".to_string());
    run_command(config, &argv, &env)
}

/// Online regeneration: drive the agent live against the task and, on a
/// clean exit, persist the freshly recorded interaction logs as the new
/// fixture, replacing the old one unconditionally. Returns whether a new
/// fixture was persisted.
///
/// Browsing test cases get the auxiliary HTTP server for the whole
/// stage; the guard releases it on every exit path.
pub fn record_online(config: &RegenConfig, key: &RunKey) -> Result<bool> {
    let _server = if config.requires_browsing(&key.task.test_name) {
        let root = config
            .http_root
            .clone()
            .unwrap_or_else(|| config.project_root.clone());
        Some(HttpServer::start(config.http_port, &root)?)
    } else {
        None
    };

    workspace::prepare(config, key)?;
    let fixture = config.fixture_dir(key);
    if fixture.exists() {
        fs::remove_dir_all(&fixture)
            .with_context(|| format!("failed to clear fixture {}", fixture.display()))?;
    }
    if config.llm_log_dir.exists() {
        fs::remove_dir_all(&config.llm_log_dir)
            .with_context(|| format!("failed to clear {}", config.llm_log_dir.display()))?;
    }
    ensure_dir(&config.llm_log_dir)?;

    let task = format!(
        "{} Do not ask me for confirmation at any point.",
        key.task.description
    );
    let max_iterations = config.max_iterations.to_string();
    let argv = render_argv(
        &config.live_command,
        &[
            ("task", task.as_str()),
            ("agent", key.agent.as_str()),
            ("max_iterations", max_iterations.as_str()),
        ],
    );
    let captured = run_command(config, &argv, &contract_env(config, key))?;
    if !captured.exit_ok() {
        tracing::warn!(
            key = %key,
            status = ?captured.status,
            "live regeneration run did not exit cleanly"
        );
        return Ok(false);
    }

    ensure_dir(&fixture)?;
    workspace::copy_tree(&config.llm_log_dir, &fixture)?;
    tracing::info!(key = %key, fixture = %fixture.display(), "fixture replaced");
    Ok(true)
}
