use anyhow::{anyhow, Context, Result};
use regen_core::{
    RegenConfig, RunKey, ENV_DEFAULT_AGENT, ENV_MAX_ITERATIONS, ENV_PERSIST_SANDBOX,
    ENV_PROJECT_ROOT, ENV_SANDBOX_BOX_TYPE, ENV_SANDBOX_CONTAINER_IMAGE, ENV_SCRIPT_DIR,
    ENV_TEST_RUNTIME, ENV_WORKSPACE_BASE,
};
use std::collections::BTreeMap;
use std::process::{Command, Stdio};

/// Exit status and captured output of one harness invocation.
#[derive(Debug, Clone)]
pub struct Captured {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn exit_ok(&self) -> bool {
        self.status == Some(0)
    }

    /// Merged view for signature scanning; the invoked process has no
    /// structured error channel, so text is all we get.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Substitutes `{placeholder}` occurrences in every argv element.
pub fn render_argv(argv: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            let mut rendered = arg.clone();
            for (name, value) in vars {
                rendered = rendered.replace(&format!("{{{}}}", name), value);
            }
            rendered
        })
        .collect()
}

/// The fixed environment contract for every harness invocation, layered
/// on top of the inherited process environment. No component reads these
/// back; they exist solely for the invoked test process.
pub fn contract_env(config: &RegenConfig, key: &RunKey) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        ENV_SCRIPT_DIR.to_string(),
        config.script_dir().display().to_string(),
    );
    env.insert(
        ENV_PROJECT_ROOT.to_string(),
        config.project_root.display().to_string(),
    );
    env.insert(
        ENV_WORKSPACE_BASE.to_string(),
        config.workspace_root.display().to_string(),
    );
    env.insert(
        ENV_SANDBOX_BOX_TYPE.to_string(),
        config.sandbox_kind.clone(),
    );
    env.insert(
        ENV_PERSIST_SANDBOX.to_string(),
        config.persist_sandbox.to_string(),
    );
    env.insert(ENV_DEFAULT_AGENT.to_string(), key.agent.as_str().to_string());
    env.insert(ENV_TEST_RUNTIME.to_string(), config.runtime_kind.clone());
    if let Some(image) = &config.container_image {
        env.insert(ENV_SANDBOX_CONTAINER_IMAGE.to_string(), image.clone());
    }
    env.insert(
        ENV_MAX_ITERATIONS.to_string(),
        config.max_iterations.to_string(),
    );
    env
}

/// Blocking run to completion. No retry, no wall-clock timeout: run time
/// is bounded by the harness's own iteration cap, not by this caller.
pub fn run_command(
    config: &RegenConfig,
    argv: &[String],
    env: &BTreeMap<String, String>,
) -> Result<Captured> {
    let program = argv
        .first()
        .ok_or_else(|| anyhow!("empty command argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    cmd.current_dir(&config.project_root);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", program))?;
    let output = child.wait_with_output()?;
    Ok(Captured {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// One test-runner invocation for the given matrix cell.
pub fn run_test(config: &RegenConfig, key: &RunKey) -> Result<Captured> {
    let argv = render_argv(&config.test_command, &[("test", &key.task.test_name)]);
    run_command(config, &argv, &contract_env(config, key))
}
