use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Environment contract handed to every harness invocation. All values
/// are plain strings; the invoked test process owns their interpretation.
pub const ENV_SCRIPT_DIR: &str = "SCRIPT_DIR";
pub const ENV_PROJECT_ROOT: &str = "PROJECT_ROOT";
pub const ENV_WORKSPACE_BASE: &str = "WORKSPACE_BASE";
pub const ENV_SANDBOX_BOX_TYPE: &str = "SANDBOX_BOX_TYPE";
pub const ENV_PERSIST_SANDBOX: &str = "PERSIST_SANDBOX";
pub const ENV_DEFAULT_AGENT: &str = "DEFAULT_AGENT";
pub const ENV_TEST_RUNTIME: &str = "TEST_RUNTIME";
pub const ENV_SANDBOX_CONTAINER_IMAGE: &str = "SANDBOX_CONTAINER_IMAGE";
pub const ENV_MAX_ITERATIONS: &str = "MAX_ITERATIONS";
/// Set only for offline regeneration: rebuild the prompt sequence from
/// the stored fixture instead of contacting the live model.
pub const ENV_REGENERATE_WITHOUT_LLM: &str = "REGENERATE_WITHOUT_LLM";

pub const DEFAULT_RUNTIME_KIND: &str = "eventstream";
pub const DEFAULT_SANDBOX_KIND: &str = "ssh";
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_HTTP_PORT: u16 = 8000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("task_descriptions has {descriptions} entries but test_names has {test_names}; the lists must be parallel")]
    TaskListMismatch {
        descriptions: usize,
        test_names: usize,
    },
    #[error("agents list is empty")]
    NoAgents,
    #[error("`{field}` command is empty")]
    EmptyCommand { field: &'static str },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One configured integration task: a natural-language instruction and
/// the test case that validates it. The test name doubles as the task's
/// identifier and must be unique within a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub test_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One matrix cell: a task run by a particular agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunKey {
    pub task: TaskSpec,
    pub agent: AgentId,
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {}", self.task.test_name, self.agent)
    }
}

/// Outcome of a single harness invocation, produced fresh each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
    InfraFatal,
}

/// Terminal per-RunKey outcome after escalation. A key with no stored
/// fixture is reported as skipped rather than failed: the two states
/// call for different follow-up (record a fixture vs triage a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Passed,
    SkippedNoFixture,
    ManualInterventionRequired,
    InfraFatal,
}

impl FinalOutcome {
    /// Outcomes that leave the overall matrix run green.
    pub fn is_accepted(self) -> bool {
        matches!(self, FinalOutcome::Passed | FinalOutcome::SkippedNoFixture)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenConfig {
    pub task_descriptions: Vec<String>,
    pub test_names: Vec<String>,
    pub agents: Vec<String>,
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Directory of the integration-test scripts; defaults to
    /// `project_root` when unset.
    #[serde(default)]
    pub script_root: Option<PathBuf>,
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub templates_root: Option<PathBuf>,
    pub fixtures_root: PathBuf,
    #[serde(default = "default_runtime_kind")]
    pub runtime_kind: String,
    #[serde(default = "default_sandbox_kind")]
    pub sandbox_kind: String,
    #[serde(default)]
    pub persist_sandbox: bool,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub http_root: Option<PathBuf>,
    #[serde(default = "default_browsing_tests")]
    pub browsing_tests: Vec<String>,
    /// Harness argv; every element may reference `{test}`.
    pub test_command: Vec<String>,
    /// Offline-regeneration argv; same `{test}` placeholder.
    pub replay_command: Vec<String>,
    /// Live-run argv; elements may reference `{task}`, `{agent}` and
    /// `{max_iterations}`.
    pub live_command: Vec<String>,
    /// Where a live run records its interaction logs before they are
    /// persisted into the fixture store.
    pub llm_log_dir: PathBuf,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_runtime_kind() -> String {
    DEFAULT_RUNTIME_KIND.to_string()
}

fn default_sandbox_kind() -> String {
    DEFAULT_SANDBOX_KIND.to_string()
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_browsing_tests() -> Vec<String> {
    vec!["test_browse_internet".to_string()]
}

impl RegenConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: RegenConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Fails before any run starts; a dangling task/test-name mapping
    /// would silently shift every cell of the matrix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_descriptions.len() != self.test_names.len() {
            return Err(ConfigError::TaskListMismatch {
                descriptions: self.task_descriptions.len(),
                test_names: self.test_names.len(),
            });
        }
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        if self.test_command.is_empty() {
            return Err(ConfigError::EmptyCommand {
                field: "test_command",
            });
        }
        if self.replay_command.is_empty() {
            return Err(ConfigError::EmptyCommand {
                field: "replay_command",
            });
        }
        if self.live_command.is_empty() {
            return Err(ConfigError::EmptyCommand {
                field: "live_command",
            });
        }
        Ok(())
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        self.task_descriptions
            .iter()
            .zip(self.test_names.iter())
            .map(|(description, test_name)| TaskSpec {
                description: description.clone(),
                test_name: test_name.clone(),
            })
            .collect()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().cloned().map(AgentId).collect()
    }

    pub fn script_dir(&self) -> PathBuf {
        self.script_root
            .clone()
            .unwrap_or_else(|| self.project_root.clone())
    }

    pub fn requires_browsing(&self, test_name: &str) -> bool {
        self.browsing_tests.iter().any(|t| t == test_name)
    }

    /// Fixture store layout: `<root>/<runtime>_runtime/<agent>/<test>/`,
    /// one file per recorded interaction step.
    pub fn fixture_dir(&self, key: &RunKey) -> PathBuf {
        self.fixtures_root
            .join(format!("{}_runtime", self.runtime_kind))
            .join(key.agent.as_str())
            .join(&key.task.test_name)
    }

    /// A missing or empty fixture directory disables escalation for the
    /// key; there is nothing to replay and nothing to diff against.
    pub fn fixture_exists(&self, key: &RunKey) -> bool {
        let dir = self.fixture_dir(key);
        match fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }

    pub fn template_dir(&self, key: &RunKey) -> Option<PathBuf> {
        let root = self.templates_root.as_ref()?;
        let dir = root.join(&key.task.test_name);
        dir.is_dir().then_some(dir)
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of a fixture directory: file names and contents in sorted
/// walk order, so two fixtures with identical steps hash identically.
pub fn fixture_digest(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(fs::read(entry.path())?);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
