use anyhow::Result;
use chrono::Utc;
use regen_core::{FinalOutcome, RegenConfig, RunKey};
use serde::Serialize;
use std::ops::ControlFlow;

pub mod classify;
pub mod escalate;
pub mod httpd;
pub mod process;
pub mod regenerate;
pub mod workspace;

pub use escalate::{process_key, RunRecord, Stage, StageError, MANUAL_INTERVENTION_CAUSES};

/// Optional matrix restriction: one test row and/or one agent column.
#[derive(Debug, Clone, Default)]
pub struct MatrixFilters {
    pub test_name: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MatrixReport {
    pub records: Vec<RunRecord>,
    /// The cell whose infrastructure failure aborted the remaining
    /// matrix, if any. Earlier records keep their outcomes.
    pub aborted: Option<RunKey>,
}

impl MatrixReport {
    pub fn manual_keys(&self) -> Vec<&RunRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome == FinalOutcome::ManualInterventionRequired)
            .collect()
    }

    /// Process exit contract: zero only when every cell passed or was
    /// accepted as skipped-without-fixture, and nothing aborted the run.
    pub fn exit_code(&self) -> i32 {
        let clean =
            self.aborted.is_none() && self.records.iter().all(|r| r.outcome.is_accepted());
        if clean {
            0
        } else {
            1
        }
    }
}

/// Filtered cross product in (task-major, agent-minor) order, preserving
/// configuration list order.
pub fn matrix_keys(config: &RegenConfig, filters: &MatrixFilters) -> Vec<RunKey> {
    let mut keys = Vec::new();
    for task in config.tasks() {
        if let Some(test_name) = &filters.test_name {
            if &task.test_name != test_name {
                continue;
            }
        }
        for agent in config.agent_ids() {
            if let Some(filter) = &filters.agent {
                if agent.as_str() != filter {
                    continue;
                }
            }
            keys.push(RunKey {
                task: task.clone(),
                agent,
            });
        }
    }
    keys
}

/// Runs the whole (filtered) matrix strictly sequentially: the workspace
/// and auxiliary server are singleton, path- and port-addressed
/// resources, so cells are never processed concurrently. The fold
/// terminates early on the first infrastructure-fatal cell; an
/// infrastructure problem invalidates every subsequent result.
pub fn run_matrix(config: &RegenConfig, filters: &MatrixFilters) -> Result<MatrixReport> {
    config.validate()?;
    let keys = matrix_keys(config, filters);
    tracing::info!(cells = keys.len(), "matrix resolved");

    let folded = keys
        .into_iter()
        .try_fold(Vec::new(), |mut records: Vec<RunRecord>, key| {
            let record = match escalate::process_key(config, &key) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(key = %key, stage = %err.stage, error = %err.source, "orchestration error, treating as infrastructure failure");
                    infra_record(&key, err.stage)
                }
            };
            let fatal = record.outcome == FinalOutcome::InfraFatal;
            records.push(record);
            if fatal {
                ControlFlow::Break((records, key))
            } else {
                ControlFlow::Continue(records)
            }
        });

    let (records, aborted) = match folded {
        ControlFlow::Continue(records) => (records, None),
        ControlFlow::Break((records, key)) => (records, Some(key)),
    };
    Ok(MatrixReport { records, aborted })
}

fn infra_record(key: &RunKey, stage: Stage) -> RunRecord {
    let now = Utc::now().to_rfc3339();
    RunRecord {
        test_name: key.task.test_name.clone(),
        agent: key.agent.as_str().to_string(),
        outcome: FinalOutcome::InfraFatal,
        stage_reached: stage,
        fixture_digest: None,
        started_at: now.clone(),
        finished_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regen_core::ensure_dir;
    use std::fs;
    use std::net::TcpListener;
    use std::path::{Path, PathBuf};

    fn base_config(root: &Path, test_names: &[&str], agents: &[&str]) -> RegenConfig {
        RegenConfig {
            task_descriptions: test_names
                .iter()
                .map(|t| format!("Task for {}.", t))
                .collect(),
            test_names: test_names.iter().map(|t| t.to_string()).collect(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            project_root: root.to_path_buf(),
            script_root: None,
            workspace_root: root.join("workspace"),
            templates_root: None,
            fixtures_root: root.join("mock"),
            runtime_kind: "eventstream".to_string(),
            sandbox_kind: "ssh".to_string(),
            persist_sandbox: false,
            container_image: None,
            max_iterations: 10,
            http_port: 0,
            http_root: Some(root.join("static")),
            browsing_tests: vec![],
            test_command: sh("exit 0"),
            replay_command: sh("exit 0"),
            live_command: sh("exit 0"),
            llm_log_dir: root.join("logs/llm"),
        }
    }

    fn sh(script: impl Into<String>) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.into()]
    }

    fn only_key(config: &RegenConfig) -> RunKey {
        let keys = matrix_keys(config, &MatrixFilters::default());
        assert_eq!(keys.len(), 1);
        keys.into_iter().next().unwrap()
    }

    fn seed_fixture(config: &RegenConfig, key: &RunKey, name: &str) -> PathBuf {
        let dir = config.fixture_dir(key);
        ensure_dir(&dir).expect("fixture dir");
        fs::write(dir.join(name), "recorded step").expect("seed fixture");
        dir
    }

    fn calls(root: &Path) -> Vec<String> {
        fs::read_to_string(root.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .expect("bind ephemeral")
            .local_addr()
            .expect("local addr")
            .port()
    }

    #[test]
    fn cached_pass_never_invokes_a_regenerator() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_edits"], &["CodeActAgent"]);
        config.test_command = sh(format!("echo test >> \"{}\"; exit 0", log.display()));
        config.replay_command = sh(format!("echo replay >> \"{}\"", log.display()));
        config.live_command = sh(format!("echo live >> \"{}\"", log.display()));

        let key = only_key(&config);
        seed_fixture(&config, &key, "prompt_001.log");
        let record = process_key(&config, &key).expect("process");

        assert_eq!(record.outcome, FinalOutcome::Passed);
        assert_eq!(record.stage_reached, Stage::Cached);
        assert_eq!(calls(root.path()), vec!["test"]);
    }

    #[test]
    fn no_fixture_failure_short_circuits_without_escalation() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_edits"], &["CodeActAgent"]);
        config.test_command = sh(format!("echo test >> \"{}\"; exit 1", log.display()));
        config.replay_command = sh(format!("echo replay >> \"{}\"", log.display()));
        config.live_command = sh(format!("echo live >> \"{}\"", log.display()));

        let record = process_key(&config, &only_key(&config)).expect("process");

        assert_eq!(record.outcome, FinalOutcome::SkippedNoFixture);
        assert_eq!(record.stage_reached, Stage::Cached);
        assert_eq!(calls(root.path()), vec!["test"]);
    }

    #[test]
    fn escalation_runs_stages_in_order_and_ends_in_manual_intervention() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_edits"], &["CodeActAgent"]);
        // the test never passes; replay and live both exit cleanly
        config.test_command = sh(format!(
            "echo test-${{REGENERATE_WITHOUT_LLM:-unset}} >> \"{}\"; exit 1",
            log.display()
        ));
        config.replay_command = sh(format!(
            "echo replay-${{REGENERATE_WITHOUT_LLM:-unset}} >> \"{}\"; exit 0",
            log.display()
        ));
        config.live_command = sh(format!(
            "echo live >> \"{}\"; echo fresh > \"{}/prompt_001.log\"; exit 0",
            log.display(),
            config.llm_log_dir.display()
        ));

        let key = only_key(&config);
        let fixture = seed_fixture(&config, &key, "stale_step.log");
        let record = process_key(&config, &key).expect("process");

        assert_eq!(record.outcome, FinalOutcome::ManualInterventionRequired);
        assert_eq!(record.stage_reached, Stage::OnlineRegenerated);
        assert_eq!(
            calls(root.path()),
            vec![
                "test-unset",
                "replay-true",
                "test-unset",
                "live",
                "test-unset"
            ]
        );
        // online regeneration replaced the fixture unconditionally
        assert!(!fixture.join("stale_step.log").exists());
        assert_eq!(
            fs::read_to_string(fixture.join("prompt_001.log")).unwrap().trim(),
            "fresh"
        );
        assert!(record.fixture_digest.is_some());
    }

    #[test]
    fn failed_offline_replay_escalates_to_online() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_edits"], &["CodeActAgent"]);
        config.test_command = sh(format!("echo test >> \"{}\"; exit 1", log.display()));
        config.replay_command = sh(format!("echo replay >> \"{}\"; exit 1", log.display()));
        config.live_command = sh(format!("echo live >> \"{}\"; exit 0", log.display()));

        let key = only_key(&config);
        seed_fixture(&config, &key, "prompt_001.log");
        let record = process_key(&config, &key).expect("process");

        assert_eq!(record.outcome, FinalOutcome::ManualInterventionRequired);
        // the failed replay skips the post-offline rerun entirely
        assert_eq!(
            calls(root.path()),
            vec!["test", "replay", "live", "test"]
        );
    }

    #[test]
    fn online_recovery_ends_passed_with_replaced_fixture() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_write_simple_script"], &["CodeActAgent"]);
        let key = RunKey {
            task: config.tasks().remove(0),
            agent: config.agent_ids().remove(0),
        };
        let fixture = seed_fixture(&config, &key, "stale_step.log");
        // passes only once the online stage has recorded prompt_001.log
        config.test_command = sh(format!(
            "echo test >> \"{}\"; test -f \"{}/prompt_001.log\"",
            log.display(),
            fixture.display()
        ));
        config.replay_command = sh(format!("echo replay >> \"{}\"; exit 0", log.display()));
        config.live_command = sh(format!(
            "echo live >> \"{}\"; echo recorded > \"{}/prompt_001.log\"; exit 0",
            log.display(),
            config.llm_log_dir.display()
        ));

        let record = process_key(&config, &key).expect("process");

        assert_eq!(record.outcome, FinalOutcome::Passed);
        assert_eq!(record.stage_reached, Stage::OnlineRegenerated);
        assert_eq!(
            calls(root.path()),
            vec!["test", "replay", "test", "live", "test"]
        );
        assert!(fixture.join("prompt_001.log").exists());
        assert!(!fixture.join("stale_step.log").exists());
    }

    #[test]
    fn infra_fatal_aborts_the_remaining_matrix() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let mut config = base_config(root.path(), &["test_edits", "test_ipython"], &["CodeActAgent"]);
        config.test_command = sh(format!(
            "echo test >> \"{}\"; echo 'pexpect.exceptions.EOF: End Of File (EOF).'; exit 2",
            log.display()
        ));

        let report = run_matrix(&config, &MatrixFilters::default()).expect("matrix");

        assert_eq!(report.records.len(), 1, "second cell must not run");
        assert_eq!(report.records[0].outcome, FinalOutcome::InfraFatal);
        assert_eq!(
            report.aborted.as_ref().map(|k| k.task.test_name.as_str()),
            Some("test_edits")
        );
        assert_eq!(report.exit_code(), 1);
        assert_eq!(calls(root.path()), vec!["test"]);
    }

    #[test]
    fn infra_fatal_after_offline_replay_aborts_the_matrix() {
        let root = tempfile::tempdir().expect("tempdir");
        let marker = root.path().join("reran");
        let mut config =
            base_config(root.path(), &["test_edits", "test_ipython"], &["CodeActAgent"]);
        // cached run fails plainly; the rerun over the replayed fixture
        // trips a fatal signature
        config.test_command = sh(format!(
            "if [ -e \"{0}\" ]; then echo 'docker.errors.DockerException: connect'; exit 2; else touch \"{0}\"; exit 1; fi",
            marker.display()
        ));
        config.replay_command = sh("exit 0");

        let keys = matrix_keys(&config, &MatrixFilters::default());
        seed_fixture(&config, &keys[0], "prompt_001.log");
        let report = run_matrix(&config, &MatrixFilters::default()).expect("matrix");

        assert_eq!(report.records.len(), 1, "second cell must not run");
        assert_eq!(report.records[0].outcome, FinalOutcome::InfraFatal);
        assert_eq!(report.records[0].stage_reached, Stage::OfflineRegenerated);
        assert_eq!(
            report.aborted.as_ref().map(|k| k.task.test_name.as_str()),
            Some("test_edits")
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn orchestration_error_is_labeled_with_the_failing_stage() {
        let root = tempfile::tempdir().expect("tempdir");
        // hold the port so the online stage cannot bind its server
        let holder = TcpListener::bind("127.0.0.1:0").expect("bind holder");
        let port = holder.local_addr().expect("local addr").port();
        let mut config = base_config(root.path(), &["test_browse_internet"], &["BrowsingAgent"]);
        ensure_dir(&root.path().join("static")).unwrap();
        config.http_port = port;
        config.browsing_tests = vec!["test_browse_internet".to_string()];
        config.test_command = sh("exit 1");
        config.replay_command = sh("exit 1");

        let key = only_key(&config);
        seed_fixture(&config, &key, "prompt_001.log");
        let report = run_matrix(&config, &MatrixFilters::default()).expect("matrix");

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].outcome, FinalOutcome::InfraFatal);
        assert_eq!(report.records[0].stage_reached, Stage::OnlineRegenerated);
        assert!(report.aborted.is_some());
        drop(holder);
    }

    #[test]
    fn completed_records_survive_a_later_abort() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(root.path(), &["test_edits", "test_ipython"], &["CodeActAgent"]);
        let marker = root.path().join("second_run");
        // first cell passes; second trips a fatal signature
        config.test_command = sh(format!(
            "if [ -e \"{0}\" ]; then echo 'docker.errors.DockerException: connect'; exit 2; else touch \"{0}\"; exit 0; fi",
            marker.display()
        ));

        let report = run_matrix(&config, &MatrixFilters::default()).expect("matrix");

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].outcome, FinalOutcome::Passed);
        assert_eq!(report.records[1].outcome, FinalOutcome::InfraFatal);
        assert_eq!(
            report.aborted.as_ref().map(|k| k.task.test_name.as_str()),
            Some("test_ipython")
        );
    }

    #[test]
    fn single_task_and_agent_filters_select_one_cell_of_a_6x6_matrix() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = base_config(
            root.path(),
            &[
                "test_edits",
                "test_ipython",
                "test_write_simple_script",
                "test_simple_task_rejection",
                "test_ipython_module",
                "test_browse_internet",
            ],
            &[
                "CodeActAgent",
                "CodeActSWEAgent",
                "MonologueAgent",
                "PlannerAgent",
                "DelegatorAgent",
                "BrowsingAgent",
            ],
        );
        assert_eq!(matrix_keys(&config, &MatrixFilters::default()).len(), 36);

        let filters = MatrixFilters {
            test_name: Some("test_ipython".to_string()),
            agent: Some("CodeActAgent".to_string()),
        };
        let keys = matrix_keys(&config, &filters);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].task.test_name, "test_ipython");
        assert_eq!(keys[0].agent.as_str(), "CodeActAgent");
    }

    #[test]
    fn matrix_order_is_task_major_agent_minor() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = base_config(root.path(), &["test_a", "test_b"], &["Agent1", "Agent2"]);
        let keys: Vec<String> = matrix_keys(&config, &MatrixFilters::default())
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "test_a x Agent1",
                "test_a x Agent2",
                "test_b x Agent1",
                "test_b x Agent2"
            ]
        );
    }

    #[test]
    fn http_server_is_released_even_when_the_online_stage_fails() {
        let root = tempfile::tempdir().expect("tempdir");
        let log = root.path().join("calls.log");
        let port = free_port();
        let mut config = base_config(root.path(), &["test_browse_internet"], &["BrowsingAgent"]);
        ensure_dir(&root.path().join("static")).unwrap();
        config.http_port = port;
        config.browsing_tests = vec!["test_browse_internet".to_string()];
        config.test_command = sh(format!("echo test >> \"{}\"; exit 1", log.display()));
        config.replay_command = sh("exit 0");
        // the live run itself fails, so the stage errors out
        config.live_command = sh("exit 1");

        let key = only_key(&config);
        seed_fixture(&config, &key, "prompt_001.log");
        let record = process_key(&config, &key).expect("process");

        assert_eq!(record.outcome, FinalOutcome::ManualInterventionRequired);
        TcpListener::bind(("127.0.0.1", port)).expect("port released after the online stage");
    }

    #[test]
    fn env_contract_reaches_the_harness_process() {
        let root = tempfile::tempdir().expect("tempdir");
        let out = root.path().join("env.txt");
        let mut config = base_config(root.path(), &["test_edits"], &["PlannerAgent"]);
        config.test_command = sh(format!(
            "echo \"$DEFAULT_AGENT $TEST_RUNTIME $SANDBOX_BOX_TYPE $PERSIST_SANDBOX $MAX_ITERATIONS\" > \"{}\"; exit 0",
            out.display()
        ));

        let key = only_key(&config);
        let record = process_key(&config, &key).expect("process");
        assert_eq!(record.outcome, FinalOutcome::Passed);
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            "PlannerAgent eventstream ssh false 10"
        );
    }

    #[test]
    fn report_with_all_accepted_outcomes_exits_zero() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(root.path(), &["test_edits", "test_ipython"], &["CodeActAgent"]);
        // first cell passes outright; second has no fixture and fails
        let marker = root.path().join("first_done");
        config.test_command = sh(format!(
            "if [ -e \"{0}\" ]; then exit 1; else touch \"{0}\"; exit 0; fi",
            marker.display()
        ));

        let report = run_matrix(&config, &MatrixFilters::default()).expect("matrix");
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].outcome, FinalOutcome::Passed);
        assert_eq!(report.records[1].outcome, FinalOutcome::SkippedNoFixture);
        assert!(report.manual_keys().is_empty());
        assert_eq!(report.exit_code(), 0);
    }
}
