use crate::classify::classify;
use crate::process::run_test;
use crate::{regenerate, workspace};
use anyhow::Result;
use chrono::Utc;
use regen_core::{fixture_digest, FinalOutcome, RegenConfig, RunKey, RunOutcome};
use serde::Serialize;

/// Recovery stages, in escalation order. Offline comes before online
/// because it costs nothing and catches prompt-template drift; online is
/// last because it pays for real model calls and may itself be
/// non-deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Cached,
    OfflineRegenerated,
    OnlineRegenerated,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Cached => "cached",
            Stage::OfflineRegenerated => "offline-regenerated",
            Stage::OnlineRegenerated => "online-regenerated",
        };
        f.write_str(label)
    }
}

/// Candidate root causes surfaced with every ManualInterventionRequired
/// outcome, for human triage.
pub const MANUAL_INTERVENTION_CAUSES: [&str; 4] = [
    "the agent could not finish the task within the iteration cap",
    "the agent believed it finished but the test's validation failed",
    "non-determinism in the recorded interaction",
    "a defect in the test harness itself",
];

/// Orchestration error (workspace unusable, harness unspawnable, port
/// unbindable) labeled with the stage that was executing, so the matrix
/// summary names where the run actually broke.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub source: anyhow::Error,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage: {}", self.stage, self.source)
    }
}

impl std::error::Error for StageError {}

fn at_stage<T>(stage: Stage, result: Result<T>) -> Result<T, StageError> {
    result.map_err(|source| StageError { stage, source })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub test_name: String,
    pub agent: String,
    pub outcome: FinalOutcome,
    pub stage_reached: Stage,
    /// Digest of the fixture after an online regeneration replaced it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture_digest: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

fn banner(action: &str, key: &RunKey) {
    println!("\n=============================================");
    println!("{} [{}]", action, key);
    println!("=============================================");
}

fn attempt(config: &RegenConfig, key: &RunKey, stage: Stage) -> Result<RunOutcome> {
    banner(&format!("Running {} attempt", stage), key);
    workspace::prepare(config, key)?;
    let captured = run_test(config, key)?;
    let outcome = classify(&captured);
    tracing::info!(key = %key, %stage, status = ?captured.status, ?outcome, "attempt finished");
    println!("Result: {:?}", outcome);
    Ok(outcome)
}

/// Drives one matrix cell through the escalation pipeline:
/// cached -> offline-regenerated -> online-regenerated, with the
/// documented no-fixture short-circuit after a cached failure. An `Err`
/// from this function means the orchestrator itself could not proceed
/// (workspace unusable, harness unspawnable) and is treated as
/// infrastructure-fatal by the matrix driver, labeled with the stage
/// that was executing.
pub fn process_key(config: &RegenConfig, key: &RunKey) -> Result<RunRecord, StageError> {
    let started_at = Utc::now().to_rfc3339();
    let mut stage = Stage::Cached;
    let mut fixture_sum = None;

    let mut outcome = at_stage(stage, attempt(config, key, stage))?;
    let terminal = loop {
        match outcome {
            RunOutcome::Passed => break FinalOutcome::Passed,
            RunOutcome::InfraFatal if stage != Stage::OnlineRegenerated => {
                break FinalOutcome::InfraFatal
            }
            // past the online stage every remaining failure is terminal
            RunOutcome::Failed | RunOutcome::InfraFatal => match stage {
                Stage::Cached => {
                    if !config.fixture_exists(key) {
                        println!("No fixture recorded for [{}]; skipping escalation.", key);
                        break FinalOutcome::SkippedNoFixture;
                    }
                    stage = Stage::OfflineRegenerated;
                    banner("Regenerating fixture offline (replay, no model cost)", key);
                    let replay = at_stage(stage, regenerate::replay_offline(config, key))?;
                    if replay.exit_ok() {
                        outcome = at_stage(stage, attempt(config, key, stage))?;
                    } else {
                        tracing::warn!(key = %key, status = ?replay.status, "offline replay errored");
                        println!("Offline replay failed; escalating.");
                        outcome = RunOutcome::Failed;
                    }
                }
                Stage::OfflineRegenerated => {
                    stage = Stage::OnlineRegenerated;
                    banner("Regenerating fixture online (live model run)", key);
                    if at_stage(stage, regenerate::record_online(config, key))? {
                        fixture_sum = fixture_digest(&config.fixture_dir(key)).ok();
                        outcome = at_stage(stage, attempt(config, key, stage))?;
                    } else {
                        break FinalOutcome::ManualInterventionRequired;
                    }
                }
                Stage::OnlineRegenerated => break FinalOutcome::ManualInterventionRequired,
            },
        }
    };

    if terminal == FinalOutcome::ManualInterventionRequired {
        println!("[{}] still failing after full escalation. Candidate causes:", key);
        for cause in MANUAL_INTERVENTION_CAUSES {
            println!("  - {}", cause);
        }
    }

    Ok(RunRecord {
        test_name: key.task.test_name.clone(),
        agent: key.agent.as_str().to_string(),
        outcome: terminal,
        stage_reached: stage,
        fixture_digest: fixture_sum,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
    })
}
