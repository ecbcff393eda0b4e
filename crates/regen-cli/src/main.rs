use anyhow::Result;
use clap::{Parser, Subcommand};
use regen_core::{FinalOutcome, RegenConfig};
use regen_runner::{matrix_keys, run_matrix, MatrixFilters, MatrixReport, MANUAL_INTERVENTION_CAUSES};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "regen",
    version,
    about = "Deterministic integration-test fixture regeneration orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the (task x agent) matrix, escalating failed cells through
    /// offline and online fixture regeneration
    Run {
        config: PathBuf,
        /// Restrict the matrix to a single test case
        #[arg(long)]
        test: Option<String>,
        /// Restrict the matrix to a single agent
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the matrix cells a run would process, without executing
    Matrix {
        config: PathBuf,
        #[arg(long)]
        test: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            test,
            agent,
            json,
        } => {
            let config = RegenConfig::load(&config)?;
            let filters = MatrixFilters {
                test_name: test,
                agent,
            };
            let report = run_matrix(&config, &filters)?;
            let code = report.exit_code();
            if json {
                print_json_report(&report, code);
            } else {
                print_report(&report);
            }
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Matrix {
            config,
            test,
            agent,
            json,
        } => {
            let config = RegenConfig::load(&config)?;
            let filters = MatrixFilters {
                test_name: test,
                agent,
            };
            let keys = matrix_keys(&config, &filters);
            if json {
                let cells: Vec<_> = keys
                    .iter()
                    .map(|k| json!({"test_name": k.task.test_name, "agent": k.agent.as_str()}))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "schema_version": "regen_matrix_v1",
                        "cells": cells,
                    }))
                    .unwrap_or_default()
                );
            } else {
                for key in &keys {
                    println!("{}", key);
                }
                println!("{} cell(s)", keys.len());
            }
            Ok(())
        }
    }
}

fn print_report(report: &MatrixReport) {
    println!("\n=============================================");
    println!("Matrix summary");
    println!("=============================================");
    for record in &report.records {
        println!(
            "{:<28} {} x {} (stage: {})",
            format!("{:?}", record.outcome),
            record.test_name,
            record.agent,
            record.stage_reached
        );
    }
    if let Some(key) = &report.aborted {
        println!("\nInfrastructure failure while processing [{}].", key);
        println!("The remaining matrix was aborted; its cells were not run.");
        println!("Check the environment (container runtime, sandbox shell, local ports) and retry.");
    }
    let manual = report.manual_keys();
    if !manual.is_empty() {
        println!("\nCells requiring manual intervention:");
        for record in &manual {
            println!("  - {} x {}", record.test_name, record.agent);
        }
        println!("Candidate causes:");
        for cause in MANUAL_INTERVENTION_CAUSES {
            println!("  * {}", cause);
        }
    }
}

fn print_json_report(report: &MatrixReport, code: i32) {
    let manual: Vec<_> = report
        .records
        .iter()
        .filter(|r| r.outcome == FinalOutcome::ManualInterventionRequired)
        .map(|r| json!({"test_name": r.test_name, "agent": r.agent}))
        .collect();
    let payload = json!({
        "schema_version": "regen_report_v1",
        "records": report.records,
        "aborted": report.aborted,
        "manual_intervention": manual,
        "candidate_causes": MANUAL_INTERVENTION_CAUSES,
        "exit_code": code,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    );
}
