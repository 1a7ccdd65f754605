// CLI commands for batchjudge
use anyhow::{bail, Context, Result};
use batchjudge_common::config::{self, Settings, DEFAULT_CONFIG_PATH};
use batchjudge_common::types::{Credential, ExecutionReport, RunOutcome, StatusKind, TestCase};
use batchjudge_engine::planner;
use batchjudge_engine::{BatchPlanner, CodeTransformer, ExecutionOrchestrator, Judge0Client, KeyPool, OrchestratorConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// A problem file: the solution plus the cases to judge it against
#[derive(Debug, Deserialize)]
pub struct Problem {
    #[serde(default)]
    pub code: Option<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub per_case_time_budget_ms: Option<u64>,
}

impl Problem {
    fn per_case_budget(&self, settings: &Settings) -> Duration {
        self.per_case_time_budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| settings.batching.per_case_time_budget())
    }
}

fn load_problem(path: &Path) -> Result<Problem> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read problem file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse problem file {}", path.display()))
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let settings = Settings::load_or_default(path)?.apply_env_overrides()?;
    Ok(settings)
}

fn solution_code(problem: &Problem, code_path: Option<&Path>) -> Result<String> {
    if let Some(path) = code_path {
        return fs::read_to_string(path)
            .with_context(|| format!("Failed to read solution {}", path.display()));
    }
    match &problem.code {
        Some(code) => Ok(code.clone()),
        None => bail!("No solution code: pass --code or set `code` in the problem file"),
    }
}

/// Run the orchestrator; Ctrl-C cancels and still prints what finished
pub async fn run(
    problem_path: &Path,
    keys_path: &Path,
    code_path: Option<&Path>,
    config_path: Option<&Path>,
    deadline_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let settings = load_settings(config_path)?;
    let problem = load_problem(problem_path)?;
    let code = solution_code(&problem, code_path)?;

    let credentials = config::load_credentials(keys_path)?;
    let pool = KeyPool::new(credentials);
    let reset = pool.reset_daily();
    info!(credentials = pool.len(), active = pool.active_count(), reset = reset, "Loaded credentials");

    if pool.active_count() == 0 {
        warn!("No active credentials; every case will report credential_exhausted");
    }

    let client = Judge0Client::new(settings.judge.clone(), settings.polling.clone())?;
    let orchestrator = ExecutionOrchestrator::new(
        Arc::new(client),
        pool,
        OrchestratorConfig::from_settings(&settings),
    )?;

    let budget = problem.per_case_budget(&settings);
    let deadline = deadline_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let cancel = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Interrupted; cancelling run"),
            Err(e) => {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await
            }
        }
    };

    let report = orchestrator
        .execute_cancellable(&code, &problem.test_cases, budget, deadline, cancel)
        .await?;

    persist_usage(keys_path, &orchestrator.pool().snapshot())?;
    print_report(&report, json)?;

    match report.outcome {
        RunOutcome::Complete => Ok(()),
        outcome => bail!("Run ended with outcome {:?}", outcome),
    }
}

fn persist_usage(keys_path: &Path, credentials: &[Credential]) -> Result<()> {
    config::save_credentials(keys_path, credentials)
        .with_context(|| format!("Failed to record key usage in {}", keys_path.display()))?;
    info!(path = %keys_path.display(), "Saved credential usage");
    Ok(())
}

fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("📋 Run {}", report.run_id);
    for warning in &report.warnings {
        println!("⚠️  {}", warning);
    }
    let mut shown_compile_error = false;
    for verdict in &report.verdicts {
        let icon = if verdict.passed { "✅" } else { "❌" };
        let time = verdict
            .execution_time_ms
            .map(|ms| format!(" ({} ms)", ms))
            .unwrap_or_default();
        println!("  {} test {:>4}: {}{}", icon, verdict.test_case_id, verdict.status_kind, time);

        if let Some(detail) = &verdict.detail {
            // identical for every case; show it once
            if verdict.status_kind == StatusKind::CompileError {
                if shown_compile_error {
                    continue;
                }
                shown_compile_error = true;
            }
            for line in detail.lines().take(5) {
                println!("       {}", line);
            }
        }
    }

    println!();
    println!(
        "🏁 {}/{} passed | outcome: {:?} | calls used: {} | saved vs one-per-case: {} | {} ms",
        report.passed_count(),
        report.verdicts.len(),
        report.outcome,
        report.calls_used,
        report.calls_saved_vs_naive,
        report.wall_time_ms
    );
    Ok(())
}

/// Print the batch plan against configured (or default) judge limits
pub fn plan(problem_path: &Path, code_path: Option<&Path>, config_path: Option<&Path>) -> Result<()> {
    let settings = load_settings(config_path)?;
    let problem = load_problem(problem_path)?;
    let ceilings = settings.ceilings.unwrap_or_default();
    let budget = problem.per_case_budget(&settings);
    let batch_planner = BatchPlanner::new(settings.batching.safety_margin)?;

    let single_case_only = match solution_code(&problem, code_path) {
        Ok(code) => CodeTransformer::default().transform(&code)?.single_case_only,
        Err(_) => false,
    };

    let batches = if single_case_only {
        batch_planner.plan_single_case(&problem.test_cases, budget, &ceilings)?
    } else {
        batch_planner.plan(&problem.test_cases, budget, &ceilings)?
    };

    println!(
        "📐 {} test cases, {:?} per case, CPU ceiling {:?}, safety margin {}",
        problem.test_cases.len(),
        budget,
        ceilings.max_cpu_time(),
        batch_planner.safety_margin()
    );
    if single_case_only {
        println!("ℹ️  Solution defines main(); one submission per test case");
    }

    for batch in &batches {
        let first = batch.test_cases.first().map(|tc| tc.id).unwrap_or_default();
        let last = batch.test_cases.last().map(|tc| tc.id).unwrap_or_default();
        let flag = if batch.may_exceed_limit { " ⚠️" } else { "" };
        println!(
            "  batch {:>3}: {:>3} cases (ids {}..={}), budget {:?}{}",
            batch.index,
            batch.len(),
            first,
            last,
            batch.estimated_time_budget,
            flag
        );
    }
    for warning in planner::warnings(&batches, budget, &ceilings) {
        println!("⚠️  {}", warning);
    }

    println!(
        "🧮 {} submissions instead of {}",
        batches.len(),
        problem.test_cases.len()
    );
    Ok(())
}

/// Print the generated harness to stdout
pub fn transform(code_path: &Path) -> Result<()> {
    let code = fs::read_to_string(code_path)
        .with_context(|| format!("Failed to read solution {}", code_path.display()))?;
    let program = CodeTransformer::default().transform(&code)?;

    if program.single_case_only {
        eprintln!("ℹ️  Solution defines main(); passed through unchanged");
    }
    print!("{}", program.source);
    Ok(())
}

/// Show credential state; secrets are never printed
pub fn keys(keys_path: &Path, json: bool) -> Result<()> {
    let pool = KeyPool::new(config::load_credentials(keys_path)?);
    let reset = pool.reset_daily();
    let snapshot = pool.snapshot();
    if reset > 0 {
        persist_usage(keys_path, &snapshot)?;
    }

    if json {
        let rows: Vec<serde_json::Value> = snapshot
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "owner_ref": c.owner_ref,
                    "status": c.status,
                    "daily_usage": c.daily_usage,
                    "daily_limit": c.daily_limit,
                    "remaining": c.remaining(),
                    "last_reset": c.last_reset,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("🔑 {} credentials, {} active, {} reset", pool.len(), pool.active_count(), reset);
    for c in &snapshot {
        println!(
            "  {}  {:<20} {:<10} {:>5}/{:<5} remaining {}",
            c.id,
            c.owner_ref,
            format!("{:?}", c.status),
            c.daily_usage,
            c.daily_limit,
            c.remaining()
        );
    }
    Ok(())
}
