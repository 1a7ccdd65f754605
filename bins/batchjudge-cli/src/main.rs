mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "batchjudge")]
#[command(about = "batchjudge - Judge many test cases per remote submission", long_about = None)]
struct Cli {
    /// Emit logs and the run report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a solution against a problem's test cases on the remote judge
    Run {
        /// Problem file (JSON: code, test_cases, per_case_time_budget_ms)
        #[arg(short, long)]
        problem: PathBuf,

        /// Credentials file (JSON list)
        #[arg(short, long)]
        keys: PathBuf,

        /// Solution source, overriding the problem's `code`
        #[arg(long)]
        code: Option<PathBuf>,

        /// Settings file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Give up after this many seconds and report what finished
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Show how a problem's test cases would be batched, without submitting
    Plan {
        #[arg(short, long)]
        problem: PathBuf,

        #[arg(long)]
        code: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the multi-case harness generated for a solution
    Transform {
        #[arg(long)]
        code: PathBuf,
    },

    /// Show credential pool state after the daily reset
    Keys {
        #[arg(short, long)]
        keys: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run {
            problem,
            keys,
            code,
            config,
            deadline_secs,
        } => {
            commands::run(
                &problem,
                &keys,
                code.as_deref(),
                config.as_deref(),
                deadline_secs,
                cli.json,
            )
            .await?;
        }
        Commands::Plan { problem, code, config } => {
            commands::plan(&problem, code.as_deref(), config.as_deref())?;
        }
        Commands::Transform { code } => {
            commands::transform(&code)?;
        }
        Commands::Keys { keys } => {
            commands::keys(&keys, cli.json)?;
        }
    }

    Ok(())
}
