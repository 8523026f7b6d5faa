use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, prelude::*};

mod evaluate;
mod fetch;
mod run;

/// Benchmark harness for evaluating coding agents against real-world
/// pull-request fixes.
///
/// `run` prepares a pre-fix baseline in the target repository, drives an
/// agent server session to produce a candidate patch, records the full
/// trajectory, and restores the repository whatever happens. `evaluate`
/// scores a candidate patch against the PR's ground truth with an LLM
/// judge.
#[derive(Parser)]
#[command(name = "agent-eval")]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an agent against a repo to generate a code patch
    ///
    /// Exit codes: 0 on success, 1 when no valid patch was produced,
    /// 2 when the repository could not be restored.
    Run(run::RunArgs),

    /// Judge a candidate patch against the ground truth
    Evaluate(evaluate::EvaluateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,cli={level},services={level},executors={level},evaluator={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run::handler(args).await?,
        Commands::Evaluate(args) => evaluate::handler(args).await?,
    };
    std::process::exit(code);
}
