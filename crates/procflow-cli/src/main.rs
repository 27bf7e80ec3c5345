//! procflow CLI
//!
//! Command-line front end for the derivation pipeline:
//! - `run`: derive a process chain from one reference-flow document
//! - `resume`: continue from the newest verified snapshot in a state dir
//! - `cleanup`: remove a state dir
//! - `stages`: list the stage boundaries usable with `--stop-after`

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use procflow_core::{
    Collaborators, DerivationState, EngineConfig, LocalCatalogue, Operation, Pipeline,
    ReferenceFlow, Stage, StageObserver,
};
use procflow_storage::SnapshotStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod logging;
mod report;

use report::RunReport;

#[derive(Parser)]
#[command(name = "procflow")]
#[command(author, version, about = "procflow: derive and reconcile unit-process chains")]
struct Cli {
    /// Emit logs as JSON lines instead of text.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive a unit-process chain for one reference flow.
    Run {
        /// Reference-flow JSON document.
        #[arg(long)]
        flow: PathBuf,

        /// `produce` or `treat`.
        #[arg(long, default_value = "produce")]
        operation: Operation,

        #[command(flatten)]
        engine: EngineArgs,

        /// Snapshot every stage boundary into this directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Resume the newest verified snapshot in a state dir.
    Resume {
        #[arg(long)]
        state_dir: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Remove a state dir and every snapshot in it.
    Cleanup {
        #[arg(long)]
        state_dir: PathBuf,
    },

    /// List stage boundaries in execution order.
    Stages,
}

#[derive(Args)]
struct EngineArgs {
    /// Flow catalogue JSON (`{"flows": [...]}` or a bare array).
    #[arg(long)]
    catalogue: Option<PathBuf>,

    /// Engine configuration TOML; PROCFLOW_* variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop once this stage has completed.
    #[arg(long)]
    stop_after: Option<Stage>,
}

#[derive(Args)]
struct OutputArgs {
    /// Write the run report (datasets, placeholder and balance reports) here.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Print the run report JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Run {
            flow,
            operation,
            engine,
            state_dir,
            output,
        } => cmd_run(&flow, operation, &engine, state_dir.as_deref(), &output).await,
        Commands::Resume {
            state_dir,
            engine,
            output,
        } => cmd_resume(&state_dir, &engine, &output).await,
        Commands::Cleanup { state_dir } => cmd_cleanup(&state_dir),
        Commands::Stages => {
            cmd_stages();
            Ok(())
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_run(
    flow_path: &Path,
    operation: Operation,
    engine: &EngineArgs,
    state_dir: Option<&Path>,
    output: &OutputArgs,
) -> Result<()> {
    let text = std::fs::read_to_string(flow_path)
        .with_context(|| format!("failed to read flow document {}", flow_path.display()))?;
    let flow = ReferenceFlow::from_json_str(&text)
        .with_context(|| format!("invalid flow document {}", flow_path.display()))?;
    eprintln!(
        "{} {} ({})",
        "Deriving".green().bold(),
        flow.name().bold(),
        operation
    );

    let pipeline = build_pipeline(engine)?;
    let store = state_dir.map(|dir| SnapshotStore::open(dir)).transpose()?;
    let observer = store.as_ref().map(|s| s as &dyn StageObserver);

    let state = DerivationState::new(flow, operation);
    let done = pipeline
        .run(state, engine.stop_after, observer)
        .await
        .context("derivation failed")?;
    finish(&done, output)
}

async fn cmd_resume(state_dir: &Path, engine: &EngineArgs, output: &OutputArgs) -> Result<()> {
    if !state_dir.is_dir() {
        bail!("state dir {} does not exist", state_dir.display());
    }
    let store = SnapshotStore::open(state_dir)?;
    let snapshot = store
        .latest()?
        .ok_or_else(|| anyhow!("no usable snapshot in {}", state_dir.display()))?;
    eprintln!(
        "{} run {} from snapshot {} ({})",
        "Resuming".green().bold(),
        snapshot.state.run_id,
        snapshot.sequence,
        snapshot.stage.as_str()
    );

    if snapshot.state.next_stage().is_none() {
        eprintln!("{}", "run already finished, nothing to resume".yellow());
        return finish(&snapshot.state, output);
    }

    let pipeline = build_pipeline(engine)?;
    let done = pipeline
        .run(snapshot.state, engine.stop_after, Some(&store as &dyn StageObserver))
        .await
        .context("derivation failed")?;
    finish(&done, output)
}

fn cmd_cleanup(state_dir: &Path) -> Result<()> {
    if !state_dir.exists() {
        eprintln!("{} {} (already absent)", "ok".green().bold(), state_dir.display());
        return Ok(());
    }
    let store = SnapshotStore::open(state_dir)?;
    let count = store.entries()?.len();
    store.cleanup()?;
    eprintln!(
        "{} removed {} ({} snapshot(s))",
        "ok".green().bold(),
        state_dir.display(),
        count
    );
    Ok(())
}

fn cmd_stages() {
    for stage in Stage::ALL {
        println!("{} {}", format!("{:<22}", stage.as_str()).bold(), stage.describe());
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::from_env().context("invalid PROCFLOW_* environment")?,
    };
    Ok(config)
}

fn build_collaborators(catalogue: Option<&Path>) -> Result<Collaborators> {
    let mut collaborators = Collaborators::new();

    match catalogue {
        Some(path) => {
            let catalogue = Arc::new(LocalCatalogue::load(path)?);
            collaborators = collaborators.with_search(catalogue.clone()).with_units(catalogue);
        }
        None => {
            tracing::warn!("no catalogue given, every exchange will stay a placeholder");
        }
    }

    #[cfg(feature = "openai")]
    {
        use procflow_core::{LlmConfig, ModelDensityEstimator, OpenAiTextGenerator};
        match LlmConfig::from_env() {
            Ok(config) => {
                tracing::info!(model = %config.model, "text generation enabled");
                let generator =
                    OpenAiTextGenerator::new(config).context("failed to build text generator")?;
                let text: Arc<dyn procflow_core::TextGenerator> = Arc::new(generator);
                collaborators = collaborators
                    .with_density(Arc::new(ModelDensityEstimator::new(text.clone())))
                    .with_text(text);
            }
            Err(err) => tracing::warn!(error = %err, "text generation disabled"),
        }
    }

    Ok(collaborators)
}

fn build_pipeline(engine: &EngineArgs) -> Result<Pipeline> {
    let config = load_config(engine.config.as_deref())?;
    let collaborators = build_collaborators(engine.catalogue.as_deref())?;
    tracing::debug!(?collaborators, "collaborators wired");
    Pipeline::new(collaborators, config).context("failed to build pipeline")
}

fn finish(state: &DerivationState, output: &OutputArgs) -> Result<()> {
    report::print_summary(state);
    let report = RunReport::from_state(state);
    if let Some(path) = &output.out {
        report.write(path)?;
        eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
    }
    if output.json {
        println!("{}", report.to_json()?);
    }
    Ok(())
}
