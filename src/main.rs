use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use patchlab::checkpoint::CheckpointStore;
use patchlab::config::{RunConfig, CONFIG_FILE};
use patchlab::dataset::prepare::prepare_file;
use patchlab::dataset::{load_bugs, CandidateStore};
use patchlab::dispatch::{Dispatcher, ProgressEvent};
use patchlab::lab::checkout::build_layout;
use patchlab::model::{Bug, BugId};
use patchlab::report::{aggregate, summary_path};
use patchlab::runner::{build_runner, preflight};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "patchlab",
    version,
    about = "Validate candidate bug-fix patches against benchmark test suites"
)]
struct Cli {
    /// Run configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    /// Debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the toolchain, validate every pending bug, then aggregate
    Validate(ValidateArgs),
    /// Rank, normalize and deduplicate raw model generations
    Prepare(PrepareArgs),
    /// Rebuild the aggregate file and summary from existing checkpoints
    Aggregate(AggregateArgs),
    /// Only run the toolchain checks
    Preflight,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    jobs: Option<usize>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Restrict the run to these bug ids (repeatable)
    #[arg(long = "bug")]
    bugs: Vec<String>,
    /// Skip the aggregation step
    #[arg(long)]
    no_aggregate: bool,
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// Raw generation JSON-lines
    #[arg(long)]
    input: PathBuf,
    /// Defaults to `paths.candidates`
    #[arg(long)]
    output: Option<PathBuf>,
    /// Defaults to `run.max_candidates_per_hunk`
    #[arg(long)]
    max_per_hunk: Option<usize>,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    /// Defaults to `paths.aggregate`
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = RunConfig::load(&cli.config)?;
    match cli.command {
        Commands::Validate(args) => run_validate(config, args),
        Commands::Prepare(args) => run_prepare(&config, args),
        Commands::Aggregate(args) => run_aggregate(&config, args),
        Commands::Preflight => run_preflight(&config),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_preflight(config: &RunConfig) -> Result<()> {
    if config.toolchain.is_empty() {
        println!("No toolchain checks configured");
        return Ok(());
    }
    for found in preflight(&config.toolchain)? {
        println!("ok: {found}");
    }
    Ok(())
}

fn run_validate(mut config: RunConfig, args: ValidateArgs) -> Result<()> {
    let run_id = Uuid::new_v4().to_string();
    config.apply_cli(args.jobs, args.timeout_secs)?;

    for found in preflight(&config.toolchain)? {
        info!(toolchain = %found, "toolchain ok");
    }

    let bugs = select_bugs(load_bugs(&config.paths.bugs)?, &args.bugs)?;
    let mut candidates = CandidateStore::load(&config.paths.candidates)?;
    if let Some(max) = config.run.max_candidates_per_hunk {
        candidates.truncate_each(max);
    }
    info!(
        run_id = %run_id,
        bugs = bugs.len(),
        with_candidates = candidates.bug_count(),
        "run started"
    );

    let layout = build_layout(&config.checkout, &config.run.project_separator)?;
    let runner = build_runner(&config)?;
    let store = CheckpointStore::open(&config.paths.checkpoints)?;

    let total = bugs.len();
    let done = AtomicUsize::new(0);
    let progress = |event: &ProgressEvent| match event {
        ProgressEvent::Started { bug, worker } => {
            info!(bug = %bug, worker, "validating");
        }
        ProgressEvent::Skipped { bug, reason } => {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            info!(bug = %bug, reason, "[{n}/{total}] skipped");
        }
        ProgressEvent::Finished { bug, verdict, .. } => {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            let verdict = verdict
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            info!(bug = %bug, verdict = %verdict, "[{n}/{total}] done");
        }
        ProgressEvent::Failed { bug, error, .. } => {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(bug = %bug, "[{n}/{total}] failed: {error}");
        }
    };

    let dispatcher = Dispatcher {
        config: &config,
        layout: layout.as_ref(),
        runner: runner.as_ref(),
        candidates: &candidates,
        store: &store,
    };
    let stats = dispatcher.run(&bugs, &progress)?;
    println!(
        "Validated {} bug(s): {} plausible, {} failed, {} skipped",
        stats.finished, stats.plausible, stats.failed, stats.skipped
    );

    if !args.no_aggregate {
        let expected: Vec<BugId> = bugs.keys().cloned().collect();
        let summary = aggregate(&store, &config.paths.aggregate, Some(&expected))?;
        print!("{}", summary.render());
        println!("Aggregate: {}", config.paths.aggregate.display());
    }
    Ok(())
}

fn select_bugs(bugs: IndexMap<BugId, Bug>, only: &[String]) -> Result<IndexMap<BugId, Bug>> {
    if only.is_empty() {
        return Ok(bugs);
    }
    let mut selected = IndexMap::new();
    for id in only {
        let id = BugId::new(id.as_str());
        let bug = bugs
            .get(&id)
            .ok_or_else(|| anyhow!("Unknown bug '{}'", id))?;
        selected.insert(id, bug.clone());
    }
    Ok(selected)
}

fn run_prepare(config: &RunConfig, args: PrepareArgs) -> Result<()> {
    let bugs = load_bugs(&config.paths.bugs)?;
    let output = args
        .output
        .unwrap_or_else(|| config.paths.candidates.clone());
    let max = args.max_per_hunk.or(config.run.max_candidates_per_hunk);
    let stats = prepare_file(&bugs, &args.input, &output, max)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("Candidates: {}", output.display());
    Ok(())
}

fn run_aggregate(config: &RunConfig, args: AggregateArgs) -> Result<()> {
    let store = CheckpointStore::open_shared(&config.paths.checkpoints)?;
    let output = args
        .output
        .unwrap_or_else(|| config.paths.aggregate.clone());
    let expected = expected_bugs(&config.paths.bugs);
    let summary = aggregate(&store, &output, expected.as_deref())?;
    print!("{}", summary.render());
    println!("Aggregate: {}", output.display());
    println!("Summary: {}", summary_path(&output).display());
    Ok(())
}

/// Bug ids from the metadata file, when it is still around.
fn expected_bugs(path: &Path) -> Option<Vec<BugId>> {
    if !path.is_file() {
        return None;
    }
    match load_bugs(path).with_context(|| format!("Reading '{}' for missing-bug report", path.display())) {
        Ok(bugs) => Some(bugs.into_keys().collect()),
        Err(err) => {
            warn!("{err:#}");
            None
        }
    }
}
