//! Knessight CLI: drive the filter and score phases over a data directory.
//!
//! Usage:
//!   knessight filter [--force-reprocess]
//!   knessight score [--reasoning-rate R] [--seed N] [--force-reprocess]
//!   knessight both [--reasoning-rate R] [--seed N] [--force-reprocess]
//!   knessight status | validate
//!   knessight cleanup-intermediate [--yes]
//!   knessight forget <name>

use clap::{Parser, Subcommand};
use knessight::backend::OpenAiBatchClient;
use knessight::batch::{BatchJobRegistry, FailureLog};
use knessight::config::{read_list, DataLayout, PipelineConfig, PromptSet};
use knessight::ledger::{EntityId, JobLedger, JsonLedgerStore, Pair, Phase};
use knessight::pipeline::{cleanup_candidates, cleanup_intermediate, pairs_for};
use knessight::resolver::{Chooser, DeferringChooser, EntityResolver, ResolutionCache, TerminalChooser};
use knessight::{FilterPipeline, RunReport, ScorePipeline, SourceProvider, SqliteSource, Workspace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "knessight",
    version,
    about = "Resumable two-phase LLM analysis of parliamentary speeches"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Data directory (cache/, intermediate/, client_data/, config/, input/)
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,
    /// Path to the speeches SQLite database (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Defer ambiguous name resolutions instead of prompting
    #[arg(long, global = true)]
    non_interactive: bool,
    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Rate speech relevance for every pending pair
    Filter {
        /// Reset the current pairs to pending first
        #[arg(long)]
        force_reprocess: bool,
    },
    /// Score stance for every filtered pair
    Score {
        /// Fraction of records that also get a reasoning sentence
        #[arg(long)]
        reasoning_rate: Option<f64>,
        /// Seed for reasoning sampling
        #[arg(long)]
        seed: Option<u64>,
        /// Reset the current pairs to filter-complete first
        #[arg(long)]
        force_reprocess: bool,
    },
    /// Filter, then score
    Both {
        #[arg(long)]
        reasoning_rate: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Reset the current pairs to pending, so both phases run again
        #[arg(long)]
        force_reprocess: bool,
    },
    /// Show ledger progress, outstanding batches and recorded failures
    Status,
    /// Delete intermediate files of pairs that finished scoring
    CleanupIntermediate {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Check configuration, prompts, input files and database
    Validate,
    /// Remove a cached name resolution
    Forget {
        /// Name as written in the input file
        name: String,
    },
}

/// Everything a phase command needs besides the backend
struct Session {
    config: PipelineConfig,
    layout: DataLayout,
    source: Arc<dyn SourceProvider>,
    prompts: PromptSet,
    pairs: Vec<Pair>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, String> {
    let mut config = PipelineConfig::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    Ok(config)
}

fn open_source(config: &PipelineConfig) -> Result<Arc<dyn SourceProvider>, String> {
    let source = SqliteSource::open(&config.database_path)
        .map_err(|e| format!("Failed to open database {}: {}", config.database_path.display(), e))?;
    Ok(Arc::new(source))
}

/// Resolve the names in `mks.txt` and pair them with `topics.txt`.
fn resolve_scope(
    layout: &DataLayout,
    source: Arc<dyn SourceProvider>,
    config: &PipelineConfig,
    non_interactive: bool,
) -> Result<Vec<Pair>, String> {
    let names = read_list(&layout.entities_input()).map_err(|e| e.to_string())?;
    let topics = read_list(&layout.topics_input()).map_err(|e| e.to_string())?;
    if names.is_empty() || topics.is_empty() {
        return Err(format!(
            "Nothing to do: {} and {} must each list at least one item",
            layout.entities_input().display(),
            layout.topics_input().display()
        ));
    }

    let cache = ResolutionCache::open(layout.resolution_cache_path()).map_err(|e| e.to_string())?;
    let mut resolver = EntityResolver::new(cache, source).with_acceptance(config.fuzzy_acceptance);
    let mut deferring = DeferringChooser;
    let mut terminal = TerminalChooser::stdio();
    let chooser: &mut dyn Chooser = if non_interactive { &mut deferring } else { &mut terminal };
    let summary = resolver.resolve_all(&names, chooser);

    for (name, reason) in &summary.unresolved {
        eprintln!("Warning: '{}' not resolved: {}", name, reason);
    }
    let mut entities: Vec<EntityId> = Vec::new();
    for resolution in &summary.resolved {
        if !entities.contains(&resolution.entity_id) {
            entities.push(resolution.entity_id);
        }
    }
    println!(
        "Resolved {}/{} names to {} entities, {} topics",
        summary.resolved.len(),
        names.len(),
        entities.len(),
        topics.len()
    );
    Ok(pairs_for(&entities, &topics))
}

fn open_session(cli: &Cli) -> Result<Session, String> {
    let config = load_config(cli)?;
    let layout = DataLayout::new(&cli.data_dir);
    let source = open_source(&config)?;
    let prompts = PromptSet::load(&layout.config_dir()).map_err(|e| format!("Failed to load prompts: {}", e))?;
    let pairs = resolve_scope(&layout, source.clone(), &config, cli.non_interactive)?;

    let topics: Vec<String> = read_list(&layout.topics_input()).map_err(|e| e.to_string())?;
    for problem in prompts.validate(&topics) {
        eprintln!("Warning: {}", problem);
    }
    Ok(Session {
        config,
        layout,
        source,
        prompts,
        pairs,
    })
}

fn open_workspace(session: &Session) -> Result<Workspace, String> {
    let backend = OpenAiBatchClient::from_env().map_err(|e| format!("Inference backend unavailable: {}", e))?;
    let mut workspace = Workspace::open(session.layout.clone(), &session.config, Arc::new(backend))
        .map_err(|e| e.to_string())?;
    workspace.seed(&session.pairs).map_err(|e| e.to_string())?;
    Ok(workspace)
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start async runtime: {}", e))
}

fn print_report(report: &RunReport) {
    println!("{}", report);
}

fn run_filter(session: &Session, workspace: &mut Workspace, rt: &tokio::runtime::Runtime) -> RunReport {
    let pipeline = FilterPipeline::new(
        session.source.clone(),
        session.prompts.clone(),
        session.layout.clone(),
        &session.config,
    );
    let Workspace { ledger, submitter, .. } = workspace;
    rt.block_on(pipeline.run(ledger, submitter, Some(session.pairs.as_slice())))
}

fn run_score(
    session: &Session,
    workspace: &mut Workspace,
    rt: &tokio::runtime::Runtime,
    reasoning_rate: Option<f64>,
    seed: Option<u64>,
) -> RunReport {
    let mut pipeline = ScorePipeline::new(
        session.source.clone(),
        session.prompts.clone(),
        session.layout.clone(),
        &session.config,
    );
    if let Some(rate) = reasoning_rate {
        pipeline = pipeline.with_reasoning_rate(rate);
    }
    if let Some(seed) = seed {
        pipeline = pipeline.with_rng(StdRng::seed_from_u64(seed));
    }
    let reports = workspace.reports();
    let Workspace {
        ledger,
        submitter,
        aggregator,
        ..
    } = workspace;
    rt.block_on(pipeline.run(ledger, submitter, aggregator, &reports, Some(session.pairs.as_slice())))
}

fn check_rate(rate: Option<f64>) -> Result<(), String> {
    match rate {
        Some(r) if !(0.0..=1.0).contains(&r) => Err(format!("--reasoning-rate {} is outside [0, 1]", r)),
        _ => Ok(()),
    }
}

fn cmd_phase(cli: &Cli, filter: bool, score: bool, force: bool, rate: Option<f64>, seed: Option<u64>) -> i32 {
    let setup = check_rate(rate)
        .and_then(|_| open_session(cli))
        .and_then(|session| open_workspace(&session).map(|ws| (session, ws)))
        .and_then(|(session, ws)| runtime().map(|rt| (session, ws, rt)));
    let (session, mut workspace, rt) = match setup {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    if force {
        let phase = reset_phase(filter);
        match workspace.force_reprocess(phase, &session.pairs) {
            Ok(n) => println!("Reset {} pairs for {}", n, phase),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }

    if filter {
        print_report(&run_filter(&session, &mut workspace, &rt));
    }
    if score {
        print_report(&run_score(&session, &mut workspace, &rt, rate, seed));
    }
    workspace.prune_settled_jobs();
    0
}

/// Earliest phase a forced run resets to. Resetting for filter sends pairs
/// back to pending, which also covers a following score.
fn reset_phase(filter: bool) -> Phase {
    if filter {
        Phase::Filter
    } else {
        Phase::Score
    }
}

fn cmd_status(cli: &Cli) -> i32 {
    let layout = DataLayout::new(&cli.data_dir);
    let ledger = match JobLedger::open(Arc::new(JsonLedgerStore::new(layout.ledger_path()))) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let stats = ledger.statistics();
    println!("{:<18} {:>7}", "STATE", "PAIRS");
    println!("{}", "-".repeat(26));
    println!("{:<18} {:>7}", "pending", stats.pending);
    println!("{:<18} {:>7}", "filter_complete", stats.filter_complete);
    println!("{:<18} {:>7}", "score_complete", stats.score_complete);
    println!("{:<18} {:>7}", "total", stats.total());

    match BatchJobRegistry::open(layout.batch_jobs_path()) {
        Ok(registry) if registry.is_empty() => println!("\nNo outstanding batch jobs."),
        Ok(registry) => {
            println!("\n{:<36}  {:<6}  {:<10}  {:>8}  SUBMITTED", "BATCH", "PHASE", "STATUS", "REQUESTS");
            for job in registry.jobs() {
                println!(
                    "{:<36}  {:<6}  {:<10}  {:>8}  {}",
                    job.batch_id,
                    job.phase,
                    job.status,
                    job.request_count,
                    job.submitted_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Err(e) => eprintln!("Warning: cannot read batch jobs: {}", e),
    }

    match FailureLog::open(layout.failures_path()) {
        Ok(log) => println!("\nRecorded failures: {}", log.len()),
        Err(e) => eprintln!("Warning: cannot read failure log: {}", e),
    }

    let leftovers = cleanup_candidates(&ledger, &layout);
    if !leftovers.is_empty() {
        println!("Intermediate files ready for cleanup: {}", leftovers.len());
    }
    0
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => matches!(line.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

fn cmd_cleanup(cli: &Cli, yes: bool) -> i32 {
    let layout = DataLayout::new(&cli.data_dir);
    let ledger = match JobLedger::open(Arc::new(JsonLedgerStore::new(layout.ledger_path()))) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let candidates = cleanup_candidates(&ledger, &layout);
    if candidates.is_empty() {
        println!("No intermediate files to clean up.");
        return 0;
    }
    if !yes {
        if cli.non_interactive {
            eprintln!("Error: {} files would be deleted; pass --yes to confirm", candidates.len());
            return 1;
        }
        if !confirm(&format!("Delete {} intermediate files?", candidates.len())) {
            println!("Cancelled.");
            return 0;
        }
    }
    match cleanup_intermediate(&ledger, &layout) {
        Ok(removed) => {
            println!("Removed {} intermediate files", removed.len());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_validate(cli: &Cli) -> i32 {
    let layout = DataLayout::new(&cli.data_dir);
    let mut problems = Vec::new();

    let config = match load_config(cli) {
        Ok(c) => Some(c),
        Err(e) => {
            problems.push(e);
            None
        }
    };

    let topics = match read_list(&layout.topics_input()) {
        Ok(t) => t,
        Err(e) => {
            problems.push(e.to_string());
            Vec::new()
        }
    };
    if let Err(e) = read_list(&layout.entities_input()) {
        problems.push(e.to_string());
    }

    match PromptSet::load(&layout.config_dir()) {
        Ok(prompts) => problems.extend(prompts.validate(&topics)),
        Err(e) => problems.push(format!("prompts: {}", e)),
    }

    if let Some(config) = &config {
        if let Err(e) = open_source(config) {
            problems.push(e);
        }
    }
    if std::env::var("OPENAI_API_KEY").map(|k| k.trim().is_empty()).unwrap_or(true) {
        problems.push("OPENAI_API_KEY is not set".to_string());
    }

    if problems.is_empty() {
        println!("Configuration OK ({} topics)", topics.len());
        0
    } else {
        for problem in &problems {
            eprintln!("  - {}", problem);
        }
        eprintln!("{} problems found", problems.len());
        1
    }
}

fn cmd_forget(cli: &Cli, name: &str) -> i32 {
    let layout = DataLayout::new(&cli.data_dir);
    let mut cache = match ResolutionCache::open(layout.resolution_cache_path()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match cache.forget(name.trim()) {
        Ok(true) => {
            println!("Forgot resolution for '{}'", name.trim());
            0
        }
        Ok(false) => {
            eprintln!("Warning: no cached resolution for '{}'", name.trim());
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match &cli.command {
        Commands::Filter { force_reprocess } => cmd_phase(&cli, true, false, *force_reprocess, None, None),
        Commands::Score {
            reasoning_rate,
            seed,
            force_reprocess,
        } => cmd_phase(&cli, false, true, *force_reprocess, *reasoning_rate, *seed),
        Commands::Both {
            reasoning_rate,
            seed,
            force_reprocess,
        } => cmd_phase(&cli, true, true, *force_reprocess, *reasoning_rate, *seed),
        Commands::Status => cmd_status(&cli),
        Commands::CleanupIntermediate { yes } => cmd_cleanup(&cli, *yes),
        Commands::Validate => cmd_validate(&cli),
        Commands::Forget { name } => cmd_forget(&cli, name),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_accepts_force_reprocess_and_resets_from_filter() {
        let cli = Cli::try_parse_from(["knessight", "both", "--force-reprocess", "--seed", "4"]).unwrap();
        match cli.command {
            Commands::Both {
                force_reprocess, seed, ..
            } => {
                assert!(force_reprocess);
                assert_eq!(seed, Some(4));
            }
            _ => panic!("expected the both command"),
        }
        assert_eq!(reset_phase(true), Phase::Filter);
        assert_eq!(reset_phase(false), Phase::Score);
    }
}
