use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use evalrig::annotation_pipeline::{ANNOTATOR_CACHE_SCOPE, run_annotations, run_prompts_and_annotations};
use evalrig::builtin::default_registry;
use evalrig::cache::SqliteCache;
use evalrig::config::RunConfig;
use evalrig::lockfile::{DependencyLock, generate_lock};
use evalrig::observability::{MetricsCollector, log_snapshot};
use evalrig::pipeline::{PipelineProgress, PipelineReport};
use evalrig::prompt_pipeline::{RunOptions, SUT_CACHE_SCOPE, run_prompts};
use evalrig::validation::validate_config;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::RunPrompts(args) => run_command(RunKind::Prompts, args),
        Commands::RunAnnotations(args) => run_command(RunKind::Annotations, args),
        Commands::RunJob(args) => run_command(RunKind::Job, args),
        Commands::FetchDependencies { config } => fetch_dependencies(&config),
        Commands::Lock { config, output } => lock_dependencies(&config, &output),
        Commands::Validate { config } => validate_config_cmd(&config),
        Commands::ListTargets => {
            list_targets();
            Ok(())
        }
        Commands::Cache { action } => cache_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "evalrig", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Prompts,
    Annotations,
    Job,
}

fn run_command(kind: RunKind, args: RunArgs) -> Result<()> {
    let mut config = RunConfig::load(&args.config)?;
    if let Some(lock_path) = &args.lock {
        let lock = DependencyLock::load(lock_path)?;
        config.apply_lock(&lock);
        info!(lockfile = %lock_path.display(), pinned = lock.versions.len(), "Applied lockfile");
    }

    let registry = default_registry();
    let report = validate_config(&config, &registry);
    for warning in &report.warnings {
        warn!(file = %args.config.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %args.config.display(), "{error_msg}");
        }
        bail!("Config validation failed with {} error(s)", report.errors.len());
    }

    let resolver = config.build_resolver();
    let metrics = MetricsCollector::new();
    let mut options = RunOptions {
        metrics: metrics.clone(),
        ..config.run_options()
    };
    if let Some(workers) = args.workers {
        options.workers = Some(workers);
    }
    if let Some(queue_capacity) = args.queue_capacity {
        options.pipeline.queue_capacity = queue_capacity;
    }
    if let Some(cache_dir) = &args.cache_dir {
        options.cache_dir = Some(cache_dir.clone());
    }
    if args.no_cache {
        options.cache_dir = None;
    }
    options.pipeline.debug = args.debug;

    ensure_parent_dir(&args.output)?;
    let progress = |progress: PipelineProgress| render_progress(&progress);
    let outcome = match kind {
        RunKind::Prompts => {
            let suts = config.build_suts(&registry, &resolver)?;
            run_prompts(&args.input, &args.output, &suts, &options, progress)
        }
        RunKind::Annotations => {
            let annotators = config.build_annotators(&registry, &resolver)?;
            run_annotations(&args.input, &args.output, &annotators, &options, progress)
        }
        RunKind::Job => {
            let suts = config.build_suts(&registry, &resolver)?;
            let annotators = config.build_annotators(&registry, &resolver)?;
            run_prompts_and_annotations(
                &args.input,
                &args.output,
                &suts,
                &annotators,
                &options,
                progress,
            )
        }
    };
    eprintln!();
    let pipeline_report = outcome?;

    for (dependency, version) in resolver.versions_used() {
        info!(dependency = dependency.as_str(), version = version.as_str(), "Dependency version used");
    }
    write_outputs(&args, &pipeline_report, &metrics)?;

    if !pipeline_report.is_clean() {
        bail!(
            "Run finished with {} dropped and {} incomplete item(s); see log for details",
            pipeline_report.progress.dropped,
            pipeline_report.incomplete
        );
    }
    info!(output = %args.output.display(), written = pipeline_report.written, "Run completed");
    Ok(())
}

fn render_progress(progress: &PipelineProgress) {
    eprint!(
        "\rread {:>6}  processed {:>6}  completed {:>6}  dropped {:>4}",
        progress.read, progress.processed, progress.completed, progress.dropped
    );
    let _ = io::stderr().flush();
}

fn write_outputs(args: &RunArgs, report: &PipelineReport, metrics: &MetricsCollector) -> Result<()> {
    if let Some(path) = &args.report {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, report)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    let snapshot = metrics.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &args.metrics_json {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.metrics_prometheus {
        ensure_parent_dir(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn fetch_dependencies(config_path: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    let resolver = config.build_resolver();
    let versions = resolver.update_all()?;
    if versions.is_empty() {
        warn!(file = %config_path.display(), "No dependencies declared");
    }
    for (dependency, version) in versions {
        println!("{dependency} {version}");
    }
    Ok(())
}

fn lock_dependencies(config_path: &Path, output_path: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    ensure_parent_dir(output_path)?;
    let lock = generate_lock(&config.build_resolver(), output_path)?;
    info!(
        lockfile = %output_path.display(),
        dependencies = lock.versions.len(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn validate_config_cmd(config_path: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    let registry = default_registry();
    let report = validate_config(&config, &registry);

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %config_path.display(), "Config validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Config validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn list_targets() {
    let registry = default_registry();
    println!("Available SUT kinds:");
    for name in registry.known_suts() {
        println!("- {name}");
    }
    println!("Available annotator kinds:");
    for name in registry.known_annotators() {
        println!("- {name}");
    }
}

fn cache_command(command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Stats { cache_dir } => {
            for (label, cache) in open_caches(&cache_dir, None)? {
                println!("{label} {}", cache.len()?);
            }
            Ok(())
        }
        CacheCommands::Clear { cache_dir, target } => {
            let caches = open_caches(&cache_dir, target.as_deref())?;
            if caches.is_empty() {
                warn!(cache_dir = %cache_dir.display(), "No matching caches found");
            }
            for (label, cache) in caches {
                let removed = cache.clear()?;
                info!(cache = label.as_str(), removed, "Cache cleared");
            }
            Ok(())
        }
    }
}

/// Every cache file under `<cache_dir>/{suts,annotators}/`, labelled
/// `<scope>/<identifier>`, optionally narrowed to one label.
fn open_caches(cache_dir: &Path, only: Option<&str>) -> Result<Vec<(String, SqliteCache)>> {
    let mut caches = Vec::new();
    for scope in [SUT_CACHE_SCOPE, ANNOTATOR_CACHE_SCOPE] {
        let scope_dir = cache_dir.join(scope);
        if !scope_dir.is_dir() {
            continue;
        }
        let pattern = format!(
            "{}/*.sqlite",
            glob::Pattern::escape(&scope_dir.to_string_lossy())
        );
        for entry in glob::glob(&pattern).with_context(|| format!("Invalid pattern: {pattern}"))? {
            let path = entry?;
            let Some(identifier) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let label = format!("{scope}/{identifier}");
            if only.is_some_and(|wanted| wanted != label) {
                continue;
            }
            let cache = SqliteCache::open(&scope_dir, identifier)
                .with_context(|| format!("Failed to open cache {}", path.display()))?;
            caches.push((label, cache));
        }
    }
    Ok(caches)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "evalrig",
    version,
    about = "Concurrent prompt and annotation runner for language-model evaluation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send every prompt to every configured SUT and write a CSV.
    RunPrompts(RunArgs),
    /// Annotate prompt/response pairs from a CSV and write JSONL.
    RunAnnotations(RunArgs),
    /// Prompts, SUTs and annotators chained into one run.
    RunJob(RunArgs),
    /// Fetch the current content of every declared dependency.
    FetchDependencies {
        #[arg(long)]
        config: PathBuf,
    },
    /// Resolve every dependency and record its version in a lockfile.
    Lock {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    ListTargets,
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    Completions {
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long = "queue-capacity")]
    queue_capacity: Option<usize>,
    #[arg(long = "cache-dir", conflicts_with = "no_cache")]
    cache_dir: Option<PathBuf>,
    #[arg(long = "no-cache")]
    no_cache: bool,
    /// Pin dependency versions from a lockfile.
    #[arg(long)]
    lock: Option<PathBuf>,
    /// Log queue occupancy and keep per-item drop diagnostics.
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry count of every cache.
    Stats {
        #[arg(long = "cache-dir")]
        cache_dir: PathBuf,
    },
    Clear {
        #[arg(long = "cache-dir")]
        cache_dir: PathBuf,
        /// Only clear `<scope>/<uid>`, e.g. `suts/gpt-4o`.
        #[arg(long)]
        target: Option<String>,
    },
}
