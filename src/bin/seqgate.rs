use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use seqgate::catalogue::{HttpCatalogue, NullCatalogue};
use seqgate::config::{ConfigLoader, ResolvedConfig};
use seqgate::engine::Engine;
use seqgate::error::GateError;
use seqgate::key_parser::{KeyParser, ParsedKey};
use seqgate::notification::Notification;
use seqgate::output::{DirectoryPublisher, JsonLinesPublisher, JsonOutput};
use seqgate::storage::LocalStore;
use seqgate::verdict::{Catalogue, Publisher, VerdictEmitter};
use seqgate::worker::{DrainReport, NotificationHandler, Sweeper, WorkerPool};

#[derive(Parser)]
#[command(name = "seqgate")]
#[command(about = "Match and validate pathogen sequencing submissions as they land in object storage")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load and validate the configuration, then print a summary")]
    CheckConfig,
    #[command(about = "Show how an object key in a bucket is interpreted")]
    ParseKey(ParseKeyArgs),
    #[command(about = "Process storage event JSON lines from stdin")]
    Run(RunArgs),
}

#[derive(Args)]
struct ParseKeyArgs {
    #[arg(long)]
    bucket: String,

    key: String,
}

#[derive(Args)]
struct RunArgs {
    /// Directory holding one subdirectory per bucket.
    #[arg(long)]
    storage_root: Utf8PathBuf,

    /// Write verdicts as files here instead of JSON lines on stdout.
    #[arg(long)]
    results: Option<Utf8PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    catalogue_url: Option<String>,

    /// Start from an empty tracker instead of re-admitting stored objects.
    #[arg(long)]
    skip_reconcile: bool,
}

#[derive(Serialize)]
struct ConfigSummary {
    schema_version: u32,
    workers: usize,
    staleness_secs: i64,
    pathogens: Vec<PathogenSummary>,
}

#[derive(Serialize)]
struct PathogenSummary {
    id: String,
    sites: Vec<String>,
    platforms: Vec<String>,
    buckets: Vec<String>,
}

#[derive(Serialize)]
struct ParseKeyResult {
    pathogen: String,
    site: String,
    test_flag: bool,
    parsed: ParsedKey,
    required_roles: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<GateError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GateError) -> u8 {
    match error {
        error if error.is_config() => 2,
        GateError::KeyFormat { .. } => 2,
        GateError::TransientIo(_)
        | GateError::Filesystem(_)
        | GateError::Publish(_)
        | GateError::Catalogue(_)
        | GateError::CatalogueStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => check_config(&resolved),
        Commands::ParseKey(args) => parse_key(&resolved, args),
        Commands::Run(args) => run_engine(resolved, args),
    }
}

fn check_config(resolved: &ResolvedConfig) -> miette::Result<()> {
    let summary = ConfigSummary {
        schema_version: resolved.schema_version,
        workers: resolved.runtime.workers,
        staleness_secs: resolved.runtime.tracker.staleness.num_seconds(),
        pathogens: resolved
            .registry
            .pathogens()
            .map(|spec| PathogenSummary {
                id: spec.id.clone(),
                sites: spec.sites.iter().cloned().collect(),
                platforms: spec.platforms.keys().map(ToString::to_string).collect(),
                buckets: spec
                    .buckets
                    .iter()
                    .map(|bucket| format!("{} ({})", bucket.layout.template(), bucket.policy))
                    .collect(),
            })
            .collect(),
    };
    JsonOutput::print_json(&summary).into_diagnostic()
}

fn parse_key(resolved: &ResolvedConfig, args: ParseKeyArgs) -> miette::Result<()> {
    let context = resolved.registry.resolve_bucket(&args.bucket)?;
    let parsed = KeyParser::new(&resolved.registry).parse(
        &args.key,
        &context.pathogen,
        Some(&context.platform),
    )?;
    let required_roles = resolved
        .registry
        .required_roles(&context.pathogen, &context.platform)?
        .iter()
        .map(ToString::to_string)
        .collect();
    JsonOutput::print_json(&ParseKeyResult {
        pathogen: context.pathogen,
        site: context.site,
        test_flag: context.test_flag,
        parsed,
        required_roles,
    })
    .into_diagnostic()
}

fn run_engine(resolved: ResolvedConfig, args: RunArgs) -> miette::Result<()> {
    let store = LocalStore::new(args.storage_root);
    let buckets = if args.skip_reconcile {
        Vec::new()
    } else {
        store.buckets()?
    };
    let catalogue: Arc<dyn Catalogue> = match &args.catalogue_url {
        Some(url) => Arc::new(HttpCatalogue::new(url.as_str())?),
        None => Arc::new(NullCatalogue),
    };
    let publisher: Arc<dyn Publisher> = match args.results {
        Some(dir) => Arc::new(DirectoryPublisher::new(dir)?),
        None => Arc::new(JsonLinesPublisher::stdout()),
    };
    let workers = args.workers.unwrap_or(resolved.runtime.workers);
    let engine = Engine::new(
        Arc::new(resolved.registry),
        resolved.runtime.tracker.clone(),
        store,
        VerdictEmitter::new(publisher, catalogue),
        resolved.runtime.retry,
    );
    if !buckets.is_empty() {
        engine.reconcile(&buckets)?;
    }
    let report = pump(Arc::new(engine), workers, resolved.runtime.sweep_interval)?;
    tracing::info!(
        handled = report.handled,
        resolved = report.resolved,
        failed = report.failed,
        "input exhausted"
    );
    Ok(())
}

fn pump<H: NotificationHandler>(
    handler: Arc<H>,
    workers: usize,
    sweep_interval: std::time::Duration,
) -> miette::Result<DrainReport> {
    let sweeper = Sweeper::start(handler.clone(), sweep_interval);
    let pool = WorkerPool::start(handler, workers);

    for line in io::stdin().lock().lines() {
        let line = line.into_diagnostic()?;
        if line.trim().is_empty() {
            continue;
        }
        match Notification::from_event_json(&line) {
            Ok(notifications) => {
                for notification in notifications {
                    pool.submit(notification)?;
                }
            }
            Err(err) => tracing::warn!(error = %err, "skipping unreadable event"),
        }
    }

    let report = pool.drain();
    sweeper.stop();
    Ok(report)
}
