//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use gtfs_etl_archive::RetentionPolicy;
use gtfs_etl_core::{CommandStatsEngine, IngestionOrchestrator, ProgressReporter, RunStats};
use gtfs_etl_feed::{CloudObjectStore, HttpFeedSource};
use gtfs_etl_shared::{
    AppConfig, IngestionConfig, LedgerEntry, Stage, StageOutcome, expand_home, init_config,
    load_config, load_config_from,
};
use gtfs_etl_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

type Orchestrator = IngestionOrchestrator<HttpFeedSource, CommandStatsEngine, CloudObjectStore>;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// gtfs-etl: archive daily GTFS snapshots and build a temporal route history.
#[derive(Parser)]
#[command(
    name = "gtfs-etl",
    version,
    about = "Archive daily GTFS snapshots and build a temporal stop/route history.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.gtfs-etl/gtfs-etl.toml).
    #[arg(long, env = "GTFS_ETL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Download today's live snapshot, archive it and upload it.
    Download {
        /// Re-run even if today's upload already succeeded, overwriting remote objects.
        #[arg(long)]
        force: bool,
    },

    /// Compute the statistics of one date into the stat archive.
    Analyze {
        /// Date to analyze (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,

        /// Snapshot date to read from (defaults to --date).
        #[arg(long)]
        source_date: Option<NaiveDate>,
    },

    /// Load one date's route statistics into the entity store.
    Load {
        /// Date the statistics describe (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,

        /// Route stats file (defaults to the stat archive entry for --date).
        #[arg(long)]
        route_stats: Option<PathBuf>,
    },

    /// Upload today's snapshot, then process one date or catch up.
    Run {
        /// Process only this date.
        #[arg(long, conflicts_with = "last_days")]
        only_date: Option<NaiveDate>,

        /// Catch up at most this many days back from today.
        #[arg(long)]
        last_days: Option<u32>,

        /// Stop starting new dates after this many seconds.
        #[arg(long)]
        max_run_time_secs: Option<u64>,

        /// Skip the Upload stage.
        #[arg(long)]
        skip_upload: bool,
    },

    /// Apply the retention policy to the local archives.
    Cleanup {
        /// Keep every day of this recent window.
        #[arg(long)]
        num_days_keep: Option<u32>,

        /// Weekly snapshots to keep beyond the recent window.
        #[arg(long)]
        num_weeklies_keep: Option<u32>,
    },

    /// Show recent processing ledger entries.
    Status {
        /// Number of dates to show.
        #[arg(long, default_value = "14")]
        limit: u32,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Mark uploads found complete in the object store as succeeded.
    Reconcile {
        /// Days back from today to check.
        #[arg(long, default_value = "7")]
        last_days: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "gtfs_etl=info",
        1 => "gtfs_etl=debug",
        _ => "gtfs_etl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Download { force } => cmd_download(config_path, force).await,
        Command::Analyze { date, source_date } => cmd_analyze(config_path, date, source_date).await,
        Command::Load { date, route_stats } => {
            cmd_load(config_path, date, route_stats.as_deref()).await
        }
        Command::Run {
            only_date,
            last_days,
            max_run_time_secs,
            skip_upload,
        } => cmd_run(config_path, only_date, last_days, max_run_time_secs, skip_upload).await,
        Command::Cleanup {
            num_days_keep,
            num_weeklies_keep,
        } => cmd_cleanup(config_path, num_days_keep, num_weeklies_keep).await,
        Command::Status { limit, json } => cmd_status(config_path, limit, json).await,
        Command::Reconcile { last_days } => cmd_reconcile(config_path, last_days).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.storage.database_path);
    Ok(Storage::open(&path).await?)
}

async fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let ingestion = IngestionConfig::from(config);
    let storage = open_storage(config).await?;
    let feed = HttpFeedSource::from_config(&config.feed)?;
    let engine = CommandStatsEngine::from_config(&config.stats_engine, ingestion.workdir.join("stats"));
    let store = CloudObjectStore::from_config(&config.object_store)?;
    info!(
        archive = %ingestion.archive_root.display(),
        object_store = store.location(),
        "orchestrator ready"
    );
    Ok(IngestionOrchestrator::new(
        storage,
        feed,
        engine,
        store,
        ingestion,
        config.object_store.prefix.clone(),
    ))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_download(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config = read_config(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    let reporter = CliProgress::new();
    let ran = orchestrator.run_upload(force, &reporter).await;
    reporter.finish();

    if ran? {
        println!("Snapshot for {} downloaded and uploaded.", orchestrator.today());
    } else {
        println!(
            "Snapshot for {} already uploaded (use --force to redo).",
            orchestrator.today()
        );
    }
    Ok(())
}

async fn cmd_analyze(
    config_path: Option<&Path>,
    date: NaiveDate,
    source_date: Option<NaiveDate>,
) -> Result<()> {
    let config = read_config(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    let reporter = CliProgress::new();
    let result = orchestrator.analyze(date, source_date, &reporter).await;
    reporter.finish();

    let stats = result?;
    let (trips, trip_cols) = stats.trip_stats.shape();
    let (routes, route_cols) = stats.route_stats.shape();
    println!("Statistics for {date}:");
    println!("  Trip stats:  {trips} rows x {trip_cols} columns");
    println!("  Route stats: {routes} rows x {route_cols} columns");
    Ok(())
}

async fn cmd_load(config_path: Option<&Path>, date: NaiveDate, route_stats: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    let stats = orchestrator.load_route_stats(date, route_stats).await?;

    println!();
    println!("  Loaded {date}");
    println!("  Routes inserted: {}", stats.routes_inserted);
    println!("  Routes extended: {}", stats.routes_extended);
    println!("  Routes skipped:  {}", stats.routes_skipped);
    println!("  Rides inserted:  {}", stats.rides_inserted);
    println!("  Stops inserted:  {}", stats.stops_inserted);
    println!("  Stops extended:  {}", stats.stops_extended);
    println!();
    Ok(())
}

async fn cmd_run(
    config_path: Option<&Path>,
    only_date: Option<NaiveDate>,
    last_days: Option<u32>,
    max_run_time_secs: Option<u64>,
    skip_upload: bool,
) -> Result<()> {
    let config = read_config(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;
    let budget = max_run_time_secs.map(Duration::from_secs);

    info!(?only_date, ?last_days, skip_upload, "starting run");

    let reporter = CliProgress::new();
    let result = orchestrator
        .run(only_date, last_days, budget, skip_upload, &reporter)
        .await;
    reporter.finish();

    let stats = result?;
    print_run_summary(&stats);
    match stats.upload_error {
        Some(e) => Err(eyre!("upload stage failed: {e}")),
        None => Ok(()),
    }
}

async fn cmd_cleanup(
    config_path: Option<&Path>,
    num_days_keep: Option<u32>,
    num_weeklies_keep: Option<u32>,
) -> Result<()> {
    let config = read_config(config_path)?;
    let policy = RetentionPolicy {
        keep_last_days: num_days_keep.unwrap_or(config.archive.num_days_keep),
        keep_weeklies: num_weeklies_keep.unwrap_or(config.archive.num_weeklies_keep),
    };
    if policy.keep_last_days == 0 {
        return Err(eyre!("--num-days-keep must be at least 1"));
    }
    let orchestrator = build_orchestrator(&config).await?;

    let stats = orchestrator.cleanup(policy)?;
    for (name, archive) in [("gtfs", stats.gtfs_archive), ("stats", stats.stat_archive)] {
        println!(
            "  {name:<6} kept {} recent, {} weekly; deleted {} old, {} thinned",
            archive.kept_recent, archive.kept_weekly, archive.deleted_old, archive.deleted_thinned
        );
    }
    Ok(())
}

async fn cmd_status(config_path: Option<&Path>, limit: u32, json: bool) -> Result<()> {
    let config = read_config(config_path)?;
    let storage = Storage::open_readonly(&expand_home(&config.storage.database_path)).await?;
    let entries = storage.list_ledger_entries(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No dates recorded yet.");
        return Ok(());
    }

    println!(
        "{:<12} {:<16} {:<16} {:<12} ERROR",
        "DATE", "UPLOAD", "PROCESSING", "SOURCE"
    );
    for entry in &entries {
        print_status_row(entry);
    }
    Ok(())
}

fn print_status_row(entry: &LedgerEntry) {
    let source = entry
        .processing_used_source_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".into());
    let error = entry
        .processing
        .error
        .as_deref()
        .or(entry.upload.error.as_deref())
        .unwrap_or("");
    println!(
        "{:<12} {:<16} {:<16} {:<12} {}",
        entry.date,
        entry.stage(Stage::Upload).status().to_string(),
        entry.stage(Stage::Processing).status().to_string(),
        source,
        error
    );
}

async fn cmd_reconcile(config_path: Option<&Path>, last_days: u32) -> Result<()> {
    let config = read_config(config_path)?;
    let orchestrator = build_orchestrator(&config).await?;

    let marked = orchestrator.reconcile(last_days).await?;
    if marked.is_empty() {
        println!("Nothing to reconcile.");
    }
    for date in marked {
        println!("  Marked upload succeeded: {date}");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn describe_outcome(outcome: &StageOutcome) -> String {
    match outcome {
        StageOutcome::Success => "ok".to_string(),
        StageOutcome::PartialSuccess(warning) => format!("ok with warnings ({warning})"),
        StageOutcome::Failure(error) => format!("failed ({error})"),
    }
}

fn print_run_summary(stats: &RunStats) {
    println!();
    println!("  Run complete");
    println!("  Uploads:         {}", stats.upload_runs);
    if let Some(e) = &stats.upload_error {
        println!("  Upload failed:   {e}");
    }
    println!("  Dates processed: {}", stats.processed_dates);
    println!("  Routes inserted: {}", stats.routes_inserted);
    println!("  Routes extended: {}", stats.routes_extended);
    println!("  Routes skipped:  {}", stats.routes_skipped);
    println!("  Rides inserted:  {}", stats.rides_inserted);
    println!("  Stops inserted:  {}", stats.stops_inserted);
    println!("  Stops extended:  {}", stats.stops_extended);
    if stats.stopped_by_budget {
        println!("  Stopped early: run time budget exhausted.");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn stage_started(&self, date: NaiveDate, stage: Stage) {
        self.spinner.set_message(format!("{stage} {date}"));
    }

    fn stage_finished(&self, date: NaiveDate, stage: Stage, outcome: &StageOutcome) {
        self.spinner
            .println(format!("  {stage} {date}: {}", describe_outcome(outcome)));
    }

    fn done(&self, _stats: &RunStats) {
        self.finish();
    }
}
