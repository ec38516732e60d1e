//! Date-driven ingestion: the per-date Upload/Processing state machine,
//! source-date fallback and bulk catch-up.
//!
//! Every stage run is bracketed by [`Storage::begin_stage`] and
//! [`Storage::complete_stage`]; a failure is written to the ledger before it
//! is returned, leaving the date eligible for the next run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use gtfs_etl_archive::{CompactionStats, DatedArchive, RetentionPolicy, compact, extract_bundle};
use gtfs_etl_feed::{FeedSource, ObjectStore};
use gtfs_etl_shared::{
    FileBundle, GtfsEtlError, IngestionConfig, Result, Stage, StageOutcome,
};
use gtfs_etl_storage::{LoadStats, Storage};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::routes::parse_route_records;
use crate::stats::{DailyStats, ROUTE_STATS_FILE, StatsEngine, StatsTable};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "today".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Progress and statistics
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    fn stage_started(&self, date: NaiveDate, stage: Stage);
    fn stage_finished(&self, date: NaiveDate, stage: Stage, outcome: &StageOutcome);
    /// Called when the run completes.
    fn done(&self, stats: &RunStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn stage_started(&self, _date: NaiveDate, _stage: Stage) {}
    fn stage_finished(&self, _date: NaiveDate, _stage: Stage, _outcome: &StageOutcome) {}
    fn done(&self, _stats: &RunStats) {}
}

/// Counters for one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub upload_runs: usize,
    /// Set when today's Upload stage failed; processing still ran.
    pub upload_error: Option<String>,
    pub processed_dates: usize,
    pub routes_inserted: usize,
    pub routes_extended: usize,
    pub routes_skipped: usize,
    pub rides_inserted: usize,
    pub stops_inserted: usize,
    pub stops_extended: usize,
    pub stopped_by_budget: bool,
}

impl RunStats {
    fn record_load(&mut self, load: &LoadStats) {
        self.processed_dates += 1;
        self.routes_inserted += load.routes_inserted;
        self.routes_extended += load.routes_extended;
        self.routes_skipped += load.routes_skipped;
        self.rides_inserted += load.rides_inserted;
        self.stops_inserted += load.stops_inserted;
        self.stops_extended += load.stops_extended;
    }
}

/// Retention results for both dated archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub gtfs_archive: CompactionStats,
    pub stat_archive: CompactionStats,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives dates through the Upload and Processing stages.
pub struct IngestionOrchestrator<F, E, O> {
    pub(crate) storage: Storage,
    pub(crate) feed: F,
    pub(crate) engine: E,
    pub(crate) store: O,
    pub(crate) config: IngestionConfig,
    pub(crate) object_prefix: String,
    pub(crate) clock: Box<dyn Clock>,
}

impl<F, E, O> IngestionOrchestrator<F, E, O>
where
    F: FeedSource,
    E: StatsEngine,
    O: ObjectStore,
{
    pub fn new(
        storage: Storage,
        feed: F,
        engine: E,
        store: O,
        config: IngestionConfig,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            feed,
            engine,
            store,
            config,
            object_prefix: object_prefix.into(),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Full idempotent run: the Upload stage for today (unless skipped),
    /// then one date or a bulk catch-up.
    ///
    /// An Upload failure does not stop processing; it is recorded in the
    /// ledger and reported through [`RunStats::upload_error`].
    pub async fn run(
        &self,
        only_date: Option<NaiveDate>,
        last_days: Option<u32>,
        budget: Option<Duration>,
        skip_upload: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<RunStats> {
        let upload = if skip_upload {
            Ok(false)
        } else {
            self.run_upload(false, progress).await
        };
        let (uploaded, upload_error) = match upload {
            Ok(uploaded) => (uploaded, None),
            Err(e) => {
                error!(date = %self.today(), error = %e, "upload stage failed, processing from earlier snapshots");
                (true, Some(e.to_string()))
            }
        };

        let mut stats = match only_date {
            Some(date) => self.run_only_date(date, progress).await?,
            None => {
                let budget = budget.unwrap_or(self.config.max_run_time);
                self.run_bulk(last_days, budget, progress).await?
            }
        };
        stats.upload_runs = usize::from(uploaded);
        stats.upload_error = upload_error;
        info!(?stats, "run complete");
        progress.done(&stats);
        Ok(stats)
    }

    /// Whether `date` needs processing and, if so, from which source date.
    ///
    /// Fails with [`GtfsEtlError::NoSourceDate`] when no upload succeeded
    /// within the lookback window.
    pub async fn check_date(&self, date: NaiveDate) -> Result<Option<NaiveDate>> {
        let processed = self
            .storage
            .get_ledger_entry(date)
            .await?
            .is_some_and(|entry| entry.succeeded(Stage::Processing));
        if processed {
            return Ok(None);
        }
        match self
            .storage
            .find_upload_source(date, self.config.lookback_days)
            .await?
        {
            Some(source) => Ok(Some(source)),
            None => Err(GtfsEtlError::NoSourceDate {
                date,
                lookback_days: self.config.lookback_days,
            }),
        }
    }

    /// Process `date` if it needs it. Returns the load counters, or `None`
    /// when the date was already processed.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn process_date(
        &self,
        date: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<LoadStats>> {
        let Some(source) = self.check_date(date).await? else {
            return Ok(None);
        };
        if source != date {
            info!(%source, "processing from an earlier snapshot");
        }
        self.run_processing(date, source, progress).await.map(Some)
    }

    pub async fn run_only_date(&self, date: NaiveDate, progress: &dyn ProgressReporter) -> Result<RunStats> {
        let mut stats = RunStats::default();
        match self.process_date(date, progress).await? {
            Some(load) => stats.record_load(&load),
            None => info!(%date, "already processed"),
        }
        Ok(stats)
    }

    /// Catch up from today backwards. After each processed date the scan
    /// restarts from today, so recent dates always win over backlog. The
    /// budget is checked only between dates; the first failure aborts.
    #[instrument(skip_all, fields(?last_days, budget_secs = budget.as_secs()))]
    pub async fn run_bulk(
        &self,
        last_days: Option<u32>,
        budget: Duration,
        progress: &dyn ProgressReporter,
    ) -> Result<RunStats> {
        let started = Instant::now();
        let today = self.today();
        let earliest = match last_days {
            Some(days) => today - chrono::Duration::days(i64::from(days)),
            None => self.config.earliest_date,
        };

        let mut stats = RunStats::default();
        progress.phase("Catching up");
        loop {
            let processed = 'scan: {
                for date in dates_descending(today, earliest) {
                    if let Some(load) = self.process_date(date, progress).await? {
                        stats.record_load(&load);
                        break 'scan true;
                    }
                }
                false
            };
            if !processed {
                break;
            }
            if started.elapsed() >= budget {
                warn!(
                    elapsed_secs = started.elapsed().as_secs(),
                    processed = stats.processed_dates,
                    "run time budget exhausted"
                );
                stats.stopped_by_budget = true;
                break;
            }
        }
        Ok(stats)
    }

    async fn run_processing(
        &self,
        date: NaiveDate,
        source: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<LoadStats> {
        let used_source = (source != date).then_some(source);
        let id = self
            .storage
            .begin_stage(date, Stage::Processing, used_source)
            .await?;
        progress.stage_started(date, Stage::Processing);

        let result = self.retrieve_and_load(date, source, progress).await;
        match result {
            Ok((outcome, load)) => {
                self.storage
                    .complete_stage(id, Stage::Processing, &outcome)
                    .await?;
                progress.stage_finished(date, Stage::Processing, &outcome);
                info!(%date, %source, ?load, "processing succeeded");
                Ok(load)
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(%date, %source, error = %e, "processing needs operator intervention");
                }
                let outcome = StageOutcome::Failure(e.to_string());
                self.record_failure(id, date, Stage::Processing, &outcome).await;
                progress.stage_finished(date, Stage::Processing, &outcome);
                Err(e)
            }
        }
    }

    pub(crate) async fn record_failure(&self, id: i64, date: NaiveDate, stage: Stage, outcome: &StageOutcome) {
        if let Err(ledger_err) = self.storage.complete_stage(id, stage, outcome).await {
            error!(%date, %stage, error = %ledger_err, "failed to record stage failure");
        }
    }

    async fn retrieve_and_load(
        &self,
        date: NaiveDate,
        source: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<(StageOutcome, LoadStats)> {
        let (stats, warnings) = self.materialize_stats(date, source, progress).await?;

        progress.phase("Loading routes");
        let records = parse_route_records(&stats.route_stats, date)?;
        let load = self.storage.load_day(date, &records).await?;

        let outcome = if warnings.is_empty() {
            StageOutcome::Success
        } else {
            StageOutcome::PartialSuccess(warnings.join("; "))
        };
        Ok((outcome, load))
    }

    /// Retrieve the snapshot of `source`, extract it, compute statistics for
    /// `date` and write them to the stat archive.
    async fn materialize_stats(
        &self,
        date: NaiveDate,
        source: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<(DailyStats, Vec<String>)> {
        let scratch = self.scratch_dir("process", date)?;
        let result = async {
            progress.phase("Retrieving snapshot");
            let bundle = self.retrieve(source, &scratch.join("download")).await?;

            progress.phase("Extracting");
            let tolerate = self.config.tolerates_extraction_failure(date);
            let extracted = extract_bundle(&bundle, &scratch.join("extracted"), tolerate)?;

            progress.phase("Computing statistics");
            let stats = self.engine.compute_stats(&extracted.bundle, date).await?;
            let dir = DatedArchive::new(self.config.stat_archive_dir()).ensure_date_dir(date)?;
            stats.write_to(&dir)?;
            info!(
                %date,
                trip_stats = ?stats.trip_stats.shape(),
                route_stats = ?stats.route_stats.shape(),
                "statistics archived"
            );
            Ok((stats, extracted.warnings))
        }
        .await;
        remove_scratch(&scratch);
        result
    }

    /// The local archive copy of `source` if complete, else a download from
    /// the historical archive.
    async fn retrieve(&self, source: NaiveDate, dest: &Path) -> Result<FileBundle> {
        let archive = DatedArchive::new(self.config.gtfs_archive_dir());
        if let Some(bundle) = archive.complete_bundle(source) {
            info!(%source, "using locally archived snapshot");
            return Ok(bundle);
        }
        self.feed.fetch_archived(source, dest).await
    }

    /// Compute and archive statistics without loading them.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn analyze(
        &self,
        date: NaiveDate,
        source_date: Option<NaiveDate>,
        progress: &dyn ProgressReporter,
    ) -> Result<DailyStats> {
        let (stats, warnings) = self
            .materialize_stats(date, source_date.unwrap_or(date), progress)
            .await?;
        for warning in warnings {
            warn!(%date, %warning, "tolerated extraction failure");
        }
        Ok(stats)
    }

    /// Load a route statistics table into the entity store. Defaults to the
    /// table archived for `date`.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn load_route_stats(&self, date: NaiveDate, path: Option<&Path>) -> Result<LoadStats> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => DatedArchive::new(self.config.stat_archive_dir()).file_path(date, ROUTE_STATS_FILE),
        };
        if !path.is_file() {
            return Err(GtfsEtlError::validation(format!(
                "no route stats at {}; run analyze for {date} first",
                path.display()
            )));
        }
        let table = StatsTable::read_csv_gz(&path)?;
        let records = parse_route_records(&table, date)?;
        self.storage.load_day(date, &records).await
    }

    /// Apply the retention policy to the raw and the statistics archives.
    pub fn cleanup(&self, policy: RetentionPolicy) -> Result<CleanupStats> {
        let today = self.today();
        Ok(CleanupStats {
            gtfs_archive: compact(&DatedArchive::new(self.config.gtfs_archive_dir()), policy, today)?,
            stat_archive: compact(&DatedArchive::new(self.config.stat_archive_dir()), policy, today)?,
        })
    }

    /// Fresh per-date scratch directory under the configured workdir.
    pub(crate) fn scratch_dir(&self, label: &str, date: NaiveDate) -> Result<PathBuf> {
        let dir = self.config.workdir.join(format!("{label}-{date}"));
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;
        Ok(dir)
    }
}

/// `from`, the day before, and so on down to `to` inclusive.
fn dates_descending(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(from), |d| d.pred_opt()).take_while(move |d| *d >= to)
}

pub(crate) fn remove_scratch(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %e, "failed to remove scratch dir");
    }
}
