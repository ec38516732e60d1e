//! Daily trip/route statistics: tables, on-disk format and the external engine.
//!
//! Tables are stored as gzip-compressed CSV under the stat archive
//! (`<root>/stat_archive/YYYY/MM/DD/{trip_stats,route_stats}.csv.gz`).

use std::fs::File;
use std::future::Future;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::NaiveDate;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use gtfs_etl_shared::{FileBundle, GtfsEtlError, Result, StatsEngineConfig};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const TRIP_STATS_FILE: &str = "trip_stats.csv.gz";
pub const ROUTE_STATS_FILE: &str = "route_stats.csv.gz";

/// A rectangular table of string cells with named columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StatsTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| GtfsEtlError::parse(format!("missing column {name}")))
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(GtfsEtlError::validation(format!(
                "row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn read_csv_gz(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| GtfsEtlError::io(path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(BufReader::new(GzDecoder::new(file)));

        let csv_err = |e: csv::Error| GtfsEtlError::parse(format!("{}: {e}", path.display()));
        let columns = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();
        let mut table = Self::new(columns);
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            table.rows.push(record.iter().map(str::to_string).collect());
        }
        debug!(path = %path.display(), shape = ?table.shape(), "read stats table");
        Ok(table)
    }

    pub fn write_csv_gz(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| GtfsEtlError::io(path, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut writer = csv::Writer::from_writer(encoder);

        let csv_err = |e: csv::Error| GtfsEtlError::validation(format!("{}: {e}", path.display()));
        writer.write_record(&self.columns).map_err(csv_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        let encoder = writer
            .into_inner()
            .map_err(|e| GtfsEtlError::validation(format!("{}: {e}", path.display())))?;
        encoder
            .finish()
            .and_then(|mut inner| inner.flush())
            .map_err(|e| GtfsEtlError::io(path, e))
    }
}

/// The engine's output for one date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyStats {
    pub trip_stats: StatsTable,
    pub route_stats: StatsTable,
}

impl DailyStats {
    pub fn read_from(dir: &Path) -> Result<Self> {
        Ok(Self {
            trip_stats: StatsTable::read_csv_gz(&dir.join(TRIP_STATS_FILE))?,
            route_stats: StatsTable::read_csv_gz(&dir.join(ROUTE_STATS_FILE))?,
        })
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| GtfsEtlError::io(dir, e))?;
        self.trip_stats.write_csv_gz(&dir.join(TRIP_STATS_FILE))?;
        self.route_stats.write_csv_gz(&dir.join(ROUTE_STATS_FILE))?;
        Ok(())
    }
}

/// Computes trip and route statistics from an extracted bundle.
pub trait StatsEngine: Send + Sync {
    fn compute_stats(
        &self,
        bundle: &FileBundle,
        date: NaiveDate,
    ) -> impl Future<Output = Result<DailyStats>> + Send;
}

/// Runs an external analyzer executable.
///
/// Invocation: `<program> <args..> --date YYYY-MM-DD --gtfs DIR --tariff DIR
/// --cluster-to-line DIR --trip-id-to-date DIR --output DIR`. The analyzer
/// must write `trip_stats.csv.gz` and `route_stats.csv.gz` into `--output`.
#[derive(Debug, Clone)]
pub struct CommandStatsEngine {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandStatsEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_config(config: &StatsEngineConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::new(config.program.clone(), config.args.clone(), scratch_dir)
    }

    fn command_args(&self, bundle: &FileBundle, date: NaiveDate, output: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        let path_arg = |p: &Path| p.display().to_string();
        args.extend([
            "--date".to_string(),
            date.to_string(),
            "--gtfs".to_string(),
            path_arg(&bundle.schedule_file),
            "--tariff".to_string(),
            path_arg(&bundle.fare_zone_file),
            "--cluster-to-line".to_string(),
            path_arg(&bundle.cluster_file),
            "--trip-id-to-date".to_string(),
            path_arg(&bundle.trip_date_map_file),
            "--output".to_string(),
            path_arg(output),
        ]);
        args
    }
}

impl StatsEngine for CommandStatsEngine {
    #[instrument(skip_all, fields(%date, program = %self.program))]
    async fn compute_stats(&self, bundle: &FileBundle, date: NaiveDate) -> Result<DailyStats> {
        let output_dir = self.scratch_dir.join(format!("stats-{date}-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&output_dir).map_err(|e| GtfsEtlError::io(&output_dir, e))?;

        info!("running stats engine");
        let output = Command::new(&self.program)
            .args(self.command_args(bundle, date, &output_dir))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                GtfsEtlError::Stats(format!(
                    "failed to spawn {}: {e}. Is `{}` installed?",
                    self.program, self.program
                ))
            })?;

        let result = if output.status.success() {
            DailyStats::read_from(&output_dir)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(GtfsEtlError::Stats(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )))
        };

        if let Err(e) = std::fs::remove_dir_all(&output_dir) {
            warn!(path = %output_dir.display(), error = %e, "failed to remove stats scratch dir");
        }
        if let Ok(stats) = &result {
            debug!(
                trip_stats = ?stats.trip_stats.shape(),
                route_stats = ?stats.route_stats.shape(),
                "stats computed"
            );
        }
        result
    }
}
