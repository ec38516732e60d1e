//! Application configuration for the GTFS ETL.
//!
//! User config lives at `~/.gtfs-etl/gtfs-etl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{GtfsEtlError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "gtfs-etl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".gtfs-etl";

/// Folder under the archive root holding raw daily bundles.
pub const GTFS_ARCHIVE_FOLDER: &str = "gtfs_archive";

/// Folder under the archive root holding computed statistics.
pub const STAT_ARCHIVE_FOLDER: &str = "stat_archive";

// ---------------------------------------------------------------------------
// Config structs (matching gtfs-etl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub stats_engine: StatsEngineConfig,

    #[serde(default)]
    pub object_store: ObjectStoreConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file holding the ledger and entity store.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.gtfs-etl/gtfs-etl.db".into()
}

/// `[archive]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Root holding `gtfs_archive/` and `stat_archive/`.
    #[serde(default = "default_archive_root")]
    pub root_dir: String,

    /// Most recent dates always kept by cleanup.
    #[serde(default = "default_num_days_keep")]
    pub num_days_keep: u32,

    /// Weekly snapshots kept beyond the recent window.
    #[serde(default = "default_num_weeklies_keep")]
    pub num_weeklies_keep: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root_dir: default_archive_root(),
            num_days_keep: default_num_days_keep(),
            num_weeklies_keep: default_num_weeklies_keep(),
        }
    }
}

fn default_archive_root() -> String {
    ".data".into()
}
fn default_num_days_keep() -> u32 {
    5
}
fn default_num_weeklies_keep() -> u32 {
    4
}

/// `[feed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Live publisher serving today's snapshot.
    #[serde(default = "default_live_base_url")]
    pub live_base_url: String,

    /// Historical archive serving `<base>/YYYY/MM/DD/<file>`.
    #[serde(default = "default_archive_base_url")]
    pub archive_base_url: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Download attempts against the live publisher.
    #[serde(default = "default_live_attempts")]
    pub live_attempts: u32,

    /// Download attempts against the historical archive.
    #[serde(default = "default_archive_attempts")]
    pub archive_attempts: u32,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            live_base_url: default_live_base_url(),
            archive_base_url: default_archive_base_url(),
            timeout_secs: default_timeout_secs(),
            live_attempts: default_live_attempts(),
            archive_attempts: default_archive_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

fn default_live_base_url() -> String {
    "https://gtfs.mot.gov.il/gtfsfiles".into()
}
fn default_archive_base_url() -> String {
    "https://open-bus-gtfs-data.hasadna.org.il/gtfs_archive".into()
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_live_attempts() -> u32 {
    10
}
fn default_archive_attempts() -> u32 {
    1
}
fn default_retry_base_delay_secs() -> u64 {
    30
}
fn default_retry_max_delay_secs() -> u64 {
    240
}

/// `[processing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// How far back a missing snapshot may be substituted.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Oldest date bulk catch-up will consider.
    #[serde(default = "default_earliest_date")]
    pub earliest_date: NaiveDate,

    /// Wall-clock budget for a bulk run, checked between dates.
    #[serde(default = "default_max_run_time_secs")]
    pub max_run_time_secs: u64,

    /// Downloads retried when the bundle fails to extract.
    #[serde(default = "default_extraction_attempts")]
    pub extraction_attempts: u32,

    #[serde(default = "default_extraction_retry_secs")]
    pub extraction_retry_secs: u64,

    /// Known-bad dates whose secondary members may fail extraction.
    #[serde(default)]
    pub tolerated_extraction_failures: Vec<NaiveDate>,

    /// Scratch directory for extraction and statistics output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            earliest_date: default_earliest_date(),
            max_run_time_secs: default_max_run_time_secs(),
            extraction_attempts: default_extraction_attempts(),
            extraction_retry_secs: default_extraction_retry_secs(),
            tolerated_extraction_failures: Vec::new(),
            workdir: None,
        }
    }
}

fn default_lookback_days() -> u32 {
    10
}
fn default_earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 16).unwrap_or_default()
}
fn default_max_run_time_secs() -> u64 {
    55 * 60
}
fn default_extraction_attempts() -> u32 {
    10
}
fn default_extraction_retry_secs() -> u64 {
    120
}

/// `[stats_engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEngineConfig {
    /// Analyzer executable.
    #[serde(default = "default_stats_program")]
    pub program: String,

    /// Extra arguments placed before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for StatsEngineConfig {
    fn default() -> Self {
        Self {
            program: default_stats_program(),
            args: Vec::new(),
        }
    }
}

fn default_stats_program() -> String {
    "gtfs-stats".into()
}

/// `[object_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// `s3://bucket` or `file:///path` (a bare path is treated as local).
    #[serde(default = "default_object_store_url")]
    pub url: String,

    /// Key prefix in front of `YYYY/MM/DD/<file>`.
    #[serde(default = "default_object_store_prefix")]
    pub prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the env var holding the access key id (never store the key itself).
    #[serde(default = "default_access_key_id_env")]
    pub access_key_id_env: String,

    /// Name of the env var holding the secret access key.
    #[serde(default = "default_secret_access_key_env")]
    pub secret_access_key_env: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            url: default_object_store_url(),
            prefix: default_object_store_prefix(),
            region: None,
            endpoint: None,
            access_key_id_env: default_access_key_id_env(),
            secret_access_key_env: default_secret_access_key_env(),
        }
    }
}

fn default_object_store_url() -> String {
    "file://.data/object_store".into()
}
fn default_object_store_prefix() -> String {
    GTFS_ARCHIVE_FOLDER.into()
}
fn default_access_key_id_env() -> String {
    "GTFS_ETL_S3_ACCESS_KEY_ID".into()
}
fn default_secret_access_key_env() -> String {
    "GTFS_ETL_S3_SECRET_ACCESS_KEY".into()
}

impl ObjectStoreConfig {
    pub fn is_s3(&self) -> bool {
        self.url.starts_with("s3://")
    }

    /// Read the credentials named by the config from the environment.
    pub fn credentials(&self) -> Result<(String, String)> {
        Ok((
            read_env(&self.access_key_id_env)?,
            read_env(&self.secret_access_key_env)?,
        ))
    }
}

fn read_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(GtfsEtlError::config(format!(
            "object store credentials not found. Set the {var_name} environment variable."
        ))),
    }
}

// ---------------------------------------------------------------------------
// Ingestion config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration handed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Root holding the dated archives.
    pub archive_root: PathBuf,
    /// Scratch space for per-date work directories.
    pub workdir: PathBuf,
    pub lookback_days: u32,
    pub earliest_date: NaiveDate,
    pub max_run_time: Duration,
    pub extraction_attempts: u32,
    pub extraction_retry: Duration,
    pub tolerated_extraction_failures: Vec<NaiveDate>,
    pub num_days_keep: u32,
    pub num_weeklies_keep: u32,
}

impl IngestionConfig {
    pub fn gtfs_archive_dir(&self) -> PathBuf {
        self.archive_root.join(GTFS_ARCHIVE_FOLDER)
    }

    pub fn stat_archive_dir(&self) -> PathBuf {
        self.archive_root.join(STAT_ARCHIVE_FOLDER)
    }

    pub fn tolerates_extraction_failure(&self, date: NaiveDate) -> bool {
        self.tolerated_extraction_failures.contains(&date)
    }
}

impl From<&AppConfig> for IngestionConfig {
    fn from(config: &AppConfig) -> Self {
        let workdir = match &config.processing.workdir {
            Some(dir) => expand_home(dir),
            None => std::env::temp_dir().join("gtfs-etl"),
        };
        Self {
            archive_root: expand_home(&config.archive.root_dir),
            workdir,
            lookback_days: config.processing.lookback_days,
            earliest_date: config.processing.earliest_date,
            max_run_time: Duration::from_secs(config.processing.max_run_time_secs),
            extraction_attempts: config.processing.extraction_attempts,
            extraction_retry: Duration::from_secs(config.processing.extraction_retry_secs),
            tolerated_extraction_failures: config.processing.tolerated_extraction_failures.clone(),
            num_days_keep: config.archive.num_days_keep,
            num_weeklies_keep: config.archive.num_weeklies_keep,
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.gtfs-etl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| GtfsEtlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.gtfs-etl/gtfs-etl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GtfsEtlError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| GtfsEtlError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GtfsEtlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GtfsEtlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.feed.live_attempts == 0 || config.feed.archive_attempts == 0 {
        return Err(GtfsEtlError::config("feed attempts must be at least 1"));
    }
    if config.processing.extraction_attempts == 0 {
        return Err(GtfsEtlError::config("extraction_attempts must be at least 1"));
    }
    if config.archive.num_days_keep == 0 {
        return Err(GtfsEtlError::config("num_days_keep must be at least 1"));
    }
    Ok(())
}
