//! Shared types, error model, and configuration for the GTFS ETL.
//!
//! This crate is the foundation depended on by all other GTFS ETL crates.
//! It provides:
//! - [`GtfsEtlError`]: the unified error type
//! - Domain types ([`LedgerEntry`], [`FileBundle`], [`Stop`], [`RouteDailyRecord`])
//! - Configuration ([`AppConfig`], [`IngestionConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ArchiveConfig, FeedConfig, GTFS_ARCHIVE_FOLDER, IngestionConfig, ObjectStoreConfig,
    ProcessingConfig, STAT_ARCHIVE_FOLDER, StatsEngineConfig, StorageConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from, validate_config,
};
pub use error::{GtfsEtlError, Result};
pub use types::{
    BundleFile, DATE_PATH_FORMAT, FileBundle, LedgerEntry, RideRecord, Route, RouteDailyRecord,
    RouteKey, Stage, StageOutcome, StageRecord, StageStatus, Stop, StopObservation,
};
