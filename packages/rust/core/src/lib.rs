//! Core ingestion logic for the GTFS ETL.
//!
//! This crate ties the feed, the archive and the system of record together:
//! statistics computation ([`stats`]), route record parsing ([`routes`]) and
//! the date-driven [`orchestrator`] with its Upload stage ([`upload`]).

pub mod orchestrator;
pub mod routes;
pub mod stats;
pub mod upload;

#[cfg(test)]
mod fixture_tests;

pub use orchestrator::{
    CleanupStats, Clock, IngestionOrchestrator, ProgressReporter, RunStats,
    SilentProgress, SystemClock,
};
pub use routes::parse_route_records;
pub use stats::{CommandStatsEngine, DailyStats, ROUTE_STATS_FILE, StatsEngine, StatsTable, TRIP_STATS_FILE};
