//! Regression pins against a real snapshot and analyzer.
//!
//! Requires `GTFS_ETL_FIXTURE_DIR` (a directory holding the four bundle
//! archives of 2019-03-07) and the analyzer named by `GTFS_ETL_STATS_PROGRAM`
//! (default `gtfs-stats`) on the path. Run with `cargo test -- --ignored`.

use std::path::PathBuf;

use chrono::NaiveDate;
use gtfs_etl_archive::extract_bundle;
use gtfs_etl_shared::FileBundle;
use uuid::Uuid;

use crate::routes::parse_route_records;
use crate::stats::{CommandStatsEngine, StatsEngine};

#[tokio::test]
#[ignore = "needs GTFS_ETL_FIXTURE_DIR and an installed analyzer"]
async fn fixture_2019_03_07_shapes() {
    let fixture = PathBuf::from(std::env::var("GTFS_ETL_FIXTURE_DIR").expect("GTFS_ETL_FIXTURE_DIR"));
    let program = std::env::var("GTFS_ETL_STATS_PROGRAM").unwrap_or_else(|_| "gtfs-stats".into());
    let work = std::env::temp_dir().join(format!("gtfs_etl_fixture_{}", Uuid::now_v7()));
    let date = NaiveDate::from_ymd_opt(2019, 3, 7).unwrap();

    let extracted = extract_bundle(&FileBundle::in_dir(&fixture), &work.join("extracted"), false).unwrap();
    let engine = CommandStatsEngine::new(program, Vec::new(), work.join("stats"));
    let stats = engine.compute_stats(&extracted.bundle, date).await.unwrap();

    assert_eq!(stats.trip_stats.shape(), (74, 49));
    assert_eq!(stats.route_stats.shape(), (3, 58));
    assert_eq!(parse_route_records(&stats.route_stats, date).unwrap().len(), 3);
}
