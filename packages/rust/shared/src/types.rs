//! Core domain types shared across the GTFS ETL crates.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Path layout used for dated directories and object keys (`YYYY/MM/DD`).
pub const DATE_PATH_FORMAT: &str = "%Y/%m/%d";

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The two independently tracked pipeline stages of a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Download from the live publisher and upload to the object store.
    Upload,
    /// Retrieve, extract, compute statistics and load into the entity store.
    Processing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Processing => "processing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Succeeded with a tolerated problem; the warning is kept as the error text.
    PartialSuccess(String),
    Failure(String),
}

/// Observable state of one stage for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NeverAttempted,
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NeverAttempted => "never-attempted",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Started/completed timestamps and tri-state success for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `None` means never completed since the last start.
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl StageRecord {
    pub fn status(&self) -> StageStatus {
        match (self.started_at, self.success) {
            (_, Some(true)) => StageStatus::Succeeded,
            (_, Some(false)) => StageStatus::Failed,
            (Some(_), None) => StageStatus::InProgress,
            (None, None) => StageStatus::NeverAttempted,
        }
    }
}

/// One row of the processing ledger: the durable per-date progress record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub date: NaiveDate,
    pub upload: StageRecord,
    pub processing: StageRecord,
    /// Set when processing used another date's snapshot.
    pub processing_used_source_date: Option<NaiveDate>,
}

impl LedgerEntry {
    pub fn stage(&self, stage: Stage) -> &StageRecord {
        match stage {
            Stage::Upload => &self.upload,
            Stage::Processing => &self.processing,
        }
    }

    pub fn succeeded(&self, stage: Stage) -> bool {
        self.stage(stage).success == Some(true)
    }
}

// ---------------------------------------------------------------------------
// FileBundle
// ---------------------------------------------------------------------------

/// The four members of a daily snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BundleFile {
    Schedule,
    FareZones,
    Clusters,
    TripDateMap,
}

impl BundleFile {
    pub const ALL: [BundleFile; 4] = [
        BundleFile::Schedule,
        BundleFile::FareZones,
        BundleFile::Clusters,
        BundleFile::TripDateMap,
    ];

    /// File name as published and archived.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Schedule => "israel-public-transportation.zip",
            Self::FareZones => "Tariff.zip",
            Self::Clusters => "ClusterToLine.zip",
            Self::TripDateMap => "TripIdToDate.zip",
        }
    }

    /// Directory name the member is extracted into.
    pub fn extract_dir_name(&self) -> &'static str {
        match self {
            Self::Schedule => "gtfs",
            Self::FareZones => "tariff",
            Self::Clusters => "cluster_to_line",
            Self::TripDateMap => "trip_id_to_date",
        }
    }
}

impl std::fmt::Display for BundleFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Paths of one date's snapshot members (archives, or their extracted directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBundle {
    pub schedule_file: PathBuf,
    pub fare_zone_file: PathBuf,
    pub cluster_file: PathBuf,
    pub trip_date_map_file: PathBuf,
}

impl FileBundle {
    /// Bundle of the canonical member file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            schedule_file: dir.join(BundleFile::Schedule.file_name()),
            fare_zone_file: dir.join(BundleFile::FareZones.file_name()),
            cluster_file: dir.join(BundleFile::Clusters.file_name()),
            trip_date_map_file: dir.join(BundleFile::TripDateMap.file_name()),
        }
    }

    pub fn path(&self, member: BundleFile) -> &Path {
        match member {
            BundleFile::Schedule => &self.schedule_file,
            BundleFile::FareZones => &self.fare_zone_file,
            BundleFile::Clusters => &self.cluster_file,
            BundleFile::TripDateMap => &self.trip_date_map_file,
        }
    }

    pub fn files(&self) -> impl Iterator<Item = (BundleFile, &Path)> {
        BundleFile::ALL.into_iter().map(|m| (m, self.path(m)))
    }

    /// Members whose path does not exist on disk.
    pub fn missing(&self) -> Vec<BundleFile> {
        self.files()
            .filter(|(_, p)| !p.exists())
            .map(|(m, _)| m)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Versioned entities
// ---------------------------------------------------------------------------

/// One day's observation of a stop, as read from the route statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StopObservation {
    pub code: String,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
    pub city: String,
}

/// A stored stop version, valid over `[min_date, max_date]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stop {
    pub id: i64,
    pub code: String,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
    pub city: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
}

impl Stop {
    pub fn same_attributes(&self, obs: &StopObservation) -> bool {
        self.lat == obs.lat && self.lon == obs.lon && self.name == obs.name && self.city == obs.city
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.min_date <= date && date <= self.max_date
    }
}

/// Natural identity of a route across versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteKey {
    pub mkt: i64,
    pub direction: i64,
    pub alternative: String,
    pub operator_ref: i64,
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.mkt, self.direction, self.alternative, self.operator_ref
        )
    }
}

/// A scheduled ride of a route.
#[derive(Debug, Clone, PartialEq)]
pub struct RideRecord {
    pub journey_ref: String,
    pub scheduled_start_time: DateTime<Utc>,
}

/// One date's full definition of a route: ordered stops and rides.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDailyRecord {
    pub date: NaiveDate,
    pub key: RouteKey,
    pub line_ref: i64,
    pub short_name: String,
    pub long_name: String,
    pub agency_name: String,
    pub route_type: i64,
    pub stops: Vec<StopObservation>,
    pub rides: Vec<RideRecord>,
}

/// A stored route version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub id: i64,
    pub key: RouteKey,
    pub line_ref: i64,
    pub short_name: String,
    pub long_name: String,
    pub agency_name: String,
    pub route_type: i64,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_from_record() {
        let mut rec = StageRecord::default();
        assert_eq!(rec.status(), StageStatus::NeverAttempted);

        rec.started_at = Some(Utc::now());
        assert_eq!(rec.status(), StageStatus::InProgress);

        rec.success = Some(false);
        assert_eq!(rec.status(), StageStatus::Failed);

        rec.success = Some(true);
        assert_eq!(rec.status(), StageStatus::Succeeded);
    }

    #[test]
    fn bundle_paths_use_published_names() {
        let bundle = FileBundle::in_dir(Path::new("/data/2024/03/10"));
        assert_eq!(
            bundle.path(BundleFile::FareZones),
            Path::new("/data/2024/03/10/Tariff.zip")
        );
        assert_eq!(bundle.files().count(), 4);
        assert_eq!(bundle.missing().len(), 4);
    }

    #[test]
    fn stop_attribute_comparison() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let stop = Stop {
            id: 1,
            code: "21472".into(),
            lat: 32.1,
            lon: 34.9,
            name: "Ben Yehuda".into(),
            city: "Kfar Saba".into(),
            min_date: date,
            max_date: date,
        };
        let mut obs = StopObservation {
            code: "21472".into(),
            lat: 32.1,
            lon: 34.9,
            name: "Ben Yehuda".into(),
            city: "Kfar Saba".into(),
        };
        assert!(stop.same_attributes(&obs));
        obs.lat = 32.2;
        assert!(!stop.same_attributes(&obs));
        assert!(stop.covers(date));
        assert!(!stop.covers(date.succ_opt().unwrap()));
    }
}
