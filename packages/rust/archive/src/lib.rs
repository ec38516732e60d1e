//! Dated on-disk archive of daily snapshots.
//!
//! Layout: `<root>/YYYY/MM/DD/<file>`. A date directory exists only while
//! the retention policy ([`retention`]) keeps it.

pub mod extract;
pub mod metadata;
pub mod retention;

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use gtfs_etl_shared::{DATE_PATH_FORMAT, FileBundle, GtfsEtlError, Result};
use tracing::debug;

pub use extract::{ExtractedBundle, extract_bundle, verify_bundle};
pub use metadata::{BundleMetadata, FileDigest, METADATA_FILE_NAME};
pub use retention::{CompactionStats, RetentionPlan, RetentionPolicy, compact};

/// A directory tree of per-date folders.
#[derive(Debug, Clone)]
pub struct DatedArchive {
    root: PathBuf,
}

impl DatedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/YYYY/MM/DD`.
    pub fn date_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format(DATE_PATH_FORMAT).to_string())
    }

    pub fn file_path(&self, date: NaiveDate, file_name: &str) -> PathBuf {
        self.date_dir(date).join(file_name)
    }

    /// Create the directory for `date` if needed and return it.
    pub fn ensure_date_dir(&self, date: NaiveDate) -> Result<PathBuf> {
        let dir = self.date_dir(date);
        std::fs::create_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;
        Ok(dir)
    }

    /// The bundle for `date`, if every member is present locally.
    pub fn complete_bundle(&self, date: NaiveDate) -> Option<FileBundle> {
        let bundle = FileBundle::in_dir(&self.date_dir(date));
        bundle.missing().is_empty().then_some(bundle)
    }

    /// All dates with a directory, ascending. Entries that are not three
    /// numeric levels forming a valid date are ignored.
    pub fn dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        for (year, year_path) in numeric_subdirs(&self.root)? {
            for (month, month_path) in numeric_subdirs(&year_path)? {
                for (day, _) in numeric_subdirs(&month_path)? {
                    if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) {
                        dates.push(date);
                    }
                }
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Recursively delete the directory for `date`, then any parents left empty.
    pub fn remove_date(&self, date: NaiveDate) -> Result<()> {
        let dir = self.date_dir(date);
        std::fs::remove_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;

        let month_dir = self.root.join(format!("{:04}/{:02}", date.year(), date.month()));
        let year_dir = self.root.join(format!("{:04}", date.year()));
        for parent in [month_dir, year_dir] {
            // Stops at the first parent that still has entries.
            if std::fs::remove_dir(&parent).is_err() {
                break;
            }
        }
        debug!(%date, path = %dir.display(), "removed dated directory");
        Ok(())
    }
}

/// Subdirectories of `dir` whose names parse as integers.
fn numeric_subdirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GtfsEtlError::io(dir, e)),
    };

    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| GtfsEtlError::io(dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            result.push((n, path));
        }
    }
    Ok(result)
}


#[cfg(test)]
mod tests {
    use gtfs_etl_shared::BundleFile;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn date_dir_layout() {
        let archive = DatedArchive::new("/data/gtfs_archive");
        assert_eq!(
            archive.date_dir(d(2024, 3, 7)),
            PathBuf::from("/data/gtfs_archive/2024/03/07")
        );
        assert_eq!(
            archive.file_path(d(2024, 3, 7), "Tariff.zip"),
            PathBuf::from("/data/gtfs_archive/2024/03/07/Tariff.zip")
        );
    }

    #[test]
    fn scan_ignores_non_date_entries() {
        let root = test_support::temp_root("scan");
        let archive = DatedArchive::new(&root);
        archive.ensure_date_dir(d(2024, 3, 7)).unwrap();
        archive.ensure_date_dir(d(2023, 12, 31)).unwrap();
        std::fs::create_dir_all(root.join("2024/02/30")).unwrap();
        std::fs::create_dir_all(root.join("tmp/01/01")).unwrap();
        std::fs::write(root.join("2024/03/notes.txt"), "x").unwrap();

        assert_eq!(archive.dates().unwrap(), vec![d(2023, 12, 31), d(2024, 3, 7)]);
    }

    #[test]
    fn missing_root_has_no_dates() {
        let archive = DatedArchive::new(std::env::temp_dir().join("gtfs_etl_does_not_exist_xyz"));
        assert!(archive.dates().unwrap().is_empty());
    }

    #[test]
    fn remove_date_prunes_empty_parents() {
        let root = test_support::temp_root("remove");
        let archive = DatedArchive::new(&root);
        archive.ensure_date_dir(d(2024, 3, 7)).unwrap();
        archive.ensure_date_dir(d(2024, 3, 8)).unwrap();

        archive.remove_date(d(2024, 3, 7)).unwrap();
        assert!(!archive.date_dir(d(2024, 3, 7)).is_dir());
        assert!(root.join("2024/03").is_dir());

        archive.remove_date(d(2024, 3, 8)).unwrap();
        assert!(!root.join("2024").exists());
    }

    #[test]
    fn complete_bundle_requires_all_members() {
        let root = test_support::temp_root("bundle");
        let archive = DatedArchive::new(&root);
        let dir = archive.ensure_date_dir(d(2024, 3, 7)).unwrap();
        for member in &BundleFile::ALL[..3] {
            std::fs::write(dir.join(member.file_name()), b"zip").unwrap();
        }
        assert!(archive.complete_bundle(d(2024, 3, 7)).is_none());

        std::fs::write(dir.join(BundleFile::TripDateMap.file_name()), b"zip").unwrap();
        let bundle = archive.complete_bundle(d(2024, 3, 7)).unwrap();
        assert_eq!(bundle.trip_date_map_file, dir.join("TripIdToDate.zip"));
    }
}
