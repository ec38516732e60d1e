//! Bundle verification and extraction.
//!
//! Every member is a zip archive. Reading each entry to the end checks its
//! CRC, so a truncated or corrupt download surfaces as an
//! [`GtfsEtlError::ExtractionFailure`] rather than later in the pipeline.

use std::fs::File;
use std::io;
use std::path::Path;

use gtfs_etl_shared::{BundleFile, FileBundle, GtfsEtlError, Result};
use tracing::{debug, instrument, warn};
use zip::ZipArchive;

/// Extracted member directories plus any tolerated failures.
#[derive(Debug, Clone)]
pub struct ExtractedBundle {
    /// Paths point at the per-member extraction directories.
    pub bundle: FileBundle,
    pub warnings: Vec<String>,
}

impl ExtractedBundle {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Check that every member opens as a non-empty zip with valid entries.
pub fn verify_bundle(bundle: &FileBundle) -> Result<()> {
    for (member, path) in bundle.files() {
        let mut archive = open_archive(member, path)?;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| member_error(member, path, e))?;
            io::copy(&mut entry, &mut io::sink()).map_err(|e| member_error(member, path, e))?;
        }
        debug!(%member, entries = archive.len(), "member verified");
    }
    Ok(())
}

/// Extract each member into `dest/<member dir>`.
///
/// With `tolerate_secondary`, a failing member other than the schedule is
/// logged and left as an empty directory; the schedule must always extract.
#[instrument(skip_all, fields(dest = %dest.display()))]
pub fn extract_bundle(bundle: &FileBundle, dest: &Path, tolerate_secondary: bool) -> Result<ExtractedBundle> {
    let mut warnings = Vec::new();
    let mut dirs = Vec::with_capacity(BundleFile::ALL.len());

    for (member, path) in bundle.files() {
        let dir = dest.join(member.extract_dir_name());
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| GtfsEtlError::io(&dir, e))?;

        match extract_member(member, path, &dir) {
            Ok(entries) => debug!(%member, entries, "member extracted"),
            Err(e) if tolerate_secondary && member != BundleFile::Schedule => {
                warn!(%member, error = %e, "tolerating extraction failure");
                warnings.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
        dirs.push(dir);
    }

    let [schedule_file, fare_zone_file, cluster_file, trip_date_map_file]: [_; 4] = dirs
        .try_into()
        .map_err(|_| GtfsEtlError::extraction("bundle member count changed during extraction"))?;
    Ok(ExtractedBundle {
        bundle: FileBundle {
            schedule_file,
            fare_zone_file,
            cluster_file,
            trip_date_map_file,
        },
        warnings,
    })
}

fn extract_member(member: BundleFile, path: &Path, dir: &Path) -> Result<usize> {
    let mut archive = open_archive(member, path)?;
    let entries = archive.len();
    archive
        .extract(dir)
        .map_err(|e| member_error(member, path, e))?;
    Ok(entries)
}

fn open_archive(member: BundleFile, path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| member_error(member, path, e))?;
    let archive = ZipArchive::new(file).map_err(|e| member_error(member, path, e))?;
    if archive.is_empty() {
        return Err(GtfsEtlError::extraction(format!(
            "{member} at {} has no entries",
            path.display()
        )));
    }
    Ok(archive)
}

fn member_error(member: BundleFile, path: &Path, e: impl std::fmt::Display) -> GtfsEtlError {
    GtfsEtlError::extraction(format!("{member} at {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use crate::test_support::temp_root;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn valid_bundle(label: &str) -> FileBundle {
        let dir = temp_root(label);
        let bundle = FileBundle::in_dir(&dir);
        for (member, path) in bundle.files() {
            write_zip(path, &[(&format!("{}.txt", member.extract_dir_name()), "id\n1\n")]);
        }
        bundle
    }

    #[test]
    fn verifies_and_extracts_valid_bundle() {
        let bundle = valid_bundle("extract_ok");
        verify_bundle(&bundle).unwrap();

        let dest = temp_root("extract_ok_dest");
        let extracted = extract_bundle(&bundle, &dest, false).unwrap();
        assert!(!extracted.is_partial());
        assert!(extracted.bundle.schedule_file.join("gtfs.txt").is_file());
        assert_eq!(extracted.bundle.fare_zone_file, dest.join("tariff"));
    }

    #[test]
    fn corrupt_member_is_extraction_failure() {
        let bundle = valid_bundle("extract_corrupt");
        std::fs::write(&bundle.cluster_file, b"not a zip").unwrap();

        let err = verify_bundle(&bundle).unwrap_err();
        assert!(matches!(err, GtfsEtlError::ExtractionFailure { .. }));
        assert!(err.to_string().contains("ClusterToLine.zip"));

        let dest = temp_root("extract_corrupt_dest");
        assert!(extract_bundle(&bundle, &dest, false).is_err());
    }

    #[test]
    fn missing_member_is_extraction_failure() {
        let bundle = valid_bundle("extract_missing");
        std::fs::remove_file(&bundle.trip_date_map_file).unwrap();
        assert!(matches!(
            verify_bundle(&bundle),
            Err(GtfsEtlError::ExtractionFailure { .. })
        ));
    }

    #[test]
    fn tolerated_secondary_failure_is_partial() {
        let bundle = valid_bundle("extract_tolerated");
        std::fs::write(&bundle.fare_zone_file, b"garbage").unwrap();

        let dest = temp_root("extract_tolerated_dest");
        let extracted = extract_bundle(&bundle, &dest, true).unwrap();
        assert!(extracted.is_partial());
        assert_eq!(extracted.warnings.len(), 1);
        assert!(extracted.bundle.fare_zone_file.is_dir());
    }

    #[test]
    fn schedule_failure_is_never_tolerated() {
        let bundle = valid_bundle("extract_schedule");
        write_zip(&bundle.schedule_file, &[]);

        let dest = temp_root("extract_schedule_dest");
        let err = extract_bundle(&bundle, &dest, true).unwrap_err();
        assert!(err.to_string().contains("no entries"));
    }
}
