//! `bundle_metadata.json`: provenance and checksums for an archived day.

use std::fs::File;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use gtfs_etl_shared::{FileBundle, GtfsEtlError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

pub const METADATA_FILE_NAME: &str = "bundle_metadata.json";

/// Size and checksum of one bundle member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Written next to the bundle after a successful download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub date: NaiveDate,
    /// `"live"` or `"archive:<source date>"`.
    pub source: String,
    pub downloaded_at: DateTime<Utc>,
    pub files: Vec<FileDigest>,
}

impl BundleMetadata {
    /// Digest every member of `bundle`.
    pub fn for_bundle(
        date: NaiveDate,
        source: impl Into<String>,
        downloaded_at: DateTime<Utc>,
        bundle: &FileBundle,
    ) -> Result<Self> {
        let files = bundle
            .files()
            .map(|(member, path)| digest_file(member.file_name(), path))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            date,
            source: source.into(),
            downloaded_at,
            files,
        })
    }

    /// Write to `dir/bundle_metadata.json` via a temp file and rename.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let target = dir.join(METADATA_FILE_NAME);
        let temp = dir.join(format!(".{METADATA_FILE_NAME}.tmp"));
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| GtfsEtlError::validation(format!("failed to serialize bundle metadata: {e}")))?;
        std::fs::write(&temp, content).map_err(|e| GtfsEtlError::io(&temp, e))?;
        std::fs::rename(&temp, &target).map_err(|e| GtfsEtlError::io(&target, e))?;
        debug!(path = %target.display(), "wrote bundle metadata");
        Ok(())
    }

    /// Read `dir/bundle_metadata.json`, or `None` if it does not exist.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(METADATA_FILE_NAME);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GtfsEtlError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| GtfsEtlError::parse(format!("invalid {}: {e}", path.display())))
    }
}

/// Stream `path` through SHA-256.
pub fn digest_file(name: &str, path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path).map_err(|e| GtfsEtlError::io(path, e))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| GtfsEtlError::io(path, e))?;
    Ok(FileDigest {
        name: name.to_string(),
        size,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
