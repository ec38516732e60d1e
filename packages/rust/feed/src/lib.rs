//! External transport: downloading daily snapshots and storing them durably.
//!
//! Two seams are defined here. [`FeedSource`] materializes a [`FileBundle`]
//! on local disk, either from the live publisher or from the historical
//! archive. [`ObjectStore`] puts archived members under dated keys and
//! answers existence/size queries for reconciliation.

mod http;
mod store;

use std::future::Future;
use std::path::Path;

use chrono::NaiveDate;
use gtfs_etl_shared::{BundleFile, DATE_PATH_FORMAT, FileBundle, Result};

pub use http::{HttpFeedSource, RetryPolicy};
pub use store::CloudObjectStore;

/// Where daily snapshots come from.
pub trait FeedSource: Send + Sync {
    /// Download the snapshot the live publisher currently serves into `dest`.
    ///
    /// Takes no date: the live publisher only ever serves today's snapshot,
    /// and the caller files it under the date it was fetched on.
    fn fetch_current(&self, dest: &Path) -> impl Future<Output = Result<FileBundle>> + Send;

    /// Download the archived snapshot of `source_date` into `dest`.
    fn fetch_archived(
        &self,
        source_date: NaiveDate,
        dest: &Path,
    ) -> impl Future<Output = Result<FileBundle>> + Send;
}

/// Durable remote storage for archived bundles.
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local` under `key`, replacing any existing object.
    fn put(&self, local: &Path, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Size in bytes of the object at `key`, or `None` if absent.
    fn size(&self, key: &str) -> impl Future<Output = Result<Option<u64>>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.size(key).await?.is_some()) }
    }
}

/// `<prefix>/YYYY/MM/DD/<file>`.
pub fn remote_key(prefix: &str, date: NaiveDate, member: BundleFile) -> String {
    let dated = format!("{}/{}", date.format(DATE_PATH_FORMAT), member.file_name());
    match prefix.trim_matches('/') {
        "" => dated,
        prefix => format!("{prefix}/{dated}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_key_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            remote_key("gtfs_archive", date, BundleFile::FareZones),
            "gtfs_archive/2024/03/07/Tariff.zip"
        );
        assert_eq!(
            remote_key("/gtfs_archive/", date, BundleFile::Schedule),
            "gtfs_archive/2024/03/07/israel-public-transportation.zip"
        );
        assert_eq!(
            remote_key("", date, BundleFile::Clusters),
            "2024/03/07/ClusterToLine.zip"
        );
    }
}
