//! The Upload stage: download today's live snapshot, verify it, archive it
//! locally and put it in the object store. Also upload reconciliation.

use std::path::Path;

use chrono::NaiveDate;
use gtfs_etl_archive::{BundleMetadata, DatedArchive, verify_bundle};
use gtfs_etl_feed::{FeedSource, ObjectStore, remote_key};
use gtfs_etl_shared::{BundleFile, FileBundle, GtfsEtlError, Result, Stage, StageOutcome};
use tracing::{info, instrument, warn};

use crate::orchestrator::{IngestionOrchestrator, ProgressReporter, remove_scratch};
use crate::stats::StatsEngine;

/// Remote objects at or below this size are treated as failed uploads.
const MIN_UPLOADED_SIZE: u64 = 1000;

impl<F, E, O> IngestionOrchestrator<F, E, O>
where
    F: FeedSource,
    E: StatsEngine,
    O: ObjectStore,
{
    /// Run the Upload stage for today unless it already succeeded. With
    /// `force` the stage is re-run and remote objects are overwritten.
    /// Returns whether the stage ran.
    #[instrument(skip_all, fields(force))]
    pub async fn run_upload(&self, force: bool, progress: &dyn ProgressReporter) -> Result<bool> {
        let today = self.today();
        let uploaded = self
            .storage
            .get_ledger_entry(today)
            .await?
            .is_some_and(|entry| entry.succeeded(Stage::Upload));
        if uploaded && !force {
            info!(date = %today, "today's snapshot is already uploaded");
            return Ok(false);
        }

        info!(date = %today, "uploading today's snapshot");
        let id = self.storage.begin_stage(today, Stage::Upload, None).await?;
        progress.stage_started(today, Stage::Upload);
        match self.download_and_archive(today, force, progress).await {
            Ok(outcome) => {
                self.storage.complete_stage(id, Stage::Upload, &outcome).await?;
                progress.stage_finished(today, Stage::Upload, &outcome);
                Ok(true)
            }
            Err(e) => {
                let outcome = StageOutcome::Failure(e.to_string());
                self.record_failure(id, today, Stage::Upload, &outcome).await;
                progress.stage_finished(today, Stage::Upload, &outcome);
                Err(e)
            }
        }
    }

    /// Download the live snapshot into the local archive under `date` and
    /// upload it.
    pub async fn download_and_archive(
        &self,
        date: NaiveDate,
        overwrite: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutcome> {
        let scratch = self.scratch_dir("upload", date)?;
        let result = async {
            progress.phase("Downloading live snapshot");
            let downloaded = self.download_verified(&scratch).await?;

            let archive = DatedArchive::new(self.config.gtfs_archive_dir());
            let dir = archive.ensure_date_dir(date)?;
            for (member, path) in downloaded.files() {
                let target = dir.join(member.file_name());
                std::fs::copy(path, &target).map_err(|e| GtfsEtlError::io(&target, e))?;
            }
            BundleMetadata::for_bundle(date, "live", self.clock.now(), &FileBundle::in_dir(&dir))?
                .write(&dir)?;
            info!(%date, dir = %dir.display(), "snapshot archived");

            progress.phase("Uploading");
            self.upload_bundle(date, &dir, overwrite).await
        }
        .await;
        remove_scratch(&scratch);
        result
    }

    /// Download until the bundle passes verification, sleeping between
    /// attempts.
    async fn download_verified(&self, dest: &Path) -> Result<FileBundle> {
        let attempts = self.config.extraction_attempts.max(1);
        let mut attempt = 1;
        loop {
            let bundle = self.feed.fetch_current(dest).await?;
            match verify_bundle(&bundle) {
                Ok(()) => return Ok(bundle),
                Err(e) if attempt < attempts => {
                    let delay = self.config.extraction_retry;
                    warn!(
                        attempt,
                        attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "downloaded snapshot failed verification, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Put every member found in `dir` under its dated key. Existing keys
    /// are left alone unless `overwrite`.
    pub async fn upload_bundle(&self, date: NaiveDate, dir: &Path, overwrite: bool) -> Result<StageOutcome> {
        let mut missing = Vec::new();
        for member in BundleFile::ALL {
            let local = dir.join(member.file_name());
            let key = remote_key(&self.object_prefix, date, member);
            if !local.is_file() {
                warn!(%member, path = %local.display(), "missing local file, not uploaded");
                missing.push(member.file_name());
                continue;
            }
            if !overwrite && self.store.exists(&key).await? {
                info!(%key, "already uploaded, not overwriting");
                continue;
            }
            self.store.put(&local, &key).await?;
        }

        if missing.is_empty() {
            Ok(StageOutcome::Success)
        } else {
            Ok(StageOutcome::PartialSuccess(format!(
                "missing files: {}",
                missing.join(", ")
            )))
        }
    }

    /// Mark the Upload stage succeeded for recent dates whose members all
    /// exist remotely with a plausible size. Returns the dates marked.
    #[instrument(skip_all, fields(last_days))]
    pub async fn reconcile(&self, last_days: u32) -> Result<Vec<NaiveDate>> {
        let today = self.today();
        let mut marked = Vec::new();
        for n in 0..=i64::from(last_days) {
            let date = today - chrono::Duration::days(n);
            let uploaded = self
                .storage
                .get_ledger_entry(date)
                .await?
                .is_some_and(|entry| entry.succeeded(Stage::Upload));
            if uploaded || !self.remote_bundle_complete(date).await? {
                continue;
            }
            self.storage.mark_upload_succeeded(date).await?;
            info!(%date, "marked upload succeeded from object store contents");
            marked.push(date);
        }
        Ok(marked)
    }

    async fn remote_bundle_complete(&self, date: NaiveDate) -> Result<bool> {
        for member in BundleFile::ALL {
            let key = remote_key(&self.object_prefix, date, member);
            match self.store.size(&key).await? {
                Some(size) if size > MIN_UPLOADED_SIZE => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use gtfs_etl_archive::METADATA_FILE_NAME;
    use uuid::Uuid;

    use crate::orchestrator::SilentProgress;
    use crate::orchestrator::test_support::*;

    use super::*;

    fn temp_file(size: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("gtfs_etl_obj_{}", Uuid::now_v7()));
        std::fs::write(&path, vec![1u8; size]).unwrap();
        path
    }

    #[tokio::test]
    async fn upload_archives_and_uploads_once() {
        let orch = orchestrator("upload").await;
        assert!(orch.run_upload(false, &SilentProgress).await.unwrap());

        let entry = orch.storage.get_ledger_entry(today()).await.unwrap().unwrap();
        assert!(entry.succeeded(Stage::Upload));

        let archive = DatedArchive::new(orch.config.gtfs_archive_dir());
        assert!(archive.complete_bundle(today()).is_some());
        assert!(archive.date_dir(today()).join(METADATA_FILE_NAME).is_file());
        for member in BundleFile::ALL {
            let key = remote_key("gtfs_archive", today(), member);
            assert!(orch.store.exists(&key).await.unwrap(), "{key}");
        }

        assert!(!orch.run_upload(false, &SilentProgress).await.unwrap());
        assert_eq!(orch.feed.current_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_download_is_retried() {
        let orch = orchestrator("upload_retry").await;
        orch.feed.corrupt_downloads.store(2, Ordering::SeqCst);

        assert!(orch.run_upload(false, &SilentProgress).await.unwrap());
        assert_eq!(orch.feed.current_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_corruption_fails_the_stage() {
        let orch = orchestrator("upload_fail").await;
        orch.feed.corrupt_downloads.store(10, Ordering::SeqCst);

        let err = orch.run_upload(false, &SilentProgress).await.unwrap_err();
        assert!(matches!(err, GtfsEtlError::ExtractionFailure { .. }));
        let entry = orch.storage.get_ledger_entry(today()).await.unwrap().unwrap();
        assert_eq!(entry.upload.success, Some(false));
        assert!(entry.upload.error.is_some());
    }

    #[tokio::test]
    async fn existing_keys_are_kept_unless_overwriting() {
        let orch = orchestrator("upload_skip").await;
        let key = remote_key("gtfs_archive", today(), BundleFile::FareZones);
        orch.store.put(&temp_file(5000), &key).await.unwrap();

        orch.run_upload(false, &SilentProgress).await.unwrap();
        assert_eq!(orch.store.size(&key).await.unwrap(), Some(5000));

        orch.run_upload(true, &SilentProgress).await.unwrap();
        assert_ne!(orch.store.size(&key).await.unwrap(), Some(5000));
        assert_eq!(orch.feed.current_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_local_member_is_partial() {
        let orch = orchestrator("upload_missing").await;
        let dir = orch.scratch_dir("manual", today()).unwrap();
        std::fs::write(dir.join(BundleFile::Schedule.file_name()), b"zip").unwrap();

        let outcome = orch.upload_bundle(today(), &dir, false).await.unwrap();
        match outcome {
            StageOutcome::PartialSuccess(message) => assert!(message.contains("Tariff.zip")),
            other => panic!("expected partial success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconcile_marks_complete_remote_bundles() {
        let orch = orchestrator("reconcile").await;
        let complete = days_before(1);
        let undersized = days_before(2);
        for member in BundleFile::ALL {
            orch.store
                .put(&temp_file(1500), &remote_key("gtfs_archive", complete, member))
                .await
                .unwrap();
            let size = if member == BundleFile::Clusters { 1000 } else { 1500 };
            orch.store
                .put(&temp_file(size), &remote_key("gtfs_archive", undersized, member))
                .await
                .unwrap();
        }

        assert_eq!(orch.reconcile(3).await.unwrap(), vec![complete]);
        let entry = orch.storage.get_ledger_entry(complete).await.unwrap().unwrap();
        assert!(entry.succeeded(Stage::Upload));
        assert!(orch.storage.get_ledger_entry(undersized).await.unwrap().is_none());

        // Already-succeeded dates are left alone.
        assert!(orch.reconcile(3).await.unwrap().is_empty());
    }
}
