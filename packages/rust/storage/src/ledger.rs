//! Processing ledger: one durable row per calendar date.
//!
//! A stage's success column is set only by [`Storage::complete_stage`]
//! following the latest [`Storage::begin_stage`]. A crash in between leaves
//! it NULL, which callers treat as "needs (re)processing".

use chrono::{NaiveDate, Utc};
use gtfs_etl_shared::{GtfsEtlError, LedgerEntry, Result, Stage, StageOutcome, StageRecord};
use libsql::params;
use tracing::debug;

use crate::{Storage, date_param, db_err, parse_date, parse_timestamp};

const ENTRY_COLUMNS: &str = "id, date,
    download_upload_started_at, download_upload_completed_at, download_upload_success, download_upload_error,
    processing_started_at, processing_completed_at, processing_success, processing_error,
    processing_used_source_date";

impl Storage {
    /// Get the ledger entry for `date`, if one was ever created.
    pub async fn get_ledger_entry(&self, date: NaiveDate) -> Result<Option<LedgerEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM processing_ledger WHERE date = ?1"),
                params![date_param(date)],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    /// List ledger entries, newest date first.
    pub async fn list_ledger_entries(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM processing_ledger ORDER BY date DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_entry(&row)?);
        }
        Ok(results)
    }

    /// Start a stage for `date`. Creates the entry if absent, otherwise
    /// resets that stage's completion fields. Returns the entry id.
    pub async fn begin_stage(
        &self,
        date: NaiveDate,
        stage: Stage,
        used_source_date: Option<NaiveDate>,
    ) -> Result<i64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let sql = match stage {
            Stage::Upload => {
                "INSERT INTO processing_ledger (date, download_upload_started_at)
                 VALUES (?1, ?2)
                 ON CONFLICT(date) DO UPDATE SET
                   download_upload_started_at = excluded.download_upload_started_at,
                   download_upload_completed_at = NULL,
                   download_upload_success = NULL,
                   download_upload_error = NULL"
            }
            Stage::Processing => {
                "INSERT INTO processing_ledger (date, processing_started_at, processing_used_source_date)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(date) DO UPDATE SET
                   processing_started_at = excluded.processing_started_at,
                   processing_completed_at = NULL,
                   processing_success = NULL,
                   processing_error = NULL,
                   processing_used_source_date = excluded.processing_used_source_date"
            }
        };
        let source = used_source_date.map(date_param);
        match stage {
            Stage::Upload => self
                .conn
                .execute(sql, params![date_param(date), now.as_str()])
                .await
                .map_err(db_err)?,
            Stage::Processing => self
                .conn
                .execute(sql, params![date_param(date), now.as_str(), source])
                .await
                .map_err(db_err)?,
        };

        let id = self.ledger_id(date).await?;
        debug!(%date, %stage, id, "stage started");
        Ok(id)
    }

    /// Record the outcome of the stage started by the latest `begin_stage`.
    pub async fn complete_stage(&self, id: i64, stage: Stage, outcome: &StageOutcome) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let sql = match stage {
            Stage::Upload => {
                "UPDATE processing_ledger SET
                   download_upload_completed_at = ?1,
                   download_upload_success = ?2,
                   download_upload_error = ?3
                 WHERE id = ?4"
            }
            Stage::Processing => {
                "UPDATE processing_ledger SET
                   processing_completed_at = ?1,
                   processing_success = ?2,
                   processing_error = ?3
                 WHERE id = ?4"
            }
        };
        let (success, error): (i64, Option<&str>) = match outcome {
            StageOutcome::Success => (1, None),
            StageOutcome::PartialSuccess(warning) => (1, Some(warning.as_str())),
            StageOutcome::Failure(reason) => (0, Some(reason.as_str())),
        };

        let updated = self
            .conn
            .execute(sql, params![now.as_str(), success, error, id])
            .await
            .map_err(db_err)?;
        if updated != 1 {
            return Err(GtfsEtlError::unsupported_state(format!(
                "expected exactly one ledger entry with id {id}, updated {updated}"
            )));
        }
        debug!(id, %stage, success, "stage completed");
        Ok(())
    }

    /// Nearest date on or before `date` whose upload succeeded, if it lies
    /// within `lookback_days`.
    pub async fn find_upload_source(
        &self,
        date: NaiveDate,
        lookback_days: u32,
    ) -> Result<Option<NaiveDate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT date FROM processing_ledger
                 WHERE date <= ?1 AND download_upload_success = 1
                 ORDER BY date DESC LIMIT 1",
                params![date_param(date)],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let found = parse_date(&row.get::<String>(0).map_err(db_err)?)?;
        if (date - found).num_days() <= i64::from(lookback_days) {
            Ok(Some(found))
        } else {
            debug!(%date, %found, lookback_days, "nearest upload is outside the lookback window");
            Ok(None)
        }
    }

    /// Mark the upload stage of `date` succeeded without running it.
    pub async fn mark_upload_succeeded(&self, date: NaiveDate) -> Result<i64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO processing_ledger
                   (date, download_upload_started_at, download_upload_completed_at, download_upload_success)
                 VALUES (?1, ?2, ?2, 1)
                 ON CONFLICT(date) DO UPDATE SET
                   download_upload_completed_at = excluded.download_upload_completed_at,
                   download_upload_success = 1,
                   download_upload_error = NULL",
                params![date_param(date), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        self.ledger_id(date).await
    }

    async fn ledger_id(&self, date: NaiveDate) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM processing_ledger WHERE date = ?1",
                params![date_param(date)],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err),
            None => Err(GtfsEtlError::unsupported_state(format!(
                "ledger entry for {date} vanished after write"
            ))),
        }
    }
}

/// Convert a ledger row (selected with [`ENTRY_COLUMNS`]) to a [`LedgerEntry`].
fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get::<i64>(0).map_err(db_err)?,
        date: parse_date(&row.get::<String>(1).map_err(db_err)?)?,
        upload: stage_record(row, 2)?,
        processing: stage_record(row, 6)?,
        processing_used_source_date: match row.get::<String>(10).ok() {
            Some(s) => Some(parse_date(&s)?),
            None => None,
        },
    })
}

/// Read the four stage columns starting at `offset`.
fn stage_record(row: &libsql::Row, offset: i32) -> Result<StageRecord> {
    let timestamp = |idx: i32| -> Result<Option<_>> {
        match row.get::<String>(idx).ok() {
            Some(s) => Ok(Some(parse_timestamp(&s)?)),
            None => Ok(None),
        }
    };
    Ok(StageRecord {
        started_at: timestamp(offset)?,
        completed_at: timestamp(offset + 1)?,
        success: row.get::<i64>(offset + 2).ok().map(|v| v != 0),
        error: row.get::<String>(offset + 3).ok(),
    })
}

#[cfg(test)]
mod tests {
    use gtfs_etl_shared::StageStatus;

    use crate::test_support::test_storage;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn begin_creates_single_entry() {
        let storage = test_storage().await;
        let date = d(2024, 3, 10);

        assert!(storage.get_ledger_entry(date).await.unwrap().is_none());

        let id = storage.begin_stage(date, Stage::Upload, None).await.unwrap();
        let again = storage.begin_stage(date, Stage::Processing, None).await.unwrap();
        assert_eq!(id, again);

        let entries = storage.list_ledger_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.upload.status(), StageStatus::InProgress);
        assert_eq!(entry.processing.status(), StageStatus::InProgress);
    }

    #[tokio::test]
    async fn failure_then_retry_resets_stage() {
        let storage = test_storage().await;
        let date = d(2024, 3, 10);

        let id = storage.begin_stage(date, Stage::Processing, None).await.unwrap();
        storage
            .complete_stage(id, Stage::Processing, &StageOutcome::Failure("boom".into()))
            .await
            .unwrap();

        let entry = storage.get_ledger_entry(date).await.unwrap().unwrap();
        assert_eq!(entry.processing.status(), StageStatus::Failed);
        assert_eq!(entry.processing.error.as_deref(), Some("boom"));
        assert!(entry.processing.completed_at.is_some());

        let source = d(2024, 3, 8);
        let id = storage
            .begin_stage(date, Stage::Processing, Some(source))
            .await
            .unwrap();
        let entry = storage.get_ledger_entry(date).await.unwrap().unwrap();
        assert_eq!(entry.processing.success, None);
        assert_eq!(entry.processing.error, None);
        assert_eq!(entry.processing.completed_at, None);
        assert_eq!(entry.processing_used_source_date, Some(source));

        storage
            .complete_stage(id, Stage::Processing, &StageOutcome::Success)
            .await
            .unwrap();
        let entry = storage.get_ledger_entry(date).await.unwrap().unwrap();
        assert!(entry.succeeded(Stage::Processing));
        assert!(!entry.succeeded(Stage::Upload));
        assert_eq!(entry.upload.status(), StageStatus::NeverAttempted);
    }

    #[tokio::test]
    async fn partial_success_keeps_warning() {
        let storage = test_storage().await;
        let date = d(2022, 3, 1);
        let id = storage.begin_stage(date, Stage::Processing, None).await.unwrap();
        storage
            .complete_stage(
                id,
                Stage::Processing,
                &StageOutcome::PartialSuccess("Tariff.zip unreadable".into()),
            )
            .await
            .unwrap();

        let entry = storage.get_ledger_entry(date).await.unwrap().unwrap();
        assert!(entry.succeeded(Stage::Processing));
        assert_eq!(entry.processing.error.as_deref(), Some("Tariff.zip unreadable"));
    }

    #[tokio::test]
    async fn complete_unknown_id_is_unsupported_state() {
        let storage = test_storage().await;
        let err = storage
            .complete_stage(999, Stage::Upload, &StageOutcome::Success)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn upload_source_prefers_same_date_then_nearest_earlier() {
        let storage = test_storage().await;
        let target = d(2024, 3, 10);

        storage.mark_upload_succeeded(d(2024, 3, 7)).await.unwrap();
        storage.mark_upload_succeeded(d(2024, 3, 12)).await.unwrap();
        assert_eq!(
            storage.find_upload_source(target, 10).await.unwrap(),
            Some(d(2024, 3, 7))
        );

        storage.mark_upload_succeeded(target).await.unwrap();
        assert_eq!(storage.find_upload_source(target, 10).await.unwrap(), Some(target));
    }

    #[tokio::test]
    async fn upload_source_respects_lookback_window() {
        let storage = test_storage().await;
        let target = d(2024, 3, 20);
        storage.mark_upload_succeeded(d(2024, 3, 10)).await.unwrap();

        assert_eq!(
            storage.find_upload_source(target, 10).await.unwrap(),
            Some(d(2024, 3, 10))
        );
        assert_eq!(storage.find_upload_source(target, 9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_upload_is_not_a_source() {
        let storage = test_storage().await;
        let date = d(2024, 3, 10);
        let id = storage.begin_stage(date, Stage::Upload, None).await.unwrap();
        storage
            .complete_stage(id, Stage::Upload, &StageOutcome::Failure("404".into()))
            .await
            .unwrap();
        assert_eq!(storage.find_upload_source(date, 10).await.unwrap(), None);
    }
}
