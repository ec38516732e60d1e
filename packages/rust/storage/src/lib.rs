//! libSQL storage layer: the system of record for the GTFS ETL.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the
//! processing ledger ([`ledger`]) and the temporally versioned stops,
//! routes and rides ([`entities`]).
//!
//! **Access rules:**
//! - Pipeline commands: read-write via [`Storage::open`]
//! - Status reporting: read-only via [`Storage::open_readonly`]

pub mod entities;
pub mod ledger;
mod migrations;

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use gtfs_etl_shared::{GtfsEtlError, Result};
use libsql::{Connection, Database, params};

pub use entities::{DayLoad, LoadStats, RouteOutcome, StopIndex};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GtfsEtlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.execute("PRAGMA foreign_keys = ON", params![])
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GtfsEtlError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Apply every migration newer than the recorded schema version.
    async fn run_migrations(&self) -> Result<()> {
        let applied = self.schema_version().await;
        let pending: Vec<_> = migrations::all_migrations()
            .into_iter()
            .filter(|m| m.version > applied)
            .collect();
        if pending.is_empty() {
            tracing::debug!(version = applied, "schema up to date");
            return Ok(());
        }

        for migration in pending {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            self.conn.execute_batch(migration.sql).await.map_err(|e| {
                GtfsEtlError::Storage(format!(
                    "migration v{} ({}) failed: {e}",
                    migration.version, migration.description
                ))
            })?;
        }
        Ok(())
    }

    /// Highest applied migration, 0 on a fresh database.
    async fn schema_version(&self) -> u32 {
        let query = "SELECT COALESCE(MAX(version), 0) FROM schema_migrations";
        let Ok(mut rows) = self.conn.query(query, params![]).await else {
            return 0;
        };
        match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(GtfsEtlError::Storage("ledger database is opened read-only".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

pub(crate) fn db_err(e: libsql::Error) -> GtfsEtlError {
    GtfsEtlError::Storage(e.to_string())
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| GtfsEtlError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GtfsEtlError::Storage(format!("invalid timestamp '{s}': {e}")))
}

pub(crate) fn date_param(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use uuid::Uuid;

    /// A fresh database under the system temp dir.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("gtfs_etl_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.unwrap()
    }
}
