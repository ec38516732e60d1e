//! SQL migration definitions for the GTFS ETL database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Processing ledger",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per calendar date; success columns are NULL until completed
CREATE TABLE IF NOT EXISTS processing_ledger (
    id                           INTEGER PRIMARY KEY AUTOINCREMENT,
    date                         TEXT NOT NULL UNIQUE,
    download_upload_started_at   TEXT,
    download_upload_completed_at TEXT,
    download_upload_success      INTEGER,
    download_upload_error        TEXT,
    processing_started_at        TEXT,
    processing_completed_at      TEXT,
    processing_success           INTEGER,
    processing_error             TEXT,
    processing_used_source_date  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Versioned stops, routes, route stops and rides",
            sql: r#"
CREATE TABLE IF NOT EXISTS stops (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    code     TEXT NOT NULL,
    lat      REAL NOT NULL,
    lon      REAL NOT NULL,
    name     TEXT NOT NULL,
    city     TEXT NOT NULL,
    min_date TEXT NOT NULL,
    max_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stops_code ON stops(code, min_date);

CREATE TABLE IF NOT EXISTS routes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    mkt          INTEGER NOT NULL,
    direction    INTEGER NOT NULL,
    alternative  TEXT NOT NULL,
    operator_ref INTEGER NOT NULL,
    line_ref     INTEGER NOT NULL,
    short_name   TEXT NOT NULL,
    long_name    TEXT NOT NULL,
    agency_name  TEXT NOT NULL,
    route_type   INTEGER NOT NULL,
    min_date     TEXT NOT NULL,
    max_date     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_routes_key ON routes(mkt, direction, alternative, operator_ref);

CREATE TABLE IF NOT EXISTS route_stops (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id   INTEGER NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
    stop_id    INTEGER NOT NULL REFERENCES stops(id),
    stop_order INTEGER NOT NULL,
    UNIQUE(route_id, stop_order)
);

CREATE INDEX IF NOT EXISTS idx_route_stops_stop ON route_stops(stop_id);

CREATE TABLE IF NOT EXISTS rides (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id             INTEGER NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
    journey_ref          TEXT NOT NULL,
    scheduled_start_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rides_route ON rides(route_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
