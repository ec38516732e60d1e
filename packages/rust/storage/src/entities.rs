//! Temporal entity store: versioned stops and routes.
//!
//! Every entity row carries a `[min_date, max_date]` validity interval.
//! Per natural key, intervals are pairwise disjoint, and consecutive
//! attribute-identical observations extend one row instead of adding rows.
//!
//! A [`DayLoad`] is the unit of work for one calendar date: it owns a
//! transaction plus the index of the latest stop per code, and is committed
//! once when the whole day has been folded in.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use gtfs_etl_shared::{
    GtfsEtlError, Result, RideRecord, Route, RouteDailyRecord, RouteKey, Stop, StopObservation,
};
use libsql::params::IntoParams;
use libsql::{Connection, Transaction, params};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{Storage, date_param, db_err, parse_date};

const STOP_COLUMNS: &str = "id, code, lat, lon, name, city, min_date, max_date";

const ROUTE_COLUMNS: &str = "id, mkt, direction, alternative, operator_ref, line_ref, short_name, long_name, agency_name, route_type, min_date, max_date";

// ---------------------------------------------------------------------------
// Stop index
// ---------------------------------------------------------------------------

/// Latest stored version of every stop code.
#[derive(Debug, Default)]
pub struct StopIndex {
    latest: HashMap<String, Stop>,
}

impl StopIndex {
    /// Load the latest version (greatest `min_date`) of each code.
    pub async fn load(conn: &Connection) -> Result<Self> {
        let stops = query_stops(
            conn,
            &format!(
                "SELECT {STOP_COLUMNS} FROM stops s
                 WHERE s.min_date = (SELECT MAX(min_date) FROM stops WHERE code = s.code)"
            ),
            params![],
        )
        .await?;

        let mut latest = HashMap::with_capacity(stops.len());
        for stop in stops {
            if let Some(previous) = latest.insert(stop.code.clone(), stop) {
                return Err(GtfsEtlError::unsupported_state(format!(
                    "stop code {} has two versions starting {}",
                    previous.code, previous.min_date
                )));
            }
        }
        Ok(Self { latest })
    }

    fn get(&self, code: &str) -> Option<&Stop> {
        self.latest.get(code)
    }

    fn len(&self) -> usize {
        self.latest.len()
    }

    fn set(&mut self, stop: Stop) {
        self.latest.insert(stop.code.clone(), stop);
    }

    fn is_latest(&self, stop: &Stop) -> bool {
        self.latest.get(&stop.code).map(|s| s.id) == Some(stop.id)
    }
}

// ---------------------------------------------------------------------------
// Day load (unit of work)
// ---------------------------------------------------------------------------

/// Which continuity rule fired for a route candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Rule A: an existing version already covers the date.
    Skipped(i64),
    /// Rule B: the version ending the day before was extended.
    Extended(i64),
    /// Rule C: a new version was inserted.
    Inserted(i64),
}

/// Counters for one loaded date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub routes_skipped: usize,
    pub routes_extended: usize,
    pub routes_inserted: usize,
    pub rides_inserted: usize,
    pub stops_inserted: usize,
    pub stops_extended: usize,
    pub stops_corrected: usize,
    pub stops_unchanged: usize,
}

/// Transaction-scoped loader for one calendar date.
pub struct DayLoad {
    tx: Transaction,
    date: NaiveDate,
    index: StopIndex,
    stats: LoadStats,
}

impl Storage {
    /// Start the unit of work for `date`.
    pub async fn begin_day_load(&self, date: NaiveDate) -> Result<DayLoad> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let index = StopIndex::load(&tx).await?;
        debug!(%date, stops = index.len(), "day load started");
        Ok(DayLoad {
            tx,
            date,
            index,
            stats: LoadStats::default(),
        })
    }

    /// Fold one date's route records into the store in a single transaction.
    #[instrument(skip_all, fields(date = %date, routes = records.len()))]
    pub async fn load_day(&self, date: NaiveDate, records: &[RouteDailyRecord]) -> Result<LoadStats> {
        let mut load = self.begin_day_load(date).await?;
        for record in records {
            if let Err(e) = load.load_route(record).await {
                load.rollback().await?;
                return Err(e);
            }
        }
        let stats = load.commit().await?;
        info!(
            inserted = stats.routes_inserted,
            extended = stats.routes_extended,
            skipped = stats.routes_skipped,
            "routes loaded"
        );
        Ok(stats)
    }
}

impl DayLoad {
    /// Commit everything written for this date.
    pub async fn commit(self) -> Result<LoadStats> {
        self.tx.commit().await.map_err(db_err)?;
        Ok(self.stats)
    }

    /// Discard everything written for this date.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Stops
    // -----------------------------------------------------------------------

    /// Fold one stop observation for this date into the stop versions.
    pub async fn upsert_stop(&mut self, obs: &StopObservation) -> Result<Stop> {
        let date = self.date;
        let Some(latest) = self.index.get(&obs.code).cloned() else {
            let stop = self.insert_stop(obs).await?;
            self.index.set(stop.clone());
            return Ok(stop);
        };

        if date < latest.min_date {
            return self.backfill_stop(obs, &latest).await;
        }

        if latest.same_attributes(obs) {
            if latest.max_date >= date {
                self.stats.stops_unchanged += 1;
                return Ok(latest);
            }
            let stop = self.set_stop_dates(&latest, latest.min_date, date).await?;
            self.stats.stops_extended += 1;
            self.index.set(stop.clone());
            return Ok(stop);
        }

        if latest.min_date == date {
            // A version opened today is corrected rather than closed with an empty interval.
            let stop = self.correct_stop(&latest, obs).await?;
            self.index.set(stop.clone());
            return Ok(stop);
        }

        if latest.max_date >= date {
            self.set_stop_dates(&latest, latest.min_date, date - Duration::days(1))
                .await?;
        }
        let stop = self.insert_stop(obs).await?;
        self.index.set(stop.clone());
        Ok(stop)
    }

    /// Observation older than the latest version of its code.
    async fn backfill_stop(&mut self, obs: &StopObservation, latest: &Stop) -> Result<Stop> {
        let date = self.date;
        let covering = query_stops(
            &self.tx,
            &format!(
                "SELECT {STOP_COLUMNS} FROM stops
                 WHERE code = ?1 AND min_date <= ?2 AND max_date >= ?2"
            ),
            params![obs.code.as_str(), date_param(date)],
        )
        .await?;
        if let Some(stop) = covering.into_iter().next() {
            self.stats.stops_unchanged += 1;
            return Ok(stop);
        }

        let neighbours = query_stops(
            &self.tx,
            &format!(
                "SELECT {STOP_COLUMNS} FROM stops
                 WHERE code = ?1 AND (max_date = ?2 OR min_date = ?3)
                 ORDER BY min_date"
            ),
            params![
                obs.code.as_str(),
                date_param(date - Duration::days(1)),
                date_param(date + Duration::days(1))
            ],
        )
        .await?;
        if let Some(neighbour) = neighbours.into_iter().find(|s| s.same_attributes(obs)) {
            let stop = if neighbour.max_date < date {
                self.set_stop_dates(&neighbour, neighbour.min_date, date).await?
            } else {
                self.set_stop_dates(&neighbour, date, neighbour.max_date).await?
            };
            if stop.id == latest.id {
                self.index.set(stop.clone());
            }
            self.stats.stops_extended += 1;
            return Ok(stop);
        }

        debug!(code = %obs.code, %date, "inserting out-of-order stop version");
        self.insert_stop(obs).await
    }

    async fn insert_stop(&mut self, obs: &StopObservation) -> Result<Stop> {
        let date = self.date;
        self.tx
            .execute(
                "INSERT INTO stops (code, lat, lon, name, city, min_date, max_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    obs.code.as_str(),
                    obs.lat,
                    obs.lon,
                    obs.name.as_str(),
                    obs.city.as_str(),
                    date_param(date)
                ],
            )
            .await
            .map_err(db_err)?;
        self.stats.stops_inserted += 1;
        Ok(Stop {
            id: self.tx.last_insert_rowid(),
            code: obs.code.clone(),
            lat: obs.lat,
            lon: obs.lon,
            name: obs.name.clone(),
            city: obs.city.clone(),
            min_date: date,
            max_date: date,
        })
    }

    async fn set_stop_dates(&self, stop: &Stop, min_date: NaiveDate, max_date: NaiveDate) -> Result<Stop> {
        self.tx
            .execute(
                "UPDATE stops SET min_date = ?1, max_date = ?2 WHERE id = ?3",
                params![date_param(min_date), date_param(max_date), stop.id],
            )
            .await
            .map_err(db_err)?;
        Ok(Stop {
            min_date,
            max_date,
            ..stop.clone()
        })
    }

    async fn correct_stop(&mut self, stop: &Stop, obs: &StopObservation) -> Result<Stop> {
        self.tx
            .execute(
                "UPDATE stops SET lat = ?1, lon = ?2, name = ?3, city = ?4 WHERE id = ?5",
                params![obs.lat, obs.lon, obs.name.as_str(), obs.city.as_str(), stop.id],
            )
            .await
            .map_err(db_err)?;
        warn!(code = %stop.code, date = %self.date, "stop attributes changed within the same day");
        self.stats.stops_corrected += 1;
        Ok(Stop {
            lat: obs.lat,
            lon: obs.lon,
            name: obs.name.clone(),
            city: obs.city.clone(),
            ..stop.clone()
        })
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    /// Fold one route candidate in, applying the first matching continuity rule.
    pub async fn load_route(&mut self, candidate: &RouteDailyRecord) -> Result<RouteOutcome> {
        let date = self.date;
        if candidate.date != date {
            return Err(GtfsEtlError::validation(format!(
                "route {} is for {} but this load is for {date}",
                candidate.key, candidate.date
            )));
        }

        // Rule A: already covered (re-run of this date).
        let covering = self
            .routes_matching(&candidate.key, "min_date <= ?5 AND max_date >= ?5", date)
            .await?;
        if let Some(route) = single(covering, &candidate.key, "covering", date)? {
            self.stats.routes_skipped += 1;
            return Ok(RouteOutcome::Skipped(route.id));
        }

        // Rule B: continuity with the version ending yesterday.
        let yesterday = date - Duration::days(1);
        let previous = self
            .routes_matching(&candidate.key, "max_date = ?5", yesterday)
            .await?;
        if let Some(route) = single(previous, &candidate.key, "ending", yesterday)? {
            self.extend_route(&route, candidate).await?;
            self.stats.routes_extended += 1;
            return Ok(RouteOutcome::Extended(route.id));
        }

        // Rule C: new version.
        let route_id = self.insert_route(candidate).await?;
        self.stats.routes_inserted += 1;
        Ok(RouteOutcome::Inserted(route_id))
    }

    async fn routes_matching(&self, key: &RouteKey, date_clause: &str, date: NaiveDate) -> Result<Vec<Route>> {
        query_routes(
            &self.tx,
            &format!(
                "SELECT {ROUTE_COLUMNS} FROM routes
                 WHERE mkt = ?1 AND direction = ?2 AND alternative = ?3 AND operator_ref = ?4
                   AND {date_clause}"
            ),
            params![
                key.mkt,
                key.direction,
                key.alternative.as_str(),
                key.operator_ref,
                date_param(date)
            ],
        )
        .await
    }

    async fn extend_route(&mut self, route: &Route, candidate: &RouteDailyRecord) -> Result<()> {
        let date = self.date;
        self.tx
            .execute(
                "UPDATE routes SET max_date = ?1 WHERE id = ?2",
                params![date_param(date), route.id],
            )
            .await
            .map_err(db_err)?;
        self.insert_rides(route.id, &candidate.rides).await?;

        let stops = query_stops(
            &self.tx,
            &format!(
                "SELECT s.{} FROM stops s
                 JOIN route_stops rs ON rs.stop_id = s.id
                 WHERE rs.route_id = ?1
                 ORDER BY rs.stop_order",
                STOP_COLUMNS.replace(", ", ", s.")
            ),
            params![route.id],
        )
        .await?;
        for stop in stops {
            // Superseded versions stay closed so intervals never overlap.
            if stop.max_date < date && self.index.is_latest(&stop) {
                let extended = self.set_stop_dates(&stop, stop.min_date, date).await?;
                self.stats.stops_extended += 1;
                self.index.set(extended);
            }
        }
        Ok(())
    }

    async fn insert_route(&mut self, candidate: &RouteDailyRecord) -> Result<i64> {
        let date = self.date;
        let key = &candidate.key;
        self.tx
            .execute(
                "INSERT INTO routes (mkt, direction, alternative, operator_ref, line_ref,
                   short_name, long_name, agency_name, route_type, min_date, max_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    key.mkt,
                    key.direction,
                    key.alternative.as_str(),
                    key.operator_ref,
                    candidate.line_ref,
                    candidate.short_name.as_str(),
                    candidate.long_name.as_str(),
                    candidate.agency_name.as_str(),
                    candidate.route_type,
                    date_param(date)
                ],
            )
            .await
            .map_err(db_err)?;
        let route_id = self.tx.last_insert_rowid();

        for (order, obs) in candidate.stops.iter().enumerate() {
            let stop = self.upsert_stop(obs).await?;
            self.tx
                .execute(
                    "INSERT INTO route_stops (route_id, stop_id, stop_order) VALUES (?1, ?2, ?3)",
                    params![route_id, stop.id, (order + 1) as i64],
                )
                .await
                .map_err(db_err)?;
        }
        self.insert_rides(route_id, &candidate.rides).await?;
        Ok(route_id)
    }

    async fn insert_rides(&mut self, route_id: i64, rides: &[RideRecord]) -> Result<()> {
        for ride in rides {
            self.tx
                .execute(
                    "INSERT INTO rides (route_id, journey_ref, scheduled_start_time) VALUES (?1, ?2, ?3)",
                    params![
                        route_id,
                        ride.journey_ref.as_str(),
                        ride.scheduled_start_time.to_rfc3339()
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        self.stats.rides_inserted += rides.len();
        Ok(())
    }
}

/// At most one row may match a continuity rule.
fn single(mut routes: Vec<Route>, key: &RouteKey, what: &str, date: NaiveDate) -> Result<Option<Route>> {
    if routes.len() > 1 {
        return Err(GtfsEtlError::unsupported_state(format!(
            "{} route versions for {key} {what} {date}",
            routes.len()
        )));
    }
    Ok(routes.pop())
}

// ---------------------------------------------------------------------------
// Point-in-time queries
// ---------------------------------------------------------------------------

impl Storage {
    /// All versions of a stop code, oldest first.
    pub async fn stops_by_code(&self, code: &str) -> Result<Vec<Stop>> {
        query_stops(
            &self.conn,
            &format!("SELECT {STOP_COLUMNS} FROM stops WHERE code = ?1 ORDER BY min_date"),
            params![code],
        )
        .await
    }

    /// Stops valid on `date`.
    pub async fn stops_at(&self, date: NaiveDate) -> Result<Vec<Stop>> {
        query_stops(
            &self.conn,
            &format!(
                "SELECT {STOP_COLUMNS} FROM stops
                 WHERE min_date <= ?1 AND max_date >= ?1 ORDER BY code"
            ),
            params![date_param(date)],
        )
        .await
    }

    /// All versions of a route, oldest first.
    pub async fn routes_by_key(&self, key: &RouteKey) -> Result<Vec<Route>> {
        query_routes(
            &self.conn,
            &format!(
                "SELECT {ROUTE_COLUMNS} FROM routes
                 WHERE mkt = ?1 AND direction = ?2 AND alternative = ?3 AND operator_ref = ?4
                 ORDER BY min_date"
            ),
            params![key.mkt, key.direction, key.alternative.as_str(), key.operator_ref],
        )
        .await
    }

    /// Routes valid on `date`.
    pub async fn routes_at(&self, date: NaiveDate) -> Result<Vec<Route>> {
        query_routes(
            &self.conn,
            &format!(
                "SELECT {ROUTE_COLUMNS} FROM routes
                 WHERE min_date <= ?1 AND max_date >= ?1 ORDER BY mkt, direction, alternative"
            ),
            params![date_param(date)],
        )
        .await
    }

    /// Ordered stops referenced by a route.
    pub async fn route_stops(&self, route_id: i64) -> Result<Vec<Stop>> {
        query_stops(
            &self.conn,
            &format!(
                "SELECT s.{} FROM stops s
                 JOIN route_stops rs ON rs.stop_id = s.id
                 WHERE rs.route_id = ?1
                 ORDER BY rs.stop_order",
                STOP_COLUMNS.replace(", ", ", s.")
            ),
            params![route_id],
        )
        .await
    }

    /// Number of rides attached to a route.
    pub async fn ride_count(&self, route_id: i64) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM rides WHERE route_id = ?1", params![route_id])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

async fn query_stops(conn: &Connection, sql: &str, params: impl IntoParams) -> Result<Vec<Stop>> {
    let mut rows = conn.query(sql, params).await.map_err(db_err)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_stop(&row)?);
    }
    Ok(results)
}

async fn query_routes(conn: &Connection, sql: &str, params: impl IntoParams) -> Result<Vec<Route>> {
    let mut rows = conn.query(sql, params).await.map_err(db_err)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_route(&row)?);
    }
    Ok(results)
}

/// Convert a row selected with [`STOP_COLUMNS`] to a [`Stop`].
fn row_to_stop(row: &libsql::Row) -> Result<Stop> {
    Ok(Stop {
        id: row.get::<i64>(0).map_err(db_err)?,
        code: row.get::<String>(1).map_err(db_err)?,
        lat: row.get::<f64>(2).map_err(db_err)?,
        lon: row.get::<f64>(3).map_err(db_err)?,
        name: row.get::<String>(4).map_err(db_err)?,
        city: row.get::<String>(5).map_err(db_err)?,
        min_date: parse_date(&row.get::<String>(6).map_err(db_err)?)?,
        max_date: parse_date(&row.get::<String>(7).map_err(db_err)?)?,
    })
}

/// Convert a row selected with [`ROUTE_COLUMNS`] to a [`Route`].
fn row_to_route(row: &libsql::Row) -> Result<Route> {
    Ok(Route {
        id: row.get::<i64>(0).map_err(db_err)?,
        key: RouteKey {
            mkt: row.get::<i64>(1).map_err(db_err)?,
            direction: row.get::<i64>(2).map_err(db_err)?,
            alternative: row.get::<String>(3).map_err(db_err)?,
            operator_ref: row.get::<i64>(4).map_err(db_err)?,
        },
        line_ref: row.get::<i64>(5).map_err(db_err)?,
        short_name: row.get::<String>(6).map_err(db_err)?,
        long_name: row.get::<String>(7).map_err(db_err)?,
        agency_name: row.get::<String>(8).map_err(db_err)?,
        route_type: row.get::<i64>(9).map_err(db_err)?,
        min_date: parse_date(&row.get::<String>(10).map_err(db_err)?)?,
        max_date: parse_date(&row.get::<String>(11).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::test_support::test_storage;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn obs(code: &str, name: &str) -> StopObservation {
        StopObservation {
            code: code.into(),
            lat: 32.184,
            lon: 34.871,
            name: name.into(),
            city: "Kfar Saba".into(),
        }
    }

    fn candidate(date: NaiveDate, stops: Vec<StopObservation>) -> RouteDailyRecord {
        RouteDailyRecord {
            date,
            key: RouteKey {
                mkt: 10149,
                direction: 1,
                alternative: "#".into(),
                operator_ref: 3,
            },
            line_ref: 8061,
            short_name: "149".into(),
            long_name: "Kfar Saba<->Tel Aviv".into(),
            agency_name: "Egged".into(),
            route_type: 3,
            stops,
            rides: vec![RideRecord {
                journey_ref: format!("{date}_1"),
                scheduled_start_time: Utc
                    .from_utc_datetime(&date.and_hms_opt(6, 30, 0).unwrap()),
            }],
        }
    }

    async fn upsert_on(storage: &Storage, date: NaiveDate, o: &StopObservation) -> Stop {
        let mut load = storage.begin_day_load(date).await.unwrap();
        let stop = load.upsert_stop(o).await.unwrap();
        load.commit().await.unwrap();
        stop
    }

    #[tokio::test]
    async fn identical_stop_observations_merge_into_one_row() {
        let storage = test_storage().await;
        let o = obs("21472", "Ben Yehuda");
        for day in 1..=5 {
            upsert_on(&storage, d(2024, 3, day), &o).await;
        }

        let versions = storage.stops_by_code("21472").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].min_date, d(2024, 3, 1));
        assert_eq!(versions[0].max_date, d(2024, 3, 5));
    }

    #[tokio::test]
    async fn changed_stop_closes_previous_version() {
        let storage = test_storage().await;
        for day in 1..=3 {
            upsert_on(&storage, d(2024, 3, day), &obs("21472", "Ben Yehuda")).await;
        }
        for day in 4..=6 {
            upsert_on(&storage, d(2024, 3, day), &obs("21472", "Ben Yehuda/Weizmann")).await;
        }

        let versions = storage.stops_by_code("21472").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!((versions[0].min_date, versions[0].max_date), (d(2024, 3, 1), d(2024, 3, 3)));
        assert_eq!((versions[1].min_date, versions[1].max_date), (d(2024, 3, 4), d(2024, 3, 6)));
        assert_eq!(versions[1].name, "Ben Yehuda/Weizmann");

        let on_third = storage.stops_at(d(2024, 3, 3)).await.unwrap();
        assert_eq!(on_third.len(), 1);
        assert_eq!(on_third[0].name, "Ben Yehuda");
    }

    #[tokio::test]
    async fn repeated_day_upsert_is_idempotent() {
        let storage = test_storage().await;
        let o = obs("100", "Central");
        let first = upsert_on(&storage, d(2024, 3, 1), &o).await;
        let second = upsert_on(&storage, d(2024, 3, 1), &o).await;
        assert_eq!(first.id, second.id);
        assert_eq!(storage.stops_by_code("100").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_day_change_corrects_in_place() {
        let storage = test_storage().await;
        upsert_on(&storage, d(2024, 3, 1), &obs("100", "Centrall")).await;
        let corrected = upsert_on(&storage, d(2024, 3, 1), &obs("100", "Central")).await;

        let versions = storage.stops_by_code("100").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, corrected.id);
        assert_eq!(versions[0].name, "Central");
    }

    #[tokio::test]
    async fn backfilled_day_extends_adjacent_identical_version() {
        let storage = test_storage().await;
        let o = obs("100", "Central");
        upsert_on(&storage, d(2024, 3, 10), &o).await;
        upsert_on(&storage, d(2024, 3, 9), &o).await;

        let versions = storage.stops_by_code("100").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!((versions[0].min_date, versions[0].max_date), (d(2024, 3, 9), d(2024, 3, 10)));

        // A gap day with different attributes becomes its own closed version.
        upsert_on(&storage, d(2024, 3, 5), &obs("100", "Old Central")).await;
        let versions = storage.stops_by_code("100").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!((versions[0].min_date, versions[0].max_date), (d(2024, 3, 5), d(2024, 3, 5)));

        // The index still points at the newest version.
        upsert_on(&storage, d(2024, 3, 11), &o).await;
        let versions = storage.stops_by_code("100").await.unwrap();
        assert_eq!(versions[1].max_date, d(2024, 3, 11));
    }

    #[tokio::test]
    async fn rerunning_route_for_same_date_is_skipped() {
        let storage = test_storage().await;
        let date = d(2024, 3, 1);
        let route = candidate(date, vec![obs("1", "A"), obs("2", "B")]);

        let first = storage.load_day(date, &[route.clone()]).await.unwrap();
        assert_eq!(first.routes_inserted, 1);
        let second = storage.load_day(date, &[route.clone()]).await.unwrap();
        assert_eq!(second.routes_skipped, 1);
        assert_eq!(second.rides_inserted, 0);

        let versions = storage.routes_by_key(&route.key).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(storage.ride_count(versions[0].id).await.unwrap(), 1);
        assert_eq!(storage.route_stops(versions[0].id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn next_day_route_extends_route_and_stops() {
        let storage = test_storage().await;
        let stops = vec![obs("1", "A"), obs("2", "B"), obs("3", "C")];
        storage
            .load_day(d(2024, 3, 1), &[candidate(d(2024, 3, 1), stops.clone())])
            .await
            .unwrap();
        let stats = storage
            .load_day(d(2024, 3, 2), &[candidate(d(2024, 3, 2), stops)])
            .await
            .unwrap();
        assert_eq!(stats.routes_extended, 1);
        assert_eq!(stats.stops_extended, 3);

        let key = candidate(d(2024, 3, 1), vec![]).key;
        let versions = storage.routes_by_key(&key).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].min_date, d(2024, 3, 1));
        assert_eq!(versions[0].max_date, d(2024, 3, 2));
        assert_eq!(storage.ride_count(versions[0].id).await.unwrap(), 2);

        for stop in storage.route_stops(versions[0].id).await.unwrap() {
            assert_eq!(stop.max_date, d(2024, 3, 2));
        }
    }

    #[tokio::test]
    async fn gap_in_dates_creates_new_route_version() {
        let storage = test_storage().await;
        let stops = vec![obs("1", "A")];
        storage
            .load_day(d(2024, 3, 1), &[candidate(d(2024, 3, 1), stops.clone())])
            .await
            .unwrap();
        let stats = storage
            .load_day(d(2024, 3, 3), &[candidate(d(2024, 3, 3), stops)])
            .await
            .unwrap();
        assert_eq!(stats.routes_inserted, 1);
        assert_eq!(stats.stops_extended, 1);

        let key = candidate(d(2024, 3, 1), vec![]).key;
        let versions = storage.routes_by_key(&key).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(storage.routes_at(d(2024, 3, 2)).await.unwrap().len(), 0);
        assert_eq!(storage.routes_at(d(2024, 3, 3)).await.unwrap().len(), 1);

        // Both versions reference the single merged stop row.
        let first = storage.route_stops(versions[0].id).await.unwrap();
        let second = storage.route_stops(versions[1].id).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(storage.stops_by_code("1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn continuity_does_not_reopen_superseded_stop() {
        let storage = test_storage().await;
        storage
            .load_day(d(2024, 3, 1), &[candidate(d(2024, 3, 1), vec![obs("1", "A")])])
            .await
            .unwrap();

        // The stop changes on day 2 through another route.
        let mut other = candidate(d(2024, 3, 2), vec![obs("1", "A renamed")]);
        other.key.mkt = 20000;
        let same = candidate(d(2024, 3, 2), vec![obs("1", "A")]);
        storage.load_day(d(2024, 3, 2), &[other, same]).await.unwrap();

        let versions = storage.stops_by_code("1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].max_date, d(2024, 3, 1));
        assert_eq!(versions[1].min_date, d(2024, 3, 2));
    }

    #[tokio::test]
    async fn mismatched_candidate_date_is_rejected_and_rolled_back() {
        let storage = test_storage().await;
        let good = candidate(d(2024, 3, 1), vec![obs("1", "A")]);
        let bad = candidate(d(2024, 3, 2), vec![obs("2", "B")]);

        let err = storage.load_day(d(2024, 3, 1), &[good.clone(), bad]).await.unwrap_err();
        assert!(matches!(err, GtfsEtlError::Validation { .. }));
        assert!(storage.routes_by_key(&good.key).await.unwrap().is_empty());
        assert!(storage.stops_by_code("1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_covering_versions_are_unsupported_state() {
        let storage = test_storage().await;
        let date = d(2024, 3, 1);
        let route = candidate(date, vec![]);
        for _ in 0..2 {
            let mut load = storage.begin_day_load(date).await.unwrap();
            load.insert_route(&route).await.unwrap();
            load.commit().await.unwrap();
        }

        let err = storage.load_day(date, &[route]).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
