//! Turning a route statistics table into per-route daily records.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use gtfs_etl_shared::{GtfsEtlError, RideRecord, RouteDailyRecord, RouteKey, Result, StopObservation};

use crate::stats::StatsTable;

/// Separator of list-valued cells.
const LIST_SEPARATOR: char = ';';

struct Columns {
    route_id: usize,
    agency_id: usize,
    short_name: usize,
    long_name: usize,
    mkt: usize,
    direction: usize,
    alternative: usize,
    agency_name: usize,
    route_type: usize,
    start_times: usize,
    trip_ids: usize,
    stop_codes: usize,
    stop_names: usize,
    stop_cities: usize,
    stop_latlons: usize,
}

impl Columns {
    fn locate(table: &StatsTable) -> Result<Self> {
        Ok(Self {
            route_id: table.column_index("route_id")?,
            agency_id: table.column_index("agency_id")?,
            short_name: table.column_index("route_short_name")?,
            long_name: table.column_index("route_long_name")?,
            mkt: table.column_index("route_mkt")?,
            direction: table.column_index("route_direction")?,
            alternative: table.column_index("route_alternative")?,
            agency_name: table.column_index("agency_name")?,
            route_type: table.column_index("route_type")?,
            start_times: table.column_index("all_start_time")?,
            trip_ids: table.column_index("all_trip_id")?,
            stop_codes: table.column_index("all_stop_code")?,
            stop_names: table.column_index("all_stop_name")?,
            stop_cities: table.column_index("all_stop_desc_city")?,
            stop_latlons: table.column_index("all_stop_latlon")?,
        })
    }
}

/// Parse every row of a route statistics table as observed on `date`.
pub fn parse_route_records(table: &StatsTable, date: NaiveDate) -> Result<Vec<RouteDailyRecord>> {
    let cols = Columns::locate(table)?;
    table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            parse_row(&cols, row, date)
                .map_err(|e| GtfsEtlError::parse(format!("route stats row {}: {e}", i + 1)))
        })
        .collect()
}

fn parse_row(cols: &Columns, row: &[String], date: NaiveDate) -> Result<RouteDailyRecord> {
    let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or_default();

    let key = RouteKey {
        mkt: parse_int(cell(cols.mkt), "route_mkt")?,
        direction: parse_int(cell(cols.direction), "route_direction")?,
        alternative: cell(cols.alternative).to_string(),
        operator_ref: parse_int(cell(cols.agency_id), "agency_id")?,
    };

    let start_times = split_list(cell(cols.start_times));
    let trip_ids = split_list(cell(cols.trip_ids));
    if start_times.len() != trip_ids.len() {
        return Err(GtfsEtlError::parse(format!(
            "{} start times but {} trip ids",
            start_times.len(),
            trip_ids.len()
        )));
    }
    let rides = start_times
        .into_iter()
        .zip(trip_ids)
        .map(|(time, trip)| {
            Ok(RideRecord {
                journey_ref: trip.to_string(),
                scheduled_start_time: scheduled_time(date, time)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let codes = split_list(cell(cols.stop_codes));
    let names = split_list(cell(cols.stop_names));
    let cities = split_list(cell(cols.stop_cities));
    let latlons = split_list(cell(cols.stop_latlons));
    if [names.len(), cities.len(), latlons.len()]
        .iter()
        .any(|&n| n != codes.len())
    {
        return Err(GtfsEtlError::parse(format!(
            "stop lists differ in length: {} codes, {} names, {} cities, {} coordinates",
            codes.len(),
            names.len(),
            cities.len(),
            latlons.len()
        )));
    }
    let stops = codes
        .iter()
        .zip(&names)
        .zip(&cities)
        .zip(&latlons)
        .map(|(((code, name), city), latlon)| {
            let (lat, lon) = parse_latlon(latlon)?;
            Ok(StopObservation {
                code: code.to_string(),
                lat,
                lon,
                name: name.to_string(),
                city: city.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RouteDailyRecord {
        date,
        key,
        line_ref: parse_int(cell(cols.route_id), "route_id")?,
        short_name: cell(cols.short_name).to_string(),
        long_name: cell(cols.long_name).to_string(),
        agency_name: cell(cols.agency_name).to_string(),
        route_type: parse_int(cell(cols.route_type), "route_type")?,
        stops,
        rides,
    })
}

fn split_list(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split(LIST_SEPARATOR).collect()
    }
}

/// Integers may arrive as `"12"` or `"12.0"`.
fn parse_int(value: &str, column: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    match value.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
        _ => Err(GtfsEtlError::parse(format!("{column}: not an integer: {value:?}"))),
    }
}

fn parse_latlon(value: &str) -> Result<(f64, f64)> {
    let bad = || GtfsEtlError::parse(format!("invalid coordinate pair {value:?}"));
    let (lat, lon) = value.split_once(',').ok_or_else(bad)?;
    let lat = lat.trim().parse::<f64>().map_err(|_| bad())?;
    let lon = lon.trim().parse::<f64>().map_err(|_| bad())?;
    Ok((lat, lon))
}

/// `HH:MM:SS` on `date`, in UTC. Hours past 23 roll into the following days.
fn scheduled_time(date: NaiveDate, value: &str) -> Result<DateTime<Utc>> {
    let bad = || GtfsEtlError::parse(format!("invalid start time {value:?}"));
    let mut parts = value.trim().split(':').map(|p| p.parse::<u32>());
    let (Some(Ok(h)), Some(Ok(m)), Some(Ok(s)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad());
    };
    if m >= 60 || s >= 60 {
        return Err(bad());
    }
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(bad)?.and_utc();
    Ok(midnight
        + Duration::hours(i64::from(h))
        + Duration::minutes(i64::from(m))
        + Duration::seconds(i64::from(s)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::stats::StatsTable;

    pub(crate) const ROUTE_COLUMNS: [&str; 15] = [
        "route_id",
        "agency_id",
        "route_short_name",
        "route_long_name",
        "route_mkt",
        "route_direction",
        "route_alternative",
        "agency_name",
        "route_type",
        "all_start_time",
        "all_trip_id",
        "all_stop_code",
        "all_stop_name",
        "all_stop_desc_city",
        "all_stop_latlon",
    ];

    /// A route stats table with two routes sharing stop 1001.
    pub(crate) fn route_stats_table() -> StatsTable {
        let mut table = StatsTable::new(ROUTE_COLUMNS.iter().map(|c| c.to_string()).collect());
        table
            .push_row(
                [
                    "1", "3", "1", "Haifa-Tel Aviv", "10001", "1", "#", "Egged", "3",
                    "06:00:00;24:15:00", "t1;t2", "1001;1002", "Central;Port", "Haifa;Haifa",
                    "32.79,34.99;32.82,35.00",
                ]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            )
            .unwrap();
        table
            .push_row(
                [
                    "2", "5", "14", "Beersheba", "20002", "2", "1", "Dan", "3", "07:30:00",
                    "t3", "1001", "Central", "Haifa", "32.79,34.99",
                ]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            )
            .unwrap();
        table
    }
}
