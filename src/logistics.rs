//! Daily garment counts (plant / home delivery) and the ingress/egress
//! summary built from order creation and delivery dates.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Local, NaiveDate};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::STATUS_DELIVERED;
use crate::search;

const DEFAULT_HISTORY_LIMIT: usize = 30;
const DEFAULT_SUMMARY_DAYS: i64 = 7;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCountInput {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub plant_count: Option<i64>,
    #[serde(default)]
    pub home_count: Option<i64>,
    #[serde(default)]
    pub plant_notes: Option<String>,
    #[serde(default)]
    pub home_notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountsQuery {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, alias = "start")]
    pub start_date: Option<String>,
    #[serde(default, alias = "end")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub date: String,
    pub plant: i64,
    pub home: i64,
    pub ingress: i64,
    pub egress: i64,
    pub plant_notes: Option<String>,
    pub home_notes: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Insert or replace the counts for one day. Blank notes keep the stored
/// ones.
pub fn upsert_daily_count(db: &DbState, input: &DailyCountInput) -> PosResult<Value> {
    let raw_date =
        non_empty(&input.date).ok_or_else(|| PosError::Validation("Date is required".into()))?;
    let day = search::parse_day(raw_date)
        .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {raw_date}")))?;
    let plant = input.plant_count.unwrap_or(0);
    let home = input.home_count.unwrap_or(0);
    if plant < 0 || home < 0 {
        return Err(PosError::Validation("Los conteos no pueden ser negativos".into()));
    }

    let date = day.format("%Y-%m-%d").to_string();
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO daily_garment_counts
            (id, date, plant_count, home_count, plant_notes, home_notes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(date) DO UPDATE SET
            plant_count = excluded.plant_count,
            home_count = excluded.home_count,
            plant_notes = COALESCE(excluded.plant_notes, plant_notes),
            home_notes = COALESCE(excluded.home_notes, home_notes),
            updated_at = excluded.updated_at",
        params![
            db::new_id(),
            date,
            plant,
            home,
            non_empty(&input.plant_notes),
            non_empty(&input.home_notes),
            db::now_iso(),
        ],
    )?;
    info!(date = %date, plant = plant, home = home, "Daily garment count saved");

    let record = count_rows(
        &conn,
        "SELECT date, plant_count, home_count, plant_notes, home_notes
         FROM daily_garment_counts WHERE date = ?1",
        params![date],
    )?;
    Ok(json!({ "success": true, "data": record.into_iter().next() }))
}

fn count_rows(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> PosResult<Vec<DayStats>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok(DayStats {
            date: row.get(0)?,
            plant: row.get(1)?,
            home: row.get(2)?,
            plant_notes: row.get(3)?,
            home_notes: row.get(4)?,
            ..Default::default()
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Latest recorded days, newest first.
pub fn history(db: &DbState, limit: Option<usize>) -> PosResult<Value> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 365);
    let conn = db.lock()?;
    let rows = count_rows(
        &conn,
        "SELECT date, plant_count, home_count, plant_notes, home_notes
         FROM daily_garment_counts ORDER BY date DESC LIMIT ?1",
        params![limit as i64],
    )?;
    Ok(json!({ "success": true, "data": rows }))
}

fn local_day_key(ts: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Local).date_naive().format("%Y-%m-%d").to_string())
}

/// Per-day counts plus orders created (ingress) and delivered (egress)
/// between `start` and `end`, inclusive local days.
pub fn summary(db: &DbState, start: NaiveDate, end: NaiveDate) -> PosResult<Value> {
    if end < start {
        return Err(PosError::Validation("endDate es anterior a startDate".into()));
    }
    let (from, _) = search::local_day_bounds(start);
    let (_, until) = search::local_day_bounds(end);
    let (from, until) = (db::to_iso(from), db::to_iso(until));

    let conn = db.lock()?;
    let mut stats: BTreeMap<String, DayStats> = BTreeMap::new();
    for count in count_rows(
        &conn,
        "SELECT date, plant_count, home_count, plant_notes, home_notes
         FROM daily_garment_counts WHERE date >= ?1 AND date <= ?2",
        params![start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string()],
    )? {
        stats.insert(count.date.clone(), count);
    }

    let mut stmt = conn.prepare(
        "SELECT created_at FROM orders WHERE created_at >= ?1 AND created_at < ?2",
    )?;
    let created = stmt
        .query_map(params![from, until], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for key in created.iter().filter_map(|ts| local_day_key(ts)) {
        day_entry(&mut stats, key).ingress += 1;
    }

    let mut stmt = conn.prepare(
        "SELECT delivered_date FROM orders
         WHERE delivered_date >= ?1 AND delivered_date < ?2 AND status IN (?3, 'ENTREGADO')",
    )?;
    let delivered = stmt
        .query_map(params![from, until, STATUS_DELIVERED], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for key in delivered.iter().filter_map(|ts| local_day_key(ts)) {
        day_entry(&mut stats, key).egress += 1;
    }

    let data: Vec<DayStats> = stats.into_values().collect();
    Ok(json!({
        "success": true,
        "startDate": start.format("%Y-%m-%d").to_string(),
        "endDate": end.format("%Y-%m-%d").to_string(),
        "data": data,
    }))
}

fn day_entry(stats: &mut BTreeMap<String, DayStats>, key: String) -> &mut DayStats {
    stats.entry(key.clone()).or_insert_with(|| DayStats {
        date: key,
        ..Default::default()
    })
}

/// GET dispatcher: `mode=summary` or the history listing.
pub fn query_counts(db: &DbState, q: &CountsQuery) -> PosResult<Value> {
    if q.mode.as_deref() != Some("summary") {
        return history(db, q.limit);
    }
    let today = search::today_local();
    let start = match non_empty(&q.start_date) {
        Some(s) => search::parse_day(s)
            .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {s}")))?,
        None => today - Duration::days(DEFAULT_SUMMARY_DAYS),
    };
    let end = match non_empty(&q.end_date) {
        Some(s) => search::parse_day(s)
            .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {s}")))?,
        None => today,
    };
    summary(db, start, end)
}
