//! Query interpretation shared by the local queue search and the server-side
//! order search: Spanish/numeric date phrases, short ticket lookups, and
//! digit normalization for cedula/phone matching.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;

/// Explicit filter panel fields. Dates are `YYYY-MM-DD` local calendar days.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cedula: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, alias = "ticket_number")]
    pub ticket_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "start_date")]
    pub start_date: Option<String>,
    #[serde(default, alias = "end_date")]
    pub end_date: Option<String>,
}

/// How a free-text query should be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Empty,
    /// Restrict to one local calendar day; all other filters are ignored.
    Date(NaiveDate),
    /// Short numeric query: ticket number only.
    Ticket { digits: String, exact: bool },
    /// Free text, already trimmed and lower-cased.
    Text(String),
}

const MONTHS: &[(&str, u32)] = &[
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("setiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
];

fn natural_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})\s+de\s+([a-záéíóú]+)(?:\s+(?:de\s+)?(\d{4}))?")
            .unwrap_or_else(|e| panic!("invalid natural date regex: {e}"))
    })
}

fn numeric_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2})[/\-](\d{1,2})(?:[/\-](\d{4}))?\b")
            .unwrap_or_else(|e| panic!("invalid numeric date regex: {e}"))
    })
}

pub fn spanish_month(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    MONTHS.iter().find(|(m, _)| *m == name).map(|(_, n)| *n)
}

/// Detect a date phrase in `term`: "15 de enero", "15 de enero 2025",
/// "15 de enero de 2025", "15/01", "15-01-2025". The year defaults to
/// `today`'s year. Impossible dates are not dates.
pub fn parse_smart_date(term: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(caps) = natural_date_re().captures(term) {
        let day: u32 = caps[1].parse().ok()?;
        if let Some(month) = spanish_month(&caps[2]) {
            let year = caps
                .get(3)
                .and_then(|y| y.as_str().parse::<i32>().ok())
                .unwrap_or(today.year());
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Some(date);
            }
        }
    }

    let caps = numeric_date_re().captures(term)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year = caps
        .get(3)
        .and_then(|y| y.as_str().parse::<i32>().ok())
        .unwrap_or(today.year());
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Classify a raw query. The raw string is inspected before trimming so a
/// trailing space can request an exact ticket match.
pub fn classify_query(raw: &str, today: NaiveDate) -> QueryKind {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return QueryKind::Empty;
    }
    if let Some(date) = parse_smart_date(trimmed, today) {
        return QueryKind::Date(date);
    }
    if trimmed.len() <= 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return QueryKind::Ticket {
            digits: trimmed.to_string(),
            exact: raw.ends_with(' '),
        };
    }
    QueryKind::Text(trimmed.to_lowercase())
}

/// Keep only ASCII digits.
pub fn normalize_digits(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Start (inclusive) and end (exclusive) of a local calendar day, in UTC.
pub fn local_day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    (local_midnight(date), local_midnight(date.succ_opt().unwrap_or(date)))
}

fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Parse a `YYYY-MM-DD` filter value.
pub fn parse_day(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

pub fn today_local() -> NaiveDate {
    Local::now().date_naive()
}

/// Non-empty trimmed filter value.
pub fn filter_value(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
