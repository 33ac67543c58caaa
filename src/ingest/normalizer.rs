//! Record normalizer: one export file -> canonical typed rows
//!
//! Export layout:
//! ```text
//! driver_name,driver_id,percent_speeding,distance_driven,...
//! Jane Doe,,5.0,1200,...
//! Median,,12.1,900,...
//! ---
//! <footer row>
//! <footer row>
//! Monday, January 1, 2024, 00:00 - Sunday, January 7, 2024, 23:59
//! ```
//! Driver rows run until the `---` sentinel. The reporting period sits three
//! records below it. Per-cell coercion is lenient (bad values become `None`);
//! only a missing sentinel, period or identity column rejects the file.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use super::IngestError;
use crate::models::RawTelemetryRecord;

const SENTINEL: &str = "---";
const PERIOD_OFFSET: usize = 3;
const PERIOD_PATTERN: &str = r"\w+, (\w+ \d{1,2}, \d{4}, \d{2}:\d{2})";
const PERIOD_FORMAT: &str = "%A, %B %d, %Y, %H:%M";
/// Period stamps are read without their weekday name, which is not checked.
const PERIOD_STAMP_FORMAT: &str = "%B %d, %Y, %H:%M";
const GEO_PATTERN: &str = r"la=(-?\d+\.\d+)&lo=(-?\d+\.\d+)&";
const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Cell values that mean "no value".
const MISSING_MARKERS: [&str; 7] = ["", "-", "nan", "null", "none", "n/a", "#n/a"];

/// Date-time layouts accepted for date cells, tried in order.
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    PERIOD_FORMAT,
];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Canonical rows of one export plus its reporting period.
#[derive(Debug, Clone)]
pub struct ParsedReport {
    pub source: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub records: Vec<RawTelemetryRecord>,
    /// Summary rows (median, totals) and rows without a driver name
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Real,
    Flag,
    Timestamp,
    Text,
}

fn column_kind(column: &str) -> ColumnKind {
    match column {
        "driver_id" => ColumnKind::Integer,
        "percent_speeding"
        | "distance_driven"
        | "max_speed_non_interstate_freeway"
        | "percent_speeding_non_interstate_freeway"
        | "max_speed_interstate_freeway"
        | "percent_speeding_interstate_freeway"
        | "speed_limit"
        | "speed"
        | "url_lat"
        | "url_lon"
        | "percent_speeding_numerator"
        | "percent_speeding_denominator"
        | "incidents_interstate_freeway"
        | "observations_interstate_freeway"
        | "incidents_non_interstate_freeway"
        | "observations_non_interstate_freeway"
        | "difference" => ColumnKind::Real,
        "is_interpolated" => ColumnKind::Flag,
        "worst_incident_date" | "start_date" | "end_date" => ColumnKind::Timestamp,
        _ => ColumnKind::Text,
    }
}

struct Patterns {
    period: Regex,
    geo: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            period: Regex::new(PERIOD_PATTERN).context("period pattern")?,
            geo: Regex::new(GEO_PATTERN).context("geo pattern")?,
        })
    }
}

// =============================================================================
// File parsing
// =============================================================================

pub fn parse_report(path: &Path) -> Result<ParsedReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_report_str(&name, &text)
}

pub fn parse_report_str(name: &str, text: &str) -> Result<ParsedReport> {
    let patterns = Patterns::compile()?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("{}: unreadable header row", name))?
        .iter()
        .map(normalize_header)
        .collect();

    if !headers.iter().any(|h| h == "driver_name") {
        return Err(IngestError::MissingColumn {
            file: name.to_string(),
            column: "driver_name",
        }
        .into());
    }

    let rows = reader
        .records()
        .collect::<Result<Vec<csv::StringRecord>, _>>()
        .with_context(|| format!("{}: unreadable CSV body", name))?;

    let sentinel = rows
        .iter()
        .position(|r| r.get(0).map(str::trim) == Some(SENTINEL))
        .ok_or_else(|| IngestError::MissingSentinel {
            file: name.to_string(),
        })?;

    let (start_date, end_date) = rows
        .get(sentinel + PERIOD_OFFSET)
        .map(|r| r.iter().collect::<Vec<_>>().join(","))
        .ok_or_else(|| IngestError::MalformedPeriod {
            file: name.to_string(),
            found: String::new(),
        })
        .and_then(|line| {
            parse_period(&patterns.period, &line).ok_or(IngestError::MalformedPeriod {
                file: name.to_string(),
                found: line,
            })
        })?;

    let mut records = Vec::with_capacity(sentinel);
    let mut skipped_rows = 0;
    for row in &rows[..sentinel] {
        match normalize_row(&headers, row, start_date, end_date, &patterns) {
            Some(record) => records.push(record),
            None => skipped_rows += 1,
        }
    }

    debug!(
        file = name,
        rows = records.len(),
        skipped = skipped_rows,
        %start_date,
        %end_date,
        "Parsed export"
    );

    Ok(ParsedReport {
        source: name.to_string(),
        start_date,
        end_date,
        records,
        skipped_rows,
    })
}

/// `"Percent Speeding"` -> `"percent_speeding"`
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '-' | '/' | ' ') { '_' } else { c })
        .collect()
}

fn parse_period(pattern: &Regex, line: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let stamps: Vec<&str> = pattern
        .captures_iter(line)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if stamps.len() != 2 {
        return None;
    }
    let start = NaiveDateTime::parse_from_str(stamps[0], PERIOD_STAMP_FORMAT).ok()?;
    let end = NaiveDateTime::parse_from_str(stamps[1], PERIOD_STAMP_FORMAT).ok()?;
    Some((start, end))
}

// =============================================================================
// Row normalization
// =============================================================================

fn normalize_row(
    headers: &[String],
    row: &csv::StringRecord,
    start_date: NaiveDateTime,
    end_date: NaiveDateTime,
    patterns: &Patterns,
) -> Option<RawTelemetryRecord> {
    let mut fields: Map<String, Value> = Map::new();
    for (header, cell) in headers.iter().zip(row.iter()) {
        if header.is_empty() {
            continue;
        }
        fields.insert(header.clone(), coerce(column_kind(header), cell));
    }
    for header in headers.iter().skip(row.len()) {
        if !header.is_empty() {
            fields.entry(header.clone()).or_insert(Value::Null);
        }
    }

    let driver_name = fields
        .get("driver_name")
        .and_then(Value::as_str)
        .map(str::to_string)?;
    if is_summary_row(&driver_name) {
        return None;
    }

    let (first_name, last_name) = split_name(&driver_name);
    let url = fields.get("url").and_then(Value::as_str).map(str::to_string);
    let (url_lat, url_lon) = url
        .as_deref()
        .map(|u| parse_geo(&patterns.geo, u))
        .unwrap_or((None, None));

    fields.insert("first_name".into(), opt_text(&first_name));
    fields.insert("last_name".into(), opt_text(&last_name));
    fields.insert("url_lat".into(), opt_real(url_lat));
    fields.insert("url_lon".into(), opt_real(url_lon));
    fields.insert("start_date".into(), iso(start_date));
    fields.insert("end_date".into(), iso(end_date));

    let text = |k: &str| fields.get(k).and_then(Value::as_str).map(str::to_string);
    let real = |k: &str| fields.get(k).and_then(Value::as_f64);

    let record = RawTelemetryRecord {
        driver_id: fields.get("driver_id").and_then(Value::as_i64),
        start_date,
        end_date,
        driver_name,
        first_name,
        last_name,
        vehicle_type: text("vehicle_type"),
        percent_speeding: real("percent_speeding"),
        distance_driven: real("distance_driven"),
        is_interpolated: fields.get("is_interpolated").and_then(Value::as_bool),
        max_speed_non_interstate_freeway: real("max_speed_non_interstate_freeway"),
        percent_speeding_non_interstate_freeway: real("percent_speeding_non_interstate_freeway"),
        max_speed_interstate_freeway: real("max_speed_interstate_freeway"),
        percent_speeding_interstate_freeway: real("percent_speeding_interstate_freeway"),
        worst_incident_date: text("worst_incident_date")
            .and_then(|s| NaiveDateTime::parse_from_str(&s, ISO_FORMAT).ok()),
        incident_location: text("incident_location"),
        speed_limit: real("speed_limit"),
        speed: real("speed"),
        speed_cap: text("speed_cap"),
        custom_speed_restriction: text("custom_speed_restriction"),
        url,
        url_lat,
        url_lon,
        location: text("location"),
        percent_speeding_numerator: real("percent_speeding_numerator"),
        percent_speeding_denominator: real("percent_speeding_denominator"),
        incidents_interstate_freeway: real("incidents_interstate_freeway"),
        observations_interstate_freeway: real("observations_interstate_freeway"),
        incidents_non_interstate_freeway: real("incidents_non_interstate_freeway"),
        observations_non_interstate_freeway: real("observations_non_interstate_freeway"),
        difference: real("difference"),
        raw_json: String::new(),
    };

    let raw_json = serde_json::to_string(&fields).ok()?;
    Some(RawTelemetryRecord { raw_json, ..record })
}

/// Footer-style rows that are not drivers.
fn is_summary_row(name: &str) -> bool {
    name.eq_ignore_ascii_case("median")
        || name.chars().next().map_or(true, |c| c.is_ascii_digit())
}

/// First whitespace token and last whitespace token.
pub fn split_name(name: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.as_slice() {
        [] => (None, None),
        [only] => (Some(only.to_string()), None),
        [first, .., last] => (Some(first.to_string()), Some(last.to_string())),
    }
}

fn parse_geo(pattern: &Regex, url: &str) -> (Option<f64>, Option<f64>) {
    pattern
        .captures(url)
        .and_then(|c| {
            let lat = c.get(1)?.as_str().parse::<f64>().ok()?;
            let lon = c.get(2)?.as_str().parse::<f64>().ok()?;
            Some((Some(lat), Some(lon)))
        })
        .unwrap_or((None, None))
}

// =============================================================================
// Cell coercion
// =============================================================================

fn coerce(kind: ColumnKind, cell: &str) -> Value {
    let cell = cell.trim();
    if is_missing(cell) {
        return Value::Null;
    }
    match kind {
        ColumnKind::Integer => parse_int(cell).map(Value::from).unwrap_or(Value::Null),
        ColumnKind::Real => opt_real(parse_real(cell)),
        ColumnKind::Flag => parse_flag(cell).map(Value::Bool).unwrap_or(Value::Null),
        ColumnKind::Timestamp => parse_timestamp(cell).map(iso).unwrap_or(Value::Null),
        ColumnKind::Text => Value::String(cell.to_string()),
    }
}

fn is_missing(cell: &str) -> bool {
    MISSING_MARKERS.iter().any(|m| cell.eq_ignore_ascii_case(m))
}

/// Accepts `"1201619"` and `"1201619.0"`.
pub fn parse_int(cell: &str) -> Option<i64> {
    if let Ok(v) = cell.parse::<i64>() {
        return Some(v);
    }
    let f = cell.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn parse_real(cell: &str) -> Option<f64> {
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_flag(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_timestamp(cell: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Some(dt.naive_local());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(cell, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(cell, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn iso(ts: NaiveDateTime) -> Value {
    Value::String(ts.format(ISO_FORMAT).to_string())
}

fn opt_real(v: Option<f64>) -> Value {
    v.and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn opt_text(v: &Option<String>) -> Value {
    v.as_ref()
        .map(|s| Value::String(s.clone()))
        .unwrap_or(Value::Null)
}
