use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tracked metrics. Column names double as the suffix of the per-metric
/// analytics columns (`avg_percent_speeding`, `median_distance_driven`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    PercentSpeeding,
    DistanceDriven,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::PercentSpeeding, Metric::DistanceDriven];

    pub fn column(&self) -> &'static str {
        match self {
            Metric::PercentSpeeding => "percent_speeding",
            Metric::DistanceDriven => "distance_driven",
        }
    }

    pub fn trend_column(&self) -> &'static str {
        match self {
            Metric::PercentSpeeding => "speeding_trend_json",
            Metric::DistanceDriven => "distance_trend_json",
        }
    }

    /// Percentage metrics never get a negative filter floor.
    pub fn is_percentage(&self) -> bool {
        matches!(self, Metric::PercentSpeeding)
    }
}

/// One driver's metrics for one reporting period.
///
/// Natural key is `(driver_id, start_date, end_date)`. `driver_id` may be
/// absent when the export omitted it and the identity directory had no match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetryRecord {
    pub driver_id: Option<i64>,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,

    pub driver_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub vehicle_type: Option<String>,

    pub percent_speeding: Option<f64>,
    pub distance_driven: Option<f64>,
    /// Synthesized/interpolated row rather than an observed one
    pub is_interpolated: Option<bool>,

    pub max_speed_non_interstate_freeway: Option<f64>,
    pub percent_speeding_non_interstate_freeway: Option<f64>,
    pub max_speed_interstate_freeway: Option<f64>,
    pub percent_speeding_interstate_freeway: Option<f64>,
    pub worst_incident_date: Option<NaiveDateTime>,
    pub incident_location: Option<String>,
    pub speed_limit: Option<f64>,
    pub speed: Option<f64>,
    pub speed_cap: Option<String>,
    pub custom_speed_restriction: Option<String>,
    pub url: Option<String>,
    pub url_lat: Option<f64>,
    pub url_lon: Option<f64>,
    pub location: Option<String>,
    pub percent_speeding_numerator: Option<f64>,
    pub percent_speeding_denominator: Option<f64>,
    pub incidents_interstate_freeway: Option<f64>,
    pub observations_interstate_freeway: Option<f64>,
    pub incidents_non_interstate_freeway: Option<f64>,
    pub observations_non_interstate_freeway: Option<f64>,
    pub difference: Option<f64>,

    /// JSON snapshot of every parsed field, timestamps as ISO-8601 strings
    pub raw_json: String,
}

impl RawTelemetryRecord {
    /// Overwrite one key of the `raw_json` snapshot, keeping keys sorted.
    pub fn set_raw_field(&mut self, key: &str, value: serde_json::Value) {
        let mut map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.raw_json).unwrap_or_default();
        map.insert(key.to_string(), value);
        if let Ok(json) = serde_json::to_string(&map) {
            self.raw_json = json;
        }
    }
}

/// Entry of the name-keyed identity directory (`drivers.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub driver_id: i64,
    pub first_name: String,
    pub last_name: String,
}

// ============================================================================
// FILTER BOUNDS
// ============================================================================

/// Acceptable value range for one metric (inclusive on both ends).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBounds {
    pub min: f64,
    pub max: f64,
}

impl MetricBounds {
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Outlier filter for one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterBounds {
    pub stdev_threshold: f64,
    pub percent_speeding: MetricBounds,
    pub distance_driven: MetricBounds,
}

impl FilterBounds {
    pub fn get(&self, metric: Metric) -> MetricBounds {
        match metric {
            Metric::PercentSpeeding => self.percent_speeding,
            Metric::DistanceDriven => self.distance_driven,
        }
    }
}

// ============================================================================
// ANALYTICS SNAPSHOTS
// ============================================================================

/// Key of a company-wide snapshot. Each reporting date has two: one over
/// every row, one restricted to observed (non-generated) rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompanyKey {
    pub start_date: NaiveDateTime,
    pub generated_allowed: bool,
}

/// Key of a per-driver trailing-year snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverKey {
    pub driver_id: i64,
    pub start_date: NaiveDateTime,
}

/// Date-ordered aggregate values keyed by ISO date (`YYYY-MM-DD`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrendSeries(pub BTreeMap<String, f64>);

impl TrendSeries {
    pub fn to_blob(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Lenient decode: a damaged blob yields whatever entries still parse.
    pub fn from_blob(blob: &str) -> Self {
        if let Ok(map) = serde_json::from_str::<BTreeMap<String, f64>>(blob) {
            return Self(map);
        }
        let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(blob)
        else {
            return Self::default();
        };
        Self(
            obj.into_iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Statistics for one metric inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub count: i64,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub stddev: Option<f64>,
    pub median: Option<f64>,
    pub abs_change: Option<f64>,
    pub percent_change: Option<f64>,
    /// Driver scope only: unfiltered value at the key date
    pub current_week: Option<f64>,
    /// Driver scope only: value at the driver's latest earlier date
    pub previous_week: Option<f64>,
    pub trend: TrendSeries,
}

/// Everything the aggregate builder derives for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFields {
    /// Rows in scope before per-metric filtering
    pub records_count: i64,
    pub stdev_threshold: f64,
    pub percent_speeding: MetricSnapshot,
    pub distance_driven: MetricSnapshot,
}

impl SnapshotFields {
    pub fn metric(&self, metric: Metric) -> &MetricSnapshot {
        match metric {
            Metric::PercentSpeeding => &self.percent_speeding,
            Metric::DistanceDriven => &self.distance_driven,
        }
    }

    pub fn metric_mut(&mut self, metric: Metric) -> &mut MetricSnapshot {
        match metric {
            Metric::PercentSpeeding => &mut self.percent_speeding,
            Metric::DistanceDriven => &mut self.distance_driven,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySnapshot {
    pub key: CompanyKey,
    pub fields: SnapshotFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSnapshot {
    pub key: DriverKey,
    pub fields: SnapshotFields,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_blob_is_ordered() {
        let mut map = BTreeMap::new();
        map.insert("2024-01-08".to_string(), 4.5);
        map.insert("2024-01-01".to_string(), 3.0);
        let blob = TrendSeries(map).to_blob();
        assert_eq!(blob, r#"{"2024-01-01":3.0,"2024-01-08":4.5}"#);
    }

    #[test]
    fn test_trend_blob_is_loss_tolerant() {
        let series = TrendSeries::from_blob(r#"{"2024-01-01":3.0,"2024-01-08":null}"#);
        assert_eq!(series.len(), 1);
        assert_eq!(series.0.get("2024-01-01"), Some(&3.0));

        assert!(TrendSeries::from_blob("not json").is_empty());
    }

    #[test]
    fn test_set_raw_field_keeps_other_keys() {
        let mut rec = RawTelemetryRecord {
            raw_json: r#"{"driver_id":null,"driver_name":"Jane Doe"}"#.to_string(),
            ..Default::default()
        };
        rec.set_raw_field("driver_id", serde_json::json!(7));
        assert_eq!(rec.raw_json, r#"{"driver_id":7,"driver_name":"Jane Doe"}"#);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let b = MetricBounds { min: 0.0, max: 50.0 };
        assert!(b.contains(0.0));
        assert!(b.contains(50.0));
        assert!(!b.contains(50.01));
    }
}
