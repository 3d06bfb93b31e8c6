use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One changed series reported by the source since the last token.
///
/// `first_point_changed == DateTime::<Utc>::MIN_UTC` is the source's way of
/// saying "this series was fully re-derived; the origin of the change is
/// unknown". An absent `first_point_changed` means only attributes changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub series_id: Uuid,
    pub first_point_changed: Option<DateTime<Utc>>,
    pub has_attribute_change: Option<bool>,
}

impl ChangeEvent {
    /// Union with a later report for the same series: the earlier point-change
    /// origin wins (a concrete timestamp beats absent), attribute changes OR.
    pub fn merge(&mut self, other: &ChangeEvent) {
        self.first_point_changed = match (self.first_point_changed, other.first_point_changed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.has_attribute_change = match (self.has_attribute_change, other.has_attribute_change) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
        };
    }

    #[must_use]
    pub fn is_rederived(&self) -> bool {
        self.first_point_changed == Some(DateTime::<Utc>::MIN_UTC)
    }
}

/// Immutable snapshot of a series' metadata, fetched once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesDescription {
    pub unique_id: Uuid,
    pub identifier: String,
    pub location_id: String,
    pub parameter: String,
    pub label: String,
    pub unit: String,
    pub interpolation_kind: String,
    pub utc_offset_hours: f64,
    #[serde(default)]
    pub extended_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Point metadata validity intervals are half-open: start inclusive,
/// end exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInterval {
    pub approval_level: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeInterval {
    pub grade_code: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualifierInterval {
    pub identifier: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub(crate) fn interval_contains(start: DateTime<Utc>, end: DateTime<Utc>, ts: DateTime<Utc>) -> bool {
    start <= ts && ts < end
}

/// A fetched slice of a series: strictly time-ordered points with unique
/// timestamps, plus the metadata records covering them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub points: Vec<Point>,
    pub approvals: Vec<ApprovalInterval>,
    pub grades: Vec<GradeInterval>,
    pub qualifiers: Vec<QualifierInterval>,
}

/// An existing sensor registration on the target. The last phenomenon time
/// is the authoritative "last exported time" for the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub procedure_id: String,
    pub offering_id: String,
    pub phenomenon_times: Vec<DateTime<Utc>>,
}

impl SensorInfo {
    #[must_use]
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.phenomenon_times.last().copied()
    }
}

/// Persisted sync cursor, keyed by configuration name in the source's
/// settings facility. Only reusable when the config hash still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncToken {
    pub config_hash: String,
    pub changes_since: DateTime<Utc>,
}

/// Trailing duration of a series' history that is kept synchronized.
/// `retention_days <= 0` means the full signal is exported, unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportWindow {
    pub retention_days: i64,
    pub label: String,
}

impl ExportWindow {
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.retention_days <= 0
    }
}

// Reference tables used to resolve filter rule text to numeric codes.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalMetadata {
    pub identifier: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeMetadata {
    pub identifier: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifierMetadata {
    pub identifier: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationDescription {
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationData {
    pub identifier: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationData {
    /// A 0,0 coordinate pair means the location has no usable geography.
    #[must_use]
    pub fn has_spatial_reference(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn merge_takes_earlier_point_change() {
        let id = Uuid::new_v4();
        let mut event = ChangeEvent {
            series_id: id,
            first_point_changed: Some(ts(2_000)),
            has_attribute_change: Some(false),
        };
        event.merge(&ChangeEvent {
            series_id: id,
            first_point_changed: Some(ts(1_000)),
            has_attribute_change: None,
        });

        assert_eq!(event.first_point_changed, Some(ts(1_000)));
        assert_eq!(event.has_attribute_change, Some(false));
    }

    #[test]
    fn merge_concrete_timestamp_beats_absent() {
        let id = Uuid::new_v4();
        let mut event = ChangeEvent {
            series_id: id,
            first_point_changed: None,
            has_attribute_change: Some(true),
        };
        event.merge(&ChangeEvent {
            series_id: id,
            first_point_changed: Some(ts(5_000)),
            has_attribute_change: Some(false),
        });

        assert_eq!(event.first_point_changed, Some(ts(5_000)));
        assert_eq!(event.has_attribute_change, Some(true));
    }

    #[test]
    fn rederived_sentinel_detected() {
        let event = ChangeEvent {
            series_id: Uuid::new_v4(),
            first_point_changed: Some(DateTime::<Utc>::MIN_UTC),
            has_attribute_change: None,
        };
        assert!(event.is_rederived());
    }

    #[test]
    fn last_observed_is_final_phenomenon_time() {
        let sensor = SensorInfo {
            procedure_id: "p".to_string(),
            offering_id: "o".to_string(),
            phenomenon_times: vec![ts(10), ts(20), ts(30)],
        };
        assert_eq!(sensor.last_observed(), Some(ts(30)));
    }

    #[test]
    fn validity_intervals_are_half_open() {
        assert!(interval_contains(ts(10), ts(20), ts(10)));
        assert!(interval_contains(ts(10), ts(20), ts(19)));
        assert!(!interval_contains(ts(10), ts(20), ts(20)));
        assert!(!interval_contains(ts(10), ts(20), ts(9)));
    }
}
