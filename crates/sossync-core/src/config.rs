use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{ExportWindow, SeriesDescription};

/// Extended attribute consulted per series to pick an export window label.
pub const EXPORT_WINDOW_ATTRIBUTE: &str = "SOS_EXPORT_WINDOW";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl ComparisonOp {
    #[must_use]
    pub fn evaluate(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }

    /// Splits a leading comparison operator off a rule text. No operator
    /// means equality.
    #[must_use]
    pub fn split_prefix(text: &str) -> (Self, &str) {
        if let Some(rest) = text.strip_prefix("<=") {
            (Self::Le, rest)
        } else if let Some(rest) = text.strip_prefix(">=") {
            (Self::Ge, rest)
        } else if let Some(rest) = text.strip_prefix('<') {
            (Self::Lt, rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (Self::Gt, rest)
        } else if let Some(rest) = text.strip_prefix('=') {
            (Self::Eq, rest)
        } else {
            (Self::Eq, text)
        }
    }
}

/// Approval rule text is resolved against the source's approval table at
/// startup; `level` holds the resolved numeric level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub exclude: bool,
    pub op: ComparisonOp,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRule {
    pub exclude: bool,
    pub op: ComparisonOp,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualifierRule {
    pub exclude: bool,
    pub text: String,
}

/// Glob pattern over series identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRule {
    pub exclude: bool,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedAttributeFilter {
    pub name: String,
    pub value: String,
}

/// The full effective export configuration. Built once at startup and
/// never mutated; any field change alters the config hash and forces a
/// full resync on the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source_server: String,
    pub source_username: String,
    pub source_password: String,
    pub sos_server: String,
    pub sos_username: String,
    pub sos_password: String,

    // Change-poll filters.
    pub location_identifier: Option<String>,
    pub parameter: Option<String>,
    pub publish: Option<bool>,
    pub computation_identifier: Option<String>,
    pub computation_period_identifier: Option<String>,
    pub extended_filters: Vec<ExtendedAttributeFilter>,

    // Point and series filters.
    pub series_filters: Vec<SeriesRule>,
    pub approval_filters: Vec<ApprovalRule>,
    pub grade_filters: Vec<GradeRule>,
    pub qualifier_filters: Vec<QualifierRule>,

    /// Export window label -> retention days. Days <= 0 means unbounded.
    pub export_windows: BTreeMap<String, i64>,
    pub default_export_window_days: i64,
    pub max_points_per_sensor: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_server: String::new(),
            source_username: "admin".to_string(),
            source_password: "admin".to_string(),
            sos_server: String::new(),
            sos_username: String::new(),
            sos_password: String::new(),
            location_identifier: None,
            parameter: None,
            publish: Some(true),
            computation_identifier: None,
            computation_period_identifier: None,
            extended_filters: Vec::new(),
            series_filters: Vec::new(),
            approval_filters: Vec::new(),
            grade_filters: Vec::new(),
            qualifier_filters: Vec::new(),
            export_windows: BTreeMap::new(),
            default_export_window_days: 90,
            max_points_per_sensor: 100_000,
        }
    }
}

impl SyncConfig {
    /// Hash of the full effective configuration, filters included, so any
    /// filter edit invalidates stale sync state.
    pub fn config_hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }

    /// Export window for a series: its extended attribute picks a label
    /// from `export_windows`, otherwise the process-wide default applies.
    #[must_use]
    pub fn export_window_for(&self, series: &SeriesDescription) -> ExportWindow {
        if let Some(label) = series.extended_attributes.get(EXPORT_WINDOW_ATTRIBUTE) {
            if let Some(days) = self.export_windows.get(label) {
                return ExportWindow {
                    retention_days: *days,
                    label: label.clone(),
                };
            }
        }

        ExportWindow {
            retention_days: self.default_export_window_days,
            label: "default".to_string(),
        }
    }
}

/// Per-run knobs that do not participate in the config hash; changing
/// these never forces a resync.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub configuration_name: String,
    pub dry_run: bool,
    pub force_resync: bool,
    pub never_resync: bool,
    pub changes_since_override: Option<DateTime<Utc>>,
    pub max_points_per_observation: usize,
    pub max_run_duration: Duration,
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            configuration_name: "SosConfig".to_string(),
            dry_run: false,
            force_resync: false,
            never_resync: false,
            changes_since_override: None,
            max_points_per_observation: 1000,
            max_run_duration: Duration::from_secs(60 * 60),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn comparison_prefixes_split() {
        assert_eq!(ComparisonOp::split_prefix("<=900"), (ComparisonOp::Le, "900"));
        assert_eq!(ComparisonOp::split_prefix(">=2"), (ComparisonOp::Ge, "2"));
        assert_eq!(ComparisonOp::split_prefix("<1"), (ComparisonOp::Lt, "1"));
        assert_eq!(ComparisonOp::split_prefix(">1"), (ComparisonOp::Gt, "1"));
        assert_eq!(ComparisonOp::split_prefix("=Working"), (ComparisonOp::Eq, "Working"));
        assert_eq!(ComparisonOp::split_prefix("Working"), (ComparisonOp::Eq, "Working"));
    }

    #[test]
    fn comparison_evaluation() {
        assert!(ComparisonOp::Ge.evaluate(3, 2));
        assert!(!ComparisonOp::Ge.evaluate(1, 2));
        assert!(ComparisonOp::Lt.evaluate(1, 2));
        assert!(ComparisonOp::Eq.evaluate(2, 2));
    }

    #[test]
    fn hash_changes_when_any_filter_changes() {
        let base = SyncConfig::default();
        let mut edited = base.clone();
        edited.grade_filters.push(GradeRule {
            exclude: false,
            op: ComparisonOp::Ge,
            text: "20".to_string(),
        });

        assert_eq!(base.config_hash().unwrap(), base.clone().config_hash().unwrap());
        assert_ne!(base.config_hash().unwrap(), edited.config_hash().unwrap());
    }

    #[test]
    fn export_window_prefers_series_attribute() {
        let mut config = SyncConfig::default();
        config.export_windows.insert("daily".to_string(), 3653);

        let mut series = SeriesDescription {
            unique_id: Uuid::new_v4(),
            identifier: "Stage.Working@Loc".to_string(),
            location_id: "Loc".to_string(),
            parameter: "Stage".to_string(),
            label: "Working".to_string(),
            unit: "m".to_string(),
            interpolation_kind: "InstantaneousValues".to_string(),
            utc_offset_hours: 0.0,
            extended_attributes: BTreeMap::new(),
        };
        assert_eq!(config.export_window_for(&series).retention_days, 90);

        series
            .extended_attributes
            .insert(EXPORT_WINDOW_ATTRIBUTE.to_string(), "daily".to_string());
        let window = config.export_window_for(&series);
        assert_eq!(window.retention_days, 3653);
        assert_eq!(window.label, "daily");
    }
}
