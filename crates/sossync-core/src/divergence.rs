use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::error::Result;
use crate::models::{ChangeEvent, Point, SensorInfo, SeriesDescription};
use crate::sos::SosService;
use crate::source::TimeSeriesSource;

/// Exported values are compared after display rounding, so anything past
/// this tolerance is a genuine divergence.
pub const VALUE_TOLERANCE: f64 = 1e-9;

/// Smallest timestamp step the services distinguish; used to advance the
/// fetch boundary past already-verified data.
const ONE_TICK: Duration = Duration::milliseconds(1);

/// How the already-exported suffix of a series relates to the source, and
/// therefore what the writer must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    /// No sensor exists on the target yet.
    CreateSensor,
    /// Already-exported data still agrees with the source; only points
    /// from `fetch_from` onward need to be transferred.
    Append { fetch_from: DateTime<Utc> },
    /// The exported history no longer matches; the sensor must be deleted
    /// and rebuilt over the full export window.
    Replace { reason: String },
}

pub struct DivergenceChecker<'a> {
    source: &'a dyn TimeSeriesSource,
    sos: &'a dyn SosService,
}

impl<'a> DivergenceChecker<'a> {
    pub fn new(source: &'a dyn TimeSeriesSource, sos: &'a dyn SosService) -> Self {
        Self { source, sos }
    }

    /// Decides between append and replace for one changed series.
    /// Whenever a comparison is inconclusive the decision errs toward
    /// replace; a false "not diverged" would leave stale history on the
    /// target indefinitely.
    pub fn decide(
        &self,
        change: &ChangeEvent,
        series: &SeriesDescription,
        procedure_id: &str,
        sensor: Option<&SensorInfo>,
    ) -> Result<SyncDecision> {
        if change.has_attribute_change == Some(true) {
            return Ok(SyncDecision::Replace {
                reason: "series attributes changed".to_string(),
            });
        }

        let Some(sensor) = sensor else {
            return Ok(SyncDecision::CreateSensor);
        };

        let Some(last_observed) = sensor.last_observed() else {
            return Ok(SyncDecision::Replace {
                reason: "existing sensor has no recorded phenomenon time".to_string(),
            });
        };

        if change.is_rederived() {
            return Ok(SyncDecision::Replace {
                reason: "series was re-derived from an unknown origin".to_string(),
            });
        }

        let Some(first_changed) = change.first_point_changed else {
            // No point-level change reported; anything new starts past the
            // last exported observation.
            return Ok(SyncDecision::Append {
                fetch_from: last_observed + ONE_TICK,
            });
        };

        if last_observed < first_changed {
            // The change begins after everything already exported, so the
            // incremental window covers it without any comparison.
            return Ok(SyncDecision::Append {
                fetch_from: first_changed,
            });
        }

        // The change overlaps already-exported data. Compare the overlap
        // tail on both sides before trusting an append.
        let source_data = self
            .source
            .points(series.unique_id, Some(first_changed), Some(last_observed), true)?;
        let exported = self
            .sos
            .query_observations(procedure_id, first_changed, last_observed)?;

        match compare_overlap(&source_data.points, &exported) {
            None => Ok(SyncDecision::Append {
                fetch_from: last_observed + ONE_TICK,
            }),
            Some(reason) => {
                warn!("'{}' diverged from its exported data: {reason}", series.identifier);
                Ok(SyncDecision::Replace { reason })
            }
        }
    }
}

/// Lock-step comparison of the overlap window. Returns the first
/// difference, or `None` when the sequences agree exactly.
#[must_use]
pub fn compare_overlap(source: &[Point], exported: &[Point]) -> Option<String> {
    for (index, exported_point) in exported.iter().enumerate() {
        let Some(source_point) = source.get(index) else {
            return Some(format!(
                "source has {} points in the overlap window but {} were exported",
                source.len(),
                exported.len()
            ));
        };

        if source_point.timestamp != exported_point.timestamp {
            return Some(format!(
                "timestamp mismatch at index {index}: source={} exported={}",
                source_point.timestamp.to_rfc3339(),
                exported_point.timestamp.to_rfc3339()
            ));
        }

        if !values_match(source_point.value, exported_point.value) {
            return Some(format!(
                "value mismatch at {}: source={:?} exported={:?}",
                source_point.timestamp.to_rfc3339(),
                source_point.value,
                exported_point.value
            ));
        }
    }

    if source.len() > exported.len() {
        return Some(format!(
            "source has {} extra points inside the already-exported window",
            source.len() - exported.len()
        ));
    }

    None
}

fn values_match(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.is_nan() && b.is_nan() {
                true
            } else {
                (a - b).abs() <= VALUE_TOLERANCE
            }
        }
        _ => false,
    }
}
