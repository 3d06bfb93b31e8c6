use chrono::{DateTime, Duration, Utc};

use crate::models::{ExportWindow, Point};

/// Points that survived future-exclusion. The retention window anchors on
/// the latest *retained* point, so this stage must run first; the type
/// makes the ordering structural rather than a call-site convention.
#[derive(Debug, Clone, PartialEq)]
pub struct StablePoints(Vec<Point>);

/// Drops points at or after the next sync boundary. Data there may still
/// be revised before the next run observes it.
#[must_use]
pub fn exclude_unstable(points: Vec<Point>, next_sync_boundary: DateTime<Utc>) -> StablePoints {
    StablePoints(
        points
            .into_iter()
            .filter(|p| p.timestamp < next_sync_boundary)
            .collect(),
    )
}

impl StablePoints {
    /// Drops points older than `last_retained - retention`. Unbounded
    /// windows keep the full signal.
    #[must_use]
    pub fn apply_retention(self, window: &ExportWindow) -> StablePoints {
        if window.is_unbounded() {
            return self;
        }

        let Some(last) = self.0.last() else {
            return self;
        };

        let earliest = saturating_sub(last.timestamp, Duration::days(window.retention_days));
        StablePoints(
            self.0
                .into_iter()
                .filter(|p| p.timestamp >= earliest)
                .collect(),
        )
    }

    /// Caps the result to a maximum point count by dropping the oldest
    /// excess. Runs last; a zero cap disables it.
    #[must_use]
    pub fn cap(self, max_points: usize) -> Vec<Point> {
        let mut points = self.0;
        if max_points > 0 && points.len() > max_points {
            points.drain(..points.len() - max_points);
        }
        points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn saturating_sub(ts: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    ts.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
