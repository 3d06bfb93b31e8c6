use tracing::info;

use crate::config::{ComparisonOp, SyncConfig};
use crate::error::{Result, SyncError};
use crate::models::{Point, TimeSeriesData, interval_contains};
use crate::source::TimeSeriesSource;

/// Approval/grade rule text resolved to its numeric code via the source's
/// reference tables.
#[derive(Debug, Clone, PartialEq)]
struct LevelRule {
    exclude: bool,
    op: ComparisonOp,
    code: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct QualifierMatchRule {
    exclude: bool,
    identifier: String,
}

/// Inclusion/exclusion rules over approval level, grade code and
/// qualifier. Each category is evaluated independently; categories are
/// ANDed together.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    approvals: Vec<LevelRule>,
    grades: Vec<LevelRule>,
    qualifiers: Vec<QualifierMatchRule>,
}

impl PointFilter {
    /// Resolves the configured rule text against the source's reference
    /// tables. Unresolvable names are user errors, reported before any
    /// target mutation.
    pub fn resolve<S: TimeSeriesSource + ?Sized>(config: &SyncConfig, source: &S) -> Result<Self> {
        let mut filter = Self::default();

        if !config.approval_filters.is_empty() {
            info!("Fetching approval configuration ...");
            let table = source.approval_table()?;

            for rule in &config.approval_filters {
                let metadata = table.iter().find(|a| {
                    a.display_name.eq_ignore_ascii_case(&rule.text)
                        || a.identifier.eq_ignore_ascii_case(&rule.text)
                });
                let Some(metadata) = metadata else {
                    return Err(SyncError::expected(format!(
                        "Unknown approval '{}'",
                        rule.text
                    )));
                };
                let level = metadata.identifier.parse::<i32>().map_err(|_| {
                    SyncError::SourceInconsistency(format!(
                        "approval identifier '{}' is not numeric",
                        metadata.identifier
                    ))
                })?;

                filter.approvals.push(LevelRule {
                    exclude: rule.exclude,
                    op: rule.op,
                    code: level,
                });
            }
        }

        if !config.grade_filters.is_empty() {
            info!("Fetching grade configuration ...");
            let table = source.grade_table()?;

            for rule in &config.grade_filters {
                let metadata = table.iter().find(|g| {
                    g.display_name.eq_ignore_ascii_case(&rule.text)
                        || g.identifier.eq_ignore_ascii_case(&rule.text)
                });
                let Some(metadata) = metadata else {
                    return Err(SyncError::expected(format!("Unknown grade '{}'", rule.text)));
                };
                let code = metadata.identifier.parse::<i32>().map_err(|_| {
                    SyncError::SourceInconsistency(format!(
                        "grade identifier '{}' is not numeric",
                        metadata.identifier
                    ))
                })?;

                filter.grades.push(LevelRule {
                    exclude: rule.exclude,
                    op: rule.op,
                    code,
                });
            }
        }

        if !config.qualifier_filters.is_empty() {
            info!("Fetching qualifier configuration ...");
            let table = source.qualifier_table()?;

            for rule in &config.qualifier_filters {
                let metadata = table.iter().find(|q| {
                    q.identifier.eq_ignore_ascii_case(&rule.text)
                        || q.code.eq_ignore_ascii_case(&rule.text)
                });
                let Some(metadata) = metadata else {
                    return Err(SyncError::expected(format!(
                        "Unknown qualifier '{}'",
                        rule.text
                    )));
                };

                filter.qualifiers.push(QualifierMatchRule {
                    exclude: rule.exclude,
                    identifier: metadata.identifier.clone(),
                });
            }
        }

        Ok(filter)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty() && self.grades.is_empty() && self.qualifiers.is_empty()
    }

    /// Applies all three categories to the fetched point set. Point
    /// metadata is resolved by validity-interval containment (start
    /// inclusive, end exclusive).
    pub fn filter(&self, series_identifier: &str, data: &TimeSeriesData) -> Result<Vec<Point>> {
        if self.is_empty() {
            return Ok(data.points.clone());
        }

        let mut kept = Vec::with_capacity(data.points.len());

        for point in &data.points {
            if !self.approvals.is_empty() {
                let level = resolve_approval(data, point)?;
                if !survives_level(&self.approvals, level) {
                    continue;
                }
            }

            if !self.grades.is_empty() {
                let code = resolve_grade(data, point)?;
                if !survives_level(&self.grades, code) {
                    continue;
                }
            }

            if !self.qualifiers.is_empty() {
                let qualifiers: Vec<&str> = data
                    .qualifiers
                    .iter()
                    .filter(|q| interval_contains(q.start, q.end, point.timestamp))
                    .map(|q| q.identifier.as_str())
                    .collect();
                if !survives_qualifiers(&self.qualifiers, &qualifiers) {
                    continue;
                }
            }

            kept.push(*point);
        }

        if kept.len() != data.points.len() {
            let categories: Vec<&str> = [
                (!self.approvals.is_empty()).then_some("approval"),
                (!self.grades.is_empty()).then_some("grade"),
                (!self.qualifiers.is_empty()).then_some("qualifier"),
            ]
            .into_iter()
            .flatten()
            .collect();

            info!(
                "Excluded {} of {} points from '{series_identifier}' due to {} filters.",
                data.points.len() - kept.len(),
                data.points.len(),
                categories.join(" and ")
            );
        }

        Ok(kept)
    }
}

/// Exactly one approval record must cover the point.
fn resolve_approval(data: &TimeSeriesData, point: &Point) -> Result<i32> {
    let mut covering = data
        .approvals
        .iter()
        .filter(|a| interval_contains(a.start, a.end, point.timestamp));

    match (covering.next(), covering.next()) {
        (Some(approval), None) => Ok(approval.approval_level),
        (None, _) => Err(SyncError::SourceInconsistency(format!(
            "no approval record covers point at {}",
            point.timestamp.to_rfc3339()
        ))),
        (Some(_), Some(_)) => Err(SyncError::SourceInconsistency(format!(
            "multiple approval records cover point at {}",
            point.timestamp.to_rfc3339()
        ))),
    }
}

fn resolve_grade(data: &TimeSeriesData, point: &Point) -> Result<i32> {
    let mut covering = data
        .grades
        .iter()
        .filter(|g| interval_contains(g.start, g.end, point.timestamp));

    match (covering.next(), covering.next()) {
        (Some(grade), None) => Ok(grade.grade_code),
        (None, _) => Err(SyncError::SourceInconsistency(format!(
            "no grade record covers point at {}",
            point.timestamp.to_rfc3339()
        ))),
        (Some(_), Some(_)) => Err(SyncError::SourceInconsistency(format!(
            "multiple grade records cover point at {}",
            point.timestamp.to_rfc3339()
        ))),
    }
}

/// A point survives a category only if the include set is empty or some
/// include rule matches, and no exclude rule matches.
fn survives_level(rules: &[LevelRule], value: i32) -> bool {
    let includes: Vec<&LevelRule> = rules.iter().filter(|r| !r.exclude).collect();
    let included = includes.is_empty() || includes.iter().any(|r| r.op.evaluate(value, r.code));
    let excluded = rules
        .iter()
        .filter(|r| r.exclude)
        .any(|r| r.op.evaluate(value, r.code));

    included && !excluded
}

fn survives_qualifiers(rules: &[QualifierMatchRule], qualifiers: &[&str]) -> bool {
    let includes: Vec<&QualifierMatchRule> = rules.iter().filter(|r| !r.exclude).collect();
    let included = includes.is_empty()
        || includes
            .iter()
            .any(|r| qualifiers.iter().any(|q| *q == r.identifier));
    let excluded = rules
        .iter()
        .filter(|r| r.exclude)
        .any(|r| qualifiers.iter().any(|q| *q == r.identifier));

    included && !excluded
}
