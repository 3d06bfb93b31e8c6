use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use sossync_core::config::{
    ApprovalRule, ComparisonOp, ExtendedAttributeFilter, GradeRule, QualifierRule, SeriesRule,
};

/// A leading '+' marks an include (the default), a leading '-' an
/// exclude.
fn split_exclusion(text: &str) -> (bool, &str) {
    if let Some(rest) = text.strip_prefix('+') {
        (false, rest)
    } else if let Some(rest) = text.strip_prefix('-') {
        (true, rest)
    } else {
        (false, text)
    }
}

pub fn parse_series_rule(text: &str) -> Result<SeriesRule> {
    let (exclude, pattern) = split_exclusion(text);
    if pattern.is_empty() {
        bail!("series filter '{text}' has no pattern");
    }

    Ok(SeriesRule {
        exclude,
        pattern: pattern.to_string(),
    })
}

pub fn parse_approval_rule(text: &str) -> Result<ApprovalRule> {
    let (exclude, rest) = split_exclusion(text);
    let (op, name) = ComparisonOp::split_prefix(rest);
    if name.is_empty() {
        bail!("approval filter '{text}' has no approval name or level");
    }

    Ok(ApprovalRule {
        exclude,
        op,
        text: name.to_string(),
    })
}

pub fn parse_grade_rule(text: &str) -> Result<GradeRule> {
    let (exclude, rest) = split_exclusion(text);
    let (op, name) = ComparisonOp::split_prefix(rest);
    if name.is_empty() {
        bail!("grade filter '{text}' has no grade name or code");
    }

    Ok(GradeRule {
        exclude,
        op,
        text: name.to_string(),
    })
}

pub fn parse_qualifier_rule(text: &str) -> Result<QualifierRule> {
    let (exclude, name) = split_exclusion(text);
    if name.is_empty() {
        bail!("qualifier filter '{text}' has no qualifier");
    }

    Ok(QualifierRule {
        exclude,
        text: name.to_string(),
    })
}

pub fn parse_extended_filter(text: &str) -> Result<ExtendedAttributeFilter> {
    let Some((name, value)) = text.split_once('=') else {
        bail!("can't parse '{text}' as a Name=Value extended attribute filter");
    };

    Ok(ExtendedAttributeFilter {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// `Label=Days`, where days of "all" (or any value <= 0) keeps the full
/// signal.
pub fn parse_export_window(text: &str) -> Result<(String, i64)> {
    let Some((label, days_text)) = text.split_once('=') else {
        bail!("can't parse '{text}' as a Label=Days export window");
    };

    let days = if days_text.eq_ignore_ascii_case("all") {
        -1
    } else {
        days_text
            .parse::<i64>()
            .with_context(|| format!("can't parse '{days_text}' as a day count"))?
    };

    Ok((label.to_string(), days))
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("can't parse '{text}' as an RFC 3339 timestamp"))
}
