use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// TOML options file. Every value is optional; command-line flags win
/// over file values.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOptions {
    #[serde(default)]
    pub source: ServerSection,
    #[serde(default)]
    pub sos: ServerSection,
    #[serde(default)]
    pub filters: FilterSection,
    #[serde(default)]
    pub windows: WindowSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSection {
    pub location: Option<String>,
    pub parameter: Option<String>,
    pub publish: Option<bool>,
    pub computation: Option<String>,
    pub computation_period: Option<String>,
    #[serde(default)]
    pub extended: Vec<String>,
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub approvals: Vec<String>,
    #[serde(default)]
    pub grades: Vec<String>,
    #[serde(default)]
    pub qualifiers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowSection {
    pub default_days: Option<i64>,
    /// Export window label -> retention days; days <= 0 keeps the full
    /// signal.
    #[serde(default)]
    pub labels: BTreeMap<String, i64>,
    pub max_points_per_sensor: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    pub config_name: Option<String>,
    pub dry_run: Option<bool>,
    pub force_resync: Option<bool>,
    pub never_resync: Option<bool>,
    pub changes_since: Option<String>,
    pub max_points_per_observation: Option<usize>,
    pub max_run_duration_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

impl FileOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("can't read options file '{}'", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("can't parse options file '{}'", path.display()))
    }
}
