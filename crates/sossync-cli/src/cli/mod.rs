use std::path::PathBuf;

use clap::{Args, Parser};

pub mod parsers;

#[derive(Debug, Parser)]
#[command(name = "sossync")]
#[command(
    about = "Export time-series changes from a source store to an OGC SOS server",
    version
)]
pub struct Cli {
    /// Read additional options from a TOML file. Command-line flags win
    /// over file values.
    #[arg(long, value_name = "FILE")]
    pub options_file: Option<PathBuf>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub filters: FilterArgs,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Server and credential settings. Changes trigger a full resync.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Source time-series server URL.
    #[arg(long)]
    pub source_server: Option<String>,

    #[arg(long)]
    pub source_username: Option<String>,

    #[arg(long)]
    pub source_password: Option<String>,

    /// Target SOS server URL.
    #[arg(long)]
    pub sos_server: Option<String>,

    #[arg(long)]
    pub sos_username: Option<String>,

    #[arg(long)]
    pub sos_password: Option<String>,
}

/// Change-poll and point filtering. Changes trigger a full resync.
#[derive(Debug, Args)]
pub struct FilterArgs {
    /// Optional location filter.
    #[arg(long)]
    pub location: Option<String>,

    /// Optional parameter filter.
    #[arg(long)]
    pub parameter: Option<String>,

    /// Optional publish filter.
    #[arg(long)]
    pub publish: Option<bool>,

    /// Optional computation filter.
    #[arg(long)]
    pub computation: Option<String>,

    /// Optional computation period filter.
    #[arg(long)]
    pub computation_period: Option<String>,

    /// Extended attribute filter in Name=Value form. Repeatable.
    #[arg(long = "extended-filter", value_name = "NAME=VALUE")]
    pub extended_filters: Vec<String>,

    /// Series identifier glob; prefix with '-' to exclude. Repeatable.
    #[arg(long = "series-filter", allow_hyphen_values = true)]
    pub series_filters: Vec<String>,

    /// Filter points by approval level or name, with an optional
    /// comparison prefix (`<`, `<=`, `=`, `>=`, `>`). Repeatable.
    #[arg(long = "approval-filter", allow_hyphen_values = true)]
    pub approval_filters: Vec<String>,

    /// Filter points by grade code or name. Repeatable.
    #[arg(long = "grade-filter", allow_hyphen_values = true)]
    pub grade_filters: Vec<String>,

    /// Filter points by qualifier. Repeatable.
    #[arg(long = "qualifier-filter", allow_hyphen_values = true)]
    pub qualifier_filters: Vec<String>,

    /// Export window in Label=Days form ("all" keeps the full signal).
    /// Repeatable.
    #[arg(long = "export-window", value_name = "LABEL=DAYS")]
    pub export_windows: Vec<String>,

    /// Retention days applied when a series names no export window.
    #[arg(long)]
    pub default_export_window_days: Option<i64>,

    /// Upper bound on points kept per sensor after trimming.
    #[arg(long)]
    pub max_points_per_sensor: Option<usize>,
}

/// Per-run knobs. Changing these never triggers a resync.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Name under which sync state is stored in the source's settings
    /// (default "SosConfig").
    #[arg(long)]
    pub config_name: Option<String>,

    /// Log intended mutations without issuing them or saving the token.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Force a full resync of all time-series.
    #[arg(long, default_value_t = false)]
    pub force_resync: bool,

    /// Skip the automatic full resync, even when the algorithm
    /// recommends one.
    #[arg(long, default_value_t = false)]
    pub never_resync: bool,

    /// Override the starting changes-since time (RFC 3339).
    #[arg(long, value_name = "TIMESTAMP")]
    pub changes_since: Option<String>,

    /// Maximum points per SOS observation request (default 1000).
    #[arg(long)]
    pub max_points_per_observation: Option<usize>,

    /// Run budget in seconds before a mid-run re-poll (default 3600).
    #[arg(long)]
    pub max_run_duration_seconds: Option<u64>,

    /// HTTP timeout in seconds for both services (default 300).
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
}
