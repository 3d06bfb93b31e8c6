mod options_file;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use sossync_core::SyncError;
use sossync_core::config::{RunOptions, SyncConfig};
use sossync_core::exporter::Exporter;
use sossync_core::sos::{SosClient, SosConfig};
use sossync_core::source::{PublishClient, PublishConfig};

use crate::cli::{Cli, parsers};
use self::options_file::FileOptions;

pub fn run(cli: Cli) -> Result<()> {
    let file = match &cli.options_file {
        Some(path) => FileOptions::load(path)?,
        None => FileOptions::default(),
    };

    let (config, options) = build(&cli, &file)?;

    info!("Connecting to {} ...", config.source_server);
    let source = PublishClient::connect(PublishConfig {
        base_url: config.source_server.clone(),
        username: config.source_username.clone(),
        password: config.source_password.clone(),
        timeout: options.timeout,
    })
    .context("can't connect to the source server")?;

    info!("Connecting to {} ...", config.sos_server);
    let sos = match SosClient::connect(SosConfig {
        base_url: config.sos_server.clone(),
        username: config.sos_username.clone(),
        password: config.sos_password.clone(),
        timeout: options.timeout,
    }) {
        Ok(sos) => sos,
        Err(error) => {
            if let Err(teardown) = source.disconnect() {
                warn!("Source session teardown failed: {teardown}");
            }
            return Err(error).context("can't connect to the SOS server");
        }
    };

    let exporter = Exporter::new(&source, &sos, &config, &options);
    let result = exporter.run();

    if let Err(error) = sos.disconnect() {
        warn!("SOS session teardown failed: {error}");
    }
    if let Err(error) = source.disconnect() {
        warn!("Source session teardown failed: {error}");
    }

    match result {
        Ok(_summary) => Ok(()),
        Err(SyncError::Expected(message)) => bail!(message),
        Err(error) => Err(error.into()),
    }
}

fn pick<T: Clone>(flag: &Option<T>, file: &Option<T>) -> Option<T> {
    flag.clone().or_else(|| file.clone())
}

/// Merges flags over file values into the immutable run inputs. Expected
/// errors (bad filter text, missing credentials) surface here, before
/// either service is contacted.
fn build(cli: &Cli, file: &FileOptions) -> Result<(SyncConfig, RunOptions)> {
    let mut config = SyncConfig::default();

    if let Some(server) = pick(&cli.connection.source_server, &file.source.server) {
        config.source_server = server;
    }
    if let Some(username) = pick(&cli.connection.source_username, &file.source.username) {
        config.source_username = username;
    }
    if let Some(password) = pick(&cli.connection.source_password, &file.source.password) {
        config.source_password = password;
    }
    if let Some(server) = pick(&cli.connection.sos_server, &file.sos.server) {
        config.sos_server = server;
    }
    if let Some(username) = pick(&cli.connection.sos_username, &file.sos.username) {
        config.sos_username = username;
    }
    if let Some(password) = pick(&cli.connection.sos_password, &file.sos.password) {
        config.sos_password = password;
    }

    if config.source_server.trim().is_empty()
        || config.source_username.is_empty()
        || config.source_password.is_empty()
    {
        bail!("Ensure your source server credentials are set.");
    }
    if config.sos_server.trim().is_empty()
        || config.sos_username.is_empty()
        || config.sos_password.is_empty()
    {
        bail!("Ensure your SOS server credentials are set.");
    }

    config.location_identifier = pick(&cli.filters.location, &file.filters.location);
    config.parameter = pick(&cli.filters.parameter, &file.filters.parameter);
    if let Some(publish) = pick(&cli.filters.publish, &file.filters.publish) {
        config.publish = Some(publish);
    }
    config.computation_identifier = pick(&cli.filters.computation, &file.filters.computation);
    config.computation_period_identifier =
        pick(&cli.filters.computation_period, &file.filters.computation_period);

    for text in file.filters.extended.iter().chain(&cli.filters.extended_filters) {
        config.extended_filters.push(parsers::parse_extended_filter(text)?);
    }
    for text in file.filters.series.iter().chain(&cli.filters.series_filters) {
        config.series_filters.push(parsers::parse_series_rule(text)?);
    }
    for text in file.filters.approvals.iter().chain(&cli.filters.approval_filters) {
        config.approval_filters.push(parsers::parse_approval_rule(text)?);
    }
    for text in file.filters.grades.iter().chain(&cli.filters.grade_filters) {
        config.grade_filters.push(parsers::parse_grade_rule(text)?);
    }
    for text in file.filters.qualifiers.iter().chain(&cli.filters.qualifier_filters) {
        config.qualifier_filters.push(parsers::parse_qualifier_rule(text)?);
    }

    config.export_windows = file.windows.labels.clone();
    for text in &cli.filters.export_windows {
        let (label, days) = parsers::parse_export_window(text)?;
        config.export_windows.insert(label, days);
    }
    if let Some(days) = cli
        .filters
        .default_export_window_days
        .or(file.windows.default_days)
    {
        config.default_export_window_days = days;
    }
    if let Some(max) = cli
        .filters
        .max_points_per_sensor
        .or(file.windows.max_points_per_sensor)
    {
        config.max_points_per_sensor = max;
    }

    let defaults = RunOptions::default();
    let changes_since = pick(&cli.run.changes_since, &file.run.changes_since)
        .map(|text| parsers::parse_timestamp(&text))
        .transpose()?;

    let options = RunOptions {
        configuration_name: pick(&cli.run.config_name, &file.run.config_name)
            .unwrap_or(defaults.configuration_name),
        dry_run: cli.run.dry_run || file.run.dry_run.unwrap_or(false),
        force_resync: cli.run.force_resync || file.run.force_resync.unwrap_or(false),
        never_resync: cli.run.never_resync || file.run.never_resync.unwrap_or(false),
        changes_since_override: changes_since,
        max_points_per_observation: cli
            .run
            .max_points_per_observation
            .or(file.run.max_points_per_observation)
            .unwrap_or(defaults.max_points_per_observation),
        max_run_duration: cli
            .run
            .max_run_duration_seconds
            .or(file.run.max_run_duration_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_run_duration),
        timeout: cli
            .run
            .timeout_seconds
            .or(file.run.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
    };

    Ok((config, options))
}
