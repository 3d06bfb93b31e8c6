use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use semver::Version;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::RunCache;
use crate::config::{RunOptions, SeriesRule, SyncConfig};
use crate::divergence::{DivergenceChecker, SyncDecision};
use crate::error::{Result, SyncError};
use crate::filter::PointFilter;
use crate::models::{
    ChangeEvent, ExportWindow, LocationData, SensorInfo, SeriesDescription, TimeSeriesData,
};
use crate::poller::Poller;
use crate::sos::{SosService, procedure_unique_id};
use crate::source::{ChangeQuery, TimeSeriesSource};
use crate::token_store::TokenStore;
use crate::trim;
use crate::writer::{ExportWriter, SeriesWrite};

/// Cooperative cancellation flag, honored between series boundaries. An
/// in-flight batch write always completes first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub exported_points: u64,
    pub exported_series: u32,
    pub failed_series: u32,
    /// Mid-run re-polls triggered by the run budget.
    pub checkpoints: u32,
    pub cancelled: bool,
}

/// One synchronization run: poll → per-series decide/trim/filter/write,
/// bracketed by the token store, bounded by the run budget.
pub struct Exporter<'a> {
    source: &'a dyn TimeSeriesSource,
    sos: &'a dyn SosService,
    config: &'a SyncConfig,
    options: &'a RunOptions,
    cancel: CancelToken,
}

impl<'a> Exporter<'a> {
    pub fn new(
        source: &'a dyn TimeSeriesSource,
        sos: &'a dyn SosService,
        config: &'a SyncConfig,
        options: &'a RunOptions,
    ) -> Self {
        Self {
            source,
            sos,
            config,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Flag an external controller can set to stop the run at the next
    /// series boundary.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();

        let reported_version = self.source.server_version()?;
        ensure_minimum_source_version(&reported_version)?;
        info!("Connected to {} (v{reported_version})", self.config.source_server);

        // Expected errors from filter resolution must surface before any
        // target mutation.
        let point_filter = PointFilter::resolve(self.config, self.source)?;
        let series_filter = SeriesIdentifierFilter::build(&self.config.series_filters)?;

        let config_hash = self.config.config_hash()?;
        let store = TokenStore::new(self.source);

        let mut token = if self.options.force_resync {
            warn!("Forcing a full time-series resync.");
            None
        } else {
            let loaded = store
                .load(&self.options.configuration_name, &config_hash)?
                .map(|t| t.changes_since);

            match self.options.changes_since_override {
                Some(explicit) => {
                    warn!(
                        "Overriding current changes-since token {loaded:?} with '{}'",
                        explicit.to_rfc3339()
                    );
                    Some(explicit)
                }
                None => loaded,
            }
        };

        // The source prunes its event log; a token older than the
        // retention window can no longer produce a complete change set.
        if let Some(current) = token {
            let max_age = store.max_change_event_age()?;
            if Utc::now() - current > max_age {
                if self.options.never_resync {
                    warn!("Skipping a recommended resync.");
                } else {
                    warn!(
                        "The stored changes-since token {} is older than the source's change event retention. Forcing a full resync.",
                        current.to_rfc3339()
                    );
                    token = None;
                }
            }
        }

        let location_identifier = match &self.config.location_identifier {
            Some(identifier) => {
                let description = self.source.location_description(identifier)?.ok_or_else(|| {
                    SyncError::expected(format!("Location '{identifier}' does not exist."))
                })?;
                Some(description.identifier)
            }
            None => None,
        };

        let query = ChangeQuery {
            location_identifier,
            parameter: self.config.parameter.clone(),
            publish: self.config.publish,
            computation_identifier: self.config.computation_identifier.clone(),
            computation_period_identifier: self.config.computation_period_identifier.clone(),
            extended_filters: self.config.extended_filters.clone(),
            changes_since: token,
        };

        info!("Checking {} ...", filter_summary(&query));

        let poller = Poller::new(self.source, self.options.never_resync);
        let outcome = poller.poll(&query)?;
        let mut next_token = outcome.next_token;
        let full_resync = outcome.full_resync;

        info!(
            "Fetching descriptions of {} changed time-series ...",
            outcome.changes.len()
        );

        let mut queue = WorkQueue::default();
        self.enqueue_changes(&mut queue, outcome.changes, &series_filter)?;

        let sensors: RunCache<String, SensorInfo> = RunCache::new();
        for sensor in self.sos.capabilities()? {
            sensors.insert(sensor.procedure_id.clone(), sensor);
        }
        let locations: RunCache<String, LocationData> = RunCache::new();

        let writer = ExportWriter::open(
            self.sos,
            self.options.max_points_per_observation,
            self.options.dry_run,
        )?;

        if full_resync {
            writer.clear_exported_data()?;
            sensors.clear();
        }

        info!("Exporting {} time-series ...", queue.len());

        let checker = DivergenceChecker::new(self.source, self.sos);
        let mut summary = RunSummary::default();
        let mut failed_events: Vec<ChangeEvent> = Vec::new();
        let mut clock = Instant::now();
        let mut processed_since_checkpoint = true;

        while let Some((event, series)) = queue.pop() {
            if self.cancel.is_cancelled() {
                warn!("Cancellation requested; stopping before the next series.");
                summary.cancelled = true;
                break;
            }

            if clock.elapsed() > self.options.max_run_duration && processed_since_checkpoint {
                info!("Run budget exceeded; re-polling for newer changes ...");

                // The popped series goes back first so a newer report for
                // it merges instead of duplicating.
                queue.push_front(event, series);

                let mut checkpoint_query = query.clone();
                checkpoint_query.changes_since = Some(next_token);
                let refreshed = poller.poll(&checkpoint_query)?;
                self.enqueue_changes(&mut queue, refreshed.changes, &series_filter)?;

                next_token = refreshed.next_token;
                clock = Instant::now();
                processed_since_checkpoint = false;
                summary.checkpoints += 1;
                continue;
            }

            processed_since_checkpoint = true;

            match self.export_series(
                &writer,
                &checker,
                &sensors,
                &locations,
                &point_filter,
                &event,
                &series,
                next_token,
            ) {
                Ok(points) => {
                    summary.exported_series += 1;
                    summary.exported_points += points as u64;
                }
                Err(err) if err.is_fatal() => {
                    let _ = writer.close();
                    return Err(err);
                }
                Err(err) => {
                    error!("Skipping '{}': {err}", series.identifier);
                    summary.failed_series += 1;
                    failed_events.push(event);
                }
            }
        }

        writer.close()?;

        if summary.cancelled {
            warn!("Run cancelled; leaving the stored changes-since token unchanged.");
        } else {
            let effective = self.low_water_mark(next_token, token, &failed_events);
            store.save(
                &self.options.configuration_name,
                &config_hash,
                effective,
                self.options.dry_run,
            )?;

            info!(
                "Successfully exported {} points from {} time-series in {:.1?}",
                summary.exported_points,
                summary.exported_series,
                started.elapsed()
            );
        }

        Ok(summary)
    }

    /// A failed series must be re-observed by the next run, so the saved
    /// token never advances past the earliest failed change.
    fn low_water_mark(
        &self,
        next_token: DateTime<Utc>,
        previous_token: Option<DateTime<Utc>>,
        failed: &[ChangeEvent],
    ) -> DateTime<Utc> {
        let mut effective = next_token;

        for event in failed {
            match event.first_point_changed.or(previous_token) {
                Some(at) => effective = effective.min(at),
                None => warn!(
                    "No safe resume point for failed series {}; its changes may be missed.",
                    event.series_id
                ),
            }
        }

        if effective < next_token {
            warn!(
                "{} series failed to export; rolling the changes-since token back to {}.",
                failed.len(),
                effective.to_rfc3339()
            );
        }

        effective
    }

    /// Fetches descriptions for newly reported series and queues them in
    /// location/identifier order; events for already-queued series merge
    /// instead.
    fn enqueue_changes(
        &self,
        queue: &mut WorkQueue,
        changes: Vec<ChangeEvent>,
        series_filter: &SeriesIdentifierFilter,
    ) -> Result<()> {
        let mut fresh: Vec<ChangeEvent> = Vec::new();
        for event in changes {
            if !queue.merge_if_queued(&event) {
                fresh.push(event);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = fresh.iter().map(|e| e.series_id).collect();
        let descriptions = self.source.series_descriptions(&ids)?;
        let events: HashMap<Uuid, ChangeEvent> =
            fresh.into_iter().map(|e| (e.series_id, e)).collect();

        for description in descriptions {
            if series_filter.excludes(&description.identifier) {
                info!("Excluding filtered time-series '{}'.", description.identifier);
                continue;
            }
            if let Some(event) = events.get(&description.unique_id) {
                queue.push_back(event.clone(), description);
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn export_series(
        &self,
        writer: &ExportWriter<'_>,
        checker: &DivergenceChecker<'_>,
        sensors: &RunCache<String, SensorInfo>,
        locations: &RunCache<String, LocationData>,
        point_filter: &PointFilter,
        event: &ChangeEvent,
        series: &SeriesDescription,
        next_sync_boundary: DateTime<Utc>,
    ) -> Result<usize> {
        info!(
            "Fetching changes from '{}' FirstPointChanged={:?} HasAttributeChange={:?} ...",
            series.identifier, event.first_point_changed, event.has_attribute_change
        );

        let procedure_id = procedure_unique_id(series);
        let sensor = sensors.get(&procedure_id);
        let decision = checker.decide(event, series, &procedure_id, sensor.as_ref())?;
        let window = self.config.export_window_for(series);

        let (fetch_from, create_sensor, delete_existing) = match &decision {
            SyncDecision::CreateSensor => (self.window_fetch_from(event, &window), true, None),
            SyncDecision::Append { fetch_from } => (Some(*fetch_from), false, None),
            SyncDecision::Replace { reason } => {
                info!("Replacing sensor for '{}': {reason}", series.identifier);
                (self.window_fetch_from(event, &window), true, sensor.clone())
            }
        };

        let fetched = self
            .source
            .points(series.unique_id, fetch_from, None, true)?;
        let TimeSeriesData {
            points,
            approvals,
            grades,
            qualifiers,
        } = fetched;
        let total_fetched = points.len();

        let trimmed = trim::exclude_unstable(points, next_sync_boundary)
            .apply_retention(&window)
            .cap(self.config.max_points_per_sensor);

        if trimmed.len() != total_fetched {
            info!(
                "Trimming '{}' left {} of {} points with window '{}'.",
                series.identifier,
                trimmed.len(),
                total_fetched,
                window.label
            );
        }

        let data = TimeSeriesData {
            points: trimmed,
            approvals,
            grades,
            qualifiers,
        };
        let points = point_filter.filter(&series.identifier, &data)?;

        if points.is_empty() && !create_sensor && delete_existing.is_none() {
            info!("No stable points to export from '{}'.", series.identifier);
            return Ok(0);
        }

        let location = locations.get_or_try_insert_with(&series.location_id, || {
            self.source.location_data(&series.location_id)
        })?;

        let write = SeriesWrite {
            series,
            location: &location,
            procedure_id: &procedure_id,
            delete_existing: delete_existing.as_ref(),
            create_sensor,
            existing_offering: sensor.as_ref().map(|s| s.offering_id.as_str()),
            points: &points,
        };
        let outcome = writer.write_series(&write)?;

        if !self.options.dry_run {
            if delete_existing.is_some() {
                sensors.remove(&procedure_id);
            }

            if let Some(offering) = &outcome.assigned_offering {
                sensors.insert(
                    procedure_id.clone(),
                    SensorInfo {
                        procedure_id: procedure_id.clone(),
                        offering_id: offering.clone(),
                        phenomenon_times: outcome.batch_end_times.clone(),
                    },
                );
            } else if let Some(mut existing) = sensors.get(&procedure_id) {
                existing
                    .phenomenon_times
                    .extend(outcome.batch_end_times.iter().copied());
                sensors.insert(procedure_id.clone(), existing);
            }
        }

        Ok(outcome.written_points)
    }

    /// Fetch origin for a sensor that is being built from scratch: the
    /// retention window backward from the change origin, or the whole
    /// signal when the window is unbounded.
    fn window_fetch_from(
        &self,
        event: &ChangeEvent,
        window: &ExportWindow,
    ) -> Option<DateTime<Utc>> {
        if window.is_unbounded() {
            return None;
        }

        let anchor = event
            .first_point_changed
            .filter(|at| *at != DateTime::<Utc>::MIN_UTC)
            .unwrap_or_else(Utc::now);

        Some(
            anchor
                .checked_sub_signed(Duration::days(window.retention_days))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

/// Per-run work queue: change events in export order with their series
/// descriptions, unioned by series id.
#[derive(Debug, Default)]
struct WorkQueue {
    order: VecDeque<Uuid>,
    events: HashMap<Uuid, (ChangeEvent, SeriesDescription)>,
}

impl WorkQueue {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn pop(&mut self) -> Option<(ChangeEvent, SeriesDescription)> {
        let id = self.order.pop_front()?;
        self.events.remove(&id)
    }

    fn push_back(&mut self, event: ChangeEvent, series: SeriesDescription) {
        let id = event.series_id;
        if self.events.insert(id, (event, series)).is_none() {
            self.order.push_back(id);
        }
    }

    fn push_front(&mut self, event: ChangeEvent, series: SeriesDescription) {
        let id = event.series_id;
        if self.events.insert(id, (event, series)).is_none() {
            self.order.push_front(id);
        }
    }

    /// Merges the event into an already-queued entry for the same series.
    /// Returns false when the series is not queued.
    fn merge_if_queued(&mut self, event: &ChangeEvent) -> bool {
        match self.events.get_mut(&event.series_id) {
            Some((queued, _)) => {
                queued.merge(event);
                true
            }
            None => false,
        }
    }
}

/// Ordered include/exclude glob patterns over series identifiers.
struct SeriesIdentifierFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl SeriesIdentifierFilter {
    fn build(rules: &[SeriesRule]) -> Result<Self> {
        let mut includes = GlobSetBuilder::new();
        let mut excludes = GlobSetBuilder::new();
        let mut has_includes = false;
        let mut has_excludes = false;

        for rule in rules {
            let glob = Glob::new(&rule.pattern).map_err(|err| {
                SyncError::expected(format!(
                    "Invalid series filter pattern '{}': {err}",
                    rule.pattern
                ))
            })?;

            if rule.exclude {
                excludes.add(glob);
                has_excludes = true;
            } else {
                includes.add(glob);
                has_includes = true;
            }
        }

        let build = |builder: GlobSetBuilder| {
            builder
                .build()
                .map_err(|err| SyncError::Internal(format!("series filter build failed: {err}")))
        };

        Ok(Self {
            includes: has_includes.then(|| build(includes)).transpose()?,
            excludes: has_excludes.then(|| build(excludes)).transpose()?,
        })
    }

    fn excludes(&self, identifier: &str) -> bool {
        if let Some(includes) = &self.includes {
            if !includes.is_match(identifier) {
                return true;
            }
        }
        if let Some(excludes) = &self.excludes {
            if excludes.is_match(identifier) {
                return true;
            }
        }
        false
    }
}

fn ensure_minimum_source_version(reported: &str) -> Result<()> {
    let minimum = Version::new(17, 2, 0);
    let version = parse_server_version(reported)?;

    if version < minimum {
        return Err(SyncError::expected(format!(
            "This utility requires a source server v{}.{} or greater.",
            minimum.major, minimum.minor
        )));
    }

    Ok(())
}

/// Source servers report two- or three-component versions.
fn parse_server_version(text: &str) -> Result<Version> {
    let trimmed = text.trim();

    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    Version::parse(&format!("{trimmed}.0")).map_err(|_| {
        SyncError::SourceInconsistency(format!("unparseable server version '{text}'"))
    })
}

fn filter_summary(query: &ChangeQuery) -> String {
    let mut summary = match &query.location_identifier {
        Some(location) => format!("location '{location}'"),
        None => "all locations".to_string(),
    };

    let mut filters = Vec::new();
    if let Some(publish) = query.publish {
        filters.push(format!("Publish={publish}"));
    }
    if let Some(parameter) = &query.parameter {
        filters.push(format!("Parameter={parameter}"));
    }
    if let Some(computation) = &query.computation_identifier {
        filters.push(format!("ComputationIdentifier={computation}"));
    }
    if let Some(period) = &query.computation_period_identifier {
        filters.push(format!("ComputationPeriodIdentifier={period}"));
    }
    if !query.extended_filters.is_empty() {
        let extended: Vec<String> = query
            .extended_filters
            .iter()
            .map(|f| format!("{}={}", f.name, f.value))
            .collect();
        filters.push(format!("ExtendedFilters={}", extended.join(", ")));
    }

    if !filters.is_empty() {
        summary.push_str(&format!(" with {}", filters.join(" and ")));
    }

    summary.push_str(" for time-series");

    if let Some(token) = query.changes_since {
        summary.push_str(&format!(" changed since {}", token.to_rfc3339()));
    }

    summary
}
