//! End-to-end engine behavior against in-memory service fakes: change
//! polling, divergence decisions, batching, budget checkpoints, and the
//! token lifecycle.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use sossync_core::config::{ComparisonOp, GradeRule, RunOptions, SyncConfig};
use sossync_core::error::{Result, SyncError};
use sossync_core::exporter::Exporter;
use sossync_core::models::{
    ApprovalMetadata, ChangeEvent, GradeMetadata, LocationData, LocationDescription, Point,
    QualifierMetadata, SensorInfo, SeriesDescription, TimeSeriesData,
};
use sossync_core::sos::{InsertedSensor, ObservationBatch, SosService, procedure_unique_id};
use sossync_core::source::{ChangeQuery, ChangeSet, TimeSeriesSource};

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

fn point(seconds: i64, value: f64) -> Point {
    Point {
        timestamp: ts(seconds),
        value: Some(value),
    }
}

fn series(id: Uuid, location: &str) -> SeriesDescription {
    SeriesDescription {
        unique_id: id,
        identifier: format!("Stage.Working@{location}"),
        location_id: location.to_string(),
        parameter: "Stage".to_string(),
        label: "Working".to_string(),
        unit: "m".to_string(),
        interpolation_kind: "InstantaneousValues".to_string(),
        utc_offset_hours: 0.0,
        extended_attributes: Default::default(),
    }
}

fn location(identifier: &str) -> LocationData {
    LocationData {
        identifier: identifier.to_string(),
        name: format!("Location {identifier}"),
        latitude: 49.0,
        longitude: -123.0,
    }
}

struct FakeSource {
    rounds: RefCell<VecDeque<Vec<ChangeEvent>>>,
    descriptions: Vec<SeriesDescription>,
    data: HashMap<Uuid, Vec<Point>>,
    locations: HashMap<String, LocationData>,
    grade_table: Vec<GradeMetadata>,
    settings: RefCell<HashMap<(String, String), String>>,
    poll_tokens: RefCell<Vec<Option<DateTime<Utc>>>>,
    point_queries: RefCell<Vec<(Uuid, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>>,
    /// Token every poll hands back. Recent, so the engine's token-age
    /// guard stays quiet, and far past every test point so
    /// future-exclusion never interferes.
    next_token: DateTime<Utc>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            rounds: RefCell::new(VecDeque::new()),
            descriptions: Vec::new(),
            data: HashMap::new(),
            locations: HashMap::new(),
            grade_table: Vec::new(),
            settings: RefCell::new(HashMap::new()),
            poll_tokens: RefCell::new(Vec::new()),
            point_queries: RefCell::new(Vec::new()),
            next_token: Utc::now(),
        }
    }

    fn with_series(mut self, description: SeriesDescription, points: Vec<Point>) -> Self {
        self.locations
            .insert(description.location_id.clone(), location(&description.location_id));
        self.data.insert(description.unique_id, points);
        self.descriptions.push(description);
        self
    }

    fn with_round(self, events: Vec<ChangeEvent>) -> Self {
        self.rounds.borrow_mut().push_back(events);
        self
    }

    /// Seeds a stored token as a prior successful run would have left it.
    fn seed_token(&self, config: &SyncConfig, options: &RunOptions, changes_since: DateTime<Utc>) {
        let mut settings = self.settings.borrow_mut();
        settings.insert(
            ("SosSync".to_string(), format!("{}.Hash", options.configuration_name)),
            config.config_hash().expect("hash"),
        );
        settings.insert(
            (
                "SosSync".to_string(),
                format!("{}.ChangesSince", options.configuration_name),
            ),
            changes_since.to_rfc3339(),
        );
    }

    fn stored_changes_since(&self, options: &RunOptions) -> Option<String> {
        self.settings
            .borrow()
            .get(&(
                "SosSync".to_string(),
                format!("{}.ChangesSince", options.configuration_name),
            ))
            .cloned()
    }
}

impl TimeSeriesSource for FakeSource {
    fn server_version(&self) -> Result<String> {
        Ok("2024.1.0".to_string())
    }

    fn poll_changes(&self, query: &ChangeQuery) -> Result<ChangeSet> {
        self.poll_tokens.borrow_mut().push(query.changes_since);
        let changed = self.rounds.borrow_mut().pop_front().unwrap_or_default();

        Ok(ChangeSet {
            changed,
            next_token: Some(self.next_token),
            token_expired: false,
            response_time: Utc::now(),
        })
    }

    fn series_descriptions(&self, ids: &[Uuid]) -> Result<Vec<SeriesDescription>> {
        let mut found: Vec<SeriesDescription> = self
            .descriptions
            .iter()
            .filter(|d| ids.contains(&d.unique_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.location_id
                .cmp(&b.location_id)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(found)
    }

    fn points(
        &self,
        series_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        _apply_rounding: bool,
    ) -> Result<TimeSeriesData> {
        self.point_queries.borrow_mut().push((series_id, from, to));

        let points = self
            .data
            .get(&series_id)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| from.is_none_or(|f| p.timestamp >= f))
                    .filter(|p| to.is_none_or(|t| p.timestamp <= t))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        Ok(TimeSeriesData {
            points,
            ..TimeSeriesData::default()
        })
    }

    fn approval_table(&self) -> Result<Vec<ApprovalMetadata>> {
        Ok(Vec::new())
    }

    fn grade_table(&self) -> Result<Vec<GradeMetadata>> {
        Ok(self.grade_table.clone())
    }

    fn qualifier_table(&self) -> Result<Vec<QualifierMetadata>> {
        Ok(Vec::new())
    }

    fn location_description(&self, identifier: &str) -> Result<Option<LocationDescription>> {
        Ok(self.locations.get(identifier).map(|l| LocationDescription {
            identifier: l.identifier.clone(),
            name: l.name.clone(),
        }))
    }

    fn location_data(&self, identifier: &str) -> Result<LocationData> {
        self.locations.get(identifier).cloned().ok_or_else(|| {
            SyncError::SourceInconsistency(format!("unknown location '{identifier}'"))
        })
    }

    fn get_setting(&self, group: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .settings
            .borrow()
            .get(&(group.to_string(), key.to_string()))
            .cloned())
    }

    fn save_setting(&self, group: &str, key: &str, value: &str) -> Result<()> {
        self.settings
            .borrow_mut()
            .insert((group.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeSos {
    sensors: RefCell<HashMap<String, SensorInfo>>,
    exported: RefCell<HashMap<String, Vec<Point>>>,
    observed: RefCell<Vec<(String, ObservationBatch)>>,
    deleted: RefCell<Vec<String>>,
    inserted: RefCell<Vec<String>>,
    toggles: RefCell<Vec<(String, bool)>>,
    cleared: Cell<bool>,
    purge_count: Cell<u32>,
    fail_observation_for: RefCell<Option<String>>,
}

impl FakeSos {
    fn with_sensor(self, sensor: SensorInfo, exported: Vec<Point>) -> Self {
        self.exported
            .borrow_mut()
            .insert(sensor.procedure_id.clone(), exported);
        self.sensors
            .borrow_mut()
            .insert(sensor.procedure_id.clone(), sensor);
        self
    }

    fn observed_point_count(&self) -> usize {
        self.observed
            .borrow()
            .iter()
            .map(|(_, batch)| batch.points.len())
            .sum()
    }
}

impl SosService for FakeSos {
    fn capabilities(&self) -> Result<Vec<SensorInfo>> {
        Ok(self.sensors.borrow().values().cloned().collect())
    }

    fn set_operation_transactional(&self, operation: &str, active: bool) -> Result<()> {
        self.toggles
            .borrow_mut()
            .push((operation.to_string(), active));
        Ok(())
    }

    fn delete_sensor(&self, procedure_id: &str) -> Result<()> {
        if self.sensors.borrow_mut().remove(procedure_id).is_none() {
            return Err(SyncError::Api {
                status: 404,
                message: "InvalidParameterValue: procedure".to_string(),
            });
        }
        self.exported.borrow_mut().remove(procedure_id);
        self.deleted.borrow_mut().push(procedure_id.to_string());
        Ok(())
    }

    fn insert_sensor(&self, series: &SeriesDescription) -> Result<InsertedSensor> {
        let procedure_id = procedure_unique_id(series);
        let offering_id = format!("offering-{procedure_id}");
        self.inserted.borrow_mut().push(procedure_id.clone());
        self.sensors.borrow_mut().insert(
            procedure_id.clone(),
            SensorInfo {
                procedure_id: procedure_id.clone(),
                offering_id: offering_id.clone(),
                phenomenon_times: Vec::new(),
            },
        );

        Ok(InsertedSensor {
            procedure_id,
            offering_id,
        })
    }

    fn insert_observation(
        &self,
        offering_id: &str,
        _location: &LocationData,
        series: &SeriesDescription,
        batch: &ObservationBatch,
    ) -> Result<()> {
        let procedure_id = procedure_unique_id(series);
        if self.fail_observation_for.borrow().as_deref() == Some(procedure_id.as_str()) {
            return Err(SyncError::Api {
                status: 500,
                message: "insert rejected".to_string(),
            });
        }

        self.exported
            .borrow_mut()
            .entry(procedure_id)
            .or_default()
            .extend(batch.points.iter().copied());
        self.observed
            .borrow_mut()
            .push((offering_id.to_string(), batch.clone()));
        Ok(())
    }

    fn clear_all_data(&self) -> Result<()> {
        self.cleared.set(true);
        self.sensors.borrow_mut().clear();
        self.exported.borrow_mut().clear();
        Ok(())
    }

    fn purge_deleted_observations(&self) -> Result<()> {
        self.purge_count.set(self.purge_count.get() + 1);
        Ok(())
    }

    fn query_observations(
        &self,
        procedure_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        Ok(self
            .exported
            .borrow()
            .get(procedure_id)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= from && p.timestamp <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn change(id: Uuid, first_point_changed: i64) -> ChangeEvent {
    ChangeEvent {
        series_id: id,
        first_point_changed: Some(ts(first_point_changed)),
        has_attribute_change: Some(false),
    }
}

#[test]
fn batches_respect_max_points_per_observation() {
    let id = Uuid::new_v4();
    let points: Vec<Point> = (1..=7i64).map(|i| point(i * 10, i as f64)).collect();
    let source = FakeSource::new()
        .with_series(series(id, "Loc1"), points)
        .with_round(vec![change(id, 10)]);
    let sos = FakeSos::default();

    let config = SyncConfig::default();
    let options = RunOptions {
        max_points_per_observation: 3,
        ..RunOptions::default()
    };

    let summary = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(summary.exported_series, 1);
    assert_eq!(summary.exported_points, 7);

    let observed = sos.observed.borrow();
    let sizes: Vec<usize> = observed.iter().map(|(_, b)| b.points.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);

    for (_, batch) in observed.iter() {
        assert_eq!(batch.start, batch.points.first().unwrap().timestamp);
        assert_eq!(batch.end, batch.points.last().unwrap().timestamp);
    }

    // Batches arrive in non-decreasing timestamp order.
    let all: Vec<Point> = observed.iter().flat_map(|(_, b)| b.points.clone()).collect();
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    assert_eq!(sos.inserted.borrow().len(), 1);

    // Transactional bracket: every write operation enabled then disabled.
    let toggles = sos.toggles.borrow();
    for operation in ["DeleteSensor", "InsertSensor", "InsertObservation"] {
        assert!(toggles.contains(&(operation.to_string(), true)));
        assert!(toggles.contains(&(operation.to_string(), false)));
    }
}

#[test]
fn second_run_with_no_changes_writes_nothing() {
    let id = Uuid::new_v4();
    let points: Vec<Point> = (1..=5).map(|i| point(i * 10, 1.0)).collect();
    let source = FakeSource::new()
        .with_series(series(id, "Loc1"), points)
        .with_round(vec![change(id, 10)]);
    let sos = FakeSos::default();

    let config = SyncConfig::default();
    let options = RunOptions::default();

    Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("first run");
    let writes_after_first = sos.observed.borrow().len();
    let sensors_after_first = sos.inserted.borrow().len();

    Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("second run");

    assert_eq!(sos.observed.borrow().len(), writes_after_first);
    assert_eq!(sos.inserted.borrow().len(), sensors_after_first);

    // The second poll reused the saved token.
    let tokens = source.poll_tokens.borrow();
    assert_eq!(tokens.len(), 2);
    assert!(tokens[0].is_none());
    assert_eq!(tokens[1], Some(source.next_token));
}

#[test]
fn editing_any_filter_forces_a_resync() {
    let id = Uuid::new_v4();
    let mut source = FakeSource::new()
        .with_series(series(id, "Loc1"), vec![point(10, 1.0)])
        .with_round(vec![change(id, 10)]);
    source.grade_table = vec![GradeMetadata {
        identifier: "20".to_string(),
        display_name: "Good".to_string(),
    }];

    let config = SyncConfig::default();
    let options = RunOptions::default();
    let sos = FakeSos::default();

    Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("first run");

    let mut edited = config.clone();
    edited.grade_filters.push(GradeRule {
        exclude: false,
        op: ComparisonOp::Ge,
        text: "Good".to_string(),
    });

    Exporter::new(&source, &sos, &edited, &options)
        .run()
        .expect("second run");

    let tokens = source.poll_tokens.borrow();
    assert_eq!(tokens.len(), 2);
    assert!(tokens[1].is_none(), "changed config must ignore the stored token");
}

#[test]
fn matching_overlap_appends_past_verified_data() {
    let id = Uuid::new_v4();
    let description = series(id, "Loc1");
    let procedure_id = procedure_unique_id(&description);

    let source_points = vec![
        point(10, 1.0),
        point(20, 2.0),
        point(30, 3.0),
        point(40, 4.0),
        point(50, 5.0),
    ];
    let exported = vec![point(10, 1.0), point(20, 2.0), point(30, 3.0)];

    let source = FakeSource::new()
        .with_series(description, source_points)
        .with_round(vec![change(id, 20)]);
    let sos = FakeSos::default().with_sensor(
        SensorInfo {
            procedure_id: procedure_id.clone(),
            offering_id: "off-1".to_string(),
            phenomenon_times: vec![ts(30)],
        },
        exported,
    );

    let config = SyncConfig::default();
    let options = RunOptions::default();
    source.seed_token(&config, &options, Utc::now() - Duration::hours(1));

    let summary = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(summary.exported_series, 1);
    assert!(sos.deleted.borrow().is_empty(), "append path must not delete");
    assert!(sos.inserted.borrow().is_empty(), "append path must not recreate");

    let observed = sos.observed.borrow();
    assert_eq!(observed.len(), 1);
    let (offering, batch) = &observed[0];
    assert_eq!(offering, "off-1");
    assert_eq!(batch.points, vec![point(40, 4.0), point(50, 5.0)]);
}

#[test]
fn any_overlap_difference_replaces_the_sensor() {
    let id = Uuid::new_v4();
    let description = series(id, "Loc1");
    let procedure_id = procedure_unique_id(&description);

    let source_points = vec![
        point(10, 1.0),
        point(20, 2.0),
        point(30, 3.0),
        point(40, 4.0),
    ];
    // The exported value at t=20 no longer matches the source.
    let exported = vec![point(10, 1.0), point(20, 2.5), point(30, 3.0)];

    let source = FakeSource::new()
        .with_series(description, source_points)
        .with_round(vec![change(id, 20)]);
    let sos = FakeSos::default().with_sensor(
        SensorInfo {
            procedure_id: procedure_id.clone(),
            offering_id: "off-1".to_string(),
            phenomenon_times: vec![ts(30)],
        },
        exported,
    );

    let config = SyncConfig::default();
    let options = RunOptions::default();
    source.seed_token(&config, &options, Utc::now() - Duration::hours(1));

    Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(sos.deleted.borrow().as_slice(), [procedure_id.clone()]);
    assert_eq!(sos.inserted.borrow().as_slice(), [procedure_id]);
    assert_eq!(sos.observed_point_count(), 4, "replacement re-exports the window");
}

#[test]
fn attribute_change_always_replaces() {
    let id = Uuid::new_v4();
    let description = series(id, "Loc1");
    let procedure_id = procedure_unique_id(&description);

    let source = FakeSource::new()
        .with_series(description, vec![point(10, 1.0), point(20, 2.0)])
        .with_round(vec![ChangeEvent {
            series_id: id,
            first_point_changed: None,
            has_attribute_change: Some(true),
        }]);
    let sos = FakeSos::default().with_sensor(
        SensorInfo {
            procedure_id: procedure_id.clone(),
            offering_id: "off-1".to_string(),
            phenomenon_times: vec![ts(20)],
        },
        vec![point(10, 1.0), point(20, 2.0)],
    );

    let config = SyncConfig::default();
    let options = RunOptions::default();
    source.seed_token(&config, &options, Utc::now() - Duration::hours(1));

    Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(sos.deleted.borrow().as_slice(), [procedure_id.clone()]);
    assert_eq!(sos.inserted.borrow().as_slice(), [procedure_id]);
}

#[test]
fn exceeded_budget_repolls_and_merges_queued_events() {
    let id = Uuid::new_v4();
    let source = FakeSource::new()
        .with_series(series(id, "Loc1"), vec![point(10, 1.0)])
        .with_round(vec![change(id, 2_000)])
        // The checkpoint re-poll reports the same series with an earlier
        // first-changed point.
        .with_round(vec![change(id, 1_000)]);
    let sos = FakeSos::default();

    let config = SyncConfig::default();
    let options = RunOptions {
        max_run_duration: StdDuration::ZERO,
        ..RunOptions::default()
    };

    let summary = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert!(summary.checkpoints >= 1);
    assert_eq!(summary.exported_series, 1);

    // The merged event kept the earlier origin: the fetch window is
    // anchored on t=1000, not t=2000.
    let expected_from = ts(1_000) - Duration::days(config.default_export_window_days);
    let queries = source.point_queries.borrow();
    assert_eq!(queries.last().unwrap().1, Some(expected_from));
}

#[test]
fn failed_series_holds_back_the_saved_token() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let series_a = series(a, "LocA");
    let series_b = series(b, "LocB");
    let failing_procedure = procedure_unique_id(&series_a);

    let source = FakeSource::new()
        .with_series(series_a, vec![point(1_500, 1.0)])
        .with_series(series_b, vec![point(2_500, 2.0)])
        .with_round(vec![change(a, 1_000), change(b, 2_000)]);
    let sos = FakeSos::default();
    *sos.fail_observation_for.borrow_mut() = Some(failing_procedure);

    let config = SyncConfig::default();
    let options = RunOptions::default();
    source.seed_token(&config, &options, Utc::now() - Duration::hours(1));

    let summary = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(summary.exported_series, 1);
    assert_eq!(summary.failed_series, 1);

    // The token rolled back to the failed series' change origin so the
    // next run re-observes it.
    assert_eq!(
        source.stored_changes_since(&options),
        Some(ts(1_000).to_rfc3339())
    );
}

#[test]
fn dry_run_reads_everything_and_mutates_nothing() {
    let id = Uuid::new_v4();
    let source = FakeSource::new()
        .with_series(series(id, "Loc1"), vec![point(10, 1.0), point(20, 2.0)])
        .with_round(vec![change(id, 10)]);
    let sos = FakeSos::default();

    let config = SyncConfig::default();
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    let summary = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect("run");

    assert_eq!(summary.exported_points, 2);
    assert!(sos.observed.borrow().is_empty());
    assert!(sos.inserted.borrow().is_empty());
    assert!(!sos.cleared.get());
    assert!(sos.toggles.borrow().is_empty());
    assert!(
        source.stored_changes_since(&options).is_none(),
        "dry run must not persist the token"
    );
}

#[test]
fn cancellation_stops_between_series_and_keeps_the_token() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let source = FakeSource::new()
        .with_series(series(a, "LocA"), vec![point(10, 1.0)])
        .with_series(series(b, "LocB"), vec![point(20, 2.0)])
        .with_round(vec![change(a, 10), change(b, 20)]);
    let sos = FakeSos::default();

    let config = SyncConfig::default();
    let options = RunOptions::default();
    source.seed_token(&config, &options, Utc::now() - Duration::hours(1));
    let seeded = source.stored_changes_since(&options);

    let exporter = Exporter::new(&source, &sos, &config, &options);
    exporter.cancel_token().cancel();
    let summary = exporter.run().expect("run");

    assert!(summary.cancelled);
    assert_eq!(summary.exported_series, 0);
    assert!(sos.observed.borrow().is_empty());
    assert_eq!(source.stored_changes_since(&options), seeded);
}

#[test]
fn unknown_filter_name_aborts_before_any_target_mutation() {
    let id = Uuid::new_v4();
    let mut source = FakeSource::new()
        .with_series(series(id, "Loc1"), vec![point(10, 1.0)])
        .with_round(vec![change(id, 10)]);
    source.grade_table = vec![GradeMetadata {
        identifier: "20".to_string(),
        display_name: "Good".to_string(),
    }];

    let mut config = SyncConfig::default();
    config.grade_filters.push(GradeRule {
        exclude: false,
        op: ComparisonOp::Ge,
        text: "NoSuchGrade".to_string(),
    });
    let options = RunOptions::default();
    let sos = FakeSos::default();

    let error = Exporter::new(&source, &sos, &config, &options)
        .run()
        .expect_err("unknown grade must fail");

    assert!(matches!(error, SyncError::Expected(_)));
    assert!(sos.toggles.borrow().is_empty());
    assert!(sos.observed.borrow().is_empty());
}
