use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::models::{LocationData, Point, SensorInfo, SeriesDescription};

/// Target operations that must run with transactional mode enabled while
/// the export writer is alive.
pub const TRANSACTIONAL_OPERATIONS: &[&str] = &["DeleteSensor", "InsertSensor", "InsertObservation"];

#[derive(Debug, Clone)]
pub struct InsertedSensor {
    pub procedure_id: String,
    pub offering_id: String,
}

/// One observation request: consecutive points plus their bounding
/// phenomenon times.
#[derive(Debug, Clone)]
pub struct ObservationBatch {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub points: Vec<Point>,
}

/// Everything the engine consumes from the target sensor service. The
/// HTTP implementation is `SosClient`; tests substitute fakes.
pub trait SosService {
    fn capabilities(&self) -> Result<Vec<SensorInfo>>;

    fn set_operation_transactional(&self, operation: &str, active: bool) -> Result<()>;

    fn delete_sensor(&self, procedure_id: &str) -> Result<()>;

    fn insert_sensor(&self, series: &SeriesDescription) -> Result<InsertedSensor>;

    fn insert_observation(
        &self,
        offering_id: &str,
        location: &LocationData,
        series: &SeriesDescription,
        batch: &ObservationBatch,
    ) -> Result<()>;

    fn clear_all_data(&self) -> Result<()>;

    fn purge_deleted_observations(&self) -> Result<()>;

    /// Already-exported points for a procedure within `[from, to]`. Used
    /// only by the divergence checker.
    fn query_observations(
        &self,
        procedure_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Point>>;
}

/// Stable procedure identity for a series on the target. An attribute
/// change (unit, interpolation, label) changes this identity, which is why
/// attribute changes always force a sensor replacement.
#[must_use]
pub fn procedure_unique_id(series: &SeriesDescription) -> String {
    let suffix = interpolation_suffix(&series.interpolation_kind);
    sanitize_identifier(&format!(
        "{}.{}@{}_{}",
        series.parameter, series.label, series.location_id, suffix
    ))
}

fn interpolation_suffix(kind: &str) -> &'static str {
    match kind {
        k if k.eq_ignore_ascii_case("DiscreteValues") => "Discrete",
        k if k.eq_ignore_ascii_case("InstantaneousTotals") => "InstantTotal",
        k if k.eq_ignore_ascii_case("InstantaneousValues") => "Instantaneous",
        k if k.eq_ignore_ascii_case("PrecedingConstant") => "AveragePrec",
        k if k.eq_ignore_ascii_case("PrecedingTotals") => "TotalPrec",
        k if k.eq_ignore_ascii_case("SucceedingConstant") => "AverageSucc",
        _ => "Unknown",
    }
}

fn sanitize_identifier(text: &str) -> String {
    text.chars()
        .map(|c| if matches!(c, ',' | '(' | ')') { '_' } else { c })
        .collect()
}

/// Field name of the observed property, derived the same way as the
/// procedure id so both sides of the mapping stay consistent.
#[must_use]
pub fn observed_property(series: &SeriesDescription) -> String {
    sanitize_identifier(&format!("{}_{}", series.parameter, series.label))
}

#[derive(Debug, Clone)]
pub struct SosConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Blocking JSON client for the target SOS service.
#[derive(Clone)]
pub struct SosClient {
    config: SosConfig,
    http: reqwest::blocking::Client,
    session_id: String,
}

impl std::fmt::Debug for SosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SosClient")
            .field("base_url", &self.config.base_url)
            .field("username", &self.config.username)
            .finish_non_exhaustive()
    }
}

impl SosClient {
    pub fn connect(config: SosConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;

        let base = config.base_url.trim_end_matches('/').to_string();
        let response = http
            .post(format!("{base}/auth/session"))
            .json(&LoginRequest {
                username: config.username.clone(),
                password: config.password.clone(),
            })
            .send()?;
        let session: SessionDto = expect_success(response)?.json()?;

        Ok(Self {
            config,
            http,
            session_id: session.session_id,
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/auth/session", self.base()))
            .header("Authorization", format!("Session {}", self.session_id))
            .send()?;
        expect_success(response)?;
        Ok(())
    }

    fn base(&self) -> String {
        self.config.base_url.trim_end_matches('/').to_string()
    }

    fn post(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base()))
            .header("Authorization", format!("Session {}", self.session_id))
    }
}

fn expect_success(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().unwrap_or_default();
    Err(SyncError::Api {
        status: status.as_u16(),
        message,
    })
}

impl SosService for SosClient {
    fn capabilities(&self) -> Result<Vec<SensorInfo>> {
        let response = expect_success(
            self.post("/service/json")
                .json(&CapabilitiesRequest {
                    request: "GetCapabilities",
                    service: "SOS",
                    sections: vec!["Contents"],
                })
                .send()?,
        )?;
        let dto: CapabilitiesDto = response.json()?;

        Ok(dto
            .contents
            .into_iter()
            .map(|c| SensorInfo {
                procedure_id: c.procedure,
                offering_id: c.offering,
                phenomenon_times: c.phenomenon_time,
            })
            .collect())
    }

    fn set_operation_transactional(&self, operation: &str, active: bool) -> Result<()> {
        let response = self
            .post("/admin/operations")
            .json(&ConfigureOperationRequest {
                operation: operation.to_string(),
                active,
            })
            .send()?;
        expect_success(response)?;
        Ok(())
    }

    fn delete_sensor(&self, procedure_id: &str) -> Result<()> {
        info!("Deleting sensor for '{procedure_id}' ...");
        let response = self
            .post("/service/json")
            .json(&DeleteSensorRequest {
                request: "DeleteSensor",
                procedure: procedure_id.to_string(),
            })
            .send()?;
        expect_success(response)?;
        Ok(())
    }

    fn insert_sensor(&self, series: &SeriesDescription) -> Result<InsertedSensor> {
        let procedure_id = procedure_unique_id(series);
        info!("Inserting sensor for '{procedure_id}' ...");

        let response = expect_success(
            self.post("/service/json")
                .json(&InsertSensorRequest {
                    request: "InsertSensor",
                    procedure: procedure_id,
                    observed_property: observed_property(series),
                    unit: series.unit.clone(),
                    feature_of_interest: series.location_id.clone(),
                })
                .send()?,
        )?;
        let dto: InsertSensorDto = response.json()?;

        Ok(InsertedSensor {
            procedure_id: dto.assigned_procedure,
            offering_id: dto.assigned_offering,
        })
    }

    fn insert_observation(
        &self,
        offering_id: &str,
        location: &LocationData,
        series: &SeriesDescription,
        batch: &ObservationBatch,
    ) -> Result<()> {
        let spatial = location.has_spatial_reference().then(|| SpatialFeatureDto {
            latitude: location.latitude,
            longitude: location.longitude,
        });

        let response = self
            .post("/service/json")
            .json(&InsertObservationRequest {
                request: "InsertObservation",
                offering: offering_id.to_string(),
                procedure: procedure_unique_id(series),
                observed_property: observed_property(series),
                unit: series.unit.clone(),
                utc_offset_hours: series.utc_offset_hours,
                feature_of_interest: FeatureOfInterestDto {
                    identifier: location.identifier.clone(),
                    name: location.name.clone(),
                    geometry: spatial,
                },
                phenomenon_start: batch.start,
                phenomenon_end: batch.end,
                point_count: batch.points.len(),
                values: batch
                    .points
                    .iter()
                    .map(|p| ObservationValueDto {
                        timestamp: p.timestamp,
                        value: p.value,
                    })
                    .collect(),
            })
            .send()?;
        expect_success(response)?;
        Ok(())
    }

    fn clear_all_data(&self) -> Result<()> {
        info!("Clearing the SOS database ...");
        let response = self.post("/admin/datasource/clear").send()?;
        expect_success(response)?;
        Ok(())
    }

    fn purge_deleted_observations(&self) -> Result<()> {
        info!("Deleting stale observations ...");
        let response = self.post("/admin/observations/purge").send()?;
        expect_success(response)?;
        Ok(())
    }

    fn query_observations(
        &self,
        procedure_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        let response = expect_success(
            self.post("/service/json")
                .json(&GetObservationRequest {
                    request: "GetObservation",
                    procedure: procedure_id.to_string(),
                    temporal_from: from,
                    temporal_to: to,
                })
                .send()?,
        )?;
        let dto: GetObservationDto = response.json()?;

        let mut points: Vec<Point> = dto
            .observations
            .into_iter()
            .flat_map(|o| o.values)
            .map(|v| Point {
                timestamp: v.timestamp,
                value: v.value,
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);

        Ok(points)
    }
}

// Wire DTOs. The SOS service speaks camelCase JSON.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDto {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesRequest {
    request: &'static str,
    service: &'static str,
    sections: Vec<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesDto {
    #[serde(default)]
    contents: Vec<CapabilityContentDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilityContentDto {
    procedure: String,
    offering: String,
    #[serde(default)]
    phenomenon_time: Vec<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureOperationRequest {
    operation: String,
    active: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSensorRequest {
    request: &'static str,
    procedure: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertSensorRequest {
    request: &'static str,
    procedure: String,
    observed_property: String,
    unit: String,
    feature_of_interest: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertSensorDto {
    assigned_procedure: String,
    assigned_offering: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeatureOfInterestDto {
    identifier: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    geometry: Option<SpatialFeatureDto>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpatialFeatureDto {
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertObservationRequest {
    request: &'static str,
    offering: String,
    procedure: String,
    observed_property: String,
    unit: String,
    utc_offset_hours: f64,
    feature_of_interest: FeatureOfInterestDto,
    phenomenon_start: DateTime<Utc>,
    phenomenon_end: DateTime<Utc>,
    point_count: usize,
    values: Vec<ObservationValueDto>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationValueDto {
    timestamp: DateTime<Utc>,
    value: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetObservationRequest {
    request: &'static str,
    procedure: String,
    temporal_from: DateTime<Utc>,
    temporal_to: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetObservationDto {
    #[serde(default)]
    observations: Vec<ObservationDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationDto {
    #[serde(default)]
    values: Vec<ObservationValueDto>,
}
