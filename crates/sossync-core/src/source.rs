use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ExtendedAttributeFilter;
use crate::error::{Result, SyncError};
use crate::models::{
    ApprovalInterval, ApprovalMetadata, ChangeEvent, GradeInterval, GradeMetadata, LocationData,
    LocationDescription, Point, QualifierInterval, QualifierMetadata, SeriesDescription,
    TimeSeriesData,
};

/// Filters presented to the source's change poll. Mirrors the change-poll
/// section of the configuration plus the current token.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    pub location_identifier: Option<String>,
    pub parameter: Option<String>,
    pub publish: Option<bool>,
    pub computation_identifier: Option<String>,
    pub computation_period_identifier: Option<String>,
    pub extended_filters: Vec<ExtendedAttributeFilter>,
    pub changes_since: Option<DateTime<Utc>>,
}

/// Raw change-poll response before expiry handling.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub changed: Vec<ChangeEvent>,
    pub next_token: Option<DateTime<Utc>>,
    pub token_expired: bool,
    pub response_time: DateTime<Utc>,
}

/// Everything the engine consumes from the source time-series system.
/// The HTTP implementation is `PublishClient`; tests substitute fakes.
pub trait TimeSeriesSource {
    fn server_version(&self) -> Result<String>;

    fn poll_changes(&self, query: &ChangeQuery) -> Result<ChangeSet>;

    /// Descriptions for the given series, ordered by location then
    /// identifier.
    fn series_descriptions(&self, ids: &[Uuid]) -> Result<Vec<SeriesDescription>>;

    fn points(
        &self,
        series_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        apply_rounding: bool,
    ) -> Result<TimeSeriesData>;

    fn approval_table(&self) -> Result<Vec<ApprovalMetadata>>;
    fn grade_table(&self) -> Result<Vec<GradeMetadata>>;
    fn qualifier_table(&self) -> Result<Vec<QualifierMetadata>>;

    fn location_description(&self, identifier: &str) -> Result<Option<LocationDescription>>;
    fn location_data(&self, identifier: &str) -> Result<LocationData>;

    /// Key/value settings facility, also used to persist the sync token.
    fn get_setting(&self, group: &str, key: &str) -> Result<Option<String>>;
    fn save_setting(&self, group: &str, key: &str, value: &str) -> Result<()>;
}

/// Descriptions are fetched in chunks to keep request bodies bounded.
const DESCRIPTION_BATCH_SIZE: usize = 400;

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Blocking JSON client for the source's publish API.
#[derive(Clone)]
pub struct PublishClient {
    config: PublishConfig,
    http: Client,
    session_token: String,
}

impl std::fmt::Debug for PublishClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishClient")
            .field("base_url", &self.config.base_url)
            .field("username", &self.config.username)
            .finish_non_exhaustive()
    }
}

impl PublishClient {
    pub fn connect(config: PublishConfig) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;

        let response = http
            .post(format!("{}/session", base_url(&config.base_url)))
            .json(&SessionRequest {
                username: config.username.clone(),
                password: config.password.clone(),
            })
            .send()?;
        let session_token = expect_success(response)?.text()?;

        Ok(Self {
            config,
            http,
            session_token,
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/session", self.base()))
            .header("X-Authentication-Token", &self.session_token)
            .send()?;
        expect_success(response)?;
        Ok(())
    }

    fn base(&self) -> String {
        base_url(&self.config.base_url)
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base()))
            .header("X-Authentication-Token", &self.session_token)
    }

    fn post(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base()))
            .header("X-Authentication-Token", &self.session_token)
    }

    fn put(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http
            .put(format!("{}{path}", self.base()))
            .header("X-Authentication-Token", &self.session_token)
    }
}

fn base_url(url: &str) -> String {
    format!("{}/Publish/v2", url.trim_end_matches('/'))
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

impl TimeSeriesSource for PublishClient {
    fn server_version(&self) -> Result<String> {
        let response = expect_success(self.get("/version").send()?)?;
        let dto: VersionDto = response.json()?;
        Ok(dto.api_version)
    }

    fn poll_changes(&self, query: &ChangeQuery) -> Result<ChangeSet> {
        let mut request = self.get("/GetTimeSeriesUniqueIdList");

        if let Some(token) = query.changes_since {
            request = request.query(&[("ChangesSinceToken", token.to_rfc3339())]);
        }
        if let Some(location) = &query.location_identifier {
            request = request.query(&[("LocationIdentifier", location)]);
        }
        if let Some(parameter) = &query.parameter {
            request = request.query(&[("Parameter", parameter)]);
        }
        if let Some(publish) = query.publish {
            request = request.query(&[("Publish", publish.to_string())]);
        }
        if let Some(computation) = &query.computation_identifier {
            request = request.query(&[("ComputationIdentifier", computation)]);
        }
        if let Some(period) = &query.computation_period_identifier {
            request = request.query(&[("ComputationPeriodIdentifier", period)]);
        }
        for filter in &query.extended_filters {
            request = request.query(&[(
                "ExtendedFilters",
                format!("{}={}", filter.name, filter.value),
            )]);
        }

        let response = expect_success(request.send()?)?;
        let dto: ChangeSetDto = response.json()?;

        Ok(ChangeSet {
            changed: dto
                .time_series_unique_ids
                .into_iter()
                .map(|c| ChangeEvent {
                    series_id: c.unique_id,
                    first_point_changed: c.first_point_changed,
                    has_attribute_change: c.has_attribute_change,
                })
                .collect(),
            next_token: dto.next_token,
            token_expired: dto.token_expired.unwrap_or(false),
            response_time: dto.response_time,
        })
    }

    fn series_descriptions(&self, ids: &[Uuid]) -> Result<Vec<SeriesDescription>> {
        let mut descriptions = Vec::with_capacity(ids.len());

        for batch in ids.chunks(DESCRIPTION_BATCH_SIZE) {
            let response = expect_success(
                self.post("/GetTimeSeriesDescriptionListByUniqueId")
                    .json(&DescriptionListRequest {
                        time_series_unique_ids: batch.to_vec(),
                    })
                    .send()?,
            )?;
            let dto: DescriptionListDto = response.json()?;
            descriptions.extend(dto.time_series_descriptions.into_iter().map(Into::into));
        }

        descriptions.sort_by(|a: &SeriesDescription, b: &SeriesDescription| {
            a.location_id
                .cmp(&b.location_id)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });

        Ok(descriptions)
    }

    fn points(
        &self,
        series_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        apply_rounding: bool,
    ) -> Result<TimeSeriesData> {
        let mut request = self
            .get("/GetTimeSeriesCorrectedData")
            .query(&[("TimeSeriesUniqueId", series_id.to_string())])
            .query(&[("ApplyRounding", apply_rounding.to_string())]);

        if let Some(from) = from {
            request = request.query(&[("QueryFrom", from.to_rfc3339())]);
        }
        if let Some(to) = to {
            request = request.query(&[("QueryTo", to.to_rfc3339())]);
        }

        let response = expect_success(request.send()?)?;
        let dto: CorrectedDataDto = response.json()?;

        Ok(TimeSeriesData {
            points: dto
                .points
                .into_iter()
                .map(|p| Point {
                    timestamp: p.timestamp,
                    value: p.value,
                })
                .collect(),
            approvals: dto
                .approvals
                .into_iter()
                .map(|a| ApprovalInterval {
                    approval_level: a.approval_level,
                    start: a.start_time,
                    end: a.end_time,
                })
                .collect(),
            grades: dto
                .grades
                .into_iter()
                .map(|g| GradeInterval {
                    grade_code: g.grade_code,
                    start: g.start_time,
                    end: g.end_time,
                })
                .collect(),
            qualifiers: dto
                .qualifiers
                .into_iter()
                .map(|q| QualifierInterval {
                    identifier: q.identifier,
                    start: q.start_time,
                    end: q.end_time,
                })
                .collect(),
        })
    }

    fn approval_table(&self) -> Result<Vec<ApprovalMetadata>> {
        let response = expect_success(self.get("/GetApprovalList").send()?)?;
        let dto: ApprovalListDto = response.json()?;
        Ok(dto
            .approvals
            .into_iter()
            .map(|a| ApprovalMetadata {
                identifier: a.identifier,
                display_name: a.display_name,
            })
            .collect())
    }

    fn grade_table(&self) -> Result<Vec<GradeMetadata>> {
        let response = expect_success(self.get("/GetGradeList").send()?)?;
        let dto: GradeListDto = response.json()?;
        Ok(dto
            .grades
            .into_iter()
            .map(|g| GradeMetadata {
                identifier: g.identifier,
                display_name: g.display_name,
            })
            .collect())
    }

    fn qualifier_table(&self) -> Result<Vec<QualifierMetadata>> {
        let response = expect_success(self.get("/GetQualifierList").send()?)?;
        let dto: QualifierListDto = response.json()?;
        Ok(dto
            .qualifiers
            .into_iter()
            .map(|q| QualifierMetadata {
                identifier: q.identifier,
                code: q.code,
            })
            .collect())
    }

    fn location_description(&self, identifier: &str) -> Result<Option<LocationDescription>> {
        let response = expect_success(
            self.get("/GetLocationDescriptionList")
                .query(&[("LocationIdentifier", identifier)])
                .send()?,
        )?;
        let dto: LocationDescriptionListDto = response.json()?;

        let mut descriptions = dto.location_descriptions;
        if descriptions.len() > 1 {
            return Err(SyncError::SourceInconsistency(format!(
                "location '{identifier}' matched {} descriptions",
                descriptions.len()
            )));
        }

        Ok(descriptions.pop().map(|d| LocationDescription {
            identifier: d.identifier,
            name: d.name,
        }))
    }

    fn location_data(&self, identifier: &str) -> Result<LocationData> {
        let response = expect_success(
            self.get("/GetLocationData")
                .query(&[("LocationIdentifier", identifier)])
                .send()?,
        )?;
        let dto: LocationDataDto = response.json()?;

        Ok(LocationData {
            identifier: dto.identifier,
            name: dto.location_name,
            latitude: dto.latitude.unwrap_or(0.0),
            longitude: dto.longitude.unwrap_or(0.0),
        })
    }

    fn get_setting(&self, group: &str, key: &str) -> Result<Option<String>> {
        let response = self.get(&format!("/settings/{group}/{key}")).send()?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        let dto: SettingDto = expect_success(response)?.json()?;
        Ok(Some(dto.setting_value))
    }

    fn save_setting(&self, group: &str, key: &str, value: &str) -> Result<()> {
        let response = self
            .put(&format!("/settings/{group}/{key}"))
            .json(&SettingDto {
                setting_value: value.to_string(),
            })
            .send()?;
        expect_success(response)?;
        Ok(())
    }
}

// Wire DTOs. The publish API speaks PascalCase JSON.

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionDto {
    api_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChangeSetDto {
    #[serde(default)]
    time_series_unique_ids: Vec<ChangedSeriesDto>,
    next_token: Option<DateTime<Utc>>,
    token_expired: Option<bool>,
    response_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChangedSeriesDto {
    unique_id: Uuid,
    first_point_changed: Option<DateTime<Utc>>,
    has_attribute_change: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescriptionListRequest {
    time_series_unique_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescriptionListDto {
    #[serde(default)]
    time_series_descriptions: Vec<SeriesDescriptionDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SeriesDescriptionDto {
    unique_id: Uuid,
    identifier: String,
    location_identifier: String,
    parameter: String,
    label: String,
    unit: String,
    interpolation_type: String,
    utc_offset: f64,
    #[serde(default)]
    extended_attributes: Vec<ExtendedAttributeDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExtendedAttributeDto {
    name: String,
    value: Option<String>,
}

impl From<SeriesDescriptionDto> for SeriesDescription {
    fn from(dto: SeriesDescriptionDto) -> Self {
        Self {
            unique_id: dto.unique_id,
            identifier: dto.identifier,
            location_id: dto.location_identifier,
            parameter: dto.parameter,
            label: dto.label,
            unit: dto.unit,
            interpolation_kind: dto.interpolation_type,
            utc_offset_hours: dto.utc_offset,
            extended_attributes: dto
                .extended_attributes
                .into_iter()
                .filter_map(|a| a.value.map(|v| (a.name, v)))
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CorrectedDataDto {
    #[serde(default)]
    points: Vec<PointDto>,
    #[serde(default)]
    approvals: Vec<ApprovalIntervalDto>,
    #[serde(default)]
    grades: Vec<GradeIntervalDto>,
    #[serde(default)]
    qualifiers: Vec<QualifierIntervalDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PointDto {
    timestamp: DateTime<Utc>,
    value: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApprovalIntervalDto {
    approval_level: i32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GradeIntervalDto {
    grade_code: i32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QualifierIntervalDto {
    identifier: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApprovalListDto {
    #[serde(default)]
    approvals: Vec<ApprovalMetadataDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApprovalMetadataDto {
    identifier: String,
    display_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GradeListDto {
    #[serde(default)]
    grades: Vec<GradeMetadataDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GradeMetadataDto {
    identifier: String,
    display_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QualifierListDto {
    #[serde(default)]
    qualifiers: Vec<QualifierMetadataDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QualifierMetadataDto {
    identifier: String,
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationDescriptionListDto {
    #[serde(default)]
    location_descriptions: Vec<LocationDescriptionDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationDescriptionDto {
    identifier: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationDataDto {
    identifier: String,
    location_name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingDto {
    setting_value: String,
}
