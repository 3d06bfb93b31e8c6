use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::models::{LocationData, Point, SensorInfo, SeriesDescription};
use crate::sos::{ObservationBatch, SosService, TRANSACTIONAL_OPERATIONS};

/// Session configuration toggles are the only retried operations.
const MAX_TOGGLE_ATTEMPTS: u32 = 3;

/// Everything the writer needs to push one series to the target.
#[derive(Debug)]
pub struct SeriesWrite<'a> {
    pub series: &'a SeriesDescription,
    pub location: &'a LocationData,
    pub procedure_id: &'a str,
    /// Sensor to delete before anything else happens for this series.
    pub delete_existing: Option<&'a SensorInfo>,
    pub create_sensor: bool,
    /// Offering of the surviving sensor when no new one is created.
    pub existing_offering: Option<&'a str>,
    pub points: &'a [Point],
}

#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Offering assigned by a sensor insert, when one happened.
    pub assigned_offering: Option<String>,
    pub written_points: usize,
    /// End timestamp of each successfully inserted batch, in order.
    pub batch_end_times: Vec<DateTime<Utc>>,
}

/// Pushes per-series changes to the target. While a writer is open the
/// target's delete/insert operations run in transactional mode so readers
/// never observe a half-written sensor.
pub struct ExportWriter<'a> {
    sos: &'a dyn SosService,
    max_batch_size: usize,
    dry_run: bool,
}

impl<'a> ExportWriter<'a> {
    pub fn open(sos: &'a dyn SosService, max_batch_size: usize, dry_run: bool) -> Result<Self> {
        let writer = Self {
            sos,
            max_batch_size: max_batch_size.max(1),
            dry_run,
        };

        if !dry_run {
            for operation in TRANSACTIONAL_OPERATIONS {
                writer.toggle_transactional(operation, true)?;
            }
        }

        Ok(writer)
    }

    pub fn close(self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        for operation in TRANSACTIONAL_OPERATIONS {
            self.toggle_transactional(operation, false)?;
        }
        Ok(())
    }

    fn toggle_transactional(&self, operation: &str, active: bool) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=MAX_TOGGLE_ATTEMPTS {
            match self.sos.set_operation_transactional(operation, active) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        "Failed to set transactional={active} for '{operation}' (attempt {attempt} of {MAX_TOGGLE_ATTEMPTS}): {error}"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SyncError::Internal(format!("could not configure operation '{operation}'"))
        }))
    }

    /// Wipes all previously exported data; used when a run has no usable
    /// token and must rebuild the target from scratch.
    pub fn clear_exported_data(&self) -> Result<()> {
        if self.dry_run {
            warn!("Dry-run: Would have cleared the SOS database of all existing data.");
            return Ok(());
        }

        self.sos.clear_all_data()?;
        self.sos.purge_deleted_observations()?;
        Ok(())
    }

    /// Writes one series: optional delete, optional sensor insert, then
    /// consecutive observation batches in timestamp order. A batch failure
    /// aborts the remaining batches for this series only.
    pub fn write_series(&self, write: &SeriesWrite<'_>) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();

        let span = match (write.points.first(), write.points.last()) {
            (Some(first), Some(last)) => format!(
                "[{} to {}]",
                first.timestamp.to_rfc3339(),
                last.timestamp.to_rfc3339()
            ),
            _ => "[empty]".to_string(),
        };
        let summary = format!(
            "{} points {span} from '{}'",
            write.points.len(),
            write.series.identifier
        );

        if self.dry_run {
            if let Some(existing) = write.delete_existing {
                warn!("Dry-run: Would delete existing sensor '{}'", existing.procedure_id);
            }
            if write.create_sensor {
                warn!(
                    "Dry-run: Would create new sensor for '{}'",
                    write.series.identifier
                );
            }
            warn!("Dry-run: Would export {summary}.");
            outcome.written_points = write.points.len();
            return Ok(outcome);
        }

        info!("Exporting {summary} ...");

        if let Some(existing) = write.delete_existing {
            self.delete_sensor(&existing.procedure_id)?;
            self.sos.purge_deleted_observations()?;
        }

        let offering = if write.create_sensor {
            let inserted = self.sos.insert_sensor(write.series)?;
            outcome.assigned_offering = Some(inserted.offering_id.clone());
            inserted.offering_id
        } else {
            let Some(existing) = write.existing_offering else {
                return Err(SyncError::Internal(format!(
                    "no offering available for '{}'",
                    write.procedure_id
                )));
            };
            existing.to_string()
        };

        for chunk in write.points.chunks(self.max_batch_size) {
            let batch = ObservationBatch {
                start: chunk[0].timestamp,
                end: chunk[chunk.len() - 1].timestamp,
                points: chunk.to_vec(),
            };

            info!(
                "Posting {} data points to '{}' ...",
                batch.points.len(),
                write.procedure_id
            );
            self.sos
                .insert_observation(&offering, write.location, write.series, &batch)?;

            outcome.written_points += batch.points.len();
            outcome.batch_end_times.push(batch.end);
        }

        Ok(outcome)
    }

    /// Sensor deletion is idempotent: the target reporting "not found" is
    /// success.
    fn delete_sensor(&self, procedure_id: &str) -> Result<()> {
        match self.sos.delete_sensor(procedure_id) {
            Ok(()) => Ok(()),
            Err(SyncError::Api { status: 404, .. }) => Ok(()),
            Err(SyncError::Api { message, .. })
                if message.contains("InvalidParameterValue") && message.contains("procedure") =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}
