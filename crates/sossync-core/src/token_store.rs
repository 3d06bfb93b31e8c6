use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::SyncToken;
use crate::source::TimeSeriesSource;

/// Settings group holding one `{hash, changes-since}` pair per named
/// configuration. Lives in the source's settings facility so the state
/// survives across hosts.
const SETTING_GROUP: &str = "SosSync";
const HASH_SUFFIX: &str = ".Hash";
const CHANGES_SINCE_SUFFIX: &str = ".ChangesSince";

/// The source prunes its change event log after this retention period; a
/// token older than it can no longer produce a complete change set.
const EVENT_LOG_GROUP: &str = "TimeSeriesEventLog";
const EVENT_LOG_RETENTION_KEY: &str = "CleanupEventsOlderThan";

pub struct TokenStore<'a, S: TimeSeriesSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: TimeSeriesSource + ?Sized> TokenStore<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Returns the stored token, or `None` when no prior record exists or
    /// the stored hash no longer matches the current configuration.
    pub fn load(&self, config_name: &str, current_hash: &str) -> Result<Option<SyncToken>> {
        let saved_hash = self
            .source
            .get_setting(SETTING_GROUP, &format!("{config_name}{HASH_SUFFIX}"))?;
        let saved_changes_since = self
            .source
            .get_setting(SETTING_GROUP, &format!("{config_name}{CHANGES_SINCE_SUFFIX}"))?;

        let (Some(saved_hash), Some(saved_changes_since)) = (saved_hash, saved_changes_since)
        else {
            return Ok(None);
        };

        if saved_hash != current_hash {
            warn!("Configuration change detected for '{config_name}'. Performing full resync.");
            return Ok(None);
        }

        let Ok(changes_since) = DateTime::parse_from_rfc3339(&saved_changes_since) else {
            warn!(
                "Stored changes-since value '{saved_changes_since}' for '{config_name}' is unreadable. Performing full resync."
            );
            return Ok(None);
        };

        info!("Restored previous export configuration from '{config_name}' settings.");

        Ok(Some(SyncToken {
            config_hash: saved_hash,
            changes_since: changes_since.with_timezone(&Utc),
        }))
    }

    pub fn save(
        &self,
        config_name: &str,
        config_hash: &str,
        next_changes_since: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<()> {
        let summary = format!(
            "configuration to '{config_name}' NextChangesSince={}",
            next_changes_since.to_rfc3339()
        );

        if dry_run {
            warn!("Dry-run: Would have saved {summary}");
            return Ok(());
        }

        self.source.save_setting(
            SETTING_GROUP,
            &format!("{config_name}{HASH_SUFFIX}"),
            config_hash,
        )?;
        self.source.save_setting(
            SETTING_GROUP,
            &format!("{config_name}{CHANGES_SINCE_SUFFIX}"),
            &next_changes_since.to_rfc3339(),
        )?;

        info!("Saved {summary}");
        Ok(())
    }

    /// How long the source retains change events. A stored token older
    /// than this is expired before the source even says so.
    pub fn max_change_event_age(&self) -> Result<Duration> {
        let hours = self
            .source
            .get_setting(EVENT_LOG_GROUP, EVENT_LOG_RETENTION_KEY)?
            .and_then(|value| value.parse::<i64>().ok());

        Ok(match hours {
            Some(hours) => Duration::hours(hours),
            None => Duration::days(1),
        })
    }
}
