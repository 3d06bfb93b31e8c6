use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::ChangeEvent;
use crate::source::{ChangeQuery, TimeSeriesSource};

/// Safety margin subtracted when deriving a bootstrap token from the
/// source's response time.
const BOOTSTRAP_MARGIN: Duration = Duration::minutes(1);

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub changes: Vec<ChangeEvent>,
    pub next_token: DateTime<Utc>,
    /// True when the effective poll ran without a token, i.e. the change
    /// set covers every matching series.
    pub full_resync: bool,
}

pub struct Poller<'a, S: TimeSeriesSource + ?Sized> {
    source: &'a S,
    never_resync: bool,
}

impl<'a, S: TimeSeriesSource + ?Sized> Poller<'a, S> {
    pub fn new(source: &'a S, never_resync: bool) -> Self {
        Self {
            source,
            never_resync,
        }
    }

    /// One change poll, with expired tokens converted into a tokenless
    /// re-poll unless auto-resync is disabled.
    pub fn poll(&self, query: &ChangeQuery) -> Result<PollOutcome> {
        let started = Instant::now();
        let mut set = self.source.poll_changes(query)?;
        let mut full_resync = query.changes_since.is_none();

        if set.token_expired {
            if self.never_resync {
                warn!("Skipping a recommended resync.");
            } else {
                warn!(
                    "The changes-since token of {:?} has expired. Forcing a full resync. You may need to run the exporter more frequently.",
                    query.changes_since
                );

                let mut tokenless = query.clone();
                tokenless.changes_since = None;
                set = self.source.poll_changes(&tokenless)?;
                full_resync = true;
            }
        }

        // When the source omits a next token, derive one from its response
        // time, backed off by the poll duration plus a safety margin.
        let elapsed = Duration::from_std(started.elapsed()).unwrap_or(Duration::zero());
        let bootstrap = set.response_time - elapsed - BOOTSTRAP_MARGIN;
        let next_token = set.next_token.unwrap_or(bootstrap);

        info!("Detected {} changed time-series.", set.changed.len());

        Ok(PollOutcome {
            changes: set.changed,
            next_token,
            full_resync,
        })
    }
}
