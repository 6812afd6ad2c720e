//! Auto-Update Coordinator
//!
//! Re-fetches every URL-backed script once per run, a bounded number at a
//! time. Individual failures end up in `last_fetch_error` and are counted,
//! never returned.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AutoUpdateConfig;
use crate::error::AppResult;
use crate::manager::ScriptManager;
use crate::model::{ScriptId, ScriptOrigin};

/// Throttle windows longer than this are treated as this long
const MAX_THROTTLE_SECS: u64 = 100 * 365 * 86_400;

/// Result of one script's refresh attempt during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub id: ScriptId,
    pub changed: bool,
    pub error: Option<String>,
}

impl UpdateResult {
    pub fn changed(id: ScriptId, changed: bool) -> Self {
        Self {
            id,
            changed,
            error: None,
        }
    }

    pub fn failed(id: ScriptId, error: String) -> Self {
        Self {
            id,
            changed: false,
            error: Some(error),
        }
    }
}

/// Totals for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct AutoUpdater {
    config: AutoUpdateConfig,
}

impl AutoUpdater {
    pub fn new(config: AutoUpdateConfig) -> Self {
        Self { config }
    }

    /// Whether `origin` should be fetched at `now` under the throttling rules
    pub fn is_due(&self, origin: &ScriptOrigin, now: DateTime<Utc>) -> bool {
        let within = |at: Option<DateTime<Utc>>, secs: u64| {
            let window = Duration::seconds(secs.min(MAX_THROTTLE_SECS) as i64);
            secs > 0 && at.is_some_and(|at| now - at < window)
        };

        if origin.last_fetch_error.is_some() {
            return !within(origin.last_checked, self.config.error_backoff_secs);
        }
        !within(origin.last_updated, self.config.min_interval_secs)
    }

    /// Refresh every due remote script in `manager`
    pub async fn update_all(&self, manager: &ScriptManager) -> AppResult<UpdateSummary> {
        let mut summary = UpdateSummary::default();
        if !self.config.enabled {
            debug!("Auto-update disabled");
            return Ok(summary);
        }

        let start_time = Instant::now();
        let now = Utc::now();
        let mut due = Vec::new();
        for record in manager.store().list()? {
            let Some(origin) = record.origin.as_ref() else {
                continue;
            };
            if self.is_due(origin, now) {
                due.push(record.id);
            } else {
                debug!(script_id = %record.id, "Skipping recently checked script");
                summary.skipped += 1;
            }
        }

        if due.is_empty() {
            info!("No remote scripts to update");
            return Ok(summary);
        }
        info!("Checking {} remote scripts for updates", due.len());

        let results: Vec<UpdateResult> = stream::iter(due)
            .map(|id| async move {
                match manager.refresh_record(&id).await {
                    Ok(outcome) => match outcome.error {
                        Some(error) => UpdateResult::failed(id, error),
                        None => UpdateResult::changed(id, outcome.changed),
                    },
                    Err(e) => {
                        warn!(script_id = %id, "Update skipped: {}", e);
                        UpdateResult::failed(id, e.to_string())
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in &results {
            summary.checked += 1;
            if result.error.is_some() {
                summary.failed += 1;
            } else if result.changed {
                summary.changed += 1;
            }
        }

        info!(
            "Auto-update complete: {} changed, {} failed, {} skipped, {}ms total",
            summary.changed,
            summary.failed,
            summary.skipped,
            start_time.elapsed().as_millis()
        );
        Ok(summary)
    }
}
