//! The script manager: every operation the presentation layer can invoke.

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::diagnostics::{Diagnostic, DiagnosticEvent, Diagnostics};
use crate::error::{AppError, AppResult};
use crate::fetcher::{FetchedScript, ScriptFetcher};
use crate::host::PageHost;
use crate::injection::{InjectionPipeline, InjectionReport};
use crate::model::{ScriptId, ScriptOrigin, ScriptRecord};
use crate::storage::{JsonFileStore, RecordStore};
use crate::store::ScriptStore;
use crate::syntax;
use crate::updater::AutoUpdater;

/// Result of a refresh attempt. A failed fetch is an outcome, not an error.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub record: ScriptRecord,
    /// Whether the stored code changed
    pub changed: bool,
    pub error: Option<String>,
}

/// Result of a syntax pre-flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntaxCheck {
    pub id: ScriptId,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct ScriptManager {
    config: Config,
    target_url: Url,
    store: Arc<ScriptStore>,
    fetcher: ScriptFetcher,
    pipeline: InjectionPipeline,
    updater: AutoUpdater,
    diagnostics: Diagnostics,
}

impl ScriptManager {
    pub async fn new(
        config: Config,
        backend: Arc<dyn RecordStore>,
        host: Arc<dyn PageHost>,
    ) -> AppResult<Self> {
        config.validate()?;
        let target_url = config.target_url()?;
        let store = Arc::new(ScriptStore::open(backend).await?);
        let fetcher = ScriptFetcher::new(config.fetch.clone())?;
        let diagnostics = Diagnostics::new();
        let pipeline = InjectionPipeline::new(
            host,
            store.clone(),
            config.injection.clone(),
            diagnostics.clone(),
        );
        let updater = AutoUpdater::new(config.auto_update.clone());

        Ok(Self {
            config,
            target_url,
            store,
            fetcher,
            pipeline,
            updater,
            diagnostics,
        })
    }

    /// Manager persisting to JSON files under `config.data_dir`
    pub async fn with_data_dir(config: Config, host: Arc<dyn PageHost>) -> AppResult<Self> {
        let backend = Arc::new(JsonFileStore::in_dir(&config.data_dir));
        Self::new(config, backend, host).await
    }

    pub fn store(&self) -> &ScriptStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    pub fn get_scripts(&self) -> AppResult<Vec<ScriptRecord>> {
        self.store.list()
    }

    /// Fetch `url` and store it as a new enabled script at the end of the
    /// order. Nothing is created if the fetch fails.
    pub async fn add_script_from_url(&self, url: &str) -> AppResult<ScriptRecord> {
        let url = self.fetcher.validate_url(url)?.to_string();
        if let Some(existing) = self.store.find_by_url(&url)? {
            return Err(AppError::DuplicateUrl { url, existing });
        }

        let cached = self.store.library_urls()?;
        let fetched = self.fetcher.fetch_script(&url, &cached).await?;
        self.store.save_libraries(&fetched.libraries).await?;

        self.store
            .insert_remote(&url, |order| {
                ScriptRecord::remote(
                    &url,
                    fetched.code.clone(),
                    &fetched.metadata,
                    fetched.fetched_at,
                    order,
                )
            })
            .await
    }

    pub async fn add_local_script(
        &self,
        name: Option<String>,
        code: String,
    ) -> AppResult<ScriptRecord> {
        if code.trim().is_empty() {
            return Err(AppError::validation("code", "must not be empty"));
        }
        self.store.add_local(name, code).await
    }

    pub async fn toggle_script(&self, id: &ScriptId, enabled: bool) -> AppResult<()> {
        self.store.toggle(id, enabled).await.map(|_| ())
    }

    pub async fn delete_script(&self, id: &ScriptId) -> AppResult<()> {
        self.store.delete(id).await
    }

    pub async fn reorder_script(&self, id: &ScriptId, new_order: i64) -> AppResult<()> {
        self.store.reorder(id, new_order).await.map(|_| ())
    }

    pub async fn swap_scripts(&self, first: &ScriptId, second: &ScriptId) -> AppResult<()> {
        self.store.swap_order(first, second).await
    }

    /// Re-fetch a remote script. Fetch failures are recorded on the returned
    /// record rather than failing the call.
    pub async fn refresh_script(&self, id: &ScriptId) -> AppResult<ScriptRecord> {
        self.refresh_record(id).await.map(|outcome| outcome.record)
    }

    /// The record's lock is held from the read through the fetch to the
    /// commit, so refreshes of one script apply in the order they were issued.
    pub(crate) async fn refresh_record(&self, id: &ScriptId) -> AppResult<RefreshOutcome> {
        let guard = self.store.lock_record(id).await?;
        let current = self.store.get(guard.id())?;
        let Some(url) = current.url().map(str::to_string) else {
            return Err(AppError::NotRemote { id: id.clone() });
        };

        let cached = self.store.library_urls()?;
        let attempted_at = Utc::now();
        let fetched = match self.fetcher.fetch_script(&url, &cached).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let message = e.to_string();
                let record = self
                    .store
                    .update_locked(&guard, |record| {
                        if let Some(origin) = record.origin.as_mut() {
                            origin.last_fetch_error = Some(message.clone());
                            origin.last_checked = Some(attempted_at);
                        }
                    })
                    .await?;
                self.diagnostics.emit(Diagnostic::RefreshFailed {
                    id: id.clone(),
                    message: message.clone(),
                });
                return Ok(RefreshOutcome {
                    record,
                    changed: false,
                    error: Some(message),
                });
            }
        };

        self.store.save_libraries(&fetched.libraries).await?;
        let previous_version = current.origin.as_ref().and_then(|o| o.version.clone());
        let record = self
            .store
            .update_locked(&guard, |record| apply_fetch(record, &fetched))
            .await?;
        drop(guard);

        let new_version = record.origin.as_ref().and_then(|o| o.version.clone());
        if new_version != previous_version {
            info!(
                script_id = %id,
                "Script version changed: {} -> {}",
                previous_version.as_deref().unwrap_or("none"),
                new_version.as_deref().unwrap_or("none")
            );
        }

        Ok(RefreshOutcome {
            changed: record.code != current.code,
            record,
            error: None,
        })
    }

    /// Navigate the page again and inject the current script set.
    pub async fn reload_scripts(&self) -> AppResult<InjectionReport> {
        self.pipeline.reload(&self.target_url).await
    }

    /// Refresh every remote script; if any changed, reload once. Returns
    /// the number of scripts whose code changed.
    pub async fn auto_update_scripts(&self) -> AppResult<usize> {
        let summary = self.updater.update_all(self).await?;
        if summary.changed > 0
            && let Err(e) = self.reload_scripts().await
        {
            warn!("Reload after auto-update failed: {}", e);
        }
        Ok(summary.changed)
    }

    pub async fn open_target_page(&self) -> AppResult<()> {
        self.pipeline.open(&self.target_url).await.map(|_| ())
    }

    pub async fn close_target_page(&self) -> AppResult<()> {
        self.pipeline.close().await
    }

    pub fn get_data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub async fn check_script(&self, id: &ScriptId) -> AppResult<SyntaxCheck> {
        let record = self.store.get(id)?;
        let result = syntax::check_source(record.code).await;
        Ok(SyntaxCheck {
            id: id.clone(),
            valid: result.is_ok(),
            message: result.err(),
        })
    }

    /// Process start: one auto-update run, then the first injection.
    pub async fn startup(&self) -> AppResult<usize> {
        let changed = self.auto_update_scripts().await?;
        self.open_target_page().await?;
        Ok(changed)
    }
}

/// Replace code and origin metadata from a successful fetch. The record's
/// URL, id, enabled flag and order are kept.
fn apply_fetch(record: &mut ScriptRecord, fetched: &FetchedScript) {
    let url = record
        .url()
        .map(str::to_string)
        .unwrap_or_else(|| fetched.url.clone());

    record.code = fetched.code.clone();
    if let Some(name) = &fetched.metadata.name {
        record.name = name.clone();
    }
    record.origin = Some(ScriptOrigin::fetched(
        &url,
        &fetched.metadata,
        fetched.fetched_at,
    ));
}
