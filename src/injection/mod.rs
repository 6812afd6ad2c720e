//! Injection Pipeline
//!
//! Drives a resolved sequence into the page's own JavaScript realm. Each pass
//! is a two-state handshake run from the isolated world:
//!
//! - `AwaitingAnchor`: poll for the document element with exponential
//!   backoff, bounded by the configured anchor timeout.
//! - `Injecting`: evaluate the bootstrap once. It attaches one script node
//!   per entry, in order, and reports how far it got.
//!
//! The pipeline is the only owner of the page host. Passes are serialized
//! and each one snapshots the store when it starts.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::InjectionConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::AppResult;
use crate::host::{ExecutionContext, HostError, PageHost};
use crate::model::{LibraryRecord, ScriptId, is_library_url};
use crate::resolver::{Resolution, ResolutionWarning, resolve};
use crate::store::ScriptStore;
use crate::syntax::find_syntax_errors;

pub mod bootstrap;

use bootstrap::{BootstrapEntry, BootstrapOutcome, EntryKind};

#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("Page host error: {0}")]
    Host(#[from] HostError),

    #[error("Page content anchor did not appear within {0} ms")]
    AnchorTimeout(u64),

    #[error("Page content anchor disappeared before injection")]
    AnchorLost,

    #[error("Failed to render bootstrap: {0}")]
    Render(String),

    #[error("Malformed bootstrap report: {0}")]
    MalformedReport(String),
}

/// Outcome of one injection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InjectionReport {
    /// Scripts whose bodies ran to completion, in order
    pub injected: Vec<ScriptId>,
    /// Libraries attached during the pass
    pub libraries: Vec<String>,
    /// The script that did not complete, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<ScriptId>,
    /// Scripts never attached because of `failed`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<ScriptId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResolutionWarning>,
}

impl InjectionReport {
    pub fn is_degraded(&self) -> bool {
        self.failed.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAnchor,
    Injecting,
}

/// Entries for one pass, each paired with the script it belongs to
struct Plan {
    entries: Vec<BootstrapEntry>,
    owners: Vec<ScriptId>,
}

impl Plan {
    /// Libraries go immediately before the first script requiring them.
    fn build(resolution: &Resolution, libraries: &HashMap<String, LibraryRecord>) -> Self {
        let mut plan = Plan {
            entries: Vec::new(),
            owners: Vec::new(),
        };
        let mut attached: HashSet<&str> = HashSet::new();

        for script in &resolution.sequence {
            for url in script.requires.iter().filter(|r| is_library_url(r)) {
                if !attached.insert(url.as_str()) {
                    continue;
                }
                match libraries.get(url) {
                    Some(library) => {
                        plan.entries.push(BootstrapEntry {
                            kind: EntryKind::Library,
                            key: library.url.clone(),
                            code: library.code.clone(),
                        });
                        plan.owners.push(script.id.clone());
                    }
                    None => {
                        debug!(
                            script_id = %script.id,
                            url = %url,
                            "Library not cached, skipping"
                        );
                    }
                }
            }

            plan.entries.push(BootstrapEntry {
                kind: EntryKind::Script,
                key: script.id.to_string(),
                code: script.code.clone(),
            });
            plan.owners.push(script.id.clone());
        }

        plan
    }

    /// Turn "`completed` entries ran" into a report
    fn report(
        &self,
        completed: usize,
        degraded: bool,
        warnings: Vec<ResolutionWarning>,
    ) -> InjectionReport {
        let completed = completed.min(self.entries.len());
        let mut report = InjectionReport {
            warnings,
            ..Default::default()
        };

        for (entry, owner) in self.entries[..completed].iter().zip(&self.owners) {
            match entry.kind {
                EntryKind::Library => report.libraries.push(entry.key.clone()),
                EntryKind::Script => report.injected.push(owner.clone()),
            }
        }

        if degraded && completed < self.entries.len() {
            let failed = self.owners[completed].clone();
            let owners = &self.owners[completed..];
            for (entry, owner) in self.entries[completed..].iter().zip(owners) {
                if entry.kind == EntryKind::Script && *owner != failed {
                    report.skipped.push(owner.clone());
                }
            }
            report.failed = Some(failed);
        }

        report
    }
}

struct PageState {
    open: bool,
    passes: u64,
}

pub struct InjectionPipeline {
    host: Arc<dyn PageHost>,
    store: Arc<ScriptStore>,
    config: InjectionConfig,
    diagnostics: Diagnostics,
    page: Mutex<PageState>,
}

impl InjectionPipeline {
    pub fn new(
        host: Arc<dyn PageHost>,
        store: Arc<ScriptStore>,
        config: InjectionConfig,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            host,
            store,
            config,
            diagnostics,
            page: Mutex::new(PageState {
                open: false,
                passes: 0,
            }),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.page.lock().await.open
    }

    /// Navigate to `url` and inject, unless the page is already open.
    /// Returns `None` when nothing was done.
    pub async fn open(&self, url: &Url) -> AppResult<Option<InjectionReport>> {
        let mut page = self.page.lock().await;
        if page.open {
            debug!("Target page already open");
            return Ok(None);
        }
        self.load(&mut page, url).await.map(Some)
    }

    /// Navigate to `url` (reloading it if open) and run a full pass.
    pub async fn reload(&self, url: &Url) -> AppResult<InjectionReport> {
        let mut page = self.page.lock().await;
        self.load(&mut page, url).await
    }

    pub async fn close(&self) -> AppResult<()> {
        let mut page = self.page.lock().await;
        if !page.open {
            return Ok(());
        }
        self.host.close().await.map_err(InjectionError::from)?;
        page.open = false;
        info!("Target page closed");
        Ok(())
    }

    async fn load(&self, page: &mut PageState, url: &Url) -> AppResult<InjectionReport> {
        let records = self.store.list()?;
        let libraries = self.store.libraries()?;

        let resolution = resolve(&records);
        for warning in &resolution.warnings {
            self.diagnostics
                .emit(Diagnostic::ResolutionWarning(warning.clone()));
        }

        let sources = resolution
            .sequence
            .iter()
            .map(|s| (s.id.clone(), s.code.clone()))
            .collect();
        for (id, message) in find_syntax_errors(sources).await {
            self.diagnostics
                .emit(Diagnostic::SyntaxSuspect { id, message });
        }

        let plan = Plan::build(&resolution, &libraries);

        page.open = false;
        self.host.navigate(url).await.map_err(InjectionError::from)?;
        page.open = true;
        page.passes += 1;

        let report = self
            .handshake(&plan, page.passes, resolution.warnings)
            .await?;

        if let Some(failed) = &report.failed {
            self.diagnostics.emit(Diagnostic::InjectionDegraded {
                failed: failed.clone(),
                skipped: report.skipped.clone(),
            });
        }
        info!(
            url = %url,
            injected = report.injected.len(),
            libraries = report.libraries.len(),
            degraded = report.is_degraded(),
            "Injection pass finished"
        );
        Ok(report)
    }

    async fn handshake(
        &self,
        plan: &Plan,
        pass: u64,
        warnings: Vec<ResolutionWarning>,
    ) -> Result<InjectionReport, InjectionError> {
        let mut phase = Phase::AwaitingAnchor;
        loop {
            debug!(?phase, pass, "Injection handshake");
            match phase {
                Phase::AwaitingAnchor => {
                    self.await_anchor().await?;
                    phase = Phase::Injecting;
                }
                Phase::Injecting => {
                    let program = bootstrap::render(&plan.entries, &format!("pass-{pass}"))?;
                    let raw = self
                        .host
                        .evaluate(ExecutionContext::Isolated, &program)
                        .await?;

                    return match bootstrap::parse_outcome(&raw)? {
                        BootstrapOutcome::Complete { completed } => {
                            Ok(plan.report(completed, false, warnings))
                        }
                        BootstrapOutcome::Degraded { completed } => {
                            Ok(plan.report(completed, true, warnings))
                        }
                        BootstrapOutcome::Subframe => {
                            debug!("Bootstrap ran in a nested frame, nothing injected");
                            Ok(InjectionReport {
                                warnings,
                                ..Default::default()
                            })
                        }
                        BootstrapOutcome::AlreadyInjected => {
                            debug!("Document already injected, nothing to do");
                            Ok(InjectionReport {
                                warnings,
                                ..Default::default()
                            })
                        }
                        BootstrapOutcome::NoAnchor => Err(InjectionError::AnchorLost),
                    };
                }
            }
        }
    }

    async fn await_anchor(&self) -> Result<(), InjectionError> {
        let timeout = self.config.anchor_timeout();
        let deadline = Instant::now() + timeout;
        let max_delay = Duration::from_millis(self.config.poll_max_ms);
        let mut delay = Duration::from_millis(self.config.poll_initial_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let ready = self
                .host
                .evaluate(ExecutionContext::Isolated, bootstrap::ANCHOR_CHECK)
                .await?;
            if ready == "true" {
                debug!(attempts, "Content anchor present");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, "Gave up waiting for content anchor");
                return Err(InjectionError::AnchorTimeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockPageHost;
    use crate::metadata::ScriptMetadata;
    use crate::model::ScriptRecord;
    use crate::resolver::ResolvedScript;
    use crate::storage::MemoryStore;

    fn resolved(id: &str, requires: &[&str]) -> ResolvedScript {
        ResolvedScript {
            id: ScriptId::from(id),
            name: id.to_string(),
            code: format!("/* {id} */"),
            requires: requires.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn library(url: &str) -> (String, LibraryRecord) {
        (
            url.to_string(),
            LibraryRecord {
                url: url.to_string(),
                code: "var lib;".into(),
                last_updated: chrono::Utc::now(),
            },
        )
    }

    #[test]
    fn test_plan_places_libraries_before_first_dependent_once() {
        let resolution = Resolution {
            sequence: vec![
                resolved("a", &[]),
                resolved("b", &["https://cdn/l.js", "https://cdn/missing.js"]),
                resolved("c", &["https://cdn/l.js"]),
            ],
            warnings: Vec::new(),
        };
        let libraries: HashMap<_, _> = [library("https://cdn/l.js")].into_iter().collect();

        let plan = Plan::build(&resolution, &libraries);
        let keys: Vec<&str> = plan.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "https://cdn/l.js", "b", "c"]);
    }

    #[test]
    fn test_report_maps_failure_to_owner() {
        let resolution = Resolution {
            sequence: vec![
                resolved("a", &[]),
                resolved("b", &["https://cdn/l.js"]),
                resolved("c", &[]),
            ],
            warnings: Vec::new(),
        };
        let libraries: HashMap<_, _> = [library("https://cdn/l.js")].into_iter().collect();
        let plan = Plan::build(&resolution, &libraries);

        // The library (entry 1) failed.
        let report = plan.report(1, true, Vec::new());
        assert_eq!(report.injected, vec![ScriptId::from("a")]);
        assert_eq!(report.failed, Some(ScriptId::from("b")));
        assert_eq!(report.skipped, vec![ScriptId::from("c")]);

        let report = plan.report(4, false, Vec::new());
        assert_eq!(report.injected.len(), 3);
        assert_eq!(report.libraries, vec!["https://cdn/l.js"]);
        assert!(!report.is_degraded());
    }

    async fn pipeline(host: MockPageHost, anchor_timeout_ms: u64) -> InjectionPipeline {
        let record = ScriptRecord::local(
            Some("a".into()),
            "1;".into(),
            &ScriptMetadata::default(),
            0,
        );
        let store = ScriptStore::open(Arc::new(MemoryStore::with_scripts([record])))
            .await
            .unwrap();
        InjectionPipeline::new(
            Arc::new(host),
            Arc::new(store),
            InjectionConfig {
                anchor_timeout_ms,
                poll_initial_ms: 1,
                poll_max_ms: 4,
            },
            Diagnostics::new(),
        )
    }

    #[tokio::test]
    async fn test_anchor_timeout_is_an_error() {
        let mut host = MockPageHost::new();
        host.expect_navigate().times(1).returning(|_| Ok(()));
        host.expect_evaluate()
            .withf(|context, script| {
                *context == ExecutionContext::Isolated && script == bootstrap::ANCHOR_CHECK
            })
            .returning(|_, _| Ok("false".to_string()));

        let pipeline = pipeline(host, 20).await;
        let url = Url::parse("https://page.test/").unwrap();
        let err = pipeline.reload(&url).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::Injection(InjectionError::AnchorTimeout(20))
        ));
    }

    #[tokio::test]
    async fn test_open_is_noop_when_already_open() {
        let mut host = MockPageHost::new();
        host.expect_navigate().times(1).returning(|_| Ok(()));
        host.expect_evaluate().returning(|_, script| {
            if script == bootstrap::ANCHOR_CHECK {
                Ok("true".to_string())
            } else {
                Ok(r#"{"status":"complete","completed":1}"#.to_string())
            }
        });
        host.expect_close().times(1).returning(|| Ok(()));

        let pipeline = pipeline(host, 100).await;
        let url = Url::parse("https://page.test/").unwrap();
        let first = pipeline.open(&url).await.unwrap().unwrap();
        assert_eq!(first.injected.len(), 1);
        assert!(pipeline.open(&url).await.unwrap().is_none());

        pipeline.close().await.unwrap();
        assert!(!pipeline.is_open().await);
    }

    #[tokio::test]
    async fn test_navigation_failure_leaves_page_closed() {
        let mut host = MockPageHost::new();
        host.expect_navigate().returning(|url| {
            Err(HostError::Navigation {
                url: url.to_string(),
                message: "offline".into(),
            })
        });

        let pipeline = pipeline(host, 100).await;
        let url = Url::parse("https://page.test/").unwrap();
        assert!(pipeline.reload(&url).await.is_err());
        assert!(!pipeline.is_open().await);
    }
}
