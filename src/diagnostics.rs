//! Side-channel diagnostics
//!
//! Non-fatal conditions raised while resolving, injecting or refreshing are
//! published here instead of failing the command that triggered them.
//! Every diagnostic is also logged, so nothing is lost when no one listens.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::model::ScriptId;
use crate::resolver::ResolutionWarning;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A dependency cycle was scheduled by order
    ResolutionWarning(ResolutionWarning),
    /// A script did not complete; it and everything after it were not run
    InjectionDegraded {
        failed: ScriptId,
        skipped: Vec<ScriptId>,
    },
    /// A body failed the syntax pre-flight but was injected anyway
    SyntaxSuspect { id: ScriptId, message: String },
    /// A refresh failed and was recorded on the script
    RefreshFailed { id: ScriptId, message: String },
}

/// A diagnostic and when it was raised
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

/// Broadcast bus for [`Diagnostic`]s
#[derive(Debug, Clone)]
pub struct Diagnostics {
    sender: broadcast::Sender<DiagnosticEvent>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::ResolutionWarning(warning) => warn!("{}", warning),
            Diagnostic::InjectionDegraded { failed, skipped } => warn!(
                script_id = %failed,
                skipped = skipped.len(),
                "Injection degraded: script did not complete"
            ),
            Diagnostic::SyntaxSuspect { id, message } => {
                warn!(script_id = %id, "Script may not parse: {}", message)
            }
            Diagnostic::RefreshFailed { id, message } => {
                warn!(script_id = %id, "Refresh failed: {}", message)
            }
        }

        let event = DiagnosticEvent {
            at: Utc::now(),
            diagnostic,
        };
        if self.sender.send(event).is_err() {
            debug!("No diagnostic subscribers");
        }
    }
}
