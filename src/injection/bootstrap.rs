//! The isolated-world bootstrap program
//!
//! One self-contained function expression per pass. It refuses to run in a
//! nested frame or twice on the same document, then attaches one `<script>`
//! node per entry to the document element. Each node ends by setting a
//! completion marker; the bootstrap stops at the first node whose marker is
//! missing and reports how many entries completed.

use serde::{Deserialize, Serialize};

use super::InjectionError;

/// Attribute set on the document element once a pass has started
pub const INJECTED_ATTR: &str = "data-pagescripts-injected";
/// Attribute each script node sets to its entry index after its body ran
pub const DONE_ATTR: &str = "data-pagescripts-done";

/// Isolated-world expression that is `true` once the document element exists
pub const ANCHOR_CHECK: &str = "document.documentElement !== null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Library,
    Script,
}

/// One script node to attach
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapEntry {
    pub kind: EntryKind,
    /// Script id or library URL
    pub key: String,
    pub code: String,
}

/// What the bootstrap reported back
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// Not the top-level frame; nothing attached
    Subframe,
    /// The document element disappeared between the anchor check and bootstrap
    NoAnchor,
    /// A previous pass already ran on this document
    AlreadyInjected,
    Complete { completed: usize },
    Degraded { completed: usize },
}

/// Render the bootstrap for `entries`. `pass` tags the document so a second
/// evaluation on the same page is a no-op.
pub fn render(entries: &[BootstrapEntry], pass: &str) -> Result<String, InjectionError> {
    // JSON is a valid JavaScript expression, and string escaping covers any script body.
    let entries_json =
        serde_json::to_string(entries).map_err(|e| InjectionError::Render(e.to_string()))?;
    let pass_json = serde_json::to_string(pass).map_err(|e| InjectionError::Render(e.to_string()))?;

    Ok(format!(
        r#"(function () {{
  if (window.top !== window) {{ return JSON.stringify({{ status: 'subframe' }}); }}
  var root = document.documentElement;
  if (!root) {{ return JSON.stringify({{ status: 'no_anchor' }}); }}
  if (root.getAttribute('{injected}') !== null) {{ return JSON.stringify({{ status: 'already_injected' }}); }}
  root.setAttribute('{injected}', {pass});
  var entries = {entries};
  for (var i = 0; i < entries.length; i++) {{
    var node = document.createElement('script');
    node.textContent = entries[i].code +
      '\n;document.documentElement.setAttribute(\'{done}\', \'' + i + '\');';
    root.appendChild(node);
    node.remove();
    if (root.getAttribute('{done}') !== String(i)) {{
      return JSON.stringify({{ status: 'degraded', completed: i }});
    }}
  }}
  return JSON.stringify({{ status: 'complete', completed: entries.length }});
}})()"#,
        injected = INJECTED_ATTR,
        done = DONE_ATTR,
        pass = pass_json,
        entries = entries_json,
    ))
}

pub fn parse_outcome(raw: &str) -> Result<BootstrapOutcome, InjectionError> {
    serde_json::from_str(raw).map_err(|e| InjectionError::MalformedReport(format!("{e}: {raw}")))
}
