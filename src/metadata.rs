//! Userscript header parsing.
//!
//! Headers are `// @key value` comment lines, either inside a
//! `// ==UserScript==` ... `// ==/UserScript==` block or as the leading
//! comment lines of the file. Parsing never fails: a script without a header
//! yields an empty [`ScriptMetadata`].

use regex::Regex;
use std::sync::OnceLock;

const BLOCK_OPEN: &str = "==UserScript==";
const BLOCK_CLOSE: &str = "==/UserScript==";

/// Header fields recognised by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub requires: Vec<String>,
}

fn header_line_regex() -> &'static Regex {
    static HEADER_LINE: OnceLock<Regex> = OnceLock::new();
    HEADER_LINE.get_or_init(|| {
        Regex::new(r"^//\s*@([A-Za-z][\w:.\-]*)(?:\s+(.*?))?\s*$").expect("Valid header line regex")
    })
}

/// Extract the header of `code`.
pub fn parse_metadata(code: &str) -> ScriptMetadata {
    let mut metadata = ScriptMetadata::default();

    for line in header_lines(code) {
        let Some(caps) = header_line_regex().captures(line) else {
            continue;
        };
        let key = &caps[1];
        let Some(value) = caps
            .get(2)
            .map(|m| m.as_str().trim())
            .filter(|v| !v.is_empty())
        else {
            continue;
        };

        let slot = match key {
            "name" => &mut metadata.name,
            "version" => &mut metadata.version,
            "description" => &mut metadata.description,
            "author" => &mut metadata.author,
            "require" => {
                metadata.requires.push(value.to_string());
                continue;
            }
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    metadata
}

/// The comment lines that make up the header, trimmed.
fn header_lines(code: &str) -> Vec<&str> {
    let code = code.strip_prefix('\u{feff}').unwrap_or(code);
    let mut lines = Vec::new();
    let mut in_block = false;

    for raw in code.lines() {
        let line = raw.trim();

        if in_block {
            if is_marker(line, BLOCK_CLOSE) {
                break;
            }
            lines.push(line);
            continue;
        }

        if is_marker(line, BLOCK_OPEN) {
            in_block = true;
            continue;
        }

        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            break;
        }

        if line.starts_with("//") {
            lines.push(line);
            continue;
        }

        break;
    }

    lines
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.strip_prefix("//")
        .map(|rest| rest.trim() == marker)
        .unwrap_or(false)
}
