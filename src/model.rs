//! Script records and the metadata attached to them.
//!
//! A [`ScriptRecord`] is the unit of persistence and injection. Records with an
//! [`ScriptOrigin`] are *remote* (fetched from a URL and kept up to date);
//! records without one are *local* and never fetched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::metadata::ScriptMetadata;

/// Name given to scripts whose header does not declare one.
pub const UNNAMED_SCRIPT: &str = "Unnamed Script";

/// Stable, opaque identifier of a script record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(String);

impl ScriptId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ScriptId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Remote-fetch metadata. Present only on URL-backed scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOrigin {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Dependency keys in header order. Entries naming another script are
    /// ordering constraints; absolute URLs are libraries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Time of the last successful fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Time of the last fetch attempt, successful or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Message from the most recent failed attempt, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch_error: Option<String>,
}

impl ScriptOrigin {
    /// Build an origin for a successful fetch of `url` at `fetched_at`.
    pub fn fetched(url: &str, metadata: &ScriptMetadata, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.to_string(),
            version: metadata.version.clone(),
            description: metadata.description.clone(),
            author: metadata.author.clone(),
            requires: metadata.requires.clone(),
            last_updated: Some(fetched_at),
            last_checked: Some(fetched_at),
            last_fetch_error: None,
        }
    }

    /// Library URLs among the declared dependencies.
    pub fn library_urls(&self) -> impl Iterator<Item = &str> {
        self.requires
            .iter()
            .map(String::as_str)
            .filter(|entry| is_library_url(entry))
    }
}

/// Whether a `requires` entry names a library URL rather than another script.
pub fn is_library_url(entry: &str) -> bool {
    entry.starts_with("https://") || entry.starts_with("http://")
}

/// A managed script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: ScriptId,
    pub name: String,
    pub code: String,
    pub enabled: bool,
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ScriptOrigin>,
}

impl ScriptRecord {
    /// A new local record. The caller assigns `order`.
    pub fn local(
        name: Option<String>,
        code: String,
        metadata: &ScriptMetadata,
        order: i64,
    ) -> Self {
        Self {
            id: ScriptId::generate(),
            name: display_name(name, metadata),
            code,
            enabled: true,
            order,
            origin: None,
        }
    }

    /// A new remote record built from fetched code.
    pub fn remote(
        url: &str,
        code: String,
        metadata: &ScriptMetadata,
        fetched_at: DateTime<Utc>,
        order: i64,
    ) -> Self {
        Self {
            id: ScriptId::generate(),
            name: display_name(None, metadata),
            code,
            enabled: true,
            order,
            origin: Some(ScriptOrigin::fetched(url, metadata, fetched_at)),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.origin.as_ref().map(|origin| origin.url.as_str())
    }

    pub fn requires(&self) -> &[String] {
        self.origin
            .as_ref()
            .map(|origin| origin.requires.as_slice())
            .unwrap_or_default()
    }

    /// Total order used for display and as the resolver's tie-breaker.
    pub fn position_cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

fn display_name(explicit: Option<String>, metadata: &ScriptMetadata) -> String {
    explicit
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| metadata.name.clone())
        .unwrap_or_else(|| UNNAMED_SCRIPT.to_string())
}

/// A plain JavaScript library referenced by a `@require` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub url: String,
    pub code: String,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_record_has_no_origin() {
        let record = ScriptRecord::local(None, "1;".into(), &ScriptMetadata::default(), 3);
        assert!(!record.is_remote());
        assert_eq!(record.name, UNNAMED_SCRIPT);
        assert_eq!(record.order, 3);
        assert!(record.enabled);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("origin").is_none());
    }

    #[test]
    fn test_explicit_name_wins_over_metadata() {
        let metadata = ScriptMetadata {
            name: Some("From Header".into()),
            ..Default::default()
        };
        let record = ScriptRecord::local(Some("  Mine ".into()), String::new(), &metadata, 0);
        assert_eq!(record.name, "Mine");

        let record = ScriptRecord::local(Some("   ".into()), String::new(), &metadata, 0);
        assert_eq!(record.name, "From Header");
    }

    #[test]
    fn test_optional_origin_fields_stay_absent() {
        let metadata = ScriptMetadata::default();
        let record = ScriptRecord::remote(
            "https://x/y.user.js",
            "1;".into(),
            &metadata,
            Utc::now(),
            0,
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("version"));
        assert!(!json.contains("last_fetch_error"));

        let back: ScriptRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.origin.unwrap().version, None);
    }

    #[test]
    fn test_position_breaks_ties_by_id() {
        let mut a = ScriptRecord::local(None, String::new(), &ScriptMetadata::default(), 1);
        let mut b = a.clone();
        a.id = ScriptId::from("a");
        b.id = ScriptId::from("b");
        assert_eq!(a.position_cmp(&b), Ordering::Less);
        b.order = 0;
        assert_eq!(a.position_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn test_library_urls_filter_script_names() {
        let origin = ScriptOrigin {
            url: "https://x/a.user.js".into(),
            version: None,
            description: None,
            author: None,
            requires: vec!["Helper".into(), "https://cdn/lib.js".into()],
            last_updated: None,
            last_checked: None,
            last_fetch_error: None,
        };
        let libs: Vec<_> = origin.library_urls().collect();
        assert_eq!(libs, vec!["https://cdn/lib.js"]);
    }
}
