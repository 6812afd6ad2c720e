//! Remote Fetcher
//!
//! Retrieves script text over HTTPS with a bounded timeout and parses its
//! header. Fetching never touches the store: callers decide whether a result
//! becomes a new record, an in-place refresh, or a recorded failure.
//!
//! # Policy
//!
//! 1. Only `https` URLs unless insecure HTTP is explicitly allowed
//! 2. Every request carries the configured `User-Agent`
//! 3. `content-type`, when present, must look like JavaScript or plain text
//! 4. Bodies larger than the configured limit are rejected while streaming
//! 5. Bodies must be UTF-8 and not blank

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchConfig;
use crate::metadata::{ScriptMetadata, parse_metadata};
use crate::model::LibraryRecord;

/// Fetch failures. Displayed verbatim as `last_fetch_error`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL scheme not allowed: {0} (only https is accepted)")]
    InsecureScheme(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),

    #[error("Response too large: {0} bytes (max {1})")]
    TooLarge(u64, usize),

    #[error("Response is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("Response body is empty")]
    EmptyBody,

    #[error("Failed to fetch required library {url}: {source}")]
    Dependency {
        url: String,
        source: Box<FetchError>,
    },

    #[error("HTTP client initialization failed: {0}")]
    ClientInitialization(String),
}

/// A successfully fetched script and any libraries fetched along with it.
#[derive(Debug, Clone)]
pub struct FetchedScript {
    pub url: String,
    pub code: String,
    pub metadata: ScriptMetadata,
    pub fetched_at: DateTime<Utc>,
    /// Libraries that were not in the cache and had to be downloaded
    pub libraries: Vec<LibraryRecord>,
}

/// HTTP client for script and library downloads
pub struct ScriptFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ScriptFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::ClientInitialization(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Check that `url` is a fetchable script location.
    pub fn validate_url(&self, url: &str) -> Result<Url, FetchError> {
        let parsed = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "https" => {}
            "http" if self.config.allow_insecure_http => {}
            other => return Err(FetchError::InsecureScheme(other.to_string())),
        }

        if parsed.host_str().is_none() {
            return Err(FetchError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(parsed)
    }

    /// Fetch a userscript and every library it requires that is not listed
    /// in `cached_libraries`.
    pub async fn fetch_script(
        &self,
        url: &str,
        cached_libraries: &HashSet<String>,
    ) -> Result<FetchedScript, FetchError> {
        let code = self.fetch_text(url).await?;
        let metadata = parse_metadata(&code);

        let mut libraries: Vec<LibraryRecord> = Vec::new();
        for library_url in metadata
            .requires
            .iter()
            .filter(|entry| crate::model::is_library_url(entry))
        {
            if cached_libraries.contains(library_url)
                || libraries.iter().any(|l| l.url == *library_url)
            {
                continue;
            }
            let library = self
                .fetch_library(library_url)
                .await
                .map_err(|source| FetchError::Dependency {
                    url: library_url.clone(),
                    source: Box::new(source),
                })?;
            libraries.push(library);
        }

        info!(
            url = %url,
            name = metadata.name.as_deref().unwrap_or("-"),
            version = metadata.version.as_deref().unwrap_or("-"),
            "Fetched script"
        );

        Ok(FetchedScript {
            url: url.trim().to_string(),
            code,
            metadata,
            fetched_at: Utc::now(),
            libraries,
        })
    }

    pub async fn fetch_library(&self, url: &str) -> Result<LibraryRecord, FetchError> {
        let code = self.fetch_text(url).await?;
        debug!(url = %url, bytes = code.len(), "Fetched library");
        Ok(LibraryRecord {
            url: url.to_string(),
            code,
            last_updated: Utc::now(),
        })
    }

    /// GET `url` and return its body as text, enforcing the fetch policy.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let parsed = self.validate_url(url)?;

        debug!("Fetching URL: {}", parsed);
        let mut response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %parsed, status = status.as_u16(), "Fetch returned error status");
            return Err(FetchError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            && !is_script_content_type(content_type)
        {
            return Err(FetchError::UnexpectedContentType(content_type.to_string()));
        }

        let limit = self.config.max_script_bytes;
        if let Some(content_length) = response.content_length()
            && content_length > limit as u64
        {
            return Err(FetchError::TooLarge(content_length, limit));
        }

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            let received = body.len() + chunk.len();
            if received > limit {
                return Err(FetchError::TooLarge(received as u64, limit));
            }
            body.extend_from_slice(&chunk);
        }

        let text = String::from_utf8(body).map_err(|e| FetchError::Encoding(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }

        Ok(text)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.config.timeout_ms)
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

fn is_script_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("javascript") || lower.contains("ecmascript") || lower.contains("text/plain")
}
