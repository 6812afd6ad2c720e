//! Page host capability
//!
//! The embedded browser surface is an external collaborator. The core only
//! needs it to navigate to a URL and to evaluate script text in one of two
//! execution contexts.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

mod headless;

pub use headless::HeadlessPage;

/// Where a script is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// A sandboxed world that shares the page's document but not its globals
    Isolated,
    /// The page's own JavaScript realm
    Page,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Page host is no longer running")]
    Unavailable,

    #[error("No page is open")]
    NotNavigated,

    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Script evaluation failed: {0}")]
    Evaluation(String),
}

/// A browser surface the injection pipeline can drive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Load `url`, replacing whatever page is open
    async fn navigate(&self, url: &Url) -> Result<(), HostError>;

    /// Evaluate `script` and return its completion value as a string
    async fn evaluate(&self, context: ExecutionContext, script: &str) -> Result<String, HostError>;

    /// Close the page. Later navigations open a new one.
    async fn close(&self) -> Result<(), HostError>;
}
