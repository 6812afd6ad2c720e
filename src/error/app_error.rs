use thiserror::Error;

use crate::fetcher::FetchError;
use crate::injection::InjectionError;
use crate::model::ScriptId;
use crate::storage::StorageError;

/// Unified error type for every operation on the script manager.
///
/// Per-script refresh failures are not represented here: they are recorded on
/// the record itself (`last_fetch_error`). Resolution warnings and degraded
/// injections travel on the diagnostics bus instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Script not found: {id}")]
    NotFound { id: ScriptId },

    #[error("Script {id} is local and has no URL to fetch from")]
    NotRemote { id: ScriptId },

    #[error("A script from this URL already exists: {url} ({existing})")]
    DuplicateUrl { url: String, existing: ScriptId },

    #[error("Failed to fetch script: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Injection failed: {0}")]
    Injection(#[from] InjectionError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration validation failed: {field} - {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("Input validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn not_found(id: &ScriptId) -> Self {
        Self::NotFound { id: id.clone() }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn config_validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire-level classification of this error
    pub fn code(&self) -> crate::error::ErrorCode {
        use crate::error::ErrorCode;

        match self {
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::NotRemote { .. } => ErrorCode::NotRemote,
            AppError::DuplicateUrl { .. } => ErrorCode::Conflict,
            AppError::Fetch(_) => ErrorCode::FetchFailed,
            AppError::Storage(_) => ErrorCode::StorageError,
            AppError::Injection(_) => ErrorCode::InjectionFailed,
            AppError::Config { .. } | AppError::ConfigValidation { .. } => {
                ErrorCode::ConfigurationError
            }
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Convert to the structured response returned for a failed command
    pub fn to_error_response(&self, command: &str) -> crate::error::ErrorResponse {
        use crate::error::ErrorResponseBuilder;

        let builder = ErrorResponseBuilder::new(self.code(), self.to_string()).command(command);

        let builder = match self {
            AppError::NotFound { id } | AppError::NotRemote { id } => {
                builder.context("id", id.as_str())
            }
            AppError::DuplicateUrl { url, existing } => builder
                .context("url", url.as_str())
                .context("existing_id", existing.as_str()),
            AppError::Fetch(err) => builder.details(err.to_string()),
            AppError::Injection(err) => builder.details(err.to_string()),
            _ => builder,
        };

        builder.build()
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config {
            message: err.to_string(),
        }
    }
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;
