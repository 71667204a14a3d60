//! Why a settings document could not be turned into [`HubSettings`].
//!
//! [`HubSettings`]: crate::HubSettings

use std::path::PathBuf;

use thiserror::Error;

/// Settings load or validation failure.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON, or a field has the wrong type.
    #[error("{} is not a valid settings document: {source}", path.display())]
    Json {
        /// File the document came from.
        path: PathBuf,
        /// Parse or shape error, with line and column when known.
        #[source]
        source: serde_json::Error,
    },
    /// The document parsed but a value breaks a constraint.
    #[error("{field} {reason}")]
    InvalidValue {
        /// camelCase path of the offending field, e.g. `server.maxConnections`.
        field: &'static str,
        /// What the value must satisfy.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
