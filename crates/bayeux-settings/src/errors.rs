//! Settings errors.

use thiserror::Error;

/// Failure to produce a usable [`crate::BayeuxSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON or does not fit the schema.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value the server cannot run with.
    #[error("{key}: {reason}")]
    InvalidValue {
        /// Dotted camelCase path of the offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
