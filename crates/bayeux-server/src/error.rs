//! Server error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bayeux_core::{ChannelId, ChannelNameError};
use thiserror::Error;
use tokio::task::JoinError;

use crate::transport::reader::ReadError;

/// Failure of one request/response exchange.
///
/// Parse failures are not here: they become protocol replies and the
/// exchange still succeeds.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Reading the request body failed or exceeded a limit.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// The `Content-Type` charset has no decoder.
    #[error("unsupported charset {0:?}")]
    UnsupportedCharset(String),
    /// A suspended `/meta/connect` was cancelled, usually by a newer one.
    #[error("meta/connect superseded")]
    Superseded,
    /// Message processing panicked or was aborted.
    #[error("message processing failed: {0}")]
    Processing(String),
}

impl ExchangeError {
    /// HTTP status for this failure. `duplicate` is the configured
    /// duplicate meta/connect status.
    pub fn status(&self, duplicate: StatusCode) -> StatusCode {
        match self {
            Self::Superseded => duplicate,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(ReadError::Oversized { .. }) => "oversized",
            Self::Read(_) => "read",
            Self::UnsupportedCharset(_) => "charset",
            Self::Superseded => "superseded",
            Self::Processing(_) => "processing",
        }
    }

    /// Response carrying the failure detail as a plain-text body.
    pub fn into_response_with(self, duplicate: StatusCode) -> Response {
        (self.status(duplicate), self.to_string()).into_response()
    }
}

impl From<JoinError> for ExchangeError {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            return Self::Processing("task cancelled".into());
        }
        let panic = err.into_panic();
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        Self::Processing(detail)
    }
}

/// Why a publish was refused.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The channel name does not parse.
    #[error(transparent)]
    InvalidChannel(#[from] ChannelNameError),
    /// Meta and wildcard channels cannot carry application messages.
    #[error("cannot publish to {0}")]
    NotPublishable(ChannelId),
}
