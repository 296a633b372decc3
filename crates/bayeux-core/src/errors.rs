//! Core error types and protocol error strings.

use thiserror::Error;

/// Reasons a channel name is rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelNameError {
    /// Channel names must start with `/`.
    #[error("channel name must be absolute: {0:?}")]
    NotAbsolute(String),
    /// Channel names must not contain empty segments.
    #[error("channel name has an empty segment: {0:?}")]
    EmptySegment(String),
    /// A wildcard may only appear as the whole last segment.
    #[error("wildcard must be the whole last segment: {0:?}")]
    MisplacedWildcard(String),
}

/// Protocol-level error carried in the `error` field of a reply.
///
/// Rendered as `code:args:message`, e.g. `402::Unknown client`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The request body could not be parsed.
    BadRequest,
    /// The `clientId` is not (or no longer) known.
    UnknownClient,
    /// Subscribe/unsubscribe without a subscription field.
    MissingSubscription,
    /// Publish without a usable channel.
    InvalidChannel,
    /// A subscription to a channel that cannot be subscribed.
    Forbidden,
    /// The server failed while processing an otherwise valid request.
    ServerError,
}

impl ProtocolError {
    /// Numeric code.
    pub fn code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::UnknownClient => 402,
            Self::MissingSubscription | Self::InvalidChannel | Self::Forbidden => 403,
            Self::ServerError => 500,
        }
    }

    /// Human readable text.
    pub fn message(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request",
            Self::UnknownClient => "Unknown client",
            Self::MissingSubscription => "Missing subscription",
            Self::InvalidChannel => "Invalid channel",
            Self::Forbidden => "Forbidden",
            Self::ServerError => "Server error",
        }
    }

    /// Wire form with optional args.
    pub fn render(self, args: &str) -> String {
        format!("{}:{}:{}", self.code(), args, self.message())
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(""))
    }
}
