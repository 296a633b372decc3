//! Hierarchical channel names.
//!
//! A channel name is an absolute, `/`-separated path such as `/chat/room1`.
//! The last segment may be a wildcard:
//! - `*` matches exactly one further segment (`/chat/*` matches `/chat/room1`)
//! - `**` matches one or more further segments (`/chat/**` matches `/chat/a/b`)
//!
//! Names under `/meta/` are reserved for the protocol itself and names under
//! `/service/` are point-to-point (never broadcast).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ChannelNameError;

/// `/meta/handshake`
pub const META_HANDSHAKE: &str = "/meta/handshake";
/// `/meta/connect`
pub const META_CONNECT: &str = "/meta/connect";
/// `/meta/subscribe`
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
/// `/meta/unsubscribe`
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
/// `/meta/disconnect`
pub const META_DISCONNECT: &str = "/meta/disconnect";
/// Pseudo-channel for replies to requests that could not be parsed.
pub const META_UNSUCCESSFUL: &str = "/meta/unsuccessful";

const META_PREFIX: &str = "/meta/";
const SERVICE_PREFIX: &str = "/service/";
const WILD: &str = "*";
const DEEP_WILD: &str = "**";

/// A validated channel name.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelId {
    name: String,
}

impl ChannelId {
    /// Parse and validate a channel name.
    pub fn new(name: impl Into<String>) -> Result<Self, ChannelNameError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self { name })
    }

    /// The full name, e.g. `/chat/room1`.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Path segments, without the leading empty segment.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.name[1..].split('/')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Whether this is a `/meta/*` channel.
    pub fn is_meta(&self) -> bool {
        self.name.starts_with(META_PREFIX)
    }

    /// Whether this is a `/service/*` channel.
    pub fn is_service(&self) -> bool {
        self.name.starts_with(SERVICE_PREFIX)
    }

    /// Whether messages on this channel fan out to subscribers.
    pub fn is_broadcast(&self) -> bool {
        !self.is_meta() && !self.is_service()
    }

    /// Whether the last segment is `*`.
    pub fn is_wild(&self) -> bool {
        self.last_segment() == WILD
    }

    /// Whether the last segment is `**`.
    pub fn is_deep_wild(&self) -> bool {
        self.last_segment() == DEEP_WILD
    }

    /// Whether the last segment is any wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.is_wild() || self.is_deep_wild()
    }

    /// The direct parent, `None` for top-level channels.
    ///
    /// This is the plain structural parent: `/foo/bar` → `/foo`.
    pub fn parent(&self) -> Option<ChannelId> {
        let idx = self.name.rfind('/')?;
        (idx > 0).then(|| Self {
            name: self.name[..idx].to_owned(),
        })
    }

    /// Wildcard channels that match this channel, nearest first.
    ///
    /// For `/a/b/c` this yields `/a/b/*`, `/a/b/**`, `/a/**`, `/**`.
    /// Wildcard channels themselves have no wildcard ancestors.
    pub fn wild_ancestors(&self) -> Vec<ChannelId> {
        if self.is_wildcard() {
            return Vec::new();
        }
        let segments: Vec<&str> = self.segments().collect();
        let mut result = Vec::with_capacity(segments.len() + 1);
        for keep in (0..segments.len()).rev() {
            let prefix: String = segments[..keep].iter().map(|s| format!("/{s}")).collect();
            if keep + 1 == segments.len() {
                result.push(Self {
                    name: format!("{prefix}/{WILD}"),
                });
            }
            result.push(Self {
                name: format!("{prefix}/{DEEP_WILD}"),
            });
        }
        result
    }

    /// Whether this (wildcard) channel matches `other`.
    ///
    /// A non-wildcard channel only matches itself.
    pub fn matches(&self, other: &ChannelId) -> bool {
        if !self.is_wildcard() {
            return self == other;
        }
        let pattern: Vec<&str> = self.segments().collect();
        let target: Vec<&str> = other.segments().collect();
        let fixed = &pattern[..pattern.len() - 1];
        if target.len() <= fixed.len() || target[..fixed.len()] != *fixed {
            return false;
        }
        if self.is_wild() {
            target.len() == pattern.len()
        } else {
            true
        }
    }

    fn last_segment(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }
}

fn validate(name: &str) -> Result<(), ChannelNameError> {
    if !name.starts_with('/') {
        return Err(ChannelNameError::NotAbsolute(name.to_owned()));
    }
    let segments: Vec<&str> = name[1..].split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(ChannelNameError::EmptySegment(name.to_owned()));
        }
        let wildcard = *segment == WILD || *segment == DEEP_WILD;
        if (wildcard && i != last) || (!wildcard && segment.contains('*')) {
            return Err(ChannelNameError::MisplacedWildcard(name.to_owned()));
        }
    }
    Ok(())
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for ChannelId {
    type Err = ChannelNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::new(name).map_err(serde::de::Error::custom)
    }
}
