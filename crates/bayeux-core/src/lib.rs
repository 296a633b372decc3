//! # bayeux-core
//!
//! Shared protocol vocabulary for the Bayeux server:
//!
//! - [`channel`]: validated hierarchical channel names with wildcard matching
//! - [`message`]: the wire message type, replies and connection advice
//! - [`ids`]: session and connection identifiers
//! - [`errors`]: channel name errors and protocol error strings

#![deny(unsafe_code)]

pub mod channel;
pub mod errors;
pub mod ids;
pub mod message;

pub use channel::ChannelId;
pub use errors::{ChannelNameError, ProtocolError};
pub use ids::{ClientId, ConnectionId};
pub use message::{Advice, Message, Reconnect};
