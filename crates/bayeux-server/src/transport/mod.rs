//! Request/response plumbing shared by the HTTP and WebSocket transports.

pub mod exchange;
pub mod http;
pub mod reader;
pub mod writer;

use bayeux_core::channel::META_UNSUCCESSFUL;
use bayeux_core::{Message, ProtocolError};

pub use exchange::{Exchange, ExchangeContext, TransportKind};
pub use http::LongPollTransport;
pub use reader::{ReadError, ReadOutcome};
pub use writer::{ResponseWriter, WriteState, WriteSummary};

/// Reply sent when a request body is not a message batch.
pub fn bad_request_reply(detail: &str) -> Message {
    unsuccessful_reply(ProtocolError::BadRequest, detail)
}

/// Reply sent when processing a well-formed batch failed.
pub fn server_error_reply(detail: &str) -> Message {
    unsuccessful_reply(ProtocolError::ServerError, detail)
}

fn unsuccessful_reply(error: ProtocolError, detail: &str) -> Message {
    let mut reply = Message::new(META_UNSUCCESSFUL);
    reply.fail(error, "");
    reply.put("failure", detail);
    reply
}
