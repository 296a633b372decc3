//! Incremental request body reader.
//!
//! UTF-8 bodies go through a streaming splitter that decodes each top-level
//! array element as soon as its bytes are complete. Bodies in any other
//! charset are buffered, transcoded and parsed at the end.

use std::pin::pin;

use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use bayeux_core::Message;
use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures::{Stream, StreamExt};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ExchangeError;
use crate::metrics::OVERSIZED_REQUESTS_TOTAL;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const INITIAL_CAPACITY: usize = 512;

/// Reading the body failed.
#[derive(Debug, Error)]
pub enum ReadError {
    /// More than the configured maximum was sent.
    #[error("max message size {limit} exceeded")]
    Oversized {
        /// The configured maximum in bytes.
        limit: usize,
    },
    /// The buffer cannot grow any further.
    #[error("request body too large to buffer")]
    TooLarge,
    /// The body stream failed.
    #[error("failed to read request body: {0}")]
    Body(#[source] BoxError),
}

/// A fully read body.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Parsed messages in request order.
    Messages(Vec<Message>),
    /// The body is not a message or array of messages.
    Malformed(String),
}

/// Encoding named by the `Content-Type` charset, UTF-8 when absent.
pub fn request_encoding(headers: &HeaderMap) -> Result<&'static Encoding, ExchangeError> {
    let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return Ok(UTF_8);
    };
    let charset = content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then_some(value.trim().trim_matches('"'))
    });
    match charset {
        None => Ok(UTF_8),
        Some(label) => Encoding::for_label(label.as_bytes())
            .ok_or_else(|| ExchangeError::UnsupportedCharset(label.to_string())),
    }
}

/// Read `stream` to the end, enforcing `limit` bytes in total.
pub async fn read_body<S, E>(
    stream: S,
    encoding: &'static Encoding,
    limit: Option<usize>,
) -> Result<ReadOutcome, ReadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    let mut stream = pin!(stream);
    let mut total = 0usize;
    let mut incoming = if encoding == UTF_8 {
        Incoming::Json(JsonArraySplitter::new())
    } else {
        Incoming::Text(CharsetBuffer::new())
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ReadError::Body(e.into()))?;
        total = total.saturating_add(chunk.len());
        if let Some(limit) = limit {
            if total > limit {
                counter!(OVERSIZED_REQUESTS_TOTAL).increment(1);
                debug!(limit, read = total, "request body over limit");
                return Err(ReadError::Oversized { limit });
            }
        }
        incoming.feed(&chunk)?;
    }
    trace!(bytes = total, charset = encoding.name(), "request body read");
    Ok(incoming.finish(encoding))
}

enum Incoming {
    Json(JsonArraySplitter),
    Text(CharsetBuffer),
}

impl Incoming {
    fn feed(&mut self, chunk: &[u8]) -> Result<(), ReadError> {
        match self {
            Self::Json(splitter) => {
                splitter.feed(chunk);
                Ok(())
            }
            Self::Text(buffer) => buffer.extend(chunk),
        }
    }

    fn finish(self, encoding: &'static Encoding) -> ReadOutcome {
        match self {
            Self::Json(splitter) => splitter.finish(),
            Self::Text(buffer) => buffer.finish(encoding),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SplitState {
    /// Before the first significant byte.
    Start,
    /// After `[`: an element or `]`.
    FirstElement,
    /// After `,`: an element.
    NextElement,
    /// After an element: `,` or `]`.
    CommaOrEnd,
    /// Inside an element.
    InElement,
    /// Past the closing bracket or the single object.
    Done,
    /// Unusable input, the rest is ignored.
    Failed,
}

/// Splits a JSON array of objects (or a single object) into elements.
#[derive(Debug)]
struct JsonArraySplitter {
    state: SplitState,
    single: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
    current: Vec<u8>,
    messages: Vec<Message>,
    error: Option<String>,
}

impl JsonArraySplitter {
    fn new() -> Self {
        Self {
            state: SplitState::Start,
            single: false,
            depth: 0,
            in_string: false,
            escaped: false,
            current: Vec::new(),
            messages: Vec::new(),
            error: None,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.state = SplitState::Failed;
        self.error = Some(reason.into());
        self.current.clear();
    }

    fn feed(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            match self.state {
                SplitState::Failed => return,
                SplitState::InElement => self.element_byte(byte),
                _ if byte.is_ascii_whitespace() => {}
                SplitState::Start => match byte {
                    b'[' => self.state = SplitState::FirstElement,
                    b'{' => {
                        self.single = true;
                        self.begin_element(byte);
                    }
                    _ => self.fail("expected a message object or array"),
                },
                SplitState::FirstElement | SplitState::NextElement => match byte {
                    b'{' => self.begin_element(byte),
                    b']' if self.state == SplitState::FirstElement => {
                        self.state = SplitState::Done;
                    }
                    _ => self.fail("expected a message object"),
                },
                SplitState::CommaOrEnd => match byte {
                    b',' => self.state = SplitState::NextElement,
                    b']' => self.state = SplitState::Done,
                    _ => self.fail("expected ',' or ']'"),
                },
                SplitState::Done => self.fail("trailing characters after message"),
            }
        }
    }

    fn begin_element(&mut self, byte: u8) {
        self.state = SplitState::InElement;
        self.depth = 1;
        self.in_string = false;
        self.escaped = false;
        self.current.push(byte);
    }

    fn element_byte(&mut self, byte: u8) {
        self.current.push(byte);
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return;
        }
        match byte {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth -= 1;
                if self.depth == 0 {
                    self.end_element();
                }
            }
            _ => {}
        }
    }

    fn end_element(&mut self) {
        match serde_json::from_slice::<Message>(&self.current) {
            Ok(message) => {
                self.messages.push(message);
                self.current.clear();
                self.state = if self.single {
                    SplitState::Done
                } else {
                    SplitState::CommaOrEnd
                };
            }
            Err(err) => self.fail(err.to_string()),
        }
    }

    fn finish(self) -> ReadOutcome {
        match self.state {
            SplitState::Done => ReadOutcome::Messages(self.messages),
            SplitState::Failed => {
                ReadOutcome::Malformed(self.error.unwrap_or_else(|| "malformed body".into()))
            }
            SplitState::Start => ReadOutcome::Malformed("empty body".into()),
            _ => ReadOutcome::Malformed("unexpected end of input".into()),
        }
    }
}

/// Accumulates a body for charset decoding.
#[derive(Debug)]
struct CharsetBuffer {
    buf: BytesMut,
}

impl CharsetBuffer {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    fn extend(&mut self, chunk: &[u8]) -> Result<(), ReadError> {
        let needed = self
            .buf
            .len()
            .checked_add(chunk.len())
            .ok_or(ReadError::TooLarge)?;
        if needed > self.buf.capacity() {
            let capacity = grown_capacity(self.buf.capacity().max(INITIAL_CAPACITY), needed)
                .ok_or(ReadError::TooLarge)?;
            self.buf.reserve(capacity - self.buf.len());
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self, encoding: &'static Encoding) -> ReadOutcome {
        let (text, _, had_errors) = encoding.decode(&self.buf);
        if had_errors {
            debug!(charset = encoding.name(), "replaced undecodable bytes");
        }
        match Message::parse_batch(&text) {
            Ok(messages) => ReadOutcome::Messages(messages),
            Err(err) => ReadOutcome::Malformed(err.to_string()),
        }
    }
}

/// Double `capacity` until it holds `needed`. `None` on overflow.
fn grown_capacity(mut capacity: usize, needed: usize) -> Option<usize> {
    while capacity < needed {
        capacity = capacity.checked_mul(2)?;
    }
    Some(capacity)
}
