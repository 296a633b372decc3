//! Incremental JSON array response writer.
//!
//! The response is one JSON array: an optional handshake reply, then the
//! queued messages, then the remaining replies. [`ResponseWriter`] emits it
//! element by element into a [`Sink`], pausing whenever the sink is not
//! ready and resuming from the same element on the next poll.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bayeux_core::Message;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Sink;
use pin_project_lite::pin_project;
use tracing::trace;

use crate::session::ExpirationArm;

/// Writer progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    /// Opening bracket.
    Begin,
    /// Leading handshake reply.
    Handshake,
    /// Queued messages.
    Messages,
    /// Protocol replies.
    Replies,
    /// Closing bracket.
    End,
    /// Flush and finish.
    Complete,
    /// Finished, successfully or not.
    Done,
}

/// What a finished response contained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Queued messages written.
    pub messages: usize,
    /// Replies written, the handshake reply included.
    pub replies: usize,
    /// Total body bytes.
    pub bytes: usize,
}

type CompletionHook = Box<dyn FnOnce(&WriteSummary) + Send>;

/// Resumable writer for one response.
pub struct ResponseWriter {
    state: WriteState,
    messages: Vec<Arc<Message>>,
    replies: Vec<Message>,
    message_index: usize,
    reply_index: usize,
    needs_comma: bool,
    handshake_delivery: bool,
    expiration: Option<ExpirationArm>,
    on_complete: Option<CompletionHook>,
    summary: WriteSummary,
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("state", &self.state)
            .field("messages", &self.messages.len())
            .field("replies", &self.replies.len())
            .field("message_index", &self.message_index)
            .field("reply_index", &self.reply_index)
            .finish_non_exhaustive()
    }
}

impl ResponseWriter {
    /// Writer for `messages` followed by `replies`.
    pub fn new(messages: Vec<Arc<Message>>, replies: Vec<Message>) -> Self {
        Self {
            state: WriteState::Begin,
            messages,
            replies,
            message_index: 0,
            reply_index: 0,
            needs_comma: false,
            handshake_delivery: false,
            expiration: None,
            on_complete: None,
            summary: WriteSummary::default(),
        }
    }

    /// Annotate a leading handshake reply with `x-messages`.
    #[must_use]
    pub fn with_handshake_delivery(mut self, enabled: bool) -> Self {
        self.handshake_delivery = enabled;
        self
    }

    /// Arm session expiration once the messages are out, or on failure.
    #[must_use]
    pub fn with_expiration(mut self, expiration: Option<ExpirationArm>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Run `hook` after a successful flush.
    #[must_use]
    pub fn on_complete(mut self, hook: impl FnOnce(&WriteSummary) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Current state.
    pub fn state(&self) -> WriteState {
        self.state
    }

    /// Drive the writer into `sink`.
    ///
    /// Returns `Pending` whenever the sink is not ready; the next call picks
    /// up at the element that was not written.
    pub fn poll_write<S>(
        &mut self,
        cx: &mut Context<'_>,
        sink: Pin<&mut S>,
    ) -> Poll<io::Result<WriteSummary>>
    where
        S: Sink<Bytes, Error = io::Error>,
    {
        if self.state == WriteState::Done {
            return Poll::Ready(Err(io::Error::other("response already written")));
        }
        match ready!(self.poll_states(cx, sink)) {
            Ok(summary) => {
                self.state = WriteState::Done;
                if let Some(hook) = self.on_complete.take() {
                    hook(&summary);
                }
                Poll::Ready(Ok(summary))
            }
            Err(err) => {
                trace!(state = ?self.state, error = %err, "response write failed");
                self.arm_expiration();
                self.state = WriteState::Done;
                Poll::Ready(Err(err))
            }
        }
    }

    /// Future writing the whole response into `sink`.
    pub fn write<S>(self, sink: S) -> WriteResponse<S>
    where
        S: Sink<Bytes, Error = io::Error>,
    {
        WriteResponse { writer: self, sink }
    }

    /// Write into memory.
    pub async fn render(self) -> io::Result<(Bytes, WriteSummary)> {
        let mut sink = BufferSink::default();
        let summary = self.write(&mut sink).await?;
        Ok((sink.into_bytes(), summary))
    }

    fn poll_states<S>(
        &mut self,
        cx: &mut Context<'_>,
        mut sink: Pin<&mut S>,
    ) -> Poll<io::Result<WriteSummary>>
    where
        S: Sink<Bytes, Error = io::Error>,
    {
        loop {
            match self.state {
                WriteState::Begin => {
                    ready!(sink.as_mut().poll_ready(cx))?;
                    self.send(sink.as_mut(), Bytes::from_static(b"["))?;
                    self.state = WriteState::Handshake;
                }
                WriteState::Handshake => {
                    if self.replies.first().is_some_and(Message::is_handshake) {
                        ready!(sink.as_mut().poll_ready(cx))?;
                        if self.handshake_delivery && !self.messages.is_empty() {
                            let count = self.messages.len();
                            self.replies[0].put("x-messages", count);
                        }
                        let json = serde_json::to_vec(&self.replies[0]).map_err(io::Error::other)?;
                        self.send_element(sink.as_mut(), &json)?;
                        self.reply_index = 1;
                        self.summary.replies += 1;
                    }
                    self.state = WriteState::Messages;
                }
                WriteState::Messages => {
                    while let Some(message) = self.messages.get(self.message_index) {
                        ready!(sink.as_mut().poll_ready(cx))?;
                        let json = message.to_json_bytes().map_err(io::Error::other)?;
                        self.send_element(sink.as_mut(), &json)?;
                        self.message_index += 1;
                        self.summary.messages += 1;
                    }
                    self.arm_expiration();
                    self.state = WriteState::Replies;
                }
                WriteState::Replies => {
                    while let Some(reply) = self.replies.get(self.reply_index) {
                        ready!(sink.as_mut().poll_ready(cx))?;
                        let json = reply.to_json_bytes().map_err(io::Error::other)?;
                        self.send_element(sink.as_mut(), &json)?;
                        self.reply_index += 1;
                        self.summary.replies += 1;
                    }
                    self.state = WriteState::End;
                }
                WriteState::End => {
                    ready!(sink.as_mut().poll_ready(cx))?;
                    self.send(sink.as_mut(), Bytes::from_static(b"]"))?;
                    self.state = WriteState::Complete;
                }
                WriteState::Complete => {
                    ready!(sink.as_mut().poll_flush(cx))?;
                    return Poll::Ready(Ok(self.summary));
                }
                WriteState::Done => {
                    return Poll::Ready(Err(io::Error::other("response already written")));
                }
            }
        }
    }

    fn send_element<S>(&mut self, sink: Pin<&mut S>, json: &[u8]) -> io::Result<()>
    where
        S: Sink<Bytes, Error = io::Error>,
    {
        let mut chunk = BytesMut::with_capacity(json.len() + 1);
        if self.needs_comma {
            chunk.put_u8(b',');
        }
        chunk.put_slice(json);
        self.needs_comma = true;
        self.send(sink, chunk.freeze())
    }

    fn send<S>(&mut self, sink: Pin<&mut S>, chunk: Bytes) -> io::Result<()>
    where
        S: Sink<Bytes, Error = io::Error>,
    {
        self.summary.bytes += chunk.len();
        sink.start_send(chunk)
    }

    fn arm_expiration(&mut self) {
        if let Some(expiration) = self.expiration.take() {
            expiration.arm();
        }
    }
}

pin_project! {
    /// Future returned by [`ResponseWriter::write`].
    #[must_use = "futures do nothing unless polled"]
    pub struct WriteResponse<S> {
        writer: ResponseWriter,
        #[pin]
        sink: S,
    }
}

impl<S> Future for WriteResponse<S>
where
    S: Sink<Bytes, Error = io::Error>,
{
    type Output = io::Result<WriteSummary>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.writer.poll_write(cx, this.sink)
    }
}

/// In-memory sink, always ready.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: BytesMut,
}

impl BufferSink {
    /// Everything written so far.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Sink<Bytes> for BufferSink {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        self.get_mut().buf.extend_from_slice(&item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
