//! HTTP long-polling transport: `POST /cometd`.

use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::Sink;
use metrics::counter;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tracing::{debug, instrument, warn};

use crate::broker::Broker;
use crate::error::ExchangeError;
use crate::long_poll::SchedulerFactory;
use crate::metrics::EXCHANGES_TOTAL;
use crate::processor::Processor;
use crate::transport::bad_request_reply;
use crate::transport::exchange::{Exchange, ExchangeContext, TransportKind};
use crate::transport::reader::{ReadOutcome, read_body, request_encoding};
use crate::transport::writer::ResponseWriter;

const RESPONSE_CONTENT_TYPE: &str = "application/json;charset=UTF-8";
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Handles one long-poll request per call.
pub struct LongPollTransport {
    broker: Arc<Broker>,
    processor: Arc<Processor>,
    scheduler_factory: Arc<dyn SchedulerFactory>,
}

impl std::fmt::Debug for LongPollTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollTransport").finish_non_exhaustive()
    }
}

impl LongPollTransport {
    /// Transport suspending connects through `scheduler_factory`.
    pub fn new(
        broker: Arc<Broker>,
        processor: Arc<Processor>,
        scheduler_factory: Arc<dyn SchedulerFactory>,
    ) -> Self {
        Self {
            broker,
            processor,
            scheduler_factory,
        }
    }

    fn duplicate_status(&self) -> StatusCode {
        StatusCode::from_u16(self.broker.settings().duplicate_meta_connect_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Read, process, maybe suspend, then stream the response.
    #[instrument(skip_all, fields(exchange))]
    pub async fn handle(&self, headers: &HeaderMap, body: Body) -> Response {
        let ctx = ExchangeContext::new(self.broker.next_exchange_id(), TransportKind::LongPolling);
        let _ = tracing::Span::current().record("exchange", ctx.id());
        match self.exchange(ctx, headers, body).await {
            Ok(writer) => {
                counter!(EXCHANGES_TOTAL, "outcome" => "ok").increment(1);
                stream_response(writer)
            }
            Err(err) => {
                counter!(EXCHANGES_TOTAL, "outcome" => err.kind()).increment(1);
                if matches!(err, ExchangeError::Superseded) {
                    debug!(error = %err, "exchange ended");
                } else {
                    warn!(error = %err, "exchange failed");
                }
                err.into_response_with(self.duplicate_status())
            }
        }
    }

    async fn exchange(
        &self,
        ctx: ExchangeContext,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<ResponseWriter, ExchangeError> {
        let settings = self.broker.settings();
        let encoding = request_encoding(headers)?;
        let outcome = read_body(
            body.into_data_stream(),
            encoding,
            settings.message_size_limit(),
        )
        .await?;

        let mut exchange = Exchange::new(ctx);
        match outcome {
            ReadOutcome::Messages(batch) => {
                exchange = self.processor.process_isolated(exchange, batch).await?;
            }
            ReadOutcome::Malformed(detail) => {
                debug!(%detail, "malformed request body");
                exchange.push_reply(bad_request_reply(&detail));
            }
        }
        let _ = exchange.resume(self.scheduler_factory.as_ref()).await?;
        Ok(exchange.into_writer(settings))
    }
}

fn stream_response(writer: ResponseWriter) -> Response {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let abort = tx.clone();
    drop(tokio::spawn(async move {
        if let Err(err) = writer.write(BodySink::new(tx)).await {
            abort_body(&abort, err).await;
        }
    }));
    (
        [(CONTENT_TYPE, HeaderValue::from_static(RESPONSE_CONTENT_TYPE))],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// End the body with `err` so the client sees a broken transfer rather than
/// a short one. Waits for room behind chunks already queued.
async fn abort_body(tx: &mpsc::Sender<Result<Bytes, io::Error>>, err: io::Error) {
    debug!(error = %err, "response body aborted");
    if tx.send(Err(err)).await.is_err() {
        debug!("client gone before the abort was delivered");
    }
}

/// Response body chunks as a [`Sink`] over a bounded channel.
struct BodySink {
    inner: PollSender<Result<Bytes, io::Error>>,
}

impl BodySink {
    fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self {
            inner: PollSender::new(tx),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body closed")
}

impl Sink<Bytes> for BodySink {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.poll_reserve(cx).map_err(|_| closed())
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        self.get_mut().inner.send_item(Ok(item)).map_err(|_| closed())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.close();
        Poll::Ready(Ok(()))
    }
}
