use std::{
    cell::Cell,
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use strom_h2::StreamId;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, trace};

use crate::{Body, BodyChunk, Headers};

use super::{
    flow::InboundWindow,
    timeout::{Clock, MinDataRate},
    types::{H2Event, H2EventPayload, H2StreamError},
};

/// Per-stream state shared between the connection loop, the request body
/// and the application (through [StreamControls]).
pub(crate) struct StreamShared {
    pub(crate) max_request_body_size: Cell<Option<u64>>,
    pub(crate) min_request_body_data_rate: Cell<Option<MinDataRate>>,
    pub(crate) min_response_data_rate: Cell<Option<MinDataRate>>,

    pub(crate) body_read_started: Cell<bool>,
    /// The request body went over `max_request_body_size`
    pub(crate) body_rejected: Cell<bool>,

    /// Set while the consumer is parked waiting for body data
    pub(crate) reading_since: Cell<Option<Instant>>,
    pub(crate) read_time_accrued: Cell<Duration>,
    pub(crate) bytes_read: Cell<u64>,

    /// The handler returned: once the response is out, nobody cares about
    /// the rest of the request body.
    pub(crate) handler_done: Cell<bool>,
}

impl Default for StreamShared {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl StreamShared {
    pub(crate) fn new(
        max_request_body_size: Option<u64>,
        min_request_body_data_rate: Option<MinDataRate>,
        min_response_data_rate: Option<MinDataRate>,
    ) -> Self {
        Self {
            max_request_body_size: Cell::new(max_request_body_size),
            min_request_body_data_rate: Cell::new(min_request_body_data_rate),
            min_response_data_rate: Cell::new(min_response_data_rate),
            body_read_started: Cell::new(false),
            body_rejected: Cell::new(false),
            reading_since: Cell::new(None),
            read_time_accrued: Cell::new(Duration::ZERO),
            bytes_read: Cell::new(0),
            handler_done: Cell::new(false),
        }
    }

    /// How long the consumer has spent waiting for body data so far
    pub(crate) fn read_time(&self, now: Instant) -> Duration {
        let waiting = self
            .reading_since
            .get()
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.read_time_accrued.get() + waiting
    }

    /// Whether the request body is arriving slower than the configured rate
    pub(crate) fn request_body_too_slow(&self, now: Instant) -> bool {
        let Some(rate) = self.min_request_body_data_rate.get() else {
            return false;
        };
        if !self.body_read_started.get() {
            return false;
        }
        rate.is_too_slow(self.bytes_read.get(), self.read_time(now))
    }
}

/// Per-request knobs, reachable from [crate::Request::controls].
#[derive(Clone, Default)]
pub struct StreamControls(pub(crate) Rc<StreamShared>);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlsError {
    #[error("the request body is already being read, its size limit can no longer change")]
    ReadOnly,
}

impl StreamControls {
    pub fn max_request_body_size(&self) -> Option<u64> {
        self.0.max_request_body_size.get()
    }

    /// `None` lifts the limit. Only allowed before the body is first read.
    pub fn set_max_request_body_size(&self, limit: Option<u64>) -> Result<(), ControlsError> {
        if self.0.body_read_started.get() {
            return Err(ControlsError::ReadOnly);
        }
        self.0.max_request_body_size.set(limit);
        Ok(())
    }

    pub fn min_request_body_data_rate(&self) -> Option<MinDataRate> {
        self.0.min_request_body_data_rate.get()
    }

    /// `None` disables the check for this request
    pub fn set_min_request_body_data_rate(&self, rate: Option<MinDataRate>) {
        self.0.min_request_body_data_rate.set(rate);
    }

    pub fn min_response_data_rate(&self) -> Option<MinDataRate> {
        self.0.min_response_data_rate.get()
    }

    /// `None` disables the check for this request
    pub fn set_min_response_data_rate(&self, rate: Option<MinDataRate>) {
        self.0.min_response_data_rate.set(rate);
    }
}

impl fmt::Debug for StreamControls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamControls")
            .field("max_request_body_size", &self.max_request_body_size())
            .field(
                "min_request_body_data_rate",
                &self.min_request_body_data_rate(),
            )
            .field("min_response_data_rate", &self.min_response_data_rate())
            .finish()
    }
}

/// Something we receive from an http/2 peer: pieces of the request
/// body, the final trailers, or perhaps an error! if the client doesn't
/// end up sending exactly the number of bytes they promised.
pub(crate) enum IncomingMessage {
    Chunk(Bytes),
    Trailers(Box<Headers>),
}

pub(crate) type IncomingMessageResult = Result<IncomingMessage, StreamIncomingError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub(crate) enum StreamIncomingError {
    #[error("stream reset")]
    StreamReset,

    #[error("{0}")]
    Io(std::io::Error),
}

pub(crate) struct StreamIncoming {
    tx: mpsc::UnboundedSender<IncomingMessageResult>,

    // total bytes received, which we keep track of, because if the client
    // announces a content-length and sends fewer or more bytes, we will
    // error out.
    pub(crate) total_received: u64,
    pub(crate) content_length: Option<u64>,

    // incoming capacity (that we decide, we get to tell
    // the peer how much we can handle with window updates)
    pub(crate) window: InboundWindow,

    pub(crate) shared: Rc<StreamShared>,
}

impl StreamIncoming {
    pub(crate) fn new(
        initial_window_size: u32,
        content_length: Option<u64>,
        tx: mpsc::UnboundedSender<IncomingMessageResult>,
        shared: Rc<StreamShared>,
    ) -> Self {
        Self {
            tx,
            total_received: 0,
            content_length,
            window: InboundWindow::new(initial_window_size),
            shared,
        }
    }

    /// Hand a DATA payload to the body consumer. Returns whether it was
    /// delivered: `false` means nobody is reading anymore and the bytes'
    /// flow-control credit should be given back right away.
    pub(crate) fn write_chunk(
        &mut self,
        chunk: Bytes,
        end_stream: bool,
    ) -> Result<bool, H2StreamError> {
        self.total_received += chunk.len() as u64;
        self.check_content_length(end_stream)?;

        if chunk.is_empty() {
            return Ok(true);
        }

        if self.tx.send(Ok(IncomingMessage::Chunk(chunk))).is_err() {
            trace!("request body receiver is gone, dropping chunk");
            return Ok(false);
        }
        Ok(true)
    }

    pub(crate) fn write_trailers(&mut self, trailers: Headers) -> Result<(), H2StreamError> {
        self.check_content_length(true)?;

        let _ = self
            .tx
            .send(Ok(IncomingMessage::Trailers(Box::new(trailers))));
        Ok(())
    }

    /// Check the bytes received so far against the declared content-length.
    /// Mismatches are reported to the consumer too.
    pub(crate) fn check_content_length(&mut self, end_stream: bool) -> Result<(), H2StreamError> {
        let Some(declared) = self.content_length else {
            return Ok(());
        };
        let received = self.total_received;

        let err = if received > declared {
            H2StreamError::MoreDataThanDeclared { received, declared }
        } else if end_stream && received < declared {
            H2StreamError::LessDataThanDeclared { received, declared }
        } else {
            return Ok(());
        };

        self.send_error(StreamIncomingError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )));
        Err(err)
    }

    pub(crate) fn send_error(&mut self, err: StreamIncomingError) {
        let _ = self.tx.send(Err(err));
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2BodyError {
    #[error("stream reset")]
    StreamReset,

    #[error("request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("request body error: {0}")]
    Io(std::io::Error),
}

/// The request body as seen by the application.
pub(crate) struct H2Body {
    pub(crate) stream_id: StreamId,
    pub(crate) content_length: Option<u64>,
    pub(crate) eof: bool,
    pub(crate) rx: mpsc::UnboundedReceiver<IncomingMessageResult>,
    pub(crate) shared: Rc<StreamShared>,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) ev_tx: mpsc::UnboundedSender<H2Event>,
    pub(crate) read_total: u64,
}

impl fmt::Debug for H2Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Body")
            .field("stream_id", &self.stream_id)
            .field("content_length", &self.content_length)
            .field("eof", &self.eof)
            .field("read_total", &self.read_total)
            .finish()
    }
}

/// Accrues waiting time on the shared state, even if the read future is
/// dropped while parked.
struct WaitingForData<'a> {
    shared: &'a StreamShared,
    clock: &'a dyn Clock,
}

impl<'a> WaitingForData<'a> {
    fn start(shared: &'a StreamShared, clock: &'a dyn Clock) -> Self {
        shared.reading_since.set(Some(clock.now()));
        Self { shared, clock }
    }
}

impl Drop for WaitingForData<'_> {
    fn drop(&mut self) {
        if let Some(since) = self.shared.reading_since.take() {
            let waited = self.clock.now().saturating_duration_since(since);
            self.shared
                .read_time_accrued
                .set(self.shared.read_time_accrued.get() + waited);
        }
    }
}

impl H2Body {
    fn consumed(&self, len: u64) {
        if len == 0 {
            return;
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        let _ = self.ev_tx.send(H2Event {
            stream_id: self.stream_id,
            payload: H2EventPayload::RequestBodyConsumed { len },
        });
    }

    fn reject(&mut self, limit: u64) -> H2BodyError {
        debug!(stream_id = %self.stream_id, %limit, "request body too large");
        self.shared.body_rejected.set(true);
        self.eof = true;
        self.rx.close();
        H2BodyError::PayloadTooLarge { limit }
    }
}

impl Body for H2Body {
    type Error = H2BodyError;

    fn content_len(&self) -> Option<u64> {
        self.content_length
    }

    fn eof(&self) -> bool {
        self.eof
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, H2BodyError> {
        if self.eof {
            return Ok(BodyChunk::Done { trailers: None });
        }

        if !self.shared.body_read_started.replace(true) {
            if let (Some(limit), Some(declared)) =
                (self.shared.max_request_body_size.get(), self.content_length)
            {
                if declared > limit {
                    return Err(self.reject(limit));
                }
            }
        }

        let msg = match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Disconnected) => None,
            Err(TryRecvError::Empty) => {
                let _waiting = WaitingForData::start(&self.shared, self.clock.as_ref());
                self.rx.recv().await
            }
        };

        match msg {
            Some(Ok(IncomingMessage::Chunk(chunk))) => {
                let len = chunk.len() as u64;
                self.read_total += len;
                self.shared.bytes_read.set(self.shared.bytes_read.get() + len);
                self.consumed(len);

                if let Some(limit) = self.shared.max_request_body_size.get() {
                    if self.read_total > limit {
                        return Err(self.reject(limit));
                    }
                }
                Ok(BodyChunk::Chunk(chunk))
            }
            Some(Ok(IncomingMessage::Trailers(trailers))) => {
                self.eof = true;
                Ok(BodyChunk::Done {
                    trailers: Some(trailers),
                })
            }
            Some(Err(StreamIncomingError::StreamReset)) => {
                self.eof = true;
                Err(H2BodyError::StreamReset)
            }
            Some(Err(StreamIncomingError::Io(e))) => {
                self.eof = true;
                Err(H2BodyError::Io(e))
            }
            None => {
                self.eof = true;
                Ok(BodyChunk::Done { trailers: None })
            }
        }
    }
}

impl Drop for H2Body {
    fn drop(&mut self) {
        // whatever is still buffered was counted against the peer's credit,
        // give it back
        self.rx.close();
        let mut unread = 0u64;
        while let Ok(msg) = self.rx.try_recv() {
            if let Ok(IncomingMessage::Chunk(chunk)) = msg {
                unread += chunk.len() as u64;
            }
        }
        if unread > 0 {
            trace!(stream_id = %self.stream_id, %unread, "refunding unread request body");
        }
        self.consumed(unread);
    }
}

/// A body made of a single chunk, handy for short canned responses.
#[derive(Debug)]
pub struct SinglePieceBody {
    content_len: u64,
    piece: Option<Bytes>,
}

impl SinglePieceBody {
    pub fn new(piece: impl Into<Bytes>) -> Self {
        let piece = piece.into();
        Self {
            content_len: piece.len() as u64,
            piece: Some(piece),
        }
    }
}

impl From<&'static str> for SinglePieceBody {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

impl Body for SinglePieceBody {
    type Error = std::convert::Infallible;

    fn content_len(&self) -> Option<u64> {
        Some(self.content_len)
    }

    fn eof(&self) -> bool {
        self.piece.is_none()
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, Self::Error> {
        match self.piece.take() {
            Some(piece) if !piece.is_empty() => Ok(BodyChunk::Chunk(piece)),
            _ => Ok(BodyChunk::Done { trailers: None }),
        }
    }
}
