use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    rc::Rc,
    time::Instant,
};

use bytes::Bytes;
use http::StatusCode;
use loona_hpack::decoder::DecoderError;
use tokio::sync::oneshot;

use crate::{observe::RejectionReason, Headers, Response};

use super::{
    body::{StreamIncoming, StreamShared},
    flow::{InboundWindow, OutboundWindow, WindowUnderflow},
    headers::PendingHeaderBlock,
};
use strom_h2::{FrameError, FrameType, KnownErrorCode, Settings, SettingsError, StreamId};

/// How many closed stream ids we remember for the reset cooldown
const MAX_RECENTLY_CLOSED: usize = 1024;

pub(crate) struct ConnState {
    pub(crate) streams: HashMap<StreamId, StreamState>,

    /// Highest stream id the peer used so far
    pub(crate) last_stream_id: StreamId,

    /// Highest stream id we handed to the application, announced in GOAWAY
    pub(crate) last_processed_stream_id: StreamId,

    pub(crate) self_settings: Settings,
    pub(crate) peer_settings: Settings,

    /// Streams with response headers or body bytes queued. Ordered, so data
    /// goes out lowest stream id first.
    pub(crate) streams_with_pending_data: BTreeSet<StreamId>,

    /// Connection-level credit we extended to the peer
    pub(crate) inbound: InboundWindow,
    /// Connection-level credit the peer extended to us
    pub(crate) outbound: OutboundWindow,

    pub(crate) recently_closed: RecentlyClosed,

    /// A header block that hasn't seen END_HEADERS yet
    pub(crate) pending_headers: Option<PendingHeaderBlock>,
}

impl ConnState {
    pub(crate) fn new(self_settings: Settings, connection_window: u32) -> Self {
        let peer_settings = Settings::default();
        Self {
            streams: Default::default(),
            last_stream_id: StreamId(0),
            last_processed_stream_id: StreamId(0),
            outbound: OutboundWindow::new(peer_settings.initial_window_size),
            inbound: InboundWindow::new(connection_window),
            self_settings,
            peer_settings,
            streams_with_pending_data: Default::default(),
            recently_closed: Default::default(),
            pending_headers: None,
        }
    }

    /// create a new [StreamOutgoing] based on the peer's current settings
    pub(crate) fn mk_stream_outgoing(&self, shared: Rc<StreamShared>) -> StreamOutgoing {
        StreamOutgoing {
            wrote_headers: false,
            body: BodyOutgoing::StillReceiving(Default::default()),
            window: OutboundWindow::new(self.peer_settings.initial_window_size),
            shared,
        }
    }

    /// Where a stream is in its lifecycle, as far as this connection can
    /// tell.
    pub(crate) fn stream_phase(&self, stream_id: StreamId, now: Instant) -> StreamPhase {
        if let Some(ss) = self.streams.get(&stream_id) {
            return match ss {
                StreamState::Open { .. } => StreamPhase::Open,
                StreamState::HalfClosedLocal { .. } => StreamPhase::HalfClosedLocal,
                StreamState::HalfClosedRemote { .. } => StreamPhase::HalfClosedRemote,
                StreamState::Transition => unreachable!("transition state observed from outside"),
            };
        }

        match self.recently_closed.get(stream_id, now) {
            Some(true) => StreamPhase::Reset,
            Some(false) => StreamPhase::Closed,
            None if stream_id > self.last_stream_id => StreamPhase::Idle,
            None => StreamPhase::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    /// Both sides sent END_STREAM (or the id was skipped over)
    Closed,
    /// Ended with RST_STREAM, still inside its cooldown
    Reset,
}

#[derive(Debug, Clone, Copy)]
struct ClosedEntry {
    deadline: Instant,
    was_reset: bool,
}

/// Streams that closed recently. Frames the peer had in flight when the
/// stream went away are tolerated until the deadline.
#[derive(Default)]
pub(crate) struct RecentlyClosed {
    entries: HashMap<StreamId, ClosedEntry>,
    order: VecDeque<StreamId>,
}

impl RecentlyClosed {
    pub(crate) fn insert(&mut self, stream_id: StreamId, deadline: Instant, was_reset: bool) {
        if self
            .entries
            .insert(
                stream_id,
                ClosedEntry {
                    deadline,
                    was_reset,
                },
            )
            .is_none()
        {
            self.order.push_back(stream_id);
        }

        while self.order.len() > MAX_RECENTLY_CLOSED {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// `Some(was_reset)` if the stream closed less than a cooldown ago
    pub(crate) fn get(&self, stream_id: StreamId, now: Instant) -> Option<bool> {
        self.entries
            .get(&stream_id)
            .filter(|e| e.deadline > now)
            .map(|e| e.was_reset)
    }

    pub(crate) fn purge(&mut self, now: Instant) {
        // deadlines are monotonic in insertion order
        while let Some(id) = self.order.front() {
            match self.entries.get(id) {
                Some(e) if e.deadline > now => break,
                _ => {
                    self.entries.remove(id);
                    self.order.pop_front();
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// cf. RFC 9113, 5.1 Stream States:
//
//                          +--------+
//                  send PP |        | recv PP
//                 ,--------+  idle  +--------.
//                /         |        |         \
//               v          +--------+          v
//        +----------+          |           +----------+
//        |          |          | send H /  |          |
// ,------+ reserved |          | recv H    | reserved +------.
// |      | (local)  |          |           | (remote) |      |
// |      +---+------+          v           +------+---+      |
// |          |             +--------+             |          |
// |          |     recv ES |        | send ES     |          |
// |   send H |     ,-------+  open  +-------.     | recv H   |
// |          |    /        |        |        \    |          |
// |          v   v         +---+----+         v   v          |
// |      +----------+          |           +----------+      |
// |      |   half-  |          |           |   half-  |      |
// |      |  closed  |          | send R /  |  closed  |      |
// |      | (remote) |          | recv R    | (local)  |      |
// |      +----+-----+          |           +-----+----+      |
// |           |                |                 |           |
// |           | send ES /      |       recv ES / |           |
// |           |  send R /      v        send R / |           |
// |           |  recv R    +--------+   recv R   |           |
// | send R /  `----------->|        |<-----------'  send R / |
// | recv R                 | closed |               recv R   |
// `----------------------->|        |<-----------------------'
//                          +--------+
//
// We never push, so the reserved states don't exist here.
#[derive(Default)]
pub(crate) enum StreamState {
    // we have received full HEADERS
    Open {
        incoming: StreamIncoming,
        outgoing: StreamOutgoing,
    },

    // the peer has sent END_STREAM (but we might still send data to the peer)
    HalfClosedRemote { outgoing: StreamOutgoing },

    // we have sent END_STREAM (but we might still receive data from the peer)
    HalfClosedLocal { incoming: StreamIncoming },

    // A transition state used for state machine code
    #[default]
    Transition,
    //
    //
    // Note: "closed" and "reset" are indicated by not having an entry in the
    // map, see [RecentlyClosed]
}

impl StreamState {
    /// Get the inner `StreamOutgoing` if the state is `Open` or
    /// `HalfClosedRemote`.
    pub(crate) fn outgoing_mut(&mut self) -> Option<&mut StreamOutgoing> {
        match self {
            StreamState::Open { outgoing, .. } => Some(outgoing),
            StreamState::HalfClosedRemote { outgoing, .. } => Some(outgoing),
            _ => None,
        }
    }

    /// Get the inner `StreamIncoming` if the state is `Open` or
    /// `HalfClosedLocal`.
    pub(crate) fn incoming_mut(&mut self) -> Option<&mut StreamIncoming> {
        match self {
            StreamState::Open { incoming, .. } => Some(incoming),
            StreamState::HalfClosedLocal { incoming } => Some(incoming),
            _ => None,
        }
    }

    pub(crate) fn shared(&self) -> Option<&Rc<StreamShared>> {
        match self {
            StreamState::Open { outgoing, .. } => Some(&outgoing.shared),
            StreamState::HalfClosedRemote { outgoing } => Some(&outgoing.shared),
            StreamState::HalfClosedLocal { incoming } => Some(&incoming.shared),
            StreamState::Transition => None,
        }
    }
}

pub(crate) struct StreamOutgoing {
    pub(crate) wrote_headers: bool,
    pub(crate) body: BodyOutgoing,

    // window size of the stream, ie. how many bytes
    // we can send to the receiver before waiting.
    pub(crate) window: OutboundWindow,

    pub(crate) shared: Rc<StreamShared>,
}

/// A response body chunk waiting for flow-control credit. The producer is
/// parked on `ack` until the last byte of the chunk is written.
pub(crate) struct QueuedChunk {
    pub(crate) data: Bytes,
    pub(crate) ack: Option<oneshot::Sender<()>>,
}

pub(crate) enum BodyOutgoing {
    /// We are still receiving body chunks from the handler
    StillReceiving(VecDeque<QueuedChunk>),

    /// We have received all body chunks from the handler
    DoneReceiving {
        chunks: VecDeque<QueuedChunk>,
        trailers: Option<Box<Headers>>,
    },

    /// We have sent all data to the peer
    DoneSending,
}

impl fmt::Debug for BodyOutgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyOutgoing::StillReceiving(chunks) => f
                .debug_tuple("BodyOutgoing::StillReceiving")
                .field(&chunks.len())
                .finish(),
            BodyOutgoing::DoneReceiving { chunks, trailers } => f
                .debug_struct("BodyOutgoing::DoneReceiving")
                .field("chunks", &chunks.len())
                .field("trailers", &trailers.is_some())
                .finish(),
            BodyOutgoing::DoneSending => f.debug_tuple("BodyOutgoing::DoneSending").finish(),
        }
    }
}

impl BodyOutgoing {
    pub(crate) fn chunks_mut(&mut self) -> Option<&mut VecDeque<QueuedChunk>> {
        match self {
            BodyOutgoing::StillReceiving(chunks) => Some(chunks),
            BodyOutgoing::DoneReceiving { chunks, .. } => Some(chunks),
            BodyOutgoing::DoneSending => None,
        }
    }

    /// Whether there's anything left to put on the wire right now, credit
    /// permitting.
    pub(crate) fn has_more_to_write(&self) -> bool {
        match self {
            BodyOutgoing::StillReceiving(chunks) => !chunks.is_empty(),
            BodyOutgoing::DoneReceiving { .. } => true,
            BodyOutgoing::DoneSending => false,
        }
    }

    /// Take the next frame's worth of body, at most `budget` bytes of DATA.
    /// The END_STREAM marker and trailers don't need any credit.
    pub(crate) fn next_frame(&mut self, budget: usize) -> Option<OutgoingFrame> {
        let done_receiving = matches!(self, BodyOutgoing::DoneReceiving { .. });
        let chunks = self.chunks_mut()?;

        if let Some(front) = chunks.front_mut() {
            if budget == 0 {
                return None;
            }

            if front.data.len() > budget {
                let data = front.data.split_to(budget);
                return Some(OutgoingFrame::Data {
                    data,
                    end_stream: false,
                    ack: None,
                });
            }

            let chunk = chunks.pop_front()?;
            let last = chunks.is_empty();
            let end_stream = done_receiving
                && last
                && matches!(self, BodyOutgoing::DoneReceiving { trailers: None, .. });
            if end_stream {
                *self = BodyOutgoing::DoneSending;
            }
            return Some(OutgoingFrame::Data {
                data: chunk.data,
                end_stream,
                ack: chunk.ack,
            });
        }

        match std::mem::replace(self, BodyOutgoing::DoneSending) {
            BodyOutgoing::DoneReceiving {
                trailers: Some(trailers),
                ..
            } => Some(OutgoingFrame::Trailers(trailers)),
            BodyOutgoing::DoneReceiving { trailers: None, .. } => Some(OutgoingFrame::Data {
                data: Bytes::new(),
                end_stream: true,
                ack: None,
            }),
            other => {
                // nothing queued yet
                *self = other;
                None
            }
        }
    }
}

/// What the writer should send next for a stream
pub(crate) enum OutgoingFrame {
    Data {
        data: Bytes,
        end_stream: bool,
        /// Completed once `data` is written, if it ends a queued chunk
        ack: Option<oneshot::Sender<()>>,
    },
    Trailers(Box<Headers>),
}

/// An error that may either indicate the peer is misbehaving
/// or just a bad request from the client.
#[derive(Debug, thiserror::Error)]
pub(crate) enum H2ErrorLevel {
    #[error("connection error: {0}")]
    Connection(#[from] H2ConnectionError),

    #[error("stream error: {0}")]
    Stream(#[from] H2StreamError),

    #[error("request error: {0}")]
    Request(#[from] H2RequestError),
}

/// The client done goofed, we're returning 4xx
#[derive(thiserror::Error)]
#[error("client error: {status:?}")]
pub(crate) struct H2RequestError {
    pub(crate) status: StatusCode,
    pub(crate) message: Bytes,
    pub(crate) reason: RejectionReason,
}

impl fmt::Debug for H2RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("H2RequestError");
        s.field("status", &self.status);
        s.field("reason", &self.reason);
        match std::str::from_utf8(&self.message[..]) {
            Ok(body) => s.field("body", &body),
            Err(_) => s.field("body", &"(not utf-8)"),
        };
        s.finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2ConnectionError {
    #[error("invalid connection preface")]
    InvalidPreface,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("headers frame had invalid priority: stream {stream_id} depends on itself")]
    HeadersInvalidPriority { stream_id: StreamId },

    #[error("client tried to initiate an even-numbered stream")]
    ClientSidShouldBeOdd,

    #[error("client stream IDs should be numerically increasing")]
    ClientSidShouldBeNumericallyIncreasing {
        stream_id: StreamId,
        last_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, expected continuation frame, but got {frame_type:?}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_type: Option<FrameType>,
    },

    #[error("expected continuation from for stream {stream_id}, but got continuation for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, received unexpected continuation frame")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("header block for stream {stream_id} exceeds {max} bytes")]
    HeaderBlockTooLarge { stream_id: StreamId, max: usize },

    #[error("hpack decoding error: {0:?}")]
    HpackDecodingError(DecoderError),

    #[error("client sent a push promise frame, clients aren't allowed to do that, cf. RFC9113 section 8.4")]
    ClientSentPushPromise,

    #[error("received {frame_type:?} frame for idle stream {stream_id}")]
    FrameForIdleStream {
        frame_type: FrameType,
        stream_id: StreamId,
    },

    #[error("stream-specific frame {frame_type:?} sent to stream ID 0 (connection-wide)")]
    StreamSpecificFrameToConnection { frame_type: FrameType },

    #[error("frame after stream close (stream {stream_id})")]
    StreamClosed { stream_id: StreamId },

    #[error("received ping frame frame with non-zero stream id")]
    PingFrameWithNonZeroStreamId { stream_id: StreamId },

    #[error("received settings frame with non-zero stream id")]
    SettingsWithNonZeroStreamId { stream_id: StreamId },

    #[error("received goaway frame with non-zero stream id")]
    GoAwayWithNonZeroStreamId { stream_id: StreamId },

    #[error("zero increment in window update frame for connection")]
    WindowUpdateZeroIncrement,

    #[error("received window update that made the connection window overflow")]
    WindowUpdateOverflow,

    #[error("connection flow control: {0}")]
    WindowUnderflow(WindowUnderflow),

    #[error("received initial window size settings update that made the window of stream {stream_id} overflow")]
    StreamWindowSizeOverflowDueToSettings { stream_id: StreamId },

    #[error("bad setting value: {0}")]
    BadSettingValue(SettingsError),

    #[error("keep-alive ping timeout")]
    KeepAlivePingTimeout,

    #[error("request headers timeout")]
    RequestHeadersTimeout,

    #[error("request body data rate too low")]
    RequestBodyDataRateTooLow { stream_id: StreamId },

    #[error("error reading from transport: {0}")]
    ReadError(std::io::Error),

    #[error("error writing H2 frame: {0:?}")]
    WriteError(std::io::Error),

    #[error("transport write too slow, minimum response data rate not met")]
    WriteTimeout,
}

impl H2ConnectionError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use H2ConnectionError::*;
        use KnownErrorCode as Code;

        match self {
            // frame size errors
            Frame(e) if e.is_frame_size_error() => Code::FrameSizeError,
            // flow control errors
            WindowUpdateOverflow => Code::FlowControlError,
            WindowUnderflow(_) => Code::FlowControlError,
            StreamWindowSizeOverflowDueToSettings { .. } => Code::FlowControlError,
            BadSettingValue(SettingsError::InitialWindowSizeTooLarge { .. }) => {
                Code::FlowControlError
            }
            // compression errors
            HpackDecodingError(_) => Code::CompressionError,
            // stream closed error
            StreamClosed { .. } => Code::StreamClosed,
            // things we gave up on
            KeepAlivePingTimeout
            | RequestHeadersTimeout
            | RequestBodyDataRateTooLow { .. }
            | ReadError(_)
            | WriteError(_)
            | WriteTimeout => Code::InternalError,
            // protocol errors
            _ => Code::ProtocolError,
        }
    }

    /// The transport itself failed: there's no point sending GOAWAY.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            H2ConnectionError::ReadError(_)
                | H2ConnectionError::WriteError(_)
                | H2ConnectionError::WriteTimeout
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2StreamError {
    #[error("less data than declared length")]
    LessDataThanDeclared { received: u64, declared: u64 },

    #[error("more data than declared length")]
    MoreDataThanDeclared { received: u64, declared: u64 },

    #[error("stream flow control: {0}")]
    WindowUnderflow(WindowUnderflow),

    #[error("zero increment in window update frame for stream")]
    WindowUpdateZeroIncrement,

    #[error("received WINDOW_UPDATE that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("refused stream (would exceed max concurrent streams)")]
    RefusedStream,

    #[error("trailers must have EndStream flag set")]
    TrailersNotEndStream,

    #[error("stream closed")]
    StreamClosed,

    #[error("bad request: {0}")]
    BadRequest(&'static str),
}

impl H2StreamError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use H2StreamError::*;
        use KnownErrorCode as Code;

        match self {
            // stream closed error
            StreamClosed => Code::StreamClosed,
            // stream refused error
            RefusedStream => Code::RefusedStream,
            // flow control errors
            WindowUpdateOverflow => Code::FlowControlError,
            WindowUnderflow(_) => Code::FlowControlError,
            _ => Code::ProtocolError,
        }
    }
}

#[derive(Debug)]
pub(crate) struct H2Event {
    pub(crate) stream_id: StreamId,
    pub(crate) payload: H2EventPayload,
}

pub(crate) enum H2EventPayload {
    Headers {
        res: Response,
        end_stream: bool,
    },
    BodyChunk {
        chunk: Bytes,
        ack: oneshot::Sender<()>,
    },
    BodyEnd {
        trailers: Option<Box<Headers>>,
    },
    Reset {
        code: KnownErrorCode,
        reason: String,
    },
    /// The handler task returned (or panicked)
    HandlerDone,
    /// The application read this many request body bytes
    RequestBodyConsumed {
        len: u32,
    },
}

impl fmt::Debug for H2EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers { res, end_stream } => f
                .debug_struct("Headers")
                .field("status", &res.status)
                .field("end_stream", end_stream)
                .finish(),
            Self::BodyChunk { chunk, .. } => f.debug_tuple("BodyChunk").field(&chunk.len()).finish(),
            Self::BodyEnd { trailers } => f
                .debug_struct("BodyEnd")
                .field("trailers", &trailers.is_some())
                .finish(),
            Self::Reset { code, reason } => f
                .debug_struct("Reset")
                .field("code", code)
                .field("reason", reason)
                .finish(),
            Self::HandlerDone => write!(f, "HandlerDone"),
            Self::RequestBodyConsumed { len } => {
                f.debug_tuple("RequestBodyConsumed").field(len).finish()
            }
        }
    }
}
