use std::{
    convert::Infallible,
    future::Future,
    io,
    panic::AssertUnwindSafe,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::FutureExt;
use http::{header, StatusCode};
use pretty_hex::PrettyHex;
use smallvec::SmallVec;
use strom_h2::{
    enumflags2::BitFlags, nom, try_read_frame, write_frame, DataFlags, ErrorCode, Frame,
    FramePayload, FrameType, GoAway, KnownErrorCode, PingFlags, PrioritySpec, RstStream, Setting,
    Settings, SettingsFlags, StreamId, WindowUpdate,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::MissedTickBehavior,
};
use tracing::{debug, trace, warn};

use crate::{
    error::ServeError,
    observe::{Observer, RejectionReason, TimeoutReason, TracingObserver},
    Request, Responder, Response, ServeOutcome, ServerDriver,
};

use super::{
    body::{
        H2Body, IncomingMessageResult, StreamControls, StreamIncoming, StreamIncomingError,
        StreamShared,
    },
    encode::H2Encoder,
    flow::DEFAULT_WINDOW_SIZE,
    headers::{
        self, response_fields, trailer_fields, HeaderCollector, HeaderLimits, HeadersOrTrailers,
        PendingHeaderBlock, ReadHeadersMode,
    },
    hpack::{HeaderBlockDecoder, HeaderBlockEncoder, HpackDecoder, HpackEncoder},
    keepalive::{KeepAlive, KeepAliveAction},
    timeout::{Clock, MinDataRate, TokioClock},
    types::{
        BodyOutgoing, ConnState, H2ConnectionError, H2ErrorLevel, H2Event, H2EventPayload,
        H2RequestError, H2StreamError, OutgoingFrame, QueuedChunk, StreamPhase, StreamState,
    },
};

/// How much we try to read from the transport at once
const READ_RESERVE: usize = 16 * 1024;

/// HTTP/2 server configuration
pub struct ServerConf {
    /// Advertised as SETTINGS_MAX_CONCURRENT_STREAMS; streams over the limit
    /// are refused. `None` is unlimited.
    pub max_streams: Option<u32>,

    /// Inbound flow-control window of each stream
    pub initial_stream_window_size: u32,

    /// Inbound flow-control window of the whole connection
    pub initial_connection_window_size: u32,

    /// Largest frame payload we accept
    pub max_frame_size: u32,

    /// Dynamic table size for our HPACK decoder
    pub header_table_size: u32,

    /// Requests with more header fields are answered with 431
    pub max_request_header_count: usize,

    /// Requests whose decoded header list (name + value + 32 per field) is
    /// larger are answered with 431. Also advertised as
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_request_headers_total_size: usize,

    /// Longest `:path` we accept
    pub max_request_line_size: usize,

    /// Hard cap on the encoded size of a header block (HEADERS plus all its
    /// CONTINUATION frames). Going over it is a connection error.
    pub max_header_block_size: usize,

    /// Default request body limit, overridable per request through
    /// [StreamControls]. Over the limit, the request gets a 413.
    pub max_request_body_size: Option<u64>,

    /// A connection with no streams for this long is shut down gracefully.
    /// Also bounds how long we wait for the connection preface.
    pub keep_alive_timeout: Duration,

    /// Probe an idle connection with PING after this long. `None` disables
    /// keep-alive pings.
    pub keep_alive_ping_delay: Option<Duration>,

    /// Give up on the connection if a keep-alive PING isn't acknowledged in
    /// time. `None` waits forever.
    pub keep_alive_ping_timeout: Option<Duration>,

    /// A header block must complete within this long
    pub request_headers_timeout: Duration,

    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,

    /// How often timeouts get checked
    pub heartbeat_interval: Duration,

    /// How long frames for a reset stream are tolerated
    pub stream_reset_cooldown: Duration,

    pub clock: Rc<dyn Clock>,
    pub observer: Rc<dyn Observer>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            max_streams: Some(32),
            initial_stream_window_size: 768 * 1024,
            initial_connection_window_size: 1024 * 1024,
            max_frame_size: 1 << 14,
            header_table_size: 4096,
            max_request_header_count: 100,
            max_request_headers_total_size: 32 * 1024,
            max_request_line_size: 8 * 1024,
            max_header_block_size: 64 * 1024,
            max_request_body_size: Some(30_000_000),
            keep_alive_timeout: Duration::from_secs(130),
            keep_alive_ping_delay: None,
            keep_alive_ping_timeout: Some(Duration::from_secs(20)),
            request_headers_timeout: Duration::from_secs(30),
            min_request_body_data_rate: Some(MinDataRate::default()),
            min_response_data_rate: Some(MinDataRate::default()),
            heartbeat_interval: Duration::from_secs(1),
            stream_reset_cooldown: Duration::from_secs(5),
            clock: Rc::new(TokioClock),
            observer: Rc::new(TracingObserver),
        }
    }
}

impl ServerConf {
    /// The settings we advertise, with out-of-range values clamped.
    fn self_settings(&self) -> Settings {
        let frame_sizes = Settings::MAX_FRAME_SIZE_ALLOWED_RANGE;
        Settings {
            header_table_size: self.header_table_size,
            enable_push: false,
            max_concurrent_streams: self.max_streams,
            initial_window_size: self
                .initial_stream_window_size
                .min(Settings::MAX_INITIAL_WINDOW_SIZE),
            max_frame_size: self
                .max_frame_size
                .clamp(*frame_sizes.start(), *frame_sizes.end()),
            max_header_list_size: u32::try_from(self.max_request_headers_total_size)
                .unwrap_or(u32::MAX),
            enable_connect_protocol: true,
        }
    }

    fn connection_window(&self) -> u32 {
        self.initial_connection_window_size
            .clamp(DEFAULT_WINDOW_SIZE, Settings::MAX_INITIAL_WINDOW_SIZE)
    }

    fn header_limits(&self) -> HeaderLimits {
        HeaderLimits {
            max_count: self.max_request_header_count,
            max_total_size: self.max_request_headers_total_size,
            max_path_len: self.max_request_line_size,
        }
    }
}

/// Serve a single HTTP/2 connection until the peer leaves or the protocol
/// is violated. Must run on a [tokio::task::LocalSet]: handlers are spawned
/// with [tokio::task::spawn_local].
pub async fn serve<Driver>(
    io: (impl AsyncRead + Unpin, impl AsyncWrite + Unpin),
    conf: Rc<ServerConf>,
    driver: Rc<Driver>,
) -> Result<ServeOutcome, ServeError<Driver::Error>>
where
    Driver: ServerDriver + 'static,
{
    serve_with_shutdown(io, conf, driver, std::future::pending()).await
}

/// Like [serve], but once `shutdown` resolves, the connection is closed
/// gracefully: GOAWAY(NO_ERROR), no new streams, and we return once
/// in-flight streams are done.
pub async fn serve_with_shutdown<Driver>(
    (transport_r, transport_w): (impl AsyncRead + Unpin, impl AsyncWrite + Unpin),
    conf: Rc<ServerConf>,
    driver: Rc<Driver>,
    shutdown: impl Future<Output = ()>,
) -> Result<ServeOutcome, ServeError<Driver::Error>>
where
    Driver: ServerDriver + 'static,
{
    let mut cx = ServerContext::new(driver, conf, transport_w);
    let outcome = cx.work(transport_r, shutdown).await?;

    debug!(?outcome, "finished serving");
    Ok(outcome)
}

enum Preface {
    Valid,
    Missing,
    Invalid,
}

/// Why the process loop stopped, when it's not an error
enum LoopEnd {
    PeerHungUp,
    Drained,
}

/// Reads and processes h2 frames from the client.
pub(crate) struct ServerContext<D: ServerDriver + 'static, W: AsyncWrite + Unpin> {
    driver: Rc<D>,
    conf: Rc<ServerConf>,
    state: ConnState,

    hpack_dec: HpackDecoder,
    hpack_enc: HpackEncoder,
    out_scratch: BytesMut,

    keepalive: KeepAlive,

    /// Last time we saw the connection with streams open
    idle_since: Instant,

    /// Whether we've received a GOAWAY frame.
    goaway_recv: bool,

    /// Whether we've announced GOAWAY(NO_ERROR). No new streams after that.
    goaway_sent: bool,

    transport_w: W,

    ev_tx: mpsc::UnboundedSender<H2Event>,
    ev_rx: mpsc::UnboundedReceiver<H2Event>,
}

impl<Driver, Write> ServerContext<Driver, Write>
where
    Driver: ServerDriver + 'static,
    Write: AsyncWrite + Unpin,
{
    pub(crate) fn new(driver: Rc<Driver>, conf: Rc<ServerConf>, transport_w: Write) -> Self {
        let self_settings = conf.self_settings();
        let state = ConnState::new(self_settings, conf.connection_window());
        let hpack_dec = HpackDecoder::new(self_settings.header_table_size as usize);

        let now = conf.clock.now();
        let keepalive = KeepAlive::new(conf.keep_alive_ping_delay, conf.keep_alive_ping_timeout, now);

        let (ev_tx, ev_rx) = mpsc::unbounded_channel::<H2Event>();

        Self {
            driver,
            conf,
            state,
            hpack_dec,
            hpack_enc: Default::default(),
            out_scratch: BytesMut::new(),
            keepalive,
            idle_since: now,
            goaway_recv: false,
            goaway_sent: false,
            transport_w,
            ev_tx,
            ev_rx,
        }
    }

    /// Reads and process h2 frames from the client.
    pub(crate) async fn work(
        &mut self,
        mut transport_r: impl AsyncRead + Unpin,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ServeOutcome, ServeError<Driver::Error>> {
        let mut client_buf = BytesMut::with_capacity(READ_RESERVE);

        match read_preface(&mut transport_r, &mut client_buf, self.conf.keep_alive_timeout)
            .await?
        {
            Preface::Valid => client_buf.advance(strom_h2::PREFACE.len()),
            Preface::Missing => return Ok(ServeOutcome::ClientDidntSpeakHttp2),
            Preface::Invalid => {
                self.goaway(&H2ConnectionError::InvalidPreface).await?;
                return Ok(ServeOutcome::ClientDidntSpeakHttp2);
            }
        }

        self.send_initial_settings().await?;

        let (frame_tx, frame_rx) = mpsc::channel(32);
        let max_frame_size = self.state.self_settings.max_frame_size;
        let deframe_task = async move {
            deframe_loop(transport_r, client_buf, max_frame_size, frame_tx).await;
            // the transport stays open until the process loop is done with it
            std::future::pending::<Infallible>().await
        };
        let process_task = self.process_loop(frame_rx, shutdown);

        debug!("Starting both deframe & process tasks");
        let res = tokio::select! {
            res = process_task => res,
            never = deframe_task => match never {},
        };

        match res {
            Ok(LoopEnd::PeerHungUp) => {
                self.cancel_all_streams();
                Ok(ServeOutcome::PeerHungUp)
            }
            Ok(LoopEnd::Drained) => Ok(ServeOutcome::SuccessfulHttp2GracefulShutdown),
            Err(e) if e.is_transport() => {
                debug!("transport failed, not bothering with GOAWAY: {e}");
                self.cancel_all_streams();
                Err(e.into())
            }
            Err(e) => {
                self.cancel_all_streams();
                self.goaway(&e).await?;
                Ok(ServeOutcome::ConnectionError)
            }
        }
    }

    async fn send_initial_settings(&mut self) -> Result<(), H2ConnectionError> {
        let s = self.state.self_settings;
        let mut pairs = vec![
            (Setting::EnablePush, 0),
            (Setting::HeaderTableSize, s.header_table_size),
            (Setting::InitialWindowSize, s.initial_window_size),
        ];
        if let Some(max) = s.max_concurrent_streams {
            pairs.push((Setting::MaxConcurrentStreams, max));
        }
        pairs.extend([
            (Setting::MaxFrameSize, s.max_frame_size),
            (Setting::MaxHeaderListSize, s.max_header_list_size),
            (Setting::EnableConnectProtocol, 1),
        ]);

        debug!(settings = ?s, "Sending initial settings");
        self.write_frame(
            Frame::new(FrameType::Settings(Default::default()), StreamId::CONNECTION),
            FramePayload::Settings(pairs),
        )
        .await?;

        // the connection window can only grow through WINDOW_UPDATE
        let increment = self.state.inbound.target().saturating_sub(DEFAULT_WINDOW_SIZE);
        if increment > 0 {
            self.write_window_update(StreamId::CONNECTION, increment)
                .await?;
        }
        Ok(())
    }

    async fn process_loop(
        &mut self,
        mut frame_rx: mpsc::Receiver<Result<(Frame, FramePayload), H2ConnectionError>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<LoopEnd, H2ConnectionError> {
        let mut heartbeat = tokio::time::interval(self.conf.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        let mut shutdown_requested = false;

        loop {
            tokio::select! {
                biased;

                maybe_frame = frame_rx.recv() => {
                    match maybe_frame {
                        Some(res) => {
                            let (frame, payload) = res?;
                            self.process_frame(frame, payload).await?;
                        }
                        None => {
                            debug!("h2 process task: peer hung up");
                            return Ok(LoopEnd::PeerHungUp);
                        }
                    }
                }

                Some(ev) = self.ev_rx.recv() => {
                    self.handle_event(ev).await?;
                }

                _ = heartbeat.tick() => {
                    self.on_heartbeat().await?;
                }

                _ = &mut shutdown, if !shutdown_requested => {
                    debug!("shutdown requested");
                    shutdown_requested = true;
                    self.start_graceful_shutdown().await?;
                }
            }

            self.send_data_maybe().await?;

            if self.goaway_sent
                && self.state.streams.is_empty()
                && self.state.pending_headers.is_none()
            {
                debug!(goaway_recv = %self.goaway_recv, "all streams done, graceful shutdown complete");
                return Ok(LoopEnd::Drained);
            }
        }
    }

    async fn on_heartbeat(&mut self) -> Result<(), H2ConnectionError> {
        let now = self.conf.clock.now();
        self.state.recently_closed.purge(now);

        match self.keepalive.poll(now, !self.state.streams.is_empty()) {
            KeepAliveAction::Nothing => {}
            KeepAliveAction::SendPing(payload) => {
                debug!(state = ?self.keepalive.state(), "Sending keep-alive ping");
                self.write_frame(
                    Frame::new(FrameType::Ping(Default::default()), StreamId::CONNECTION),
                    FramePayload::Ping(payload),
                )
                .await?;
            }
            KeepAliveAction::TimedOut => {
                self.conf.observer.timeout(TimeoutReason::KeepAlivePing);
                return Err(H2ConnectionError::KeepAlivePingTimeout);
            }
        }

        if let Some(pending) = &self.state.pending_headers {
            if now.saturating_duration_since(pending.started_at) >= self.conf.request_headers_timeout
            {
                self.conf.observer.timeout(TimeoutReason::RequestHeaders);
                return Err(H2ConnectionError::RequestHeadersTimeout);
            }
        }

        for (&stream_id, ss) in &self.state.streams {
            let shared = match ss {
                StreamState::Open { incoming, .. } | StreamState::HalfClosedLocal { incoming } => {
                    &incoming.shared
                }
                _ => continue,
            };
            if shared.request_body_too_slow(now) {
                self.conf
                    .observer
                    .timeout(TimeoutReason::MinRequestBodyDataRate);
                return Err(H2ConnectionError::RequestBodyDataRateTooLow { stream_id });
            }
        }

        if !self.state.streams.is_empty() || self.state.pending_headers.is_some() {
            self.idle_since = now;
        } else if !self.goaway_sent
            && now.saturating_duration_since(self.idle_since) >= self.conf.keep_alive_timeout
        {
            debug!(idle_for = ?now.saturating_duration_since(self.idle_since), "connection idle for too long");
            self.conf.observer.timeout(TimeoutReason::KeepAlive);
            self.start_graceful_shutdown().await?;
        }

        Ok(())
    }

    async fn start_graceful_shutdown(&mut self) -> Result<(), H2ConnectionError> {
        if self.goaway_sent {
            return Ok(());
        }
        self.goaway_sent = true;

        let last_stream_id = self.state.last_processed_stream_id;
        debug!(%last_stream_id, streams = %self.state.streams.len(), "Starting graceful shutdown, sending GoAway");
        self.write_frame(
            Frame::new(FrameType::GoAway, StreamId::CONNECTION),
            FramePayload::GoAway(GoAway {
                last_stream_id,
                error_code: KnownErrorCode::NoError.into(),
                additional_debug_data: Bytes::new(),
            }),
        )
        .await
    }

    async fn goaway(&mut self, err: &H2ConnectionError) -> Result<(), H2ConnectionError> {
        let error_code = err.as_known_error_code();
        let last_stream_id = self.state.last_processed_stream_id;
        debug!("Connection error: {err} ({err:?}) (code {error_code:?})");

        let reason = err.to_string();
        self.conf
            .observer
            .connection_error(error_code, last_stream_id, &reason);

        debug!(%last_stream_id, ?error_code, "Sending GoAway");
        self.write_frame(
            Frame::new(FrameType::GoAway, StreamId::CONNECTION),
            FramePayload::GoAway(GoAway {
                last_stream_id,
                error_code: error_code.into(),
                additional_debug_data: Bytes::from(reason),
            }),
        )
        .await
    }

    fn cancel_all_streams(&mut self) {
        for (stream_id, mut ss) in self.state.streams.drain() {
            trace!(%stream_id, "cancelling stream");
            if let Some(incoming) = ss.incoming_mut() {
                incoming.send_error(StreamIncomingError::StreamReset);
            }
        }
        self.state.streams_with_pending_data.clear();
        self.state.pending_headers = None;
    }

    async fn send_data_maybe(&mut self) -> Result<(), H2ConnectionError> {
        if self.state.streams_with_pending_data.is_empty() {
            return Ok(());
        }

        let max_frame_size = self.state.peer_settings.max_frame_size as usize;
        let ids: SmallVec<[StreamId; 8]> = self
            .state
            .streams_with_pending_data
            .iter()
            .copied()
            .collect();

        for id in ids {
            loop {
                let conn_credit = self.state.outbound.available();
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(&id)
                    .and_then(|ss| ss.outgoing_mut())
                else {
                    self.state.streams_with_pending_data.remove(&id);
                    break;
                };

                let credit = conn_credit.min(outgoing.window.available()).max(0);
                let budget = usize::try_from(credit)
                    .unwrap_or_default()
                    .min(max_frame_size);

                let Some(next) = outgoing.body.next_frame(budget) else {
                    if outgoing.body.has_more_to_write() {
                        trace!(stream_id = %id, %conn_credit, stream_credit = %outgoing.window.available(), "waiting for window update");
                    } else {
                        self.state.streams_with_pending_data.remove(&id);
                    }
                    break;
                };

                match next {
                    OutgoingFrame::Data {
                        data,
                        end_stream,
                        ack,
                    } => {
                        let len = data.len() as u32;
                        outgoing.window.consume(len);
                        self.state.outbound.consume(len);
                        let rate = outgoing.shared.min_response_data_rate.get();

                        let mut flags = BitFlags::<DataFlags>::default();
                        if end_stream {
                            flags |= DataFlags::EndStream;
                        }
                        self.write_frame_with_rate(
                            Frame::new(FrameType::Data(flags), id),
                            FramePayload::Data(data),
                            rate,
                        )
                        .await?;

                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        if end_stream {
                            self.on_end_stream_sent(id).await?;
                            break;
                        }
                    }
                    OutgoingFrame::Trailers(trailers) => {
                        debug!(stream_id = %id, "writing trailers");
                        let fields: Vec<_> = trailer_fields(&trailers).collect();
                        self.write_header_block(id, &fields, true).await?;
                        self.on_end_stream_sent(id).await?;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&mut self, ev: H2Event) -> Result<(), H2ConnectionError> {
        trace!(?ev, "handling event");
        let stream_id = ev.stream_id;

        match ev.payload {
            H2EventPayload::Headers { res, end_stream } => {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|ss| ss.outgoing_mut())
                else {
                    debug!(%stream_id, "stream is gone, dropping response headers");
                    return Ok(());
                };
                outgoing.wrote_headers = true;
                if res.status == StatusCode::PAYLOAD_TOO_LARGE && outgoing.shared.body_rejected.get()
                {
                    self.conf
                        .observer
                        .request_rejected(stream_id, RejectionReason::BodyTooLarge);
                }

                res.debug_print();
                let fields = response_fields(&res);
                self.write_header_block(stream_id, &fields, end_stream)
                    .await?;
                if end_stream {
                    self.on_end_stream_sent(stream_id).await?;
                }
            }
            H2EventPayload::BodyChunk { chunk, ack } => {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|ss| ss.outgoing_mut())
                else {
                    // dropping `ack` tells the writer
                    debug!(%stream_id, "stream is gone, dropping body chunk");
                    return Ok(());
                };

                if chunk.is_empty() {
                    let _ = ack.send(());
                    return Ok(());
                }

                match &mut outgoing.body {
                    BodyOutgoing::StillReceiving(chunks) => chunks.push_back(QueuedChunk {
                        data: chunk,
                        ack: Some(ack),
                    }),
                    other => {
                        warn!(%stream_id, body = ?other, "body chunk after end of body, dropping");
                        return Ok(());
                    }
                }
                self.state.streams_with_pending_data.insert(stream_id);
            }
            H2EventPayload::BodyEnd { trailers } => {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|ss| ss.outgoing_mut())
                else {
                    debug!(%stream_id, "stream is gone, dropping body end");
                    return Ok(());
                };

                match std::mem::replace(&mut outgoing.body, BodyOutgoing::DoneSending) {
                    BodyOutgoing::StillReceiving(chunks) => {
                        debug!(%stream_id, queued = %chunks.len(), "got body end");
                        outgoing.body = BodyOutgoing::DoneReceiving { chunks, trailers };
                    }
                    other => {
                        warn!(%stream_id, body = ?other, "got body end twice");
                        outgoing.body = other;
                        return Ok(());
                    }
                }
                self.state.streams_with_pending_data.insert(stream_id);
            }
            H2EventPayload::Reset { code, reason } => {
                if !self.state.streams.contains_key(&stream_id) {
                    debug!(%stream_id, "stream is gone, not resetting it again");
                    return Ok(());
                }
                self.reset_stream(stream_id, code, &reason).await?;
                if code != KnownErrorCode::NoError {
                    self.conf
                        .observer
                        .stream_aborted(stream_id, code.into(), &reason);
                }
            }
            H2EventPayload::HandlerDone => {
                let Some(ss) = self.state.streams.get(&stream_id) else {
                    return Ok(());
                };
                if let Some(shared) = ss.shared() {
                    shared.handler_done.set(true);
                }
                if matches!(ss, StreamState::HalfClosedLocal { .. }) {
                    debug!(%stream_id, "response sent and handler done, the rest of the request body is unwanted");
                    self.reset_stream(stream_id, KnownErrorCode::NoError, "handler done")
                        .await?;
                }
            }
            H2EventPayload::RequestBodyConsumed { len } => {
                self.release_stream_window(stream_id, len).await?;
                self.release_connection_window(len).await?;
            }
        }

        Ok(())
    }

    async fn write_header_block(
        &mut self,
        stream_id: StreamId,
        fields: &[(&[u8], &[u8])],
        end_stream: bool,
    ) -> Result<(), H2ConnectionError> {
        let max_frame_size = self.state.peer_settings.max_frame_size as usize;
        let frames = headers::write_header_block(
            &mut self.hpack_enc,
            stream_id,
            fields,
            end_stream,
            max_frame_size,
        )
        .map_err(H2ConnectionError::WriteError)?;

        for (frame, fragment) in frames {
            let payload = match frame.frame_type {
                FrameType::Headers(_) => FramePayload::Headers {
                    priority: None,
                    fragment,
                },
                _ => FramePayload::Continuation(fragment),
            };
            self.write_frame(frame, payload).await?;
        }
        Ok(())
    }

    async fn write_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> Result<(), H2ConnectionError> {
        debug!(%stream_id, %increment, "Sending window update");
        self.write_frame(
            Frame::new(FrameType::WindowUpdate, stream_id),
            FramePayload::WindowUpdate(WindowUpdate {
                reserved: 0,
                increment,
            }),
        )
        .await
    }

    async fn write_frame(
        &mut self,
        frame: Frame,
        payload: FramePayload,
    ) -> Result<(), H2ConnectionError> {
        let rate = self.conf.min_response_data_rate;
        self.write_frame_with_rate(frame, payload, rate).await
    }

    /// Writes a frame, giving up if the transport doesn't take it within
    /// the deadline `rate` allows. The deadline is checked against the
    /// connection's clock on every heartbeat tick while the write is stuck.
    async fn write_frame_with_rate(
        &mut self,
        frame: Frame,
        payload: FramePayload,
        rate: Option<MinDataRate>,
    ) -> Result<(), H2ConnectionError> {
        write_frame(frame, &payload, &mut self.out_scratch);
        let buf = self.out_scratch.split().freeze();
        debug!(?frame, ">");

        let len = buf.len();
        let w = &mut self.transport_w;
        let write = async move {
            w.write_all(&buf).await?;
            w.flush().await
        };

        let Some(rate) = rate else {
            return write.await.map_err(H2ConnectionError::WriteError);
        };

        let clock = &self.conf.clock;
        let deadline = clock.now() + rate.write_deadline(len);
        let mut heartbeat = tokio::time::interval(self.conf.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes right away
        heartbeat.tick().await;

        tokio::pin!(write);
        loop {
            tokio::select! {
                biased;

                res = &mut write => {
                    return res.map_err(H2ConnectionError::WriteError);
                }
                _ = heartbeat.tick() => {
                    if clock.now() >= deadline {
                        debug!(%len, ?rate, "transport write too slow");
                        self.conf
                            .observer
                            .timeout(TimeoutReason::MinResponseDataRate);
                        return Err(H2ConnectionError::WriteTimeout);
                    }
                }
            }
        }
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        payload: FramePayload,
    ) -> Result<(), H2ConnectionError> {
        let now = self.conf.clock.now();
        let is_ping_ack =
            matches!(frame.frame_type, FrameType::Ping(flags) if flags.contains(PingFlags::Ack));
        if !is_ping_ack {
            self.keepalive.on_frame_received(now);
        }

        if let Some(pending) = &self.state.pending_headers {
            match frame.frame_type {
                FrameType::Continuation(_) if frame.stream_id == pending.stream_id => {}
                FrameType::Continuation(_) => {
                    return Err(H2ConnectionError::ExpectedContinuationForStream {
                        stream_id: pending.stream_id,
                        continuation_stream_id: frame.stream_id,
                    })
                }
                other => {
                    return Err(H2ConnectionError::ExpectedContinuationFrame {
                        stream_id: pending.stream_id,
                        frame_type: Some(other),
                    })
                }
            }
        }

        match payload {
            FramePayload::Data(data) => self.on_data(frame, data).await,
            FramePayload::Headers { priority, fragment } => {
                self.on_headers(frame, priority, fragment).await
            }
            FramePayload::Priority(pri_spec) => {
                if frame.stream_id == StreamId::CONNECTION {
                    return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                        frame_type: frame.frame_type,
                    });
                }
                if pri_spec.stream_dependency == frame.stream_id {
                    return Err(H2ConnectionError::HeadersInvalidPriority {
                        stream_id: frame.stream_id,
                    });
                }
                debug!(?pri_spec, "received priority frame, ignoring");
                Ok(())
            }
            FramePayload::RstStream(rst) => self.on_rst_stream(frame, rst).await,
            FramePayload::Settings(pairs) => self.on_settings(frame, pairs).await,
            FramePayload::PushPromise(_) => Err(H2ConnectionError::ClientSentPushPromise),
            FramePayload::Ping(payload) => {
                if frame.stream_id != StreamId::CONNECTION {
                    return Err(H2ConnectionError::PingFrameWithNonZeroStreamId {
                        stream_id: frame.stream_id,
                    });
                }

                if is_ping_ack {
                    if !self.keepalive.on_ping_ack(payload, now) {
                        debug!("ping ack doesn't match our keep-alive ping, ignoring");
                    }
                    return Ok(());
                }

                trace!("Answering ping");
                self.write_frame(
                    Frame::new(FrameType::Ping(PingFlags::Ack.into()), StreamId::CONNECTION),
                    FramePayload::Ping(payload),
                )
                .await
            }
            FramePayload::GoAway(goaway) => {
                if frame.stream_id != StreamId::CONNECTION {
                    return Err(H2ConnectionError::GoAwayWithNonZeroStreamId {
                        stream_id: frame.stream_id,
                    });
                }

                debug!(
                    last_stream_id = %goaway.last_stream_id,
                    error_code = ?goaway.error_code,
                    debug_data = %String::from_utf8_lossy(&goaway.additional_debug_data),
                    "Peer sent GoAway"
                );
                self.goaway_recv = true;
                self.start_graceful_shutdown().await
            }
            FramePayload::WindowUpdate(update) => self.on_window_update(frame, update).await,
            FramePayload::Continuation(fragment) => {
                let Some(mut pending) = self.state.pending_headers.take() else {
                    return Err(H2ConnectionError::UnexpectedContinuationFrame {
                        stream_id: frame.stream_id,
                    });
                };

                pending.push(fragment, self.conf.max_header_block_size)?;
                if frame.is_end_headers() {
                    self.finish_header_block(pending).await
                } else {
                    self.state.pending_headers = Some(pending);
                    Ok(())
                }
            }
            FramePayload::Unknown(_) => {
                trace!(?frame, "Ignoring unknown frame");
                Ok(())
            }
        }
    }

    async fn on_data(&mut self, frame: Frame, data: Bytes) -> Result<(), H2ConnectionError> {
        let stream_id = frame.stream_id;
        if stream_id == StreamId::CONNECTION {
            return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }
        trace!(%stream_id, len = %data.len(), "received data:\n{:?}", data.hex_dump());

        let end_stream = frame.is_end_stream();
        let now = self.conf.clock.now();
        let phase = self.state.stream_phase(stream_id, now);
        match phase {
            StreamPhase::Idle => {
                return Err(H2ConnectionError::FrameForIdleStream {
                    frame_type: frame.frame_type,
                    stream_id,
                })
            }
            StreamPhase::Closed if self.state.recently_closed.get(stream_id, now).is_none() => {
                return Err(H2ConnectionError::StreamClosed { stream_id })
            }
            _ => {}
        }

        // padding included, whatever happens to the stream
        self.state
            .inbound
            .receive(frame.len)
            .map_err(H2ConnectionError::WindowUnderflow)?;

        let Some(ss) = self.state.streams.get_mut(&stream_id) else {
            trace!(%stream_id, ?phase, "data for a stream that just went away, refunding");
            self.release_connection_window(frame.len).await?;
            if phase == StreamPhase::Closed {
                return self.rst(stream_id, H2StreamError::StreamClosed).await;
            }
            return Ok(());
        };

        let Some(incoming) = ss.incoming_mut() else {
            // half-closed (remote): the peer already sent END_STREAM
            self.release_connection_window(frame.len).await?;
            return self.rst(stream_id, H2StreamError::StreamClosed).await;
        };

        if let Err(e) = incoming.window.receive(frame.len) {
            self.release_connection_window(frame.len).await?;
            return self.rst(stream_id, H2StreamError::WindowUnderflow(e)).await;
        }

        let padding = frame.len.saturating_sub(data.len() as u32);
        let delivered = match incoming.write_chunk(data, end_stream) {
            Ok(delivered) => delivered,
            Err(e) => {
                self.release_connection_window(frame.len).await?;
                return self.rst(stream_id, e).await;
            }
        };

        if end_stream {
            self.on_end_stream_received(stream_id);
        }

        // padding never reaches the consumer, and neither does anything it
        // stopped listening for
        let refund = if delivered { padding } else { frame.len };
        if refund > 0 {
            self.release_stream_window(stream_id, refund).await?;
            self.release_connection_window(refund).await?;
        }

        Ok(())
    }

    async fn on_headers(
        &mut self,
        frame: Frame,
        priority: Option<PrioritySpec>,
        fragment: Bytes,
    ) -> Result<(), H2ConnectionError> {
        let stream_id = frame.stream_id;
        if stream_id == StreamId::CONNECTION {
            return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }
        if let Some(pri_spec) = priority {
            if pri_spec.stream_dependency == stream_id {
                return Err(H2ConnectionError::HeadersInvalidPriority { stream_id });
            }
        }

        let end_stream = frame.is_end_stream();
        let now = self.conf.clock.now();

        let mode = match self.state.stream_phase(stream_id, now) {
            StreamPhase::Idle => {
                if stream_id.is_server_initiated() {
                    return Err(H2ConnectionError::ClientSidShouldBeOdd);
                }
                self.state.last_stream_id = stream_id;
                self.idle_since = now;

                let max_streams = self.conf.max_streams.map(|max| max as usize);
                if self.goaway_sent {
                    debug!(%stream_id, "Refusing stream, we're shutting down");
                    self.refuse_stream(stream_id).await?;
                    ReadHeadersMode::Skip
                } else if max_streams.is_some_and(|max| self.state.streams.len() >= max) {
                    debug!(%stream_id, streams = %self.state.streams.len(), "Refusing stream, would exceed max concurrent streams");
                    self.refuse_stream(stream_id).await?;
                    ReadHeadersMode::Skip
                } else {
                    ReadHeadersMode::Process(HeadersOrTrailers::Headers)
                }
            }
            StreamPhase::Open | StreamPhase::HalfClosedLocal => {
                debug!("Receiving trailers for stream {stream_id}");
                if end_stream {
                    ReadHeadersMode::Process(HeadersOrTrailers::Trailers)
                } else {
                    self.rst(stream_id, H2StreamError::TrailersNotEndStream)
                        .await?;
                    ReadHeadersMode::Skip
                }
            }
            StreamPhase::HalfClosedRemote => {
                self.rst(stream_id, H2StreamError::StreamClosed).await?;
                ReadHeadersMode::Skip
            }
            StreamPhase::Reset => {
                debug!(%stream_id, "Headers for a reset stream, decoding and dropping");
                ReadHeadersMode::Skip
            }
            StreamPhase::Closed => {
                if stream_id.is_server_initiated() {
                    return Err(H2ConnectionError::ClientSidShouldBeOdd);
                }
                let last_stream_id = self.state.last_stream_id;
                if stream_id == last_stream_id
                    || self.state.recently_closed.get(stream_id, now).is_some()
                {
                    return Err(H2ConnectionError::StreamClosed { stream_id });
                }
                return Err(H2ConnectionError::ClientSidShouldBeNumericallyIncreasing {
                    stream_id,
                    last_stream_id,
                });
            }
        };

        let mut pending = PendingHeaderBlock::new(stream_id, mode, end_stream, now);
        pending.push(fragment, self.conf.max_header_block_size)?;
        if frame.is_end_headers() {
            self.finish_header_block(pending).await
        } else {
            self.state.pending_headers = Some(pending);
            Ok(())
        }
    }

    async fn finish_header_block(
        &mut self,
        pending: PendingHeaderBlock,
    ) -> Result<(), H2ConnectionError> {
        let (stream_id, mode, end_stream) = (pending.stream_id, pending.mode, pending.end_stream);
        let block = pending.into_block();

        let kind = match mode {
            ReadHeadersMode::Skip => {
                // still has to go through the decoder, its table must stay in sync
                self.hpack_dec
                    .decode(&block, true, &mut |_: &[u8], _: &[u8]| {})
                    .map_err(H2ConnectionError::HpackDecodingError)?;
                return Ok(());
            }
            ReadHeadersMode::Process(kind) => kind,
        };

        let mut collector = HeaderCollector::new(kind, self.conf.header_limits());
        self.hpack_dec
            .decode(&block, true, &mut |k: &[u8], v: &[u8]| {
                collector.on_field(k, v)
            })
            .map_err(H2ConnectionError::HpackDecodingError)?;

        match kind {
            HeadersOrTrailers::Headers => match collector.into_request() {
                Ok((req, content_length)) => {
                    self.open_stream(stream_id, req, content_length, end_stream)
                        .await
                }
                Err(H2ErrorLevel::Connection(e)) => Err(e),
                Err(H2ErrorLevel::Stream(e)) => self.rst(stream_id, e).await,
                Err(H2ErrorLevel::Request(e)) => {
                    self.respond_with_error(stream_id, e, end_stream).await
                }
            },
            HeadersOrTrailers::Trailers => {
                let trailers = collector.into_trailers();
                let Some(incoming) = self
                    .state
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|ss| ss.incoming_mut())
                else {
                    return Ok(());
                };

                match trailers.and_then(|trailers| incoming.write_trailers(trailers)) {
                    Ok(()) => {
                        self.on_end_stream_received(stream_id);
                        Ok(())
                    }
                    Err(e) => self.rst(stream_id, e).await,
                }
            }
        }
    }

    async fn open_stream(
        &mut self,
        stream_id: StreamId,
        mut req: Request,
        content_length: Option<u64>,
        end_stream: bool,
    ) -> Result<(), H2ConnectionError> {
        if self.goaway_sent {
            debug!(%stream_id, "Refusing stream, we're shutting down");
            return self.refuse_stream(stream_id).await;
        }
        if end_stream {
            if let Some(declared) = content_length.filter(|&declared| declared > 0) {
                return self
                    .rst(
                        stream_id,
                        H2StreamError::LessDataThanDeclared {
                            received: 0,
                            declared,
                        },
                    )
                    .await;
            }
        }

        self.state.last_processed_stream_id = stream_id;

        let shared = Rc::new(StreamShared::new(
            self.conf.max_request_body_size,
            self.conf.min_request_body_data_rate,
            self.conf.min_response_data_rate,
        ));
        req.controls = StreamControls(shared.clone());

        let (piece_tx, piece_rx) = mpsc::unbounded_channel::<IncomingMessageResult>();
        let outgoing = self.state.mk_stream_outgoing(shared.clone());
        let ss = if end_stream {
            StreamState::HalfClosedRemote { outgoing }
        } else {
            StreamState::Open {
                incoming: StreamIncoming::new(
                    self.state.self_settings.initial_window_size,
                    content_length,
                    piece_tx,
                    shared.clone(),
                ),
                outgoing,
            }
        };
        self.state.streams.insert(stream_id, ss);
        debug!(
            "Accepted stream {stream_id} ({} {}), now have {} streams",
            req.method,
            req.raw_target(),
            self.state.streams.len()
        );

        let mut req_body = H2Body {
            stream_id,
            content_length: if end_stream { Some(0) } else { content_length },
            eof: end_stream,
            rx: piece_rx,
            shared: shared.clone(),
            clock: self.conf.clock.clone(),
            ev_tx: self.ev_tx.clone(),
            read_total: 0,
        };
        let responder = Responder::new(H2Encoder::new(stream_id, self.ev_tx.clone(), shared));
        let driver = self.driver.clone();
        let ev_tx = self.ev_tx.clone();

        tokio::task::spawn_local(async move {
            let res = AssertUnwindSafe(driver.handle(req, &mut req_body, responder))
                .catch_unwind()
                .await;
            match res {
                Ok(Ok(_done)) => {
                    debug!(%stream_id, "Handler completed successfully, gave us a responder")
                }
                Ok(Err(e)) => debug!(%stream_id, "Handler returned an error: {e}"),
                Err(_) => warn!(%stream_id, "Handler panicked"),
            }

            // unread body bytes get refunded before the stream is let go
            drop(req_body);
            let _ = ev_tx.send(H2Event {
                stream_id,
                payload: H2EventPayload::HandlerDone,
            });
        });

        Ok(())
    }

    /// Answer a request we won't hand to the application (431 and friends)
    async fn respond_with_error(
        &mut self,
        stream_id: StreamId,
        e: H2RequestError,
        end_stream: bool,
    ) -> Result<(), H2ConnectionError> {
        debug!(?e, %stream_id, "Responding to stream with error");
        self.conf.observer.request_rejected(stream_id, e.reason);
        self.state.last_processed_stream_id = stream_id;

        let shared = Rc::new(StreamShared::default());
        // no handler will ever run
        shared.handler_done.set(true);

        let mut outgoing = self.state.mk_stream_outgoing(shared.clone());
        outgoing.wrote_headers = true;
        outgoing.body = BodyOutgoing::DoneReceiving {
            chunks: [QueuedChunk {
                data: e.message.clone(),
                ack: None,
            }]
            .into(),
            trailers: None,
        };

        let ss = if end_stream {
            StreamState::HalfClosedRemote { outgoing }
        } else {
            // nobody reads the body, everything that arrives gets refunded
            let (tx, _) = mpsc::unbounded_channel();
            StreamState::Open {
                incoming: StreamIncoming::new(
                    self.state.self_settings.initial_window_size,
                    None,
                    tx,
                    shared,
                ),
                outgoing,
            }
        };
        self.state.streams.insert(stream_id, ss);

        let mut res = Response::with_status(e.status);
        res.headers.insert(
            header::CONTENT_TYPE,
            Bytes::from_static(b"text/plain; charset=utf-8"),
        );
        res.headers.insert(
            header::CONTENT_LENGTH,
            Bytes::from(e.message.len().to_string()),
        );
        let fields = response_fields(&res);
        self.write_header_block(stream_id, &fields, false).await?;
        self.state.streams_with_pending_data.insert(stream_id);

        Ok(())
    }

    async fn on_rst_stream(&mut self, frame: Frame, rst: RstStream) -> Result<(), H2ConnectionError> {
        let stream_id = frame.stream_id;
        if stream_id == StreamId::CONNECTION {
            return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }

        let now = self.conf.clock.now();
        match self.state.stream_phase(stream_id, now) {
            StreamPhase::Idle => Err(H2ConnectionError::FrameForIdleStream {
                frame_type: frame.frame_type,
                stream_id,
            }),
            StreamPhase::Closed | StreamPhase::Reset => {
                debug!(%stream_id, "Ignoring RstStream for a closed stream");
                Ok(())
            }
            _ => {
                let error_code = rst.error_code;
                debug!(%stream_id, ?error_code, "Received RstStream");
                if let Some(mut ss) = self.forget_stream(stream_id, true) {
                    if let Some(incoming) = ss.incoming_mut() {
                        incoming.send_error(StreamIncomingError::StreamReset);
                    }
                }

                if error_code != ErrorCode::from(KnownErrorCode::NoError) {
                    self.conf
                        .observer
                        .stream_aborted(stream_id, error_code, "reset by peer");
                }
                Ok(())
            }
        }
    }

    async fn on_settings(
        &mut self,
        frame: Frame,
        pairs: Vec<(Setting, u32)>,
    ) -> Result<(), H2ConnectionError> {
        if frame.stream_id != StreamId::CONNECTION {
            return Err(H2ConnectionError::SettingsWithNonZeroStreamId {
                stream_id: frame.stream_id,
            });
        }

        if frame.is_ack() {
            debug!("Peer has acknowledged our settings, cool");
            return Ok(());
        }

        let old_initial_window_size = self.state.peer_settings.initial_window_size;
        for (setting, value) in pairs {
            self.state
                .peer_settings
                .apply(setting, value)
                .map_err(H2ConnectionError::BadSettingValue)?;
            if setting == Setting::HeaderTableSize {
                self.hpack_enc.set_max_table_size(value as usize);
            }
        }

        let delta = self.state.peer_settings.initial_window_size as i64
            - old_initial_window_size as i64;
        if delta != 0 {
            debug!(%delta, "initial window size changed, adjusting streams");
            for (&stream_id, ss) in self.state.streams.iter_mut() {
                if let Some(outgoing) = ss.outgoing_mut() {
                    outgoing.window.adjust(delta).map_err(|_| {
                        H2ConnectionError::StreamWindowSizeOverflowDueToSettings { stream_id }
                    })?;
                }
            }
        }

        debug!(settings = ?self.state.peer_settings, "Acknowledging peer settings");
        self.write_frame(
            Frame::new(
                FrameType::Settings(SettingsFlags::Ack.into()),
                StreamId::CONNECTION,
            ),
            FramePayload::Settings(Vec::new()),
        )
        .await
    }

    async fn on_window_update(
        &mut self,
        frame: Frame,
        update: WindowUpdate,
    ) -> Result<(), H2ConnectionError> {
        let stream_id = frame.stream_id;
        let increment = update.increment;
        debug!(?update, "Received window update");

        if stream_id == StreamId::CONNECTION {
            if increment == 0 {
                return Err(H2ConnectionError::WindowUpdateZeroIncrement);
            }
            self.state
                .outbound
                .expand(increment)
                .map_err(|_| H2ConnectionError::WindowUpdateOverflow)?;
            debug!(conn_window = %self.state.outbound.available(), "connection window update");
            return Ok(());
        }

        let now = self.conf.clock.now();
        match self.state.stream_phase(stream_id, now) {
            StreamPhase::Idle => {
                return Err(H2ConnectionError::FrameForIdleStream {
                    frame_type: frame.frame_type,
                    stream_id,
                })
            }
            StreamPhase::Closed | StreamPhase::Reset => {
                trace!(%stream_id, "Ignoring window update for a closed stream");
                return Ok(());
            }
            _ => {}
        }

        if increment == 0 {
            return self
                .rst(stream_id, H2StreamError::WindowUpdateZeroIncrement)
                .await;
        }

        let Some(outgoing) = self
            .state
            .streams
            .get_mut(&stream_id)
            .and_then(|ss| ss.outgoing_mut())
        else {
            // half-closed (local), we're done sending anyway
            return Ok(());
        };
        if outgoing.window.expand(increment).is_err() {
            return self
                .rst(stream_id, H2StreamError::WindowUpdateOverflow)
                .await;
        }
        debug!(%stream_id, window = %outgoing.window.available(), "stream window update");

        Ok(())
    }

    fn on_end_stream_received(&mut self, stream_id: StreamId) {
        let Some(ss) = self.state.streams.get_mut(&stream_id) else {
            return;
        };
        match std::mem::take(ss) {
            StreamState::Open { outgoing, .. } => {
                trace!(%stream_id, "end of request body");
                *ss = StreamState::HalfClosedRemote { outgoing };
            }
            StreamState::HalfClosedLocal { .. } => {
                self.forget_stream(stream_id, false);
            }
            other => *ss = other,
        }
    }

    async fn on_end_stream_sent(&mut self, stream_id: StreamId) -> Result<(), H2ConnectionError> {
        self.state.streams_with_pending_data.remove(&stream_id);
        let Some(ss) = self.state.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        match std::mem::take(ss) {
            StreamState::Open { incoming, .. } => {
                let handler_done = incoming.shared.handler_done.get();
                *ss = StreamState::HalfClosedLocal { incoming };
                if handler_done {
                    self.reset_stream(stream_id, KnownErrorCode::NoError, "response complete")
                        .await?;
                }
            }
            StreamState::HalfClosedRemote { .. } => {
                self.forget_stream(stream_id, false);
            }
            other => *ss = other,
        }
        Ok(())
    }

    async fn release_connection_window(&mut self, len: u32) -> Result<(), H2ConnectionError> {
        if let Some(increment) = self.state.inbound.release(len) {
            self.write_window_update(StreamId::CONNECTION, increment)
                .await?;
        }
        Ok(())
    }

    async fn release_stream_window(
        &mut self,
        stream_id: StreamId,
        len: u32,
    ) -> Result<(), H2ConnectionError> {
        let increment = self
            .state
            .streams
            .get_mut(&stream_id)
            .and_then(|ss| ss.incoming_mut())
            .and_then(|incoming| incoming.window.release(len));
        if let Some(increment) = increment {
            self.write_window_update(stream_id, increment).await?;
        }
        Ok(())
    }

    /// Remove a stream, remembering it for the cooldown
    fn forget_stream(&mut self, stream_id: StreamId, was_reset: bool) -> Option<StreamState> {
        let ss = self.state.streams.remove(&stream_id);
        self.state.streams_with_pending_data.remove(&stream_id);

        let now = self.conf.clock.now();
        self.state.recently_closed.insert(
            stream_id,
            now + self.conf.stream_reset_cooldown,
            was_reset,
        );
        if self.state.streams.is_empty() {
            self.idle_since = now;
        }

        debug!(
            "Closed stream {stream_id} ({}), now have {} streams",
            if was_reset { "reset" } else { "done" },
            self.state.streams.len()
        );
        ss
    }

    /// Send RST_STREAM and let go of the stream.
    async fn reset_stream(
        &mut self,
        stream_id: StreamId,
        code: KnownErrorCode,
        reason: &str,
    ) -> Result<(), H2ConnectionError> {
        debug!(%stream_id, ?code, %reason, "Sending RstStream");
        if let Some(mut ss) = self.forget_stream(stream_id, true) {
            if let Some(incoming) = ss.incoming_mut() {
                incoming.send_error(StreamIncomingError::StreamReset);
            }
        }

        self.write_frame(
            Frame::new(FrameType::RstStream, stream_id),
            FramePayload::RstStream(RstStream {
                error_code: code.into(),
            }),
        )
        .await
    }

    /// Reset a stream the peer misbehaved on
    async fn rst(&mut self, stream_id: StreamId, e: H2StreamError) -> Result<(), H2ConnectionError> {
        let code = e.as_known_error_code();
        let reason = e.to_string();
        debug!("Sending rst because: {e} (known error code: {code:?})");

        self.conf.observer.stream_error(stream_id, code, &reason);
        self.reset_stream(stream_id, code, &reason).await?;
        self.conf
            .observer
            .stream_aborted(stream_id, code.into(), &reason);
        Ok(())
    }

    async fn refuse_stream(&mut self, stream_id: StreamId) -> Result<(), H2ConnectionError> {
        let reason = H2StreamError::RefusedStream.to_string();
        self.conf
            .observer
            .request_rejected(stream_id, RejectionReason::RefusedStream);
        self.reset_stream(stream_id, KnownErrorCode::RefusedStream, &reason)
            .await?;
        self.conf
            .observer
            .stream_aborted(stream_id, KnownErrorCode::RefusedStream.into(), &reason);
        Ok(())
    }
}

/// Read the connection preface, giving up after `timeout`.
async fn read_preface(
    transport_r: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<Preface, H2ConnectionError> {
    let read = async {
        loop {
            match strom_h2::preface(&buf[..]) {
                Ok(_) => return Ok(Preface::Valid),
                Err(nom::Err::Incomplete(_)) => {}
                Err(_) => {
                    debug!(got = ?&buf[..], "invalid connection preface");
                    return Ok(Preface::Invalid);
                }
            }

            buf.reserve(READ_RESERVE);
            let n = transport_r
                .read_buf(buf)
                .await
                .map_err(H2ConnectionError::ReadError)?;
            if n == 0 {
                debug!(read = %buf.len(), "Peer hung up before sending the preface");
                return Ok(Preface::Missing);
            }
        }
    };

    match tokio::time::timeout(timeout, read).await {
        Ok(res) => res,
        Err(_) => {
            debug!("No preface within the keep-alive timeout");
            Ok(Preface::Missing)
        }
    }
}

async fn deframe_loop(
    mut transport_r: impl AsyncRead + Unpin,
    mut client_buf: BytesMut,
    max_frame_size: u32,
    tx: mpsc::Sender<Result<(Frame, FramePayload), H2ConnectionError>>,
) {
    loop {
        match try_read_frame(&mut client_buf, max_frame_size) {
            Ok(Some((frame, payload))) => {
                debug!(?frame, "<");
                if tx.send(Ok((frame, payload))).await.is_err() {
                    debug!("h2 deframer: receiver dropped, closing connection");
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                debug!("h2 deframer: {e}");
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }

        trace!("Reading frame... Buffer length: {}", client_buf.len());
        client_buf.reserve(READ_RESERVE);
        match transport_r.read_buf(&mut client_buf).await {
            Ok(0) => {
                debug!("Peer hung up");
                return;
            }
            Ok(n) => trace!("Read {n} bytes"),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("Peer reset the connection");
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(H2ConnectionError::ReadError(e))).await;
                return;
            }
        }
    }
}
