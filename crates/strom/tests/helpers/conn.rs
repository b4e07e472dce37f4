//! A frame-level HTTP/2 client, good for poking at the server one frame at
//! a time.

use std::{future::Future, rc::Rc, time::Duration};

use bytes::{Bytes, BytesMut};
use eyre::{bail, ensure, eyre};
use strom::{
    error::ServeError,
    h2::{
        hpack::{EncodeProgress, HeaderBlockDecoder, HeaderBlockEncoder, HpackDecoder, HpackEncoder},
        ServerConf,
    },
    strom_h2::{
        enumflags2::BitFlags, try_read_frame, write_frame, ContinuationFlags, DataFlags, ErrorCode,
        Frame, FramePayload, FrameType, GoAway, HeadersFlags, KnownErrorCode, PingFlags,
        RstStream, Setting, SettingsFlags, StreamId, WindowUpdate, PREFACE,
    },
    ServeOutcome, ServerDriver,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
};
use tracing::debug;

/// How long we wait for the server to say something
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) type ServeResult<D> = Result<ServeOutcome, ServeError<<D as ServerDriver>::Error>>;

/// Serve a fresh connection on a `spawn_local` task, returning the client
/// end.
pub(crate) fn start<D: ServerDriver + 'static>(
    conf: ServerConf,
    driver: D,
) -> (Conn, JoinHandle<ServeResult<D>>) {
    start_with_shutdown(conf, driver, std::future::pending())
}

pub(crate) fn start_with_shutdown<D: ServerDriver + 'static>(
    conf: ServerConf,
    driver: D,
    shutdown: impl Future<Output = ()> + 'static,
) -> (Conn, JoinHandle<ServeResult<D>>) {
    spawn_server(conf, driver, shutdown, 1 << 20)
}

/// Like [start], but the pipe between client and server only buffers
/// `pipe_size` bytes: a client that stops reading stalls the server's writes.
pub(crate) fn start_with_pipe_size<D: ServerDriver + 'static>(
    conf: ServerConf,
    driver: D,
    pipe_size: usize,
) -> (Conn, JoinHandle<ServeResult<D>>) {
    spawn_server(conf, driver, std::future::pending(), pipe_size)
}

fn spawn_server<D: ServerDriver + 'static>(
    conf: ServerConf,
    driver: D,
    shutdown: impl Future<Output = ()> + 'static,
    pipe_size: usize,
) -> (Conn, JoinHandle<ServeResult<D>>) {
    let (client, server) = tokio::io::duplex(pipe_size);
    let task = tokio::task::spawn_local(async move {
        strom::h2::serve_with_shutdown(
            tokio::io::split(server),
            Rc::new(conf),
            Rc::new(driver),
            shutdown,
        )
        .await
    });
    (Conn::new(client), task)
}

/// Wait for the server task and flatten its result
pub(crate) async fn outcome<D: ServerDriver + 'static>(
    task: JoinHandle<ServeResult<D>>,
) -> eyre::Result<ServeOutcome> {
    task.await?.map_err(|e| eyre!("serve failed: {e}"))
}

pub(crate) type Fields = Vec<(String, String)>;

/// A response as a client sees it
#[derive(Debug, Default)]
pub(crate) struct ClientResponse {
    pub(crate) headers: Fields,
    pub(crate) body: Vec<u8>,
    /// Length of every DATA frame, in order
    pub(crate) data_frames: Vec<usize>,
    pub(crate) trailers: Fields,
}

impl ClientResponse {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name)
    }

    pub(crate) fn status(&self) -> Option<&str> {
        self.header(":status")
    }

    pub(crate) fn trailer(&self, name: &str) -> Option<&str> {
        find(&self.trailers, name)
    }
}

fn find<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

pub(crate) struct Conn {
    io: DuplexStream,
    buf: BytesMut,
    enc: HpackEncoder,
    dec: HpackDecoder,

    /// What the server advertised in its first SETTINGS frame
    pub(crate) server_settings: Vec<(Setting, u32)>,
}

impl Conn {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buf: BytesMut::new(),
            enc: HpackEncoder::default(),
            dec: HpackDecoder::new(4096),
            server_settings: Vec::new(),
        }
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> eyre::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub(crate) async fn write_frame(
        &mut self,
        frame: Frame,
        payload: FramePayload,
    ) -> eyre::Result<()> {
        debug!(?frame, "client >");
        let mut out = BytesMut::new();
        write_frame(frame, &payload, &mut out);
        self.send(&out).await
    }

    /// Preface, SETTINGS both ways, and their acknowledgements.
    pub(crate) async fn handshake(&mut self) -> eyre::Result<()> {
        self.handshake_with_settings(Vec::new()).await
    }

    pub(crate) async fn handshake_with_settings(
        &mut self,
        settings: Vec<(Setting, u32)>,
    ) -> eyre::Result<()> {
        self.send(PREFACE).await?;
        self.write_frame(
            Frame::new(FrameType::Settings(Default::default()), StreamId::CONNECTION),
            FramePayload::Settings(settings),
        )
        .await?;

        let (mut got_settings, mut got_ack) = (false, false);
        while !(got_settings && got_ack) {
            let (frame, payload) = self.read_frame().await?;
            match payload {
                FramePayload::Settings(_) if frame.is_ack() => got_ack = true,
                FramePayload::Settings(pairs) => {
                    self.server_settings = pairs;
                    got_settings = true;
                    self.write_frame(
                        Frame::new(
                            FrameType::Settings(SettingsFlags::Ack.into()),
                            StreamId::CONNECTION,
                        ),
                        FramePayload::Settings(Vec::new()),
                    )
                    .await?;
                }
                FramePayload::WindowUpdate(_) => {}
                other => bail!("unexpected frame during handshake: {frame:?} {other:?}"),
            }
        }
        Ok(())
    }

    pub(crate) fn encode_headers(&mut self, fields: &[(&str, &str)]) -> eyre::Result<Bytes> {
        let fields: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|(k, v)| (k.as_bytes(), v.as_bytes()))
            .collect();
        let (block, progress) = self.enc.begin_encode(&fields, usize::MAX)?;
        ensure!(progress == EncodeProgress::Done, "header block left behind");
        Ok(block)
    }

    pub(crate) fn decode_headers(&mut self, block: &[u8]) -> eyre::Result<Fields> {
        let mut fields = Vec::new();
        self.dec
            .decode(block, true, &mut |k: &[u8], v: &[u8]| {
                fields.push((
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                ))
            })
            .map_err(|e| eyre!("hpack decoding error: {e:?}"))?;
        Ok(fields)
    }

    pub(crate) async fn write_headers(
        &mut self,
        stream_id: StreamId,
        flags: BitFlags<HeadersFlags>,
        fragment: Bytes,
    ) -> eyre::Result<()> {
        self.write_frame(
            Frame::new(FrameType::Headers(flags), stream_id),
            FramePayload::Headers {
                priority: None,
                fragment,
            },
        )
        .await
    }

    pub(crate) async fn write_continuation(
        &mut self,
        stream_id: StreamId,
        end_headers: bool,
        fragment: Bytes,
    ) -> eyre::Result<()> {
        let mut flags = BitFlags::<ContinuationFlags>::default();
        if end_headers {
            flags |= ContinuationFlags::EndHeaders;
        }
        self.write_frame(
            Frame::new(FrameType::Continuation(flags), stream_id),
            FramePayload::Continuation(fragment),
        )
        .await
    }

    /// A whole request header block in a single HEADERS frame
    pub(crate) async fn send_request(
        &mut self,
        stream_id: StreamId,
        fields: &[(&str, &str)],
        end_stream: bool,
    ) -> eyre::Result<()> {
        let block = self.encode_headers(fields)?;
        let mut flags: BitFlags<HeadersFlags> = HeadersFlags::EndHeaders.into();
        if end_stream {
            flags |= HeadersFlags::EndStream;
        }
        self.write_headers(stream_id, flags, block).await
    }

    pub(crate) async fn write_data(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        data: impl Into<Bytes>,
    ) -> eyre::Result<()> {
        let mut flags = BitFlags::<DataFlags>::default();
        if end_stream {
            flags |= DataFlags::EndStream;
        }
        self.write_frame(
            Frame::new(FrameType::Data(flags), stream_id),
            FramePayload::Data(data.into()),
        )
        .await
    }

    pub(crate) async fn write_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> eyre::Result<()> {
        self.write_frame(
            Frame::new(FrameType::WindowUpdate, stream_id),
            FramePayload::WindowUpdate(WindowUpdate {
                reserved: 0,
                increment,
            }),
        )
        .await
    }

    pub(crate) async fn write_rst_stream(
        &mut self,
        stream_id: StreamId,
        code: KnownErrorCode,
    ) -> eyre::Result<()> {
        self.write_frame(
            Frame::new(FrameType::RstStream, stream_id),
            FramePayload::RstStream(RstStream {
                error_code: code.into(),
            }),
        )
        .await
    }

    pub(crate) async fn write_ping(&mut self, ack: bool, payload: [u8; 8]) -> eyre::Result<()> {
        let mut flags = BitFlags::<PingFlags>::default();
        if ack {
            flags |= PingFlags::Ack;
        }
        self.write_frame(
            Frame::new(FrameType::Ping(flags), StreamId::CONNECTION),
            FramePayload::Ping(payload),
        )
        .await
    }

    /// Send a PING and expect its ACK to be the next thing the server says,
    /// window updates aside. Proves the server processed everything sent
    /// before it.
    pub(crate) async fn verify_ping_roundtrip(&mut self) -> eyre::Result<()> {
        let payload = *b"roundtr!";
        self.write_ping(false, payload).await?;
        loop {
            let (frame, payload_in) = self.read_frame().await?;
            match payload_in {
                FramePayload::Ping(p) if frame.is_ack() => {
                    ensure!(p == payload, "ping ack with unexpected payload {p:?}");
                    return Ok(());
                }
                FramePayload::WindowUpdate(_) => {}
                other => bail!("expected PING ack, got {frame:?} {other:?}"),
            }
        }
    }

    pub(crate) async fn read_frame(&mut self) -> eyre::Result<(Frame, FramePayload)> {
        tokio::time::timeout(READ_TIMEOUT, self.read_frame_inner())
            .await
            .map_err(|_| eyre!("timed out waiting for a frame"))?
    }

    async fn read_frame_inner(&mut self) -> eyre::Result<(Frame, FramePayload)> {
        loop {
            if let Some((frame, payload)) = try_read_frame(&mut self.buf, (1 << 24) - 1)? {
                debug!(?frame, "client <");
                return Ok((frame, payload));
            }

            self.buf.reserve(16 * 1024);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                bail!("server closed the connection");
            }
        }
    }

    /// Skip frames until one matches
    pub(crate) async fn wait_for_frame(
        &mut self,
        mut pred: impl FnMut(&Frame, &FramePayload) -> bool,
    ) -> eyre::Result<(Frame, FramePayload)> {
        loop {
            let (frame, payload) = self.read_frame().await?;
            if pred(&frame, &payload) {
                return Ok((frame, payload));
            }
            debug!(?frame, "skipping frame");
        }
    }

    /// Read the whole response for `stream_id`: headers, body, trailers.
    pub(crate) async fn read_response(
        &mut self,
        stream_id: StreamId,
    ) -> eyre::Result<ClientResponse> {
        let mut res = ClientResponse::default();
        let mut got_headers = false;

        loop {
            let (frame, payload) = self.read_frame().await?;
            match payload {
                FramePayload::Headers { fragment, .. } => {
                    ensure!(
                        frame.stream_id == stream_id,
                        "HEADERS for stream {}, expected {stream_id}",
                        frame.stream_id
                    );
                    let end_stream = frame.is_end_stream();
                    let fields = self.finish_header_block(frame, fragment).await?;
                    if got_headers {
                        res.trailers = fields;
                    } else {
                        res.headers = fields;
                        got_headers = true;
                    }
                    if end_stream {
                        return Ok(res);
                    }
                }
                FramePayload::Data(data) => {
                    ensure!(
                        frame.stream_id == stream_id,
                        "DATA for stream {}, expected {stream_id}",
                        frame.stream_id
                    );
                    res.data_frames.push(data.len());
                    res.body.extend_from_slice(&data);
                    if frame.is_end_stream() {
                        return Ok(res);
                    }
                }
                FramePayload::WindowUpdate(_) | FramePayload::Ping(_) => {}
                FramePayload::RstStream(rst) => {
                    bail!("stream {} reset: {:?}", frame.stream_id, rst.error_code)
                }
                other => bail!("unexpected frame while reading response: {frame:?} {other:?}"),
            }
        }
    }

    async fn finish_header_block(&mut self, frame: Frame, fragment: Bytes) -> eyre::Result<Fields> {
        let mut block = BytesMut::from(&fragment[..]);
        let mut end_headers = frame.is_end_headers();
        while !end_headers {
            let (frame, payload) = self.read_frame().await?;
            let FramePayload::Continuation(fragment) = payload else {
                bail!("expected CONTINUATION, got {frame:?}");
            };
            block.extend_from_slice(&fragment);
            end_headers = frame.is_end_headers();
        }
        self.decode_headers(&block)
    }

    /// Expect RST_STREAM with `code` on `stream_id`, skipping connection
    /// housekeeping frames.
    pub(crate) async fn verify_stream_error(
        &mut self,
        stream_id: StreamId,
        code: KnownErrorCode,
    ) -> eyre::Result<()> {
        loop {
            let (frame, payload) = self.read_frame().await?;
            match payload {
                FramePayload::RstStream(rst) => {
                    ensure!(
                        frame.stream_id == stream_id,
                        "RST_STREAM for stream {}, expected {stream_id}",
                        frame.stream_id
                    );
                    ensure!(
                        rst.error_code == ErrorCode::from(code),
                        "expected {code:?}, got {:?}",
                        rst.error_code
                    );
                    return Ok(());
                }
                FramePayload::GoAway(goaway) => bail!(
                    "expected stream error {code:?}, got GOAWAY {:?} ({})",
                    goaway.error_code,
                    String::from_utf8_lossy(&goaway.additional_debug_data)
                ),
                FramePayload::WindowUpdate(_) | FramePayload::Ping(_) | FramePayload::Settings(_) => {}
                other => bail!("expected RST_STREAM, got {frame:?} {other:?}"),
            }
        }
    }

    /// Expect GOAWAY with `code`, skipping anything before it.
    pub(crate) async fn verify_connection_error(
        &mut self,
        code: KnownErrorCode,
    ) -> eyre::Result<GoAway> {
        let (_, payload) = self
            .wait_for_frame(|_, payload| matches!(payload, FramePayload::GoAway(_)))
            .await?;
        let FramePayload::GoAway(goaway) = payload else {
            unreachable!()
        };
        ensure!(
            goaway.error_code == ErrorCode::from(code),
            "expected GOAWAY {code:?}, got {:?} ({})",
            goaway.error_code,
            String::from_utf8_lossy(&goaway.additional_debug_data)
        );
        Ok(goaway)
    }

    /// Expect the server to close its end.
    pub(crate) async fn verify_closed(&mut self) -> eyre::Result<()> {
        loop {
            match self.read_frame().await {
                Ok((frame, _)) => debug!(?frame, "draining before close"),
                Err(e) if e.to_string().contains("closed the connection") => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
