//! Canned request handlers and an observer that remembers everything.

use std::{cell::RefCell, fmt, io};

use bytes::Bytes;
use http::{header, HeaderName, StatusCode};
use strom::{
    h2::SinglePieceBody,
    observe::{Observer, RejectionReason, TimeoutReason},
    strom_h2::{ErrorCode, KnownErrorCode, StreamId},
    Body, BodyChunk, Encoder, ExpectResponseHeaders, Request, Responder, ResponderError,
    ResponseDone, Response, ServerDriver,
};
use tokio::sync::mpsc;

type HandleResult<E> = Result<Responder<E, ResponseDone>, io::Error>;

fn other(e: impl fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// Responds 200 with a fixed body, written as a single chunk.
pub(crate) struct StaticDriver {
    pub(crate) body: Bytes,
    /// Announce the body length with content-length
    pub(crate) sized: bool,
    pub(crate) trailers: Vec<(&'static str, &'static str)>,
}

impl StaticDriver {
    pub(crate) fn new(body: &'static str) -> Self {
        Self {
            body: Bytes::from_static(body.as_bytes()),
            sized: false,
            trailers: Vec::new(),
        }
    }
}

impl ServerDriver for StaticDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        _req: Request,
        _req_body: &mut impl Body,
        mut respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        for &(name, value) in &self.trailers {
            respond.append_trailer(
                HeaderName::from_static(name),
                Bytes::from_static(value.as_bytes()),
            );
        }

        if self.sized {
            return respond
                .write_final_response_with_body(
                    Response::default(),
                    &mut SinglePieceBody::new(self.body.clone()),
                )
                .await
                .map_err(other);
        }

        let mut respond = respond
            .write_final_response(Response::default())
            .map_err(other)?;
        respond.write_chunk(self.body.clone()).await.map_err(other)?;
        respond.finish_body(None).await.map_err(other)
    }
}

/// Reads the whole request body, then sends it back.
pub(crate) struct EchoDriver {
    pub(crate) log: mpsc::UnboundedSender<String>,
}

impl EchoDriver {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (log, rx) = mpsc::unbounded_channel();
        (Self { log }, rx)
    }
}

impl ServerDriver for EchoDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        req: Request,
        req_body: &mut impl Body,
        respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        let _ = self.log.send(format!("{} {}", req.method, req.raw_target()));

        let mut body = Vec::new();
        let mut req_trailers = 0;
        loop {
            match req_body.next_chunk().await {
                Ok(BodyChunk::Chunk(chunk)) => body.extend_from_slice(&chunk),
                Ok(BodyChunk::Done { trailers }) => {
                    req_trailers = trailers.map(|t| t.len()).unwrap_or_default();
                    break;
                }
                Err(e) => {
                    let _ = self.log.send(format!("read error: {e}"));
                    return Err(other(e));
                }
            }
        }
        let _ = self.log.send(format!("read {} bytes", body.len()));

        let mut res = Response::default();
        res.headers.insert(
            HeaderName::from_static("x-request-trailers"),
            Bytes::from(req_trailers.to_string()),
        );
        let mut respond = respond.write_final_response(res).map_err(other)?;
        respond.write_chunk(body.into()).await.map_err(other)?;
        respond.finish_body(None).await.map_err(other)
    }
}

/// Announces a content-length of 11, then writes 12 bytes.
pub(crate) struct OverlongDriver {
    pub(crate) log: mpsc::UnboundedSender<String>,
}

impl ServerDriver for OverlongDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        _req: Request,
        _req_body: &mut impl Body,
        respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        let mut res = Response::default();
        res.headers
            .insert(header::CONTENT_LENGTH, Bytes::from_static(b"11"));
        let mut respond = respond.write_final_response(res).map_err(other)?;

        let res = respond
            .write_chunk(Bytes::from_static(b"hello world!"))
            .await;
        let _ = self.log.send(format!("{res:?}"));
        res.map_err(other)?;
        respond.finish_body(None).await.map_err(other)
    }
}

/// Responds with a single header whose value is `len` times `^`.
pub(crate) struct BigHeaderDriver {
    pub(crate) len: usize,
}

impl ServerDriver for BigHeaderDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        _req: Request,
        _req_body: &mut impl Body,
        respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        let mut res = Response::default();
        res.headers.insert(
            HeaderName::from_static("x-big"),
            Bytes::from("^".repeat(self.len)),
        );
        respond
            .write_final_response(res)
            .map_err(other)?
            .finish_body(None)
            .await
            .map_err(other)
    }
}

/// Registers `on_starting` callbacks before and after the response is
/// recorded, and once more after it started.
pub(crate) struct OnStartingDriver {
    pub(crate) log: mpsc::UnboundedSender<String>,
}

impl ServerDriver for OnStartingDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        _req: Request,
        _req_body: &mut impl Body,
        mut respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        let x_order = HeaderName::from_static("x-order");

        let name = x_order.clone();
        respond.on_starting(move |res| {
            res.headers.insert(name, Bytes::from_static(b"1"));
        });

        let mut respond = respond
            .write_final_response(Response::default())
            .map_err(other)?;
        let name = x_order.clone();
        respond
            .on_starting(move |res| {
                let prev = res
                    .headers
                    .get(&name)
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                res.headers.insert(name, Bytes::from(format!("{prev},2")));
            })
            .map_err(other)?;

        respond
            .write_chunk(Bytes::from_static(b"started"))
            .await
            .map_err(other)?;

        match respond.on_starting(|res| res.status = StatusCode::IM_A_TEAPOT) {
            Err(ResponderError::AlreadyStarted) => {
                let _ = self.log.send("already started".to_owned());
            }
            res => {
                let _ = self.log.send(format!("late registration: {res:?}"));
            }
        }

        respond.finish_body(None).await.map_err(other)
    }
}

/// Never responds: panics right away.
pub(crate) struct PanicDriver;

impl ServerDriver for PanicDriver {
    type Error = io::Error;

    async fn handle<E: Encoder>(
        &self,
        _req: Request,
        _req_body: &mut impl Body,
        _respond: Responder<E, ExpectResponseHeaders>,
    ) -> HandleResult<E> {
        panic!("handler blew up");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observed {
    StreamAborted {
        stream_id: StreamId,
        code: ErrorCode,
        reason: String,
    },
    StreamError {
        stream_id: StreamId,
        code: KnownErrorCode,
    },
    ConnectionError {
        code: KnownErrorCode,
        last_stream_id: StreamId,
    },
    Timeout(TimeoutReason),
    Rejected {
        stream_id: StreamId,
        reason: RejectionReason,
    },
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) events: RefCell<Vec<Observed>>,
}

impl RecordingObserver {
    pub(crate) fn aborts_for(&self, stream_id: StreamId) -> Vec<Observed> {
        self.events
            .borrow()
            .iter()
            .filter(|ev| matches!(ev, Observed::StreamAborted { stream_id: id, .. } if *id == stream_id))
            .cloned()
            .collect()
    }

    pub(crate) fn saw(&self, ev: &Observed) -> bool {
        self.events.borrow().contains(ev)
    }
}

impl Observer for RecordingObserver {
    fn stream_aborted(&self, stream_id: StreamId, code: ErrorCode, reason: &str) {
        self.events.borrow_mut().push(Observed::StreamAborted {
            stream_id,
            code,
            reason: reason.to_owned(),
        });
    }

    fn stream_error(&self, stream_id: StreamId, code: KnownErrorCode, _reason: &str) {
        self.events
            .borrow_mut()
            .push(Observed::StreamError { stream_id, code });
    }

    fn connection_error(&self, code: KnownErrorCode, last_stream_id: StreamId, _reason: &str) {
        self.events.borrow_mut().push(Observed::ConnectionError {
            code,
            last_stream_id,
        });
    }

    fn timeout(&self, reason: TimeoutReason) {
        self.events.borrow_mut().push(Observed::Timeout(reason));
    }

    fn request_rejected(&self, stream_id: StreamId, reason: RejectionReason) {
        self.events
            .borrow_mut()
            .push(Observed::Rejected { stream_id, reason });
    }
}
