use bytes::Bytes;
use http::{header, HeaderName, StatusCode};
use strom_h2::KnownErrorCode;
use tracing::debug;

use crate::{Body, BodyChunk, Headers, HeadersExt, Response};

pub trait ResponseState {}

pub struct ExpectResponseHeaders;
impl ResponseState for ExpectResponseHeaders {}

pub struct ExpectResponseBody {
    /// Known once the response started
    pub announced_content_length: Option<u64>,
    pub bytes_written: u64,
    /// The response, until it is handed to the encoder
    pending: Option<Response>,
}
impl ResponseState for ExpectResponseBody {}

pub struct ResponseDone;
impl ResponseState for ResponseDone {}

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ResponderError<EncoderError> {
    #[error("final response must have status code >= 200, got {actual}")]
    FinalResponseMustHaveStatusCodeGreaterThanOrEqualTo200 { actual: StatusCode },

    #[error("the response already started, its headers can't change anymore")]
    AlreadyStarted,

    #[error("too many bytes written ({actual} of {expected})")]
    TooManyBytesWritten { actual: u64, expected: u64 },

    #[error("too few bytes written ({actual} of {expected})")]
    TooFewBytesWritten { actual: u64, expected: u64 },

    #[error("encoder error: {0}")]
    EncoderError(#[from] EncoderError),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResponderOrBodyError<EncoderError, BodyError> {
    #[error("Responder error: {0}")]
    Responder(ResponderError<EncoderError>),
    #[error("Body error: {0}")]
    Body(#[from] BodyError),
}

type OnStarting = Box<dyn FnOnce(&mut Response)>;

pub struct Responder<OurEncoder, OurResponseState>
where
    OurEncoder: Encoder,
    OurResponseState: ResponseState,
{
    encoder: OurEncoder,
    state: OurResponseState,
    on_starting: Vec<OnStarting>,
    trailers: Option<Box<Headers>>,
}

impl<OurEncoder, OurResponseState> Responder<OurEncoder, OurResponseState>
where
    OurEncoder: Encoder,
    OurResponseState: ResponseState,
{
    fn with_state<NextState: ResponseState>(
        self,
        state: NextState,
    ) -> Responder<OurEncoder, NextState> {
        Responder {
            encoder: self.encoder,
            state,
            on_starting: self.on_starting,
            trailers: self.trailers,
        }
    }

    async fn reset_internal(
        mut self,
        code: KnownErrorCode,
        reason: String,
    ) -> ResponderResult<Responder<OurEncoder, ResponseDone>, OurEncoder::Error> {
        self.encoder.reset(code, reason).await?;
        Ok(self.with_state(ResponseDone))
    }
}

impl<OurEncoder> Responder<OurEncoder, ExpectResponseHeaders>
where
    OurEncoder: Encoder,
{
    pub fn new(encoder: OurEncoder) -> Self {
        Self {
            encoder,
            state: ExpectResponseHeaders,
            on_starting: Vec::new(),
            trailers: None,
        }
    }

    /// Register a callback that runs right before the response headers are
    /// sent, with a last chance to modify them. Callbacks run in
    /// registration order.
    pub fn on_starting(&mut self, f: impl FnOnce(&mut Response) + 'static) {
        self.on_starting.push(Box::new(f));
    }

    /// Add a trailer, sent after the body.
    pub fn append_trailer(&mut self, name: HeaderName, value: impl Into<Bytes>) {
        self.trailers
            .get_or_insert_with(Default::default)
            .append(name, value.into());
    }

    /// Record the final response. Nothing goes out until the first body
    /// chunk, an explicit [Responder::start], or [Responder::finish_body].
    pub fn write_final_response(
        self,
        res: Response,
    ) -> ResponderResult<Responder<OurEncoder, ExpectResponseBody>, OurEncoder::Error> {
        if res.status.is_informational() {
            return Err(
                ResponderError::FinalResponseMustHaveStatusCodeGreaterThanOrEqualTo200 {
                    actual: res.status,
                },
            );
        }

        Ok(self.with_state(ExpectResponseBody {
            announced_content_length: None,
            bytes_written: 0,
            pending: Some(res),
        }))
    }

    /// Writes a response with the given body. Sets `content-length` if the
    /// body knows its length.
    pub async fn write_final_response_with_body<TheirBody>(
        self,
        mut res: Response,
        body: &mut TheirBody,
    ) -> Result<
        Responder<OurEncoder, ResponseDone>,
        ResponderOrBodyError<OurEncoder::Error, TheirBody::Error>,
    >
    where
        TheirBody: Body,
    {
        if let Some(clen) = body.content_len() {
            res.headers
                .entry(header::CONTENT_LENGTH)
                .or_insert_with(|| format!("{clen}").into_bytes().into());
        }

        let mut this = self
            .write_final_response(res)
            .map_err(ResponderOrBodyError::Responder)?;

        loop {
            match body
                .next_chunk()
                .await
                .map_err(ResponderOrBodyError::Body)?
            {
                BodyChunk::Chunk(chunk) => {
                    this.write_chunk(chunk)
                        .await
                        .map_err(ResponderOrBodyError::Responder)?;
                }
                BodyChunk::Done { trailers } => {
                    return this
                        .finish_body(trailers)
                        .await
                        .map_err(ResponderOrBodyError::Responder);
                }
            }
        }
    }

    /// Reset the stream with the given error code instead of responding.
    pub async fn reset(
        self,
        code: KnownErrorCode,
    ) -> ResponderResult<Responder<OurEncoder, ResponseDone>, OurEncoder::Error> {
        self.reset_internal(code, "reset by handler".to_owned())
            .await
    }

    /// Same as `reset(INTERNAL_ERROR)`
    pub async fn abort(
        self,
    ) -> ResponderResult<Responder<OurEncoder, ResponseDone>, OurEncoder::Error> {
        self.reset(KnownErrorCode::InternalError).await
    }
}

impl<E> Responder<E, ExpectResponseBody>
where
    E: Encoder,
{
    pub fn is_started(&self) -> bool {
        self.state.pending.is_none()
    }

    /// The response headers, while they can still change.
    pub fn response_mut(&mut self) -> ResponderResult<&mut Response, E::Error> {
        self.state
            .pending
            .as_mut()
            .ok_or(ResponderError::AlreadyStarted)
    }

    pub fn on_starting(
        &mut self,
        f: impl FnOnce(&mut Response) + 'static,
    ) -> ResponderResult<(), E::Error> {
        if self.is_started() {
            return Err(ResponderError::AlreadyStarted);
        }
        self.on_starting.push(Box::new(f));
        Ok(())
    }

    pub fn append_trailer(&mut self, name: HeaderName, value: impl Into<Bytes>) {
        self.trailers
            .get_or_insert_with(Default::default)
            .append(name, value.into());
    }

    /// Run the `on_starting` callbacks, freeze the headers.
    fn take_pending(&mut self) -> Option<Response> {
        let mut res = self.state.pending.take()?;
        for cb in self.on_starting.drain(..) {
            cb(&mut res);
        }
        self.state.announced_content_length = res.headers.content_length();
        Some(res)
    }

    /// Send the response headers now, if they haven't been sent yet.
    pub async fn start(&mut self) -> ResponderResult<(), E::Error> {
        if let Some(res) = self.take_pending() {
            res.debug_print();
            self.encoder.write_response(res, false).await?;
        }
        Ok(())
    }

    /// Send a response body chunk. Errors out if sending more than the
    /// announced content-length, in which case the stream is reset.
    pub async fn write_chunk(&mut self, chunk: Bytes) -> ResponderResult<(), E::Error> {
        self.start().await?;
        if chunk.is_empty() {
            return Ok(());
        }

        let actual = self.state.bytes_written + chunk.len() as u64;
        if let Some(expected) = self.state.announced_content_length {
            if actual > expected {
                let reason = format!("too many bytes written ({actual} of {expected})");
                debug!(%reason, "resetting stream");
                self.encoder
                    .reset(KnownErrorCode::InternalError, reason)
                    .await?;
                return Err(ResponderError::TooManyBytesWritten { actual, expected });
            }
        }

        self.state.bytes_written = actual;
        self.encoder.write_body_chunk(chunk).await?;
        Ok(())
    }

    /// Finish the body, with optional trailers (added to any appended
    /// earlier). Errors out if the sent body is shorter than the announced
    /// content-length.
    pub async fn finish_body(
        mut self,
        trailers: Option<Box<Headers>>,
    ) -> ResponderResult<Responder<E, ResponseDone>, E::Error> {
        if let Some(extra) = trailers {
            match self.trailers.as_mut() {
                Some(existing) => existing.extend(*extra),
                None => self.trailers = Some(extra),
            }
        }

        let pending = self.take_pending();

        if let Some(expected) = self.state.announced_content_length {
            let actual = self.state.bytes_written;
            if actual < expected {
                return Err(ResponderError::TooFewBytesWritten { actual, expected });
            }
        }

        let trailers = self.trailers.take();
        match (pending, trailers) {
            (Some(res), None) => {
                // headers-only response
                res.debug_print();
                self.encoder.write_response(res, true).await?;
            }
            (Some(res), trailers) => {
                res.debug_print();
                self.encoder.write_response(res, false).await?;
                self.encoder.write_body_end(trailers).await?;
            }
            (None, trailers) => {
                self.encoder.write_body_end(trailers).await?;
            }
        }

        Ok(self.with_state(ResponseDone))
    }

    /// Reset the stream with the given error code, whether or not the
    /// response started.
    pub async fn reset(
        self,
        code: KnownErrorCode,
    ) -> ResponderResult<Responder<E, ResponseDone>, E::Error> {
        self.reset_internal(code, "reset by handler".to_owned())
            .await
    }

    /// Same as `reset(INTERNAL_ERROR)`
    pub async fn abort(self) -> ResponderResult<Responder<E, ResponseDone>, E::Error> {
        self.reset(KnownErrorCode::InternalError).await
    }
}

impl<E> Responder<E, ResponseDone>
where
    E: Encoder,
{
    pub fn into_inner(self) -> E {
        self.encoder
    }
}

pub type ResponderResult<T, EncoderError> = Result<T, ResponderError<EncoderError>>;

#[allow(async_fn_in_trait)] // we never require Send
pub trait Encoder {
    type Error: std::error::Error + 'static;

    /// `end_stream` is set for responses without body or trailers
    async fn write_response(&mut self, res: Response, end_stream: bool) -> Result<(), Self::Error>;
    /// Note: encoders do not have a duty to check for matching content-length:
    /// the responder takes care of that
    async fn write_body_chunk(&mut self, chunk: Bytes) -> Result<(), Self::Error>;
    async fn write_body_end(&mut self, trailers: Option<Box<Headers>>) -> Result<(), Self::Error>;
    async fn reset(&mut self, code: KnownErrorCode, reason: String) -> Result<(), Self::Error>;
}
