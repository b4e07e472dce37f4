use std::rc::Rc;

use bytes::Bytes;
use http::StatusCode;
use strom_h2::{KnownErrorCode, StreamId};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    body::StreamShared,
    types::{H2Event, H2EventPayload},
};
use crate::{Encoder, Headers, Response};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum EncoderState {
    ExpectResponseHeaders,
    ExpectResponseBody,
    ResponseDone,
    /// The stream was reset from our side
    Aborted,
}

/// Encodes HTTP/2 responses and bodies
pub(crate) struct H2Encoder {
    stream_id: StreamId,
    tx: mpsc::UnboundedSender<H2Event>,
    state: EncoderState,
    shared: Rc<StreamShared>,
}

impl H2Encoder {
    pub(crate) fn new(
        stream_id: StreamId,
        tx: mpsc::UnboundedSender<H2Event>,
        shared: Rc<StreamShared>,
    ) -> Self {
        Self {
            stream_id,
            tx,
            state: EncoderState::ExpectResponseHeaders,
            shared,
        }
    }

    fn event(&self, payload: H2EventPayload) -> H2Event {
        H2Event {
            payload,
            stream_id: self.stream_id,
        }
    }

    fn send(&self, payload: H2EventPayload) -> Result<(), H2EncoderError> {
        self.tx
            .send(self.event(payload))
            .map_err(|_| H2EncoderError::StreamReset)
    }

    fn expect(&self, expected: EncoderState) -> Result<(), H2EncoderError> {
        if self.state != expected {
            return Err(H2EncoderError::WrongState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2EncoderError {
    /// The encoder is in the wrong state
    #[error("Wrong state: expected {expected:?}, actual {actual:?}")]
    WrongState {
        expected: EncoderState,
        actual: EncoderState,
    },

    #[error("Stream reset")]
    StreamReset,
}

impl Encoder for H2Encoder {
    type Error = H2EncoderError;

    async fn write_response(&mut self, res: Response, end_stream: bool) -> Result<(), Self::Error> {
        self.expect(EncoderState::ExpectResponseHeaders)?;

        self.send(H2EventPayload::Headers { res, end_stream })?;
        self.state = if end_stream {
            EncoderState::ResponseDone
        } else {
            EncoderState::ExpectResponseBody
        };

        Ok(())
    }

    async fn write_body_chunk(&mut self, chunk: Bytes) -> Result<(), Self::Error> {
        self.expect(EncoderState::ExpectResponseBody)?;

        let (ack, written) = oneshot::channel();
        self.send(H2EventPayload::BodyChunk { chunk, ack })?;

        // parked until the last byte of this chunk went out. if the stream
        // gets reset, the sender is dropped along with the queue.
        written.await.map_err(|_| H2EncoderError::StreamReset)
    }

    async fn write_body_end(&mut self, trailers: Option<Box<Headers>>) -> Result<(), Self::Error> {
        self.expect(EncoderState::ExpectResponseBody)?;

        self.send(H2EventPayload::BodyEnd { trailers })?;
        self.state = EncoderState::ResponseDone;

        Ok(())
    }

    async fn reset(&mut self, code: KnownErrorCode, reason: String) -> Result<(), Self::Error> {
        if matches!(
            self.state,
            EncoderState::ResponseDone | EncoderState::Aborted
        ) {
            return Err(H2EncoderError::WrongState {
                expected: EncoderState::ExpectResponseBody,
                actual: self.state,
            });
        }

        self.state = EncoderState::Aborted;
        self.send(H2EventPayload::Reset { code, reason })
    }
}

impl Drop for H2Encoder {
    fn drop(&mut self) {
        let payload = match self.state {
            EncoderState::ExpectResponseHeaders => {
                let status = if self.shared.body_rejected.get() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                debug!(stream_id = %self.stream_id, %status, "responder dropped before responding");
                H2EventPayload::Headers {
                    res: Response::with_status(status),
                    end_stream: true,
                }
            }
            EncoderState::ExpectResponseBody => H2EventPayload::Reset {
                code: KnownErrorCode::InternalError,
                reason: "response body unfinished".to_owned(),
            },
            EncoderState::ResponseDone | EncoderState::Aborted => {
                // ah, good.
                return;
            }
        };

        if self.tx.send(self.event(payload)).is_err() {
            debug!("could not send event to h2 connection handler");
        }
    }
}
