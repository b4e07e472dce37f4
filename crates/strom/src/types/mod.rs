use std::{
    convert::Infallible,
    fmt::{self, Debug},
};

use bytes::Bytes;
use http::{StatusCode, Uri, Version};
use tracing::debug;

mod headers;
pub use headers::*;

mod method;
pub use method::*;

use crate::h2::StreamControls;

/// An HTTP request
#[derive(Clone)]
pub struct Request {
    pub method: Method,

    /// Requested entity
    pub uri: Uri,

    /// The HTTP version used
    pub version: Version,

    /// Request headers
    pub headers: Headers,

    /// The `:protocol` pseudo-header of an extended CONNECT request
    /// (RFC 8441), e.g. `websocket`
    pub protocol: Option<String>,

    /// Per-request knobs: body size limit, minimum data rates
    pub controls: StreamControls,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            uri: Uri::from_static("/"),
            version: Version::HTTP_2,
            headers: Default::default(),
            protocol: None,
            controls: Default::default(),
        }
    }
}

impl Request {
    /// The request target as it appeared on the wire: the `:path` for
    /// regular requests and extended CONNECT, the `:authority` for plain
    /// CONNECT.
    pub fn raw_target(&self) -> &str {
        if self.method == Method::Connect && self.protocol.is_none() {
            return self.uri.authority().map(|a| a.as_str()).unwrap_or_default();
        }

        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Request");
        s.field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version);
        if let Some(protocol) = &self.protocol {
            s.field("protocol", protocol);
        }
        s.field("headers", &self.headers.len()).finish()
    }
}

/// An HTTP response
#[derive(Clone)]
pub struct Response {
    /// Always HTTP/2 for responses produced here
    pub version: Version,

    /// Status code (2xx-5xx)
    pub status: StatusCode,

    /// Response headers
    pub headers: Headers,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            version: Version::HTTP_2,
            status: StatusCode::OK,
            headers: Default::default(),
        }
    }
}

impl Response {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub(crate) fn debug_print(&self) {
        debug!(code = %self.status, version = ?self.version, "got response");
        for (name, value) in &self.headers {
            debug!(%name, value = ?std::str::from_utf8(value), "got header");
        }
    }

    /// 204 and 304 responses must not have a body
    pub fn means_empty_body(&self) -> bool {
        matches!(
            self.status,
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
        )
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// A body chunk
pub enum BodyChunk {
    Chunk(Bytes),

    /// The body finished, and it matched the announced content-length
    Done {
        trailers: Option<Box<Headers>>,
    },
}

impl fmt::Debug for BodyChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyChunk::Chunk(chunk) => f.debug_tuple("Chunk").field(&chunk.len()).finish(),
            BodyChunk::Done { trailers } => f
                .debug_struct("Done")
                .field("trailers", &trailers.as_ref().map(|t| t.len()))
                .finish(),
        }
    }
}

#[allow(async_fn_in_trait)] // we never require Send
pub trait Body: Debug
where
    Self: Sized,
{
    type Error: std::error::Error + 'static;

    fn content_len(&self) -> Option<u64>;
    fn eof(&self) -> bool;
    async fn next_chunk(&mut self) -> Result<BodyChunk, Self::Error>;
}

impl Body for () {
    type Error = Infallible;

    fn content_len(&self) -> Option<u64> {
        Some(0)
    }

    fn eof(&self) -> bool {
        true
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, Self::Error> {
        Ok(BodyChunk::Done { trailers: None })
    }
}

/// How an HTTP/2 connection ended, when it ended without a transport fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The peer closed the connection or sent something other than the
    /// HTTP/2 connection preface before the first frame.
    ClientDidntSpeakHttp2,

    /// We sent GOAWAY(NO_ERROR) and every accepted stream ran to completion.
    SuccessfulHttp2GracefulShutdown,

    /// The peer violated the protocol; we sent GOAWAY with an error code.
    ConnectionError,

    /// The peer closed the transport.
    PeerHungUp,
}
