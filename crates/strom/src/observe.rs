//! Hooks for watching what happens to connections and streams.

use strom_h2::{ErrorCode, KnownErrorCode, StreamId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The connection sat idle for too long
    KeepAlive,
    /// A keep-alive PING went unanswered
    KeepAlivePing,
    /// A header block didn't complete in time
    RequestHeaders,
    MinRequestBodyDataRate,
    MinResponseDataRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Answered with 431
    HeadersTooLarge,
    /// Answered with 431
    TooManyHeaders,
    /// Answered with 413
    BodyTooLarge,
    /// Reset with REFUSED_STREAM
    RefusedStream,
}

/// Receives every protocol-level failure the server runs into. All methods
/// default to doing nothing.
pub trait Observer {
    /// A stream ended with RST_STREAM, whoever sent it. Called once per
    /// stream.
    fn stream_aborted(&self, stream_id: StreamId, code: ErrorCode, reason: &str) {
        let _ = (stream_id, code, reason);
    }

    /// We reset a stream because the peer misbehaved on it
    fn stream_error(&self, stream_id: StreamId, code: KnownErrorCode, reason: &str) {
        let _ = (stream_id, code, reason);
    }

    /// We sent GOAWAY with an error code
    fn connection_error(&self, code: KnownErrorCode, last_stream_id: StreamId, reason: &str) {
        let _ = (code, last_stream_id, reason);
    }

    fn timeout(&self, reason: TimeoutReason) {
        let _ = reason;
    }

    fn request_rejected(&self, stream_id: StreamId, reason: RejectionReason) {
        let _ = (stream_id, reason);
    }
}

/// Logs everything through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn stream_aborted(&self, stream_id: StreamId, code: ErrorCode, reason: &str) {
        debug!(%stream_id, ?code, %reason, "stream aborted");
    }

    fn stream_error(&self, stream_id: StreamId, code: KnownErrorCode, reason: &str) {
        debug!(%stream_id, ?code, %reason, "stream error");
    }

    fn connection_error(&self, code: KnownErrorCode, last_stream_id: StreamId, reason: &str) {
        warn!(?code, %last_stream_id, %reason, "connection error");
    }

    fn timeout(&self, reason: TimeoutReason) {
        debug!(?reason, "timeout");
    }

    fn request_rejected(&self, stream_id: StreamId, reason: RejectionReason) {
        debug!(%stream_id, ?reason, "request rejected");
    }
}
