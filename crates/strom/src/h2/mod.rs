//! HTTP/2 server: one connection at a time, many streams per connection.
//!
//! See [serve] and [ServerConf].

mod server;
pub use server::*;

pub(crate) mod body;
pub(crate) mod encode;
pub(crate) mod headers;
pub mod flow;
pub mod hpack;
pub(crate) mod keepalive;
pub(crate) mod timeout;
pub(crate) mod types;

pub use body::{ControlsError, H2BodyError, SinglePieceBody, StreamControls};
pub use encode::{EncoderState, H2EncoderError};
pub use keepalive::KeepAliveState;
pub use timeout::{Clock, ManualClock, MinDataRate, TokioClock};
pub use types::{H2ConnectionError, H2StreamError, StreamPhase};
