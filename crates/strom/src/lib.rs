//! The connection-multiplexing and stream-lifecycle core of an HTTP/2
//! server: framing, flow control, header blocks, keep-alive.
//!
//! Everything here is `!Send`: run [h2::serve] on a
//! [tokio::task::LocalSet].

mod types;
pub use types::*;

pub mod h2;

mod responder;
pub use responder::*;

pub mod error;
pub mod observe;

/// re-exported so consumers can use whatever version we use
pub use http;
pub use strom_h2;

#[allow(async_fn_in_trait)] // we never require Send
pub trait ServerDriver {
    type Error: std::error::Error + 'static;

    async fn handle<E: Encoder>(
        &self,
        req: Request,
        req_body: &mut impl Body,
        respond: Responder<E, ExpectResponseHeaders>,
    ) -> Result<Responder<E, ResponseDone>, Self::Error>;
}
