//! Request/response exchanges over a single connection, looked at from
//! the client side.

mod helpers;

use bytes::Bytes;
use helpers::{
    conn::{outcome, start},
    drivers::{
        BigHeaderDriver, EchoDriver, Observed, OnStartingDriver, OverlongDriver, PanicDriver,
        RecordingObserver, StaticDriver,
    },
    request, run,
};
use pretty_assertions::assert_eq;
use std::rc::Rc;
use strom::{
    h2::ServerConf,
    strom_h2::{ErrorCode, FramePayload, HeadersFlags, KnownErrorCode, StreamId},
    ServeOutcome,
};
use tokio::sync::mpsc;

#[test]
fn get_with_unsized_body() {
    run(async {
        let (mut conn, task) = start(ServerConf::default(), StaticDriver::new("hello, world"));
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;
        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("200"));
        assert_eq!(res.header("content-length"), None);
        assert_eq!(res.body, b"hello, world");
        // the end of the body is its own empty DATA frame
        assert_eq!(res.data_frames, vec![12, 0]);

        drop(conn);
        assert_eq!(outcome::<StaticDriver>(task).await?, ServeOutcome::PeerHungUp);
        Ok(())
    })
}

#[test]
fn get_with_sized_body() {
    run(async {
        let driver = StaticDriver {
            sized: true,
            ..StaticDriver::new("hello, world")
        };
        let (mut conn, _task) = start(ServerConf::default(), driver);
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;
        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("200"));
        assert_eq!(res.header("content-length"), Some("12"));
        assert_eq!(res.body, b"hello, world");
        Ok(())
    })
}

#[test]
fn several_requests_on_one_connection() {
    run(async {
        let (mut conn, _task) = start(ServerConf::default(), StaticDriver::new("again"));
        conn.handshake().await?;

        for id in [1, 3, 5] {
            conn.send_request(StreamId(id), &request("GET", "/"), true)
                .await?;
            let res = conn.read_response(StreamId(id)).await?;
            assert_eq!(res.body, b"again");
        }
        Ok(())
    })
}

#[test]
fn echo_request_body() {
    run(async {
        let (driver, mut log) = EchoDriver::new();
        let (mut conn, _task) = start(ServerConf::default(), driver);
        conn.handshake().await?;

        let mut fields = request("POST", "/echo");
        fields.push(("content-length", "11"));
        conn.send_request(StreamId(1), &fields, false).await?;
        conn.write_data(StreamId(1), false, "hello ").await?;
        conn.write_data(StreamId(1), true, "world").await?;

        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("200"));
        assert_eq!(res.body, b"hello world");
        assert_eq!(res.header("x-request-trailers"), Some("0"));

        assert_eq!(log.recv().await.as_deref(), Some("POST /echo"));
        assert_eq!(log.recv().await.as_deref(), Some("read 11 bytes"));
        Ok(())
    })
}

#[test]
fn request_body_shorter_than_declared() {
    run(async {
        let (driver, mut log) = EchoDriver::new();
        let observer = Rc::new(RecordingObserver::default());
        let conf = ServerConf {
            observer: observer.clone(),
            ..Default::default()
        };
        let (mut conn, _task) = start(conf, driver);
        conn.handshake().await?;

        let mut fields = request("POST", "/");
        fields.push(("content-length", "12"));
        conn.send_request(StreamId(1), &fields, false).await?;
        conn.write_data(StreamId(1), true, "hello world").await?;

        conn.verify_stream_error(StreamId(1), KnownErrorCode::ProtocolError)
            .await?;
        assert!(observer.saw(&Observed::StreamError {
            stream_id: StreamId(1),
            code: KnownErrorCode::ProtocolError,
        }));

        assert_eq!(log.recv().await.as_deref(), Some("POST /"));
        assert_eq!(
            log.recv().await.as_deref(),
            Some("read error: request body error: less data than declared length")
        );

        // the 500 the dropped responder wanted to send has nowhere to go
        conn.verify_ping_roundtrip().await?;
        Ok(())
    })
}

#[test]
fn headers_only_request_with_nonzero_content_length() {
    run(async {
        let (driver, _log) = EchoDriver::new();
        let (mut conn, _task) = start(ServerConf::default(), driver);
        conn.handshake().await?;

        let mut fields = request("POST", "/");
        fields.push(("content-length", "5"));
        conn.send_request(StreamId(1), &fields, true).await?;

        conn.verify_stream_error(StreamId(1), KnownErrorCode::ProtocolError)
            .await?;
        Ok(())
    })
}

#[test]
fn response_longer_than_announced() {
    run(async {
        let (log_tx, mut log) = mpsc::unbounded_channel();
        let observer = Rc::new(RecordingObserver::default());
        let conf = ServerConf {
            observer: observer.clone(),
            ..Default::default()
        };
        let (mut conn, _task) = start(conf, OverlongDriver { log: log_tx });
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;

        let (frame, payload) = conn
            .wait_for_frame(|_, payload| matches!(payload, FramePayload::Headers { .. }))
            .await?;
        assert!(!frame.is_end_stream());
        let FramePayload::Headers { fragment, .. } = payload else {
            unreachable!()
        };
        let fields = conn.decode_headers(&fragment)?;
        assert!(fields.contains(&("content-length".to_owned(), "11".to_owned())));

        conn.verify_stream_error(StreamId(1), KnownErrorCode::InternalError)
            .await?;
        conn.verify_ping_roundtrip().await?;
        assert_eq!(
            observer.aborts_for(StreamId(1)),
            vec![Observed::StreamAborted {
                stream_id: StreamId(1),
                code: KnownErrorCode::InternalError.into(),
                reason: "too many bytes written (12 of 11)".to_owned(),
            }]
        );

        let line = log.recv().await.unwrap_or_default();
        assert!(line.contains("TooManyBytesWritten"), "got {line:?}");
        Ok(())
    })
}

#[test]
fn peer_reset_while_reading_body() {
    run(async {
        let (driver, mut log) = EchoDriver::new();
        let observer = Rc::new(RecordingObserver::default());
        let conf = ServerConf {
            observer: observer.clone(),
            ..Default::default()
        };
        let (mut conn, _task) = start(conf, driver);
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("POST", "/upload"), false)
            .await?;
        conn.write_data(StreamId(1), false, "partial").await?;
        conn.write_rst_stream(StreamId(1), KnownErrorCode::Cancel)
            .await?;

        assert_eq!(log.recv().await.as_deref(), Some("POST /upload"));
        assert_eq!(log.recv().await.as_deref(), Some("read error: stream reset"));

        // nothing goes out for a stream the peer reset
        conn.verify_ping_roundtrip().await?;
        assert_eq!(
            observer.aborts_for(StreamId(1)),
            vec![Observed::StreamAborted {
                stream_id: StreamId(1),
                code: ErrorCode::from(KnownErrorCode::Cancel),
                reason: "reset by peer".to_owned(),
            }]
        );
        Ok(())
    })
}

#[test]
fn big_response_headers_span_continuation() {
    run(async {
        let (mut conn, _task) = start(ServerConf::default(), BigHeaderDriver { len: 16385 });
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;

        let (first, payload) = conn
            .wait_for_frame(|_, payload| matches!(payload, FramePayload::Headers { .. }))
            .await?;
        assert!(first.is_end_stream());
        assert!(!first.is_end_headers());
        let FramePayload::Headers { fragment, .. } = payload else {
            unreachable!()
        };

        let (second, payload) = conn.read_frame().await?;
        assert!(second.is_end_headers());
        assert_eq!(second.stream_id, StreamId(1));
        let FramePayload::Continuation(rest) = payload else {
            eyre::bail!("expected CONTINUATION, got {second:?}");
        };

        let block = [&fragment[..], &rest[..]].concat();
        let fields = conn.decode_headers(&block)?;
        let big = fields
            .iter()
            .find(|(k, _)| k == "x-big")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        assert_eq!(big, "^".repeat(16385));
        Ok(())
    })
}

#[test]
fn split_request_header_block() {
    run(async {
        let (mut conn, _task) = start(ServerConf::default(), StaticDriver::new("split"));
        conn.handshake().await?;

        let mut fields = request("GET", "/split");
        fields.push(("x-filler", "abcdefghijklmnopqrstuvwxyz"));
        let block = conn.encode_headers(&fields)?;
        let (a, b) = block.split_at(block.len() / 2);

        conn.write_headers(
            StreamId(1),
            HeadersFlags::EndStream.into(),
            Bytes::copy_from_slice(a),
        )
        .await?;
        conn.write_continuation(StreamId(1), true, Bytes::copy_from_slice(b))
            .await?;

        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("200"));
        assert_eq!(res.body, b"split");
        Ok(())
    })
}

#[test]
fn trailers_both_ways() {
    run(async {
        let (driver, mut log) = EchoDriver::new();
        let (mut conn, _task) = start(ServerConf::default(), driver);
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("POST", "/"), false)
            .await?;
        conn.write_data(StreamId(1), false, "abc").await?;
        let trailers = conn.encode_headers(&[("x-checksum", "42")])?;
        conn.write_headers(
            StreamId(1),
            HeadersFlags::EndHeaders | HeadersFlags::EndStream,
            trailers,
        )
        .await?;

        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.body, b"abc");
        assert_eq!(res.header("x-request-trailers"), Some("1"));
        assert_eq!(log.recv().await.as_deref(), Some("POST /"));
        assert_eq!(log.recv().await.as_deref(), Some("read 3 bytes"));

        let driver = StaticDriver {
            trailers: vec![("x-served-by", "strom")],
            ..StaticDriver::new("with trailers")
        };
        let (mut conn, _task) = start(ServerConf::default(), driver);
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;
        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.body, b"with trailers");
        assert_eq!(res.trailer("x-served-by"), Some("strom"));
        Ok(())
    })
}

#[test]
fn on_starting_callbacks() {
    run(async {
        let (log_tx, mut log) = mpsc::unbounded_channel();
        let (mut conn, _task) = start(ServerConf::default(), OnStartingDriver { log: log_tx });
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;
        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("200"));
        assert_eq!(res.header("x-order"), Some("1,2"));
        assert_eq!(res.body, b"started");

        assert_eq!(log.recv().await.as_deref(), Some("already started"));
        Ok(())
    })
}

#[test]
fn handler_panic_becomes_500() {
    run(async {
        let (mut conn, _task) = start(ServerConf::default(), PanicDriver);
        conn.handshake().await?;

        conn.send_request(StreamId(1), &request("GET", "/"), true)
            .await?;
        let res = conn.read_response(StreamId(1)).await?;
        assert_eq!(res.status(), Some("500"));
        assert!(res.body.is_empty());

        // the connection survives
        conn.verify_ping_roundtrip().await?;
        Ok(())
    })
}

#[test]
fn ping_is_echoed() {
    run(async {
        let (mut conn, _task) = start(ServerConf::default(), StaticDriver::new(""));
        conn.handshake().await?;

        conn.write_ping(false, *b"12345678").await?;
        let (frame, payload) = conn
            .wait_for_frame(|_, payload| matches!(payload, FramePayload::Ping(_)))
            .await?;
        assert!(frame.is_ack());
        assert_eq!(payload, FramePayload::Ping(*b"12345678"));
        Ok(())
    })
}
