//! Header blocks: splitting outgoing ones across HEADERS + CONTINUATION,
//! reassembling and validating incoming ones.

use std::time::Instant;

use bytes::Bytes;
use http::{
    header,
    uri::{Authority, PathAndQuery, Scheme},
    HeaderName, StatusCode, Uri, Version,
};
use smallvec::{smallvec, SmallVec};
use strom_h2::{
    enumflags2::BitFlags, ContinuationFlags, Frame, FrameType, HeadersFlags, StreamId,
};
use tracing::debug;

use crate::{observe::RejectionReason, types::from_digits, Headers, Method, Request, Response};

use super::{
    hpack::{EncodeProgress, HeaderBlockEncoder},
    types::{H2ConnectionError, H2ErrorLevel, H2RequestError, H2StreamError},
};

static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

fn is_connection_specific(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == KEEP_ALIVE
        || name == PROXY_CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
}

/// The field list for a response: `:status` first, connection-specific
/// headers dropped.
pub(crate) fn response_fields(res: &Response) -> Vec<(&[u8], &[u8])> {
    let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(res.headers.len() + 1);
    fields.push((b":status", res.status.as_str().as_bytes()));
    fields.extend(trailer_fields(&res.headers));
    fields
}

pub(crate) fn trailer_fields(headers: &Headers) -> impl Iterator<Item = (&[u8], &[u8])> {
    headers.iter().filter_map(|(name, value)| {
        if is_connection_specific(name) {
            debug!(%name, "dropping connection-specific header");
            return None;
        }
        Some((name.as_str().as_bytes(), &value[..]))
    })
}

/// Encode `fields` and cut the result into frames of at most
/// `max_frame_size` bytes: one HEADERS, then as many CONTINUATION as needed.
pub(crate) fn write_header_block(
    encoder: &mut (impl HeaderBlockEncoder + ?Sized),
    stream_id: StreamId,
    fields: &[(&[u8], &[u8])],
    end_stream: bool,
    max_frame_size: usize,
) -> std::io::Result<Vec<(Frame, Bytes)>> {
    let (first, mut progress) = encoder.begin_encode(fields, max_frame_size)?;
    let mut fragments: SmallVec<[Bytes; 2]> = smallvec![first];
    while progress == EncodeProgress::Partial {
        let (fragment, next) = encoder.continue_encode(max_frame_size);
        fragments.push(fragment);
        progress = next;
    }

    let last = fragments.len() - 1;
    let frames = fragments
        .into_iter()
        .enumerate()
        .map(|(i, fragment)| {
            let end_headers = i == last;
            let frame_type = if i == 0 {
                let mut flags = BitFlags::<HeadersFlags>::default();
                if end_stream {
                    flags |= HeadersFlags::EndStream;
                }
                if end_headers {
                    flags |= HeadersFlags::EndHeaders;
                }
                FrameType::Headers(flags)
            } else {
                let mut flags = BitFlags::<ContinuationFlags>::default();
                if end_headers {
                    flags |= ContinuationFlags::EndHeaders;
                }
                FrameType::Continuation(flags)
            };
            let frame = Frame::new(frame_type, stream_id).with_len(fragment.len() as u32);
            (frame, fragment)
        })
        .collect();
    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeadersOrTrailers {
    Headers,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadHeadersMode {
    // we're accepting the stream or processing trailers, we want to
    // process the headers we read.
    Process(HeadersOrTrailers),
    // we're refusing the stream, the block is only decoded to keep the
    // HPACK context in sync.
    Skip,
}

/// A header block that started with HEADERS and is waiting for more
/// CONTINUATION frames.
pub(crate) struct PendingHeaderBlock {
    pub(crate) stream_id: StreamId,
    pub(crate) mode: ReadHeadersMode,
    pub(crate) end_stream: bool,
    pub(crate) started_at: Instant,
    fragments: SmallVec<[Bytes; 2]>,
    total_len: usize,
}

impl PendingHeaderBlock {
    pub(crate) fn new(
        stream_id: StreamId,
        mode: ReadHeadersMode,
        end_stream: bool,
        started_at: Instant,
    ) -> Self {
        Self {
            stream_id,
            mode,
            end_stream,
            started_at,
            fragments: Default::default(),
            total_len: 0,
        }
    }

    pub(crate) fn push(&mut self, fragment: Bytes, max: usize) -> Result<(), H2ConnectionError> {
        self.total_len += fragment.len();
        if self.total_len > max {
            return Err(H2ConnectionError::HeaderBlockTooLarge {
                stream_id: self.stream_id,
                max,
            });
        }
        self.fragments.push(fragment);
        Ok(())
    }

    pub(crate) fn into_block(self) -> Bytes {
        if self.fragments.len() == 1 {
            if let Some(only) = self.fragments.into_iter().next() {
                return only;
            }
            return Bytes::new();
        }

        // this is a slow path, let's do a little heap allocation
        let mut block = Vec::with_capacity(self.total_len);
        for frag in &self.fragments {
            block.extend_from_slice(&frag[..]);
        }
        block.into()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderLimits {
    pub(crate) max_count: usize,
    /// name + value + 32 per field, cf. RFC 9113 section 6.5.2
    pub(crate) max_total_size: usize,
    pub(crate) max_path_len: usize,
}

/// Validates decoded fields as they come out of the HPACK decoder.
///
/// Decoding has to run to completion no matter what: even if a request is
/// invalid, the decoder's dynamic table must stay in sync with the peer's
/// encoder. So errors are recorded, not returned.
pub(crate) struct HeaderCollector {
    kind: HeadersOrTrailers,
    limits: HeaderLimits,

    method: Option<Method>,
    scheme: Option<Scheme>,
    path: Option<String>,
    authority: Option<Authority>,
    protocol: Option<String>,
    headers: Headers,

    saw_regular_header: bool,
    count: usize,
    total_size: usize,
    oversize: Option<RejectionReason>,
    error: Option<H2StreamError>,
}

impl HeaderCollector {
    pub(crate) fn new(kind: HeadersOrTrailers, limits: HeaderLimits) -> Self {
        Self {
            kind,
            limits,
            method: None,
            scheme: None,
            path: None,
            authority: None,
            protocol: None,
            headers: Default::default(),
            saw_regular_header: false,
            count: 0,
            total_size: 0,
            oversize: None,
            error: None,
        }
    }

    pub(crate) fn on_field(&mut self, key: &[u8], value: &[u8]) {
        self.count += 1;
        self.total_size += key.len() + value.len() + 32;
        if self.oversize.is_none() {
            if self.count > self.limits.max_count {
                self.oversize = Some(RejectionReason::TooManyHeaders);
            } else if self.total_size > self.limits.max_total_size {
                self.oversize = Some(RejectionReason::HeadersTooLarge);
            }
        }

        if self.oversize.is_some() || self.error.is_some() {
            return;
        }

        if let Err(e) = self.validate_field(key, value) {
            self.error = Some(e);
        }
    }

    fn validate_field(&mut self, key: &[u8], value: &[u8]) -> Result<(), H2StreamError> {
        debug!(
            "{:?} | {}: {}",
            self.kind,
            std::str::from_utf8(key).unwrap_or("<non-utf8-key>"),
            std::str::from_utf8(value).unwrap_or("<non-utf8-value>"),
        );

        let Some(pseudo) = key.strip_prefix(b":") else {
            return self.regular_field(key, value);
        };

        if self.saw_regular_header {
            return Err(H2StreamError::BadRequest(
                "All pseudo-header fields MUST appear in a field block before all regular field lines (RFC 9113, section 8.3)",
            ));
        }

        if self.kind == HeadersOrTrailers::Trailers {
            return Err(H2StreamError::BadRequest(
                "Pseudo-header fields MUST NOT appear in a trailer section (RFC 9113, section 8.3)",
            ));
        }

        match pseudo {
            b"method" => {
                let method = Method::from_token(value).ok_or(H2StreamError::BadRequest(
                    "invalid ':method' pseudo-header: not a valid token like POST, GET, OPTIONS, CONNECT, PROPFIND, etc.",
                ))?;
                if self.method.replace(method).is_some() {
                    return Err(H2StreamError::BadRequest("duplicate ':method' pseudo-header. All HTTP/2 requests MUST include _exactly one_ valid value for the ':method', ':scheme', and ':path' pseudo-header fields, unless they are CONNECT requests (RFC 9113, section 8.3.1)"));
                }
            }
            b"scheme" => {
                let scheme: Scheme = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(H2StreamError::BadRequest(
                        "invalid ':scheme' pseudo-header: not a valid URI scheme",
                    ))?;
                if self.scheme.replace(scheme).is_some() {
                    return Err(H2StreamError::BadRequest("duplicate ':scheme' pseudo-header. All HTTP/2 requests MUST include _exactly one_ valid value for the ':method', ':scheme', and ':path' pseudo-header fields, unless they are CONNECT requests (RFC 9113, section 8.3.1)"));
                }
            }
            b"path" => {
                if value.len() > self.limits.max_path_len {
                    return Err(H2StreamError::BadRequest(
                        "':path' pseudo-header exceeds the maximum request line size",
                    ));
                }
                let path = std::str::from_utf8(value).map_err(|_| {
                    H2StreamError::BadRequest("invalid ':path' pseudo-header (not valid utf-8, which is _certainly_ not a valid URI, as defined by RFC 3986, section 2. See also RFC 9113, section 8.3.1). ")
                })?;
                if self.path.replace(path.to_owned()).is_some() {
                    return Err(H2StreamError::BadRequest("duplicate ':path' pseudo-header. All HTTP/2 requests MUST include _exactly one_ valid value for the ':method', ':scheme', and ':path' pseudo-header fields, unless they are CONNECT requests (RFC 9113, section 8.3.1)"));
                }
            }
            b"authority" => {
                let authority: Authority = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(H2StreamError::BadRequest("invalid ':authority' pseudo-header: not a valid authority (which is to say: not a valid URI, see RFC 3986, section 3.2)"))?;
                if self.authority.replace(authority).is_some() {
                    return Err(H2StreamError::BadRequest("duplicate ':authority' pseudo-header"));
                }
            }
            b"protocol" => {
                let protocol = std::str::from_utf8(value)
                    .ok()
                    .filter(|p| !p.is_empty())
                    .ok_or(H2StreamError::BadRequest(
                        "invalid ':protocol' pseudo-header (RFC 8441, section 4)",
                    ))?;
                if self.protocol.replace(protocol.to_owned()).is_some() {
                    return Err(H2StreamError::BadRequest("duplicate ':protocol' pseudo-header"));
                }
            }
            _ => {
                return Err(H2StreamError::BadRequest(
                    "received invalid pseudo-header. the only defined request pseudo-headers are: ':method', ':scheme', ':path', ':authority' (RFC 9113, section 8.3.1) and ':protocol' (RFC 8441, section 4)",
                ));
            }
        }

        Ok(())
    }

    fn regular_field(&mut self, key: &[u8], value: &[u8]) -> Result<(), H2StreamError> {
        self.saw_regular_header = true;

        // Note: An implementation that validates fields according to the definitions in
        // Sections 5.1 and 5.5 of HTTP only needs an additional check that field
        // names do not include uppercase characters.
        if key.iter().any(|b: &u8| b.is_ascii_uppercase()) {
            return Err(H2StreamError::BadRequest(
                "A field name MUST NOT contain characters in the ranges 0x00-0x20, 0x41-0x5a, or 0x7f-0xff (all ranges inclusive). This specifically excludes all non-visible ASCII characters, ASCII SP (0x20), and uppercase characters ('A' to 'Z', ASCII 0x41 to 0x5a). See RFC9113, section 8.2.1, 'Field Validity'",
            ));
        }

        let name = HeaderName::from_bytes(key).map_err(|_| {
            H2StreamError::BadRequest(
                "invalid header name. see RFC 9113, section 8.2.1, 'Field validity'",
            )
        })?;

        if is_connection_specific(&name) {
            return Err(H2StreamError::BadRequest(
                "connection-specific headers are forbidden. see RFC 9113, section 8.1.2",
            ));
        }

        if name == header::TE && value != b"trailers" {
            return Err(H2StreamError::BadRequest(
                "The only exception to this is the TE header field, which MAY be present in an HTTP/2 request; when it is, it MUST NOT contain any value other than 'trailers'. cf. RFC9113, Section 8.2.2",
            ));
        }

        let first = value.first();
        let last = value.last();
        if first == Some(&b' ')
            || first == Some(&b'\x09')
            || last == Some(&b' ')
            || last == Some(&b'\x09')
        {
            return Err(H2StreamError::BadRequest(
                "A field value MUST NOT start or end with an ASCII whitespace character (ASCII SP or HTAB, 0x20 or 0x09). (RFC 9113, section 8.2.1, 'Field validity')",
            ));
        }

        if memchr::memchr3(b'\r', b'\n', b'\0', value).is_some() {
            return Err(H2StreamError::BadRequest(
                "A field value MUST NOT contain the zero value (ASCII NUL, 0x00), line feed (ASCII LF, 0x0a), or carriage return (ASCII CR, 0x0d) at any position. See RFC 9113, section 8.2.1, 'Field validity'",
            ));
        }

        self.headers.append(name, Bytes::copy_from_slice(value));
        Ok(())
    }

    fn check_limits(&self) -> Result<(), H2RequestError> {
        match self.oversize {
            Some(reason) => Err(H2RequestError {
                status: StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                message: Bytes::from_static(b"request header fields too large"),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Turn a request header block into a [Request], along with its declared
    /// content-length.
    pub(crate) fn into_request(self) -> Result<(Request, Option<u64>), H2ErrorLevel> {
        self.check_limits()?;
        if let Some(e) = self.error {
            return Err(e.into());
        }

        let Self {
            method,
            scheme,
            path,
            authority,
            protocol,
            headers,
            ..
        } = self;

        let method = method
            .ok_or_else(|| H2StreamError::BadRequest("missing :method pseudo-header"))?;

        if protocol.is_some() && method != Method::Connect {
            return Err(H2StreamError::BadRequest(
                "':protocol' pseudo-header is only allowed on CONNECT requests (RFC 8441, section 4)",
            )
            .into());
        }

        let authority = reconcile_host(authority, &headers)?;

        let uri = if method == Method::Connect && protocol.is_none() {
            // RFC 9113, section 8.5 'The CONNECT method': The ":scheme" and ":path"
            // pseudo-header fields MUST be omitted.
            if scheme.is_some() {
                return Err(H2StreamError::BadRequest(
                    "CONNECT method MUST NOT include ':scheme' pseudo-header",
                )
                .into());
            }
            if path.is_some() {
                return Err(H2StreamError::BadRequest(
                    "CONNECT method MUST NOT include ':path' pseudo-header",
                )
                .into());
            }
            let authority = authority.ok_or(H2StreamError::BadRequest(
                "CONNECT method MUST include ':authority' pseudo-header",
            ))?;

            let mut parts = http::uri::Parts::default();
            parts.authority = Some(authority);
            Uri::from_parts(parts).map_err(|_| H2StreamError::BadRequest("invalid CONNECT target"))?
        } else {
            let scheme = scheme
                .ok_or_else(|| H2StreamError::BadRequest("missing :scheme pseudo-header"))?;

            let path = path.ok_or_else(|| {
                H2StreamError::BadRequest("missing :path pseudo-header, cf. RFC9113, section 8.3.1: This pseudo-header field MUST NOT be empty for 'http' or 'https' URIs; 'http' or 'https' URIs that do not contain a path component MUST include a value of '/'.")
            })?;

            if path.is_empty() && (scheme == Scheme::HTTP || scheme == Scheme::HTTPS) {
                return Err(H2StreamError::BadRequest(
                    "as per RFC9113, section 8.3.1, ':path' header value MUST NOT be empty for 'http' and 'https' URIs",
                )
                .into());
            }

            let path_and_query: PathAndQuery = path.parse().map_err(|_| {
                H2StreamError::BadRequest("':path' header value is not a valid PathAndQuery")
            })?;

            let mut parts = http::uri::Parts::default();
            parts.scheme = Some(scheme);
            parts.authority = authority;
            parts.path_and_query = Some(path_and_query);
            Uri::from_parts(parts)
                .map_err(|_| H2StreamError::BadRequest("invalid request target"))?
        };

        let content_length = declared_content_length(&headers)?;

        let req = Request {
            method,
            uri,
            version: Version::HTTP_2,
            headers,
            protocol,
            controls: Default::default(),
        };
        Ok((req, content_length))
    }

    pub(crate) fn into_trailers(self) -> Result<Headers, H2StreamError> {
        if self.oversize.is_some() {
            return Err(H2StreamError::BadRequest("trailers too large"));
        }
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.headers),
        }
    }
}

/// If there's a `host` header, it must match the `:authority` pseudo-header,
/// cf. RFC9113, Section 8.3.1
fn reconcile_host(
    authority: Option<Authority>,
    headers: &Headers,
) -> Result<Option<Authority>, H2StreamError> {
    let Some(host) = headers.get(header::HOST) else {
        return Ok(authority);
    };

    let host = std::str::from_utf8(host)
        .map_err(|_| H2StreamError::BadRequest("'host' header value is not utf-8"))?;
    let host_authority: Authority = host
        .parse()
        .map_err(|_| H2StreamError::BadRequest("'host' header value is not a valid URI"))?;

    match authority {
        Some(authority) if authority != host_authority => Err(H2StreamError::BadRequest(
            "'host' header value does not match ':authority' pseudo-header value, cf. RFC9113, Section 8.3.1: A server SHOULD treat a request as malformed if it contains a Host header field that identifies an entity that differs from the entity in the ':authority' pseudo-header field",
        )),
        Some(authority) => Ok(Some(authority)),
        None => Ok(Some(host_authority)),
    }
}

fn declared_content_length(headers: &Headers) -> Result<Option<u64>, H2StreamError> {
    let mut declared = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let len = from_digits(value).ok_or(H2StreamError::BadRequest(
            "content-length header value is not a valid integer",
        ))?;
        match declared {
            Some(prev) if prev != len => {
                return Err(H2StreamError::BadRequest(
                    "conflicting content-length header values",
                ))
            }
            _ => declared = Some(len),
        }
    }
    Ok(declared)
}
