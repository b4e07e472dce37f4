//! Types for HTTP headers

use bytes::Bytes;
use http::{header, HeaderMap};

pub type Headers = HeaderMap<Bytes>;

pub trait HeadersExt {
    /// Returns the content-length header
    fn content_length(&self) -> Option<u64>;
}

impl HeadersExt for HeaderMap<Bytes> {
    fn content_length(&self) -> Option<u64> {
        self.get(header::CONTENT_LENGTH)
            .and_then(|s| from_digits(s))
    }
}

/// Parse a non-empty run of ASCII digits into a u64.
pub(crate) fn from_digits(bytes: &[u8]) -> Option<u64> {
    // cannot use FromStr for u64, since it allows a signed prefix
    let mut result = 0u64;
    const RADIX: u64 = 10;

    if bytes.is_empty() {
        return None;
    }

    for &b in bytes {
        // can't use char::to_digit, since we haven't verified these bytes
        // are utf-8.
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(RADIX)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => {
                // not a DIGIT, get outta here!
                return None;
            }
        }
    }

    Some(result)
}
