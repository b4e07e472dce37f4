use std::fmt;

/// An HTTP method, see <https://httpwg.org/specs/rfc9110.html#methods>
#[derive(Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl fmt::Debug for Method {
    // forward to display
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        }
    }

    /// Parse a method from the bytes of a `:method` pseudo-header. Returns
    /// `None` unless the input is a valid `token` (RFC 9110, section 5.6.2).
    pub fn from_token(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || !bytes.iter().copied().all(is_tchar) {
            return None;
        }

        Some(match bytes {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"PATCH" => Method::Patch,
            // all tchars are ASCII
            other => Method::Other(String::from_utf8_lossy(other).into_owned()),
        })
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        Method::from_token(s.as_bytes()).unwrap_or_else(|| Method::Other(s.to_owned()))
    }
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
