//! HTTP/2 frame codec and base types
//!
//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>
//! Extended CONNECT <https://httpwg.org/specs/rfc8441.html>

use std::{fmt, ops::RangeInclusive};

pub use enumflags2;
use enumflags2::{bitflags, BitFlags};
use enum_repr::EnumRepr;

pub use nom;

use nom::{
    combinator::map,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

mod codec;
pub use codec::*;

/// Sent by h2 clients after negotiating over ALPN, or when doing h2c with
/// prior knowledge.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

pub fn preface(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = nom::bytes::streaming::tag(PREFACE)(i)?;
    Ok((i, ()))
}

/// See <https://httpwg.org/specs/rfc9113.html#FrameTypes>
#[EnumRepr(type = "u8")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    RstStream = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Ping = 0x06,
    GoAway = 0x07,
    WindowUpdate = 0x08,
    Continuation = 0x09,
}


/// Frame type along with its typed flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise,
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    Unknown(EncodedFrameType),
}

impl FrameType {
    /// Turn this [FrameType] into a [Frame]
    pub fn into_frame(self, stream_id: StreamId) -> Frame {
        Frame::new(self, stream_id)
    }
}

/// See <https://httpwg.org/specs/rfc9113.html#DATA>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#HEADERS>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#SETTINGS>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#PING>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#CONTINUATION>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameType {
    pub ty: u8,
    pub flags: u8,
}

impl EncodedFrameType {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (ty, flags)) = tuple((be_u8, be_u8))(i)?;
        Ok((i, Self { ty, flags }))
    }
}

impl From<(RawFrameType, u8)> for EncodedFrameType {
    fn from((ty, flags): (RawFrameType, u8)) -> Self {
        Self {
            ty: ty.repr(),
            flags,
        }
    }
}

impl FrameType {
    pub(crate) fn encode(self) -> EncodedFrameType {
        match self {
            FrameType::Data(f) => (RawFrameType::Data, f.bits()).into(),
            FrameType::Headers(f) => (RawFrameType::Headers, f.bits()).into(),
            FrameType::Priority => (RawFrameType::Priority, 0).into(),
            FrameType::RstStream => (RawFrameType::RstStream, 0).into(),
            FrameType::Settings(f) => (RawFrameType::Settings, f.bits()).into(),
            FrameType::PushPromise => (RawFrameType::PushPromise, 0).into(),
            FrameType::Ping(f) => (RawFrameType::Ping, f.bits()).into(),
            FrameType::GoAway => (RawFrameType::GoAway, 0).into(),
            FrameType::WindowUpdate => (RawFrameType::WindowUpdate, 0).into(),
            FrameType::Continuation(f) => (RawFrameType::Continuation, f.bits()).into(),
            FrameType::Unknown(ft) => ft,
        }
    }

    fn decode(ft: EncodedFrameType) -> Self {
        match RawFrameType::from_repr(ft.ty) {
            Some(ty) => match ty {
                RawFrameType::Data => FrameType::Data(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::Headers => {
                    FrameType::Headers(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::Priority => FrameType::Priority,
                RawFrameType::RstStream => FrameType::RstStream,
                RawFrameType::Settings => {
                    FrameType::Settings(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::PushPromise => FrameType::PushPromise,
                RawFrameType::Ping => FrameType::Ping(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::GoAway => FrameType::GoAway,
                RawFrameType::WindowUpdate => FrameType::WindowUpdate,
                RawFrameType::Continuation => {
                    FrameType::Continuation(BitFlags::from_bits_truncate(ft.flags))
                }
            },
            None => FrameType::Unknown(ft),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream ID used for connection control frames
    pub const CONNECTION: Self = Self(0);

    /// Largest stream id representable on the wire
    pub const MAX: Self = Self(0x7FFF_FFFF);

    /// Server-initiated streams have even IDs
    pub fn is_server_initiated(&self) -> bool {
        self.0 % 2 == 0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct StreamIdOutOfRange(u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value & 0x8000_0000 != 0 {
            Err(StreamIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The 9-byte frame header, see <https://httpwg.org/specs/rfc9113.html#FrameHeader>
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub reserved: u8,
    pub stream_id: StreamId,
    pub len: u32,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id == StreamId::CONNECTION {
            write!(f, "Conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id.0)?;
        }

        let (name, flags): (&str, Option<String>) = match &self.frame_type {
            FrameType::Data(fl) => ("Data", (!fl.is_empty()).then(|| fl.to_string())),
            FrameType::Headers(fl) => ("Headers", (!fl.is_empty()).then(|| fl.to_string())),
            FrameType::Priority => ("Priority", None),
            FrameType::RstStream => ("RstStream", None),
            FrameType::Settings(fl) => ("Settings", (!fl.is_empty()).then(|| fl.to_string())),
            FrameType::PushPromise => ("PushPromise", None),
            FrameType::Ping(fl) => ("Ping", (!fl.is_empty()).then(|| fl.to_string())),
            FrameType::GoAway => ("GoAway", None),
            FrameType::WindowUpdate => ("WindowUpdate", None),
            FrameType::Continuation(fl) => {
                ("Continuation", (!fl.is_empty()).then(|| fl.to_string()))
            }
            FrameType::Unknown(EncodedFrameType { ty, flags }) => {
                return write!(f, "UnknownFrame({:#x}, {:#x}, len={})", ty, flags, self.len)
            }
        };

        let mut s = f.debug_struct(name);
        if self.reserved != 0 {
            s.field("reserved", &self.reserved);
        }
        if self.len > 0 {
            s.field("len", &self.len);
        }
        if let Some(flags) = flags {
            s.field("flags", &format_args!("{flags}"));
        }
        s.finish()
    }
}

impl Frame {
    /// Create a new frame with the given type and stream ID.
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: 0,
            stream_id,
            len: 0,
        }
    }

    /// Set the frame's length.
    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Parse a frame header from the given slice
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (len, frame_type, (reserved, stream_id))) = tuple((
            be_u24,
            EncodedFrameType::parse,
            parse_reserved_and_stream_id,
        ))(i)?;

        let frame = Frame {
            frame_type: FrameType::decode(frame_type),
            reserved,
            stream_id,
            len,
        };
        Ok((i, frame))
    }

    /// Serialize this frame header. `len` must already be set.
    pub fn write_into(self, out: &mut impl bytes::BufMut) {
        out.put_uint(self.len as u64, 3);
        let ft = self.frame_type.encode();
        out.put_u8(ft.ty);
        out.put_u8(ft.flags);
        out.put_slice(&pack_reserved_and_stream_id(self.reserved, self.stream_id));
    }

    /// Returns true if this frame is an ack
    pub fn is_ack(&self) -> bool {
        match self.frame_type {
            FrameType::Settings(flags) => flags.contains(SettingsFlags::Ack),
            FrameType::Ping(flags) => flags.contains(PingFlags::Ack),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndHeaders` set
    pub fn is_end_headers(&self) -> bool {
        match self.frame_type {
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndHeaders),
            FrameType::Continuation(flags) => flags.contains(ContinuationFlags::EndHeaders),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndStream` set
    pub fn is_end_stream(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::EndStream),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndStream),
            _ => false,
        }
    }
}

/// The first bit is reserved, the rest is a 31-bit value
pub fn parse_bit_and_u31(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
    let (i, x) = be_u32(i)?;

    let bit = (x >> 31) as u8;
    let val = x & 0x7FFF_FFFF;

    Ok((i, (bit, val)))
}

fn parse_reserved_and_stream_id(i: &[u8]) -> IResult<&[u8], (u8, StreamId)> {
    parse_bit_and_u31(i).map(|(i, (reserved, stream_id))| (i, (reserved, StreamId(stream_id))))
}

/// Pack a bit and a u31 into a 4-byte array (big-endian)
pub fn pack_bit_and_u31(bit: u8, val: u32) -> [u8; 4] {
    assert_eq!(val & 0x7FFF_FFFF, val, "val is too large: {val:x}");
    assert_eq!(bit & 0x1, bit, "bit should be 0 or 1: {bit:x}");

    let mut bytes = val.to_be_bytes();
    if bit != 0 {
        bytes[0] |= 0x80;
    }

    bytes
}

pub fn pack_reserved_and_stream_id(reserved: u8, stream_id: StreamId) -> [u8; 4] {
    pack_bit_and_u31(reserved, stream_id.0)
}

/// Priority block, found in PRIORITY frames and in HEADERS frames with the
/// PRIORITY flag. Parsed, never acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    // 0-255 => 1-256
    pub weight: u8,
}

impl PrioritySpec {
    pub const LEN: usize = 5;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((parse_reserved_and_stream_id, be_u8)),
            |((exclusive, stream_dependency), weight)| Self {
                exclusive: exclusive != 0,
                stream_dependency,
                weight,
            },
        )(i)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Returns the underlying u32
    pub fn as_repr(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KnownErrorCode::from_repr(self.0) {
            Some(e) => fmt::Debug::fmt(&e, f),
            None => write!(f, "ErrorCode(0x{:02x})", self.0),
        }
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e.repr())
    }
}

/// See <https://httpwg.org/specs/rfc9113.html#ErrorCodes>
#[EnumRepr(type = "u32")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownErrorCode {
    /// Graceful shutdown, or a stream that's no longer needed after a full
    /// response.
    NoError = 0x00,

    /// Unspecific protocol error.
    ProtocolError = 0x01,

    /// Unexpected internal error.
    InternalError = 0x02,

    /// The peer violated flow control.
    FlowControlError = 0x03,

    /// SETTINGS were not acknowledged in time.
    SettingsTimeout = 0x04,

    /// A frame arrived after the stream was half-closed.
    StreamClosed = 0x05,

    /// A frame had an invalid size.
    FrameSizeError = 0x06,

    /// The stream was refused before any application processing.
    RefusedStream = 0x07,

    /// The stream is no longer needed.
    Cancel = 0x08,

    /// The field section compression context can't be maintained.
    CompressionError = 0x09,

    /// A CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0x0a,

    /// The peer is generating excessive load.
    EnhanceYourCalm = 0x0b,

    InadequateSecurity = 0x0c,

    Http1_1Required = 0x0d,
}


impl TryFrom<ErrorCode> for KnownErrorCode {
    type Error = ();

    fn try_from(e: ErrorCode) -> Result<Self, Self::Error> {
        KnownErrorCode::from_repr(e.0).ok_or(())
    }
}

/// See <https://httpwg.org/specs/rfc9113.html#SettingValues>
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the HPACK dynamic table the sender's decoder uses.
    pub header_table_size: u32,

    /// Servers never push; a client advertising 1 only means it could accept
    /// pushes.
    pub enable_push: bool,

    /// Streams the sender permits the receiver to open. `None` is unlimited.
    pub max_concurrent_streams: Option<u32>,

    /// Initial stream-level flow control window, at most 2^31-1.
    pub initial_window_size: u32,

    /// Largest frame payload the sender accepts, in 2^14..=2^24-1.
    pub max_frame_size: u32,

    /// Advisory limit on the uncompressed field section size (name + value +
    /// 32 per field). 0 means unlimited.
    pub max_header_list_size: u32,

    /// RFC 8441: the sender understands extended CONNECT.
    pub enable_connect_protocol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: None,
            initial_window_size: (1 << 16) - 1,
            max_frame_size: (1 << 14),
            max_header_list_size: 0,
            enable_connect_protocol: false,
        }
    }
}

impl Settings {
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
    pub const MAX_FRAME_SIZE_ALLOWED_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Apply a setting, returning an error if the value is invalid.
    pub fn apply(&mut self, code: Setting, value: u32) -> Result<(), SettingsError> {
        match code {
            Setting::HeaderTableSize => {
                self.header_table_size = value;
            }
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePushValue { actual: value }),
            },
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
            }
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::InitialWindowSizeTooLarge { actual: value });
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_ALLOWED_RANGE.contains(&value) {
                    return Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: value });
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => {
                self.max_header_list_size = value;
            }
            Setting::EnableConnectProtocol => match value {
                0 => self.enable_connect_protocol = false,
                1 => self.enable_connect_protocol = true,
                _ => {
                    return Err(SettingsError::InvalidEnableConnectProtocolValue { actual: value })
                }
            },
        }

        Ok(())
    }

    /// Parse a series of settings, calling `callback` for each known setting.
    /// Unknown settings are ignored, a trailing partial setting is ignored
    /// too (callers check the length first).
    pub fn parse<E>(
        buf: &[u8],
        mut callback: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E> {
        for chunk in buf.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(id) = Setting::from_repr(id) {
                callback(id, value)?;
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("ENABLE_PUSH setting is supposed to be either 0 or 1, got {actual}")]
    InvalidEnablePushValue { actual: u32 },

    #[error("ENABLE_CONNECT_PROTOCOL setting is supposed to be either 0 or 1, got {actual}")]
    InvalidEnableConnectProtocolValue { actual: u32 },

    #[error("bad INITIAL_WINDOW_SIZE value {actual}, should be less than or equal to 2^31-1")]
    InitialWindowSizeTooLarge { actual: u32 },

    #[error(
        "bad SETTINGS_MAX_FRAME_SIZE value {actual}, should be between 2^14 and 2^24-1 inclusive"
    )]
    SettingsMaxFrameSizeInvalid { actual: u32 },
}

#[EnumRepr(type = "u16")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize = 0x01,
    EnablePush = 0x02,
    MaxConcurrentStreams = 0x03,
    InitialWindowSize = 0x04,
    MaxFrameSize = 0x05,
    MaxHeaderListSize = 0x06,
    EnableConnectProtocol = 0x08,
}


/// Payload for a GOAWAY frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: bytes::Bytes,
}

impl GoAway {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, ((_, last_stream_id), error_code)) =
            tuple((parse_reserved_and_stream_id, be_u32))(i)?;

        Ok((
            &rest[rest.len()..],
            Self {
                last_stream_id,
                error_code: ErrorCode(error_code),
                additional_debug_data: bytes::Bytes::copy_from_slice(rest),
            },
        ))
    }
}

/// Payload for a RST_STREAM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, error_code) = be_u32(i)?;
        Ok((
            rest,
            Self {
                error_code: ErrorCode(error_code),
            },
        ))
    }
}

/// Payload for a WINDOW_UPDATE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub reserved: u8,
    pub increment: u32,
}

impl WindowUpdate {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (reserved, increment)) = parse_bit_and_u31(i)?;
        Ok((
            rest,
            Self {
                reserved,
                increment,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pack_and_parse_bit_and_u31() {
        let test_cases = [
            (0, 0),
            (1, 0),
            (0, 1),
            (1, 1),
            (0, 0x7FFF_FFFF),
            (1, 0x7FFF_FFFF),
        ];

        for &(bit, number) in &test_cases {
            let packed = pack_bit_and_u31(bit, number);
            let (rest, (parsed_bit, parsed_number)) = parse_bit_and_u31(&packed[..]).unwrap();
            assert!(rest.is_empty());
            assert_eq!(bit, parsed_bit);
            assert_eq!(number, parsed_number);
        }
    }

    #[test]
    #[should_panic(expected = "bit should be 0 or 1: 2")]
    fn test_pack_bit_and_u31_panic_not_a_bit() {
        pack_bit_and_u31(2, 0);
    }

    #[test]
    #[should_panic(expected = "val is too large: 80000000")]
    fn test_pack_bit_and_u31_panic_val_too_large() {
        pack_bit_and_u31(0, 1 << 31);
    }

    #[test]
    fn settings_apply_rejects_invalid_values() {
        let mut s = Settings::default();
        assert_eq!(
            s.apply(Setting::EnablePush, 2),
            Err(SettingsError::InvalidEnablePushValue { actual: 2 })
        );
        assert_eq!(
            s.apply(Setting::InitialWindowSize, 1 << 31),
            Err(SettingsError::InitialWindowSizeTooLarge { actual: 1 << 31 })
        );
        assert_eq!(
            s.apply(Setting::MaxFrameSize, 1000),
            Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: 1000 })
        );
        assert_eq!(
            s.apply(Setting::EnableConnectProtocol, 7),
            Err(SettingsError::InvalidEnableConnectProtocolValue { actual: 7 })
        );

        s.apply(Setting::MaxFrameSize, 1 << 20).unwrap();
        s.apply(Setting::MaxConcurrentStreams, 12).unwrap();
        assert_eq!(s.max_frame_size, 1 << 20);
        assert_eq!(s.max_concurrent_streams, Some(12));
    }

    #[test]
    fn settings_parse_skips_unknown_ids() {
        let buf = [
            0x00, 0x04, 0x00, 0x00, 0x10, 0x00, // initial window size 4096
            0x00, 0xfe, 0x00, 0x00, 0x00, 0x01, // unknown
            0x00, 0x08, 0x00, 0x00, 0x00, 0x01, // enable connect protocol
        ];
        let mut seen = vec![];
        Settings::parse::<()>(&buf, |code, value| {
            seen.push((code, value));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (Setting::InitialWindowSize, 4096),
                (Setting::EnableConnectProtocol, 1)
            ]
        );
    }

    #[test]
    fn frame_type_survives_encoding() {
        let ft = FrameType::Headers(HeadersFlags::EndHeaders | HeadersFlags::EndStream);
        assert_eq!(FrameType::decode(ft.encode()), ft);

        let unknown = EncodedFrameType { ty: 0xfa, flags: 3 };
        assert_eq!(FrameType::decode(unknown), FrameType::Unknown(unknown));
    }

    #[test]
    fn wire_values_map_to_known_variants() {
        assert_eq!(RawFrameType::from_repr(0x09), Some(RawFrameType::Continuation));
        assert_eq!(RawFrameType::from_repr(0x0a), None);
        assert_eq!(RawFrameType::WindowUpdate.repr(), 0x08);

        assert_eq!(
            KnownErrorCode::try_from(ErrorCode(0x0d)),
            Ok(KnownErrorCode::Http1_1Required)
        );
        assert_eq!(KnownErrorCode::try_from(ErrorCode(0x0e)), Err(()));
        assert_eq!(ErrorCode::from(KnownErrorCode::Cancel).as_repr(), 0x08);

        assert_eq!(Setting::from_repr(0x07), None);
        assert_eq!(Setting::from_repr(0x08), Some(Setting::EnableConnectProtocol));
        assert_eq!(Setting::MaxHeaderListSize.repr(), 0x06);
    }
}
