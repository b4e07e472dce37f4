//! Turns buffered bytes into typed frames and back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{
    DataFlags, ErrorCode, Frame, FrameType, GoAway, HeadersFlags, PrioritySpec, RstStream,
    Setting, Settings, SettingsFlags, WindowUpdate, FRAME_HEADER_LEN,
};

/// A frame payload, already stripped of padding and split into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Data(Bytes),
    Headers {
        priority: Option<PrioritySpec>,
        fragment: Bytes,
    },
    Priority(PrioritySpec),
    RstStream(RstStream),
    /// Known settings only, in wire order
    Settings(Vec<(Setting, u32)>),
    PushPromise(Bytes),
    Ping([u8; 8]),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Continuation(Bytes),
    Unknown(Bytes),
}

impl FramePayload {
    /// Number of bytes this payload occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            FramePayload::Data(b)
            | FramePayload::PushPromise(b)
            | FramePayload::Continuation(b)
            | FramePayload::Unknown(b) => b.len(),
            FramePayload::Headers { priority, fragment } => {
                priority.map(|_| PrioritySpec::LEN).unwrap_or_default() + fragment.len()
            }
            FramePayload::Priority(_) => PrioritySpec::LEN,
            FramePayload::RstStream(_) => 4,
            FramePayload::Settings(pairs) => pairs.len() * 6,
            FramePayload::Ping(_) => 8,
            FramePayload::GoAway(g) => 8 + g.additional_debug_data.len(),
            FramePayload::WindowUpdate(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame too large: {frame_type:?} frame of size {frame_size} exceeds max frame size of {max_frame_size}")]
    FrameTooLarge {
        frame_type: FrameType,
        frame_size: u32,
        max_frame_size: u32,
    },

    #[error("{frame_type:?} frame has invalid size {frame_size}, {expected}")]
    InvalidSize {
        frame_type: FrameType,
        frame_size: u32,
        expected: &'static str,
    },

    #[error("received {frame_type:?} frame with Padded flag but empty payload")]
    PaddedFrameEmpty { frame_type: FrameType },

    #[error("received {frame_type:?} with Padded flag but payload was shorter than padding")]
    PaddedFrameTooShort {
        frame_type: FrameType,
        padding_length: usize,
        frame_size: u32,
    },
}

impl FrameError {
    /// True for errors that RFC 9113 classifies as FRAME_SIZE_ERROR, the
    /// others are PROTOCOL_ERROR.
    pub fn is_frame_size_error(&self) -> bool {
        !matches!(self, FrameError::PaddedFrameTooShort { .. })
    }
}

/// Try to read one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. The declared length is
/// checked against `max_frame_size` as soon as the header is available, so
/// an oversized frame is rejected before its payload arrives.
pub fn try_read_frame(
    buf: &mut BytesMut,
    max_frame_size: u32,
) -> Result<Option<(Frame, FramePayload)>, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    // 9 bytes are always enough for a header
    let frame = match Frame::parse(&buf[..FRAME_HEADER_LEN]) {
        Ok((_, frame)) => frame,
        Err(_) => return Ok(None),
    };

    if frame.len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            frame_type: frame.frame_type,
            frame_size: frame.len,
            max_frame_size,
        });
    }

    let total = FRAME_HEADER_LEN + frame.len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(frame.len as usize).freeze();
    trace!(?frame, "deframed");

    let payload = decode_payload(&frame, payload)?;
    Ok(Some((frame, payload)))
}

fn decode_payload(frame: &Frame, payload: Bytes) -> Result<FramePayload, FrameError> {
    let invalid_size = |expected: &'static str| FrameError::InvalidSize {
        frame_type: frame.frame_type,
        frame_size: frame.len,
        expected,
    };

    let payload = match frame.frame_type {
        FrameType::Data(flags) => {
            let payload = if flags.contains(DataFlags::Padded) {
                strip_padding(frame, payload)?
            } else {
                payload
            };
            FramePayload::Data(payload)
        }
        FrameType::Headers(flags) => {
            let mut payload = if flags.contains(HeadersFlags::Padded) {
                strip_padding(frame, payload)?
            } else {
                payload
            };

            let priority = if flags.contains(HeadersFlags::Priority) {
                if payload.len() < PrioritySpec::LEN {
                    return Err(invalid_size("expected at least 5 bytes of priority"));
                }
                let spec = parse_priority(&payload[..PrioritySpec::LEN])
                    .ok_or_else(|| invalid_size("expected at least 5 bytes of priority"))?;
                payload.advance(PrioritySpec::LEN);
                Some(spec)
            } else {
                None
            };

            FramePayload::Headers {
                priority,
                fragment: payload,
            }
        }
        FrameType::Priority => {
            if payload.len() != PrioritySpec::LEN {
                return Err(invalid_size("expected exactly 5 bytes"));
            }
            FramePayload::Priority(
                parse_priority(&payload).ok_or_else(|| invalid_size("expected exactly 5 bytes"))?,
            )
        }
        FrameType::RstStream => {
            if payload.len() != 4 {
                return Err(invalid_size("expected exactly 4 bytes"));
            }
            let (_, rst) = RstStream::parse(&payload)
                .map_err(|_| invalid_size("expected exactly 4 bytes"))?;
            FramePayload::RstStream(rst)
        }
        FrameType::Settings(flags) => {
            if payload.len() % 6 != 0 {
                return Err(invalid_size("expected a multiple of 6 bytes"));
            }
            if flags.contains(SettingsFlags::Ack) && !payload.is_empty() {
                return Err(invalid_size("expected an empty SETTINGS ACK"));
            }
            let mut pairs = Vec::with_capacity(payload.len() / 6);
            Settings::parse::<()>(&payload, |code, value| {
                pairs.push((code, value));
                Ok(())
            })
            .ok();
            FramePayload::Settings(pairs)
        }
        FrameType::PushPromise => FramePayload::PushPromise(payload),
        FrameType::Ping(_) => {
            let data = <[u8; 8]>::try_from(&payload[..])
                .map_err(|_| invalid_size("expected exactly 8 bytes"))?;
            FramePayload::Ping(data)
        }
        FrameType::GoAway => {
            if payload.len() < 8 {
                return Err(invalid_size("expected at least 8 bytes"));
            }
            let (_, goaway) = GoAway::parse(&payload)
                .map_err(|_| invalid_size("expected at least 8 bytes"))?;
            FramePayload::GoAway(goaway)
        }
        FrameType::WindowUpdate => {
            if payload.len() != 4 {
                return Err(invalid_size("expected exactly 4 bytes"));
            }
            let (_, update) = WindowUpdate::parse(&payload)
                .map_err(|_| invalid_size("expected exactly 4 bytes"))?;
            FramePayload::WindowUpdate(update)
        }
        FrameType::Continuation(_) => FramePayload::Continuation(payload),
        FrameType::Unknown(_) => FramePayload::Unknown(payload),
    };

    Ok(payload)
}

fn parse_priority(i: &[u8]) -> Option<PrioritySpec> {
    PrioritySpec::parse(i).ok().map(|(_, spec)| spec)
}

/// Padding is one length byte up front and that many bytes at the end.
fn strip_padding(frame: &Frame, mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::PaddedFrameEmpty {
            frame_type: frame.frame_type,
        });
    }

    let padding_length = payload.get_u8() as usize;
    if payload.len() < padding_length {
        return Err(FrameError::PaddedFrameTooShort {
            frame_type: frame.frame_type,
            padding_length,
            frame_size: frame.len,
        });
    }

    payload.truncate(payload.len() - padding_length);
    Ok(payload)
}

/// Serialize a frame header followed by its payload. `frame.len` is
/// overwritten with the payload's encoded length.
///
/// For HEADERS with a priority block, the caller sets the PRIORITY flag.
pub fn write_frame(mut frame: Frame, payload: &FramePayload, out: &mut BytesMut) {
    let len = payload.encoded_len();
    frame.len = len as u32;
    out.reserve(FRAME_HEADER_LEN + len);
    frame.write_into(out);

    match payload {
        FramePayload::Data(b)
        | FramePayload::PushPromise(b)
        | FramePayload::Continuation(b)
        | FramePayload::Unknown(b) => out.put_slice(b),
        FramePayload::Headers { priority, fragment } => {
            if let Some(priority) = priority {
                write_priority(priority, out);
            }
            out.put_slice(fragment);
        }
        FramePayload::Priority(priority) => write_priority(priority, out),
        FramePayload::RstStream(rst) => out.put_u32(rst.error_code.as_repr()),
        FramePayload::Settings(pairs) => {
            for (code, value) in pairs {
                out.put_u16(code.repr());
                out.put_u32(*value);
            }
        }
        FramePayload::Ping(data) => out.put_slice(&data[..]),
        FramePayload::GoAway(goaway) => {
            out.put_u32(goaway.last_stream_id.0);
            out.put_u32(goaway.error_code.as_repr());
            out.put_slice(&goaway.additional_debug_data);
        }
        FramePayload::WindowUpdate(update) => {
            out.put_slice(&crate::pack_bit_and_u31(update.reserved, update.increment))
        }
    }
}

fn write_priority(priority: &PrioritySpec, out: &mut BytesMut) {
    out.put_slice(&crate::pack_reserved_and_stream_id(
        priority.exclusive as u8,
        priority.stream_dependency,
    ));
    out.put_u8(priority.weight);
}

impl From<ErrorCode> for RstStream {
    fn from(error_code: ErrorCode) -> Self {
        Self { error_code }
    }
}
