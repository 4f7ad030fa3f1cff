//! Frame layer.
//!
//! <https://www.rfc-editor.org/rfc/rfc9113.html#name-frame-definitions>
use bytes::{Buf, BufMut, BytesMut};

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Type {
    Data = 0,
    Headers = 1,
    /// Deprecated, ignored on receipt.
    Priority = 2,
    RstStream = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
}

impl Type {
    pub(crate) fn from_u8(ty: u8) -> Option<Self> {
        if ty < 10 {
            // SAFETY: every discriminant below 10 is declared
            Some(unsafe { core::mem::transmute::<u8, Self>(ty) })
        } else {
            None
        }
    }
}

// per-type flag bits
pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

/// The 9-octet frame header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Header {
    /// Payload length, a 24-bit integer.
    pub len: u32,
    /// Frame type; unknown types are ignored and discarded.
    pub ty: u8,
    /// Flags specific to the frame type.
    pub flags: u8,
    /// Stream identifier, a 31-bit integer. Zero addresses the connection.
    pub stream_id: u32,
}

impl Header {
    pub(crate) const SIZE: usize = 9;

    pub(crate) fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Header {
            len: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            ty: bytes[3],
            flags: bytes[4],
            // the reserved high bit is ignored
            stream_id: u32::from_be_bytes([bytes[5] & 0x7f, bytes[6], bytes[7], bytes[8]]),
        }
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        let len = self.len.to_be_bytes();
        out.reserve(Self::SIZE);
        out.put_slice(&len[1..]);
        out.put_u8(self.ty);
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & (u32::MAX >> 1));
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub(crate) fn frame_type(&self) -> Option<Type> {
        Type::from_u8(self.ty)
    }

    #[inline]
    pub(crate) fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// One complete frame read off the wire.
#[derive(Debug, PartialEq)]
pub(crate) struct Frame {
    pub header: Header,
    pub payload: BytesMut,
}

/// Pulls the next whole frame off the buffer, enforcing `max_frame_size`.
pub(crate) fn parse(
    buffer: &mut BytesMut,
    max_frame_size: u32,
) -> Result<Option<Frame>, FrameSizeError> {
    let Some((header, _)) = buffer.as_ref().split_first_chunk::<{ Header::SIZE }>() else {
        return Ok(None);
    };
    let header = Header::decode(header);
    if header.len > max_frame_size {
        return Err(FrameSizeError);
    }
    if buffer.len() < Header::SIZE + header.len() {
        return Ok(None);
    }
    buffer.advance(Header::SIZE);
    let payload = buffer.split_to(header.len());
    Ok(Some(Frame { header, payload }))
}

/// Appends a whole frame.
pub(crate) fn encode(ty: Type, flags: u8, stream_id: u32, payload: &[u8], out: &mut BytesMut) {
    Header {
        len: payload.len() as u32,
        ty: ty as u8,
        flags,
        stream_id,
    }
    .encode(out);
    out.put_slice(payload);
}

/// A frame larger than the advertised SETTINGS_MAX_FRAME_SIZE.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FrameSizeError;

impl std::error::Error for FrameSizeError {}

impl std::fmt::Display for FrameSizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("frame exceeds maximum frame size")
    }
}

// ===== Error codes =====

/// RFC 9113 error codes used in RST_STREAM and GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Compression = 0x9,
    EnhanceYourCalm = 0xb,
}

// ===== Test =====
