//! Tether wire format: the frame exchanged over every client socket.
//!
//! One WebSocket binary message carries exactly one frame:
//!
//!   [ FrameHeader (4 bytes) ][ msg (msg_len bytes, UTF-8) ][ payload ... ]
//!
//! The payload length is implied by the transport message boundary, so the
//! header never limits payload size. Changing the header layout is a breaking
//! change for every deployed client.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Fixed prefix of every frame.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// One of the [`Flag`] values.
    pub flag: u8,

    /// Length of the `msg` section in bytes, big endian. Zero means no msg.
    pub msg_len: [u8; 2],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 4]);

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Control flag carried in [`Meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    /// Client liveness probe. Answered with `Pong`.
    Ping = 0x01,
    /// Server answer to `Ping`.
    Pong = 0x02,
    /// Application payload.
    Data = 0x03,
    /// Server-reported problem. Carries a message, payload is empty.
    Err = 0x04,
}

impl Flag {
    /// Clients may only send `Ping` or `Data`. Anything else is a protocol
    /// violation answered with an `Err` frame.
    pub fn client_may_send(self) -> bool {
        matches!(self, Flag::Ping | Flag::Data)
    }
}

impl TryFrom<u8> for Flag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Flag::Ping),
            0x02 => Ok(Flag::Pong),
            0x03 => Ok(Flag::Data),
            0x04 => Ok(Flag::Err),
            other => Err(WireError::UnknownFlag(other)),
        }
    }
}

impl From<Flag> for u8 {
    fn from(f: Flag) -> u8 {
        f as u8
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Control part of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub flag: Flag,
    pub msg: Option<String>,
}

impl Meta {
    pub fn new(flag: Flag) -> Self {
        Self { flag, msg: None }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            flag: Flag::Err,
            msg: Some(msg.into()),
        }
    }
}

/// A decoded frame. The payload is a zero-copy slice of the received buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub meta: Meta,
    pub payload: Bytes,
}

impl Frame {
    pub fn ping() -> Self {
        Self::control(Flag::Ping)
    }

    pub fn pong() -> Self {
        Self::control(Flag::Pong)
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            meta: Meta::new(Flag::Data),
            payload: payload.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            meta: Meta::error(msg),
            payload: Bytes::new(),
        }
    }

    fn control(flag: Flag) -> Self {
        Self {
            meta: Meta::new(flag),
            payload: Bytes::new(),
        }
    }

    pub fn flag(&self) -> Flag {
        self.meta.flag
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode(&self.meta, &self.payload)
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Default upper bound on a whole inbound frame (header + msg + payload).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode a frame into a single buffer.
pub fn encode(meta: &Meta, payload: &[u8]) -> Result<Bytes, WireError> {
    let msg = meta.msg.as_deref().unwrap_or("");
    let msg_len = u16::try_from(msg.len()).map_err(|_| WireError::MsgTooLong(msg.len()))?;

    let header = FrameHeader {
        version: FRAME_VERSION,
        flag: meta.flag.into(),
        msg_len: msg_len.to_be_bytes(),
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.len() + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(msg.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a frame with the default size limit.
pub fn decode(bytes: Bytes) -> Result<Frame, WireError> {
    decode_with_limit(bytes, DEFAULT_MAX_FRAME_BYTES)
}

/// Decode a frame, rejecting anything larger than `max_frame_bytes`.
pub fn decode_with_limit(bytes: Bytes, max_frame_bytes: usize) -> Result<Frame, WireError> {
    if bytes.len() > max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            len: bytes.len(),
            max: max_frame_bytes,
        });
    }

    let header = FrameHeader::read_from_prefix(&bytes[..])
        .ok_or(WireError::Truncated(bytes.len()))?;

    if header.version != FRAME_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    let flag = Flag::try_from(header.flag)?;

    let msg_len = u16::from_be_bytes(header.msg_len) as usize;
    let available = bytes.len() - HEADER_LEN;
    if msg_len > available {
        return Err(WireError::MsgOverrun {
            declared: msg_len,
            available,
        });
    }

    let msg = if msg_len == 0 {
        None
    } else {
        let raw = &bytes[HEADER_LEN..HEADER_LEN + msg_len];
        Some(
            std::str::from_utf8(raw)
                .map_err(|_| WireError::InvalidMsg)?
                .to_owned(),
        )
    };

    Ok(Frame {
        meta: Meta { flag, msg },
        payload: bytes.slice(HEADER_LEN + msg_len..),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown flag byte: 0x{0:02x}")]
    UnknownFlag(u8),

    #[error("msg length {declared} exceeds remaining {available} bytes")]
    MsgOverrun { declared: usize, available: usize },

    #[error("msg is not valid UTF-8")]
    InvalidMsg,

    #[error("msg length {0} does not fit in the header")]
    MsgTooLong(usize),

    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
