//! Wire framing.
//!
//! ```text
//! +--------------+---------+---------+-----------------+
//! | total_length | opcode  | version | payload         |
//! |   4 bytes    | 2 bytes | 2 bytes | length - 4 bytes|
//! +--------------+---------+---------+-----------------+
//! ```
//!
//! All integers are big-endian. `total_length` counts everything after
//! itself: the opcode, the version and the payload.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest accepted `total_length`.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Size of the `total_length` prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the opcode and version fields.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame length {0}")]
    InvalidLength(u32),

    #[error("frame length {0} cannot hold opcode and version")]
    TooShort(u32),

    #[error("frame length {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: u32 },
}

/// Key selecting a message type: opcode plus wire version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub opcode: u16,
    pub version: u16,
}

impl MessageId {
    pub const fn new(opcode: u16, version: u16) -> Self {
        Self { opcode, version }
    }
}

impl From<u16> for MessageId {
    fn from(opcode: u16) -> Self {
        Self::new(opcode, 0)
    }
}

impl From<(u16, u16)> for MessageId {
    fn from((opcode, version): (u16, u16)) -> Self {
        Self::new(opcode, version)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.opcode, self.version)
    }
}

/// One decoded message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: MessageId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, FrameError> {
        encode_frame(self.id, &self.payload)
    }

    /// Takes one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// incomplete. An invalid length is an error; the caller cannot
    /// resynchronize the stream after one.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        validate_length(length)?;

        let frame_size = LENGTH_PREFIX_SIZE + length as usize;
        if buf.len() < frame_size {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_size);
        frame.advance(LENGTH_PREFIX_SIZE);
        let opcode = frame.get_u16();
        let version = frame.get_u16();

        Ok(Some(Self {
            id: MessageId::new(opcode, version),
            payload: frame.freeze(),
        }))
    }
}

fn validate_length(length: u32) -> Result<(), FrameError> {
    if length == 0 {
        return Err(FrameError::InvalidLength(length));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: length as usize,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if (length as usize) < HEADER_SIZE {
        return Err(FrameError::TooShort(length));
    }
    Ok(())
}

/// Builds a complete frame around an already serialized payload.
pub fn encode_frame(id: MessageId, payload: &[u8]) -> Result<BytesMut, FrameError> {
    let total = HEADER_SIZE + payload.len();
    if total > MAX_MESSAGE_SIZE as usize {
        return Err(FrameError::TooLarge {
            size: total,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + total);
    buf.put_u32(total as u32);
    buf.put_u16(id.opcode);
    buf.put_u16(id.version);
    buf.put_slice(payload);
    Ok(buf)
}
