//! Payload encoding helpers.
//!
//! Payloads produced here use bincode with big-endian, fixed-width integers,
//! matching the byte order of the frame header.
use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("payload has {remaining} unread trailing bytes")]
    TrailingBytes { remaining: usize },

    #[error("value is not a {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::encode_to_vec(value, config())?)
}

/// Decodes a whole payload. Truncated input and leftover bytes both fail.
pub fn decode<T: Decode<()>>(payload: &[u8]) -> Result<T, CodecError> {
    let (value, read) = bincode::decode_from_slice(payload, config())?;
    if read != payload.len() {
        return Err(CodecError::TrailingBytes {
            remaining: payload.len() - read,
        });
    }
    Ok(value)
}
