use std::io::{self, Read, Write};

use bincode::{Decode, Encode};
use bytes::BytesMut;
use thiserror::Error;

use super::{CodecError, Frame, FrameError, MessageId, codec, encode_frame};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to encode message: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
}

/// Blocking framed stream, the client side of the wire format.
pub struct FramedStream<T: Read + Write> {
    stream: T,
    buffer: BytesMut,
}

impl<T: Read + Write> FramedStream<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.write_raw(&bytes)
    }

    pub fn write_message<M: Encode>(
        &mut self,
        id: MessageId,
        message: &M,
    ) -> Result<(), TransportError> {
        let payload = codec::encode(message)?;
        let bytes = encode_frame(id, &payload)?;
        self.write_raw(&bytes)
    }

    /// Blocks until one whole frame has arrived.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn read_message<M: Decode<()>>(&mut self) -> Result<(MessageId, M), TransportError> {
        let frame = self.read_frame()?;
        let message = codec::decode(&frame.payload)?;
        Ok((frame.id, message))
    }
}
