//! Message framing and typed dispatch.
//!
//! This module turns the raw byte chunks delivered by the
//! [`net`](crate::net) transport into discrete, typed messages, and turns
//! typed values back into framed bytes on a connection's outbound queue.
//!
//! # Binary Format
//!
//! Every message travels in one [`Frame`]:
//!
//! - a 4-byte length counting everything after itself;
//! - a 2-byte opcode and a 2-byte version, together the [`MessageId`];
//! - the payload.
//!
//! All integers are big-endian. A length of zero or above
//! [`MAX_MESSAGE_SIZE`] can never be resynchronized and drops the connection.
//!
//! # Dispatch
//!
//! [`ProtocolServer`] keeps one accumulator per connection. Each inbound chunk
//! is appended and every complete frame in it is dispatched before the
//! chunk is released, so pipelined frames and frames split across reads take
//! the same path. For each frame:
//!
//! - no deserializer for the key: logged and skipped, the stream continues;
//! - deserializer fails: protocol violation;
//! - handler registered: called with the decoded value, failure is a
//!   protocol violation.
//!
//! A protocol violation discards the accumulator and disconnects the client.
//!
//! # Key Components
//!
//! - [`ProtocolServer`]: owns the transport, the registries and the accumulators.
//! - [`Sender`]: cloneable handle handlers use to reply.
//! - [`FramedStream`]: blocking client-side reader/writer of the same format.
pub mod codec;
mod frame;
pub mod message;
mod registry;
mod server;
mod transport;

pub use codec::CodecError;
pub use frame::{
    Frame, FrameError, HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, MessageId, encode_frame,
};
pub use message::{PING, PONG, Ping, Pong};
pub use registry::{
    DeserializeFn, DeserializerRegistry, HandlerError, HandlerFn, HandlerRegistry, Registry,
    SerializeFn, SerializerRegistry,
};
pub use server::{ProtocolServer, ProtocolViolation, Sender};
pub use transport::{FramedStream, TransportError};
