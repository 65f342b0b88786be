//! Wire format of the transport protocol.
//!
//! Frames travel length-prefixed on the connection (see [crate::network::connection]), the frame
//!  body itself starts with a one-byte tag:
//!
//! ```ascii
//! 0: ChunkFetchRequest  stream chunk id
//! 1: ChunkFetchSuccess  stream chunk id, body
//! 2: ChunkFetchFailure  stream chunk id, error string
//! 3: RpcRequest         request id (i64), body
//! 4: RpcResponse        request id (i64), body
//! 5: RpcFailure         request id (i64), error string
//! 9: OneWayMessage      body
//! ```
//!
//! All fixed-width integers are big-endian. Strings and bodies are prefixed with their length as
//!  an unsigned varint. Any other tag is not interpreted here, it is handed on unchanged.

mod message;
mod stream_chunk_id;
mod wire_error;

use bytes::{Buf, BufMut};

pub use message::{Frame, RequestMessage, ResponseMessage};
pub use stream_chunk_id::StreamChunkId;
pub use wire_error::WireError;


/// Fixed-shape values that know their exact encoded size.
///
/// `encode` writes exactly `encoded_length()` bytes without padding or markers, and `decode` is a
///  pure function of the leading bytes of its buffer: it checks that enough bytes are available
///  before reading a field, failing with [WireError::Malformed] rather than returning a partially
///  populated value.
pub trait Encodable: Sized {
    fn encoded_length(&self) -> usize;

    fn encode(&self, buf: &mut impl BufMut);

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError>;
}
