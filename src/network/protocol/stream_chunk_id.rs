use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};

use crate::network::protocol::{Encodable, WireError};
use crate::util::buf::ensure_remaining;


/// Addresses a single chunk inside a stream. The encoding is a fixed 12 bytes: the stream id as
///  i64, followed by the chunk index as i32, both big-endian.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct StreamChunkId {
    pub stream_id: i64,
    pub chunk_index: i32,
}

impl StreamChunkId {
    pub const SERIALIZED_LEN: usize = size_of::<i64>() + size_of::<i32>();

    pub fn new(stream_id: i64, chunk_index: i32) -> StreamChunkId {
        StreamChunkId {
            stream_id,
            chunk_index,
        }
    }
}

impl Debug for StreamChunkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[stream {} chunk {}]", self.stream_id, self.chunk_index)
    }
}

impl Encodable for StreamChunkId {
    fn encoded_length(&self) -> usize {
        Self::SERIALIZED_LEN
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.stream_id);
        buf.put_i32(self.chunk_index);
    }

    fn decode(buf: &mut impl Buf) -> Result<StreamChunkId, WireError> {
        ensure_remaining(buf, Self::SERIALIZED_LEN, "stream chunk id")?;
        let stream_id = buf.get_i64();
        let chunk_index = buf.get_i32();
        Ok(StreamChunkId {
            stream_id,
            chunk_index,
        })
    }
}
