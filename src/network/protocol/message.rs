use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::protocol::{Encodable, StreamChunkId, WireError};
use crate::util::buf::{blob_len, ensure_remaining, put_blob, put_string, string_len, try_get_blob, try_get_i64, try_get_string};


const TAG_CHUNK_FETCH_REQUEST: u8 = 0;
const TAG_CHUNK_FETCH_SUCCESS: u8 = 1;
const TAG_CHUNK_FETCH_FAILURE: u8 = 2;
const TAG_RPC_REQUEST: u8 = 3;
const TAG_RPC_RESPONSE: u8 = 4;
const TAG_RPC_FAILURE: u8 = 5;
const TAG_ONE_WAY_MESSAGE: u8 = 9;

const REQUEST_ID_LEN: usize = size_of::<i64>();


/// Frames that are handled by the request side of a connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RequestMessage {
    ChunkFetchRequest(StreamChunkId),
    RpcRequest {
        request_id: i64,
        body: Bytes,
    },
    OneWayMessage {
        body: Bytes,
    },
}

/// Frames that complete an outstanding request
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseMessage {
    ChunkFetchSuccess {
        chunk_id: StreamChunkId,
        body: Bytes,
    },
    ChunkFetchFailure {
        chunk_id: StreamChunkId,
        error: String,
    },
    RpcResponse {
        request_id: i64,
        body: Bytes,
    },
    RpcFailure {
        request_id: i64,
        error: String,
    },
}

/// A decoded frame body. Frames with a tag that is not part of this protocol are carried as
///  [Frame::Unrecognized] so that they can be passed on to some outer layer unchanged.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Request(RequestMessage),
    Response(ResponseMessage),
    Unrecognized {
        tag: u8,
        payload: Bytes,
    },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Request(RequestMessage::ChunkFetchRequest(_)) => TAG_CHUNK_FETCH_REQUEST,
            Frame::Request(RequestMessage::RpcRequest { .. }) => TAG_RPC_REQUEST,
            Frame::Request(RequestMessage::OneWayMessage { .. }) => TAG_ONE_WAY_MESSAGE,
            Frame::Response(ResponseMessage::ChunkFetchSuccess { .. }) => TAG_CHUNK_FETCH_SUCCESS,
            Frame::Response(ResponseMessage::ChunkFetchFailure { .. }) => TAG_CHUNK_FETCH_FAILURE,
            Frame::Response(ResponseMessage::RpcResponse { .. }) => TAG_RPC_RESPONSE,
            Frame::Response(ResponseMessage::RpcFailure { .. }) => TAG_RPC_FAILURE,
            Frame::Unrecognized { tag, .. } => *tag,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_length());
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl From<RequestMessage> for Frame {
    fn from(value: RequestMessage) -> Self {
        Frame::Request(value)
    }
}

impl From<ResponseMessage> for Frame {
    fn from(value: ResponseMessage) -> Self {
        Frame::Response(value)
    }
}

impl Encodable for Frame {
    fn encoded_length(&self) -> usize {
        let body_len = match self {
            Frame::Request(RequestMessage::ChunkFetchRequest(chunk_id)) => chunk_id.encoded_length(),
            Frame::Request(RequestMessage::RpcRequest { body, .. }) => REQUEST_ID_LEN + blob_len(body),
            Frame::Request(RequestMessage::OneWayMessage { body }) => blob_len(body),
            Frame::Response(ResponseMessage::ChunkFetchSuccess { chunk_id, body }) => chunk_id.encoded_length() + blob_len(body),
            Frame::Response(ResponseMessage::ChunkFetchFailure { chunk_id, error }) => chunk_id.encoded_length() + string_len(error),
            Frame::Response(ResponseMessage::RpcResponse { body, .. }) => REQUEST_ID_LEN + blob_len(body),
            Frame::Response(ResponseMessage::RpcFailure { error, .. }) => REQUEST_ID_LEN + string_len(error),
            Frame::Unrecognized { payload, .. } => payload.len(),
        };
        1 + body_len
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag());
        match self {
            Frame::Request(RequestMessage::ChunkFetchRequest(chunk_id)) => {
                chunk_id.encode(buf);
            }
            Frame::Request(RequestMessage::RpcRequest { request_id, body }) => {
                buf.put_i64(*request_id);
                put_blob(buf, body);
            }
            Frame::Request(RequestMessage::OneWayMessage { body }) => {
                put_blob(buf, body);
            }
            Frame::Response(ResponseMessage::ChunkFetchSuccess { chunk_id, body }) => {
                chunk_id.encode(buf);
                put_blob(buf, body);
            }
            Frame::Response(ResponseMessage::ChunkFetchFailure { chunk_id, error }) => {
                chunk_id.encode(buf);
                put_string(buf, error);
            }
            Frame::Response(ResponseMessage::RpcResponse { request_id, body }) => {
                buf.put_i64(*request_id);
                put_blob(buf, body);
            }
            Frame::Response(ResponseMessage::RpcFailure { request_id, error }) => {
                buf.put_i64(*request_id);
                put_string(buf, error);
            }
            Frame::Unrecognized { payload, .. } => {
                buf.put_slice(payload);
            }
        }
    }

    /// Decodes a complete frame body, i.e. `buf` is expected to be delimited by the frame's length
    ///  prefix. An unrecognized frame takes all remaining bytes as its payload.
    fn decode(buf: &mut impl Buf) -> Result<Frame, WireError> {
        ensure_remaining(buf, 1, "frame tag")?;
        let frame = match buf.get_u8() {
            TAG_CHUNK_FETCH_REQUEST => {
                Frame::Request(RequestMessage::ChunkFetchRequest(StreamChunkId::decode(buf)?))
            }
            TAG_RPC_REQUEST => {
                let request_id = try_get_i64(buf, "rpc request id")?;
                let body = try_get_blob(buf, "rpc request body")?;
                Frame::Request(RequestMessage::RpcRequest { request_id, body })
            }
            TAG_ONE_WAY_MESSAGE => {
                let body = try_get_blob(buf, "one-way message body")?;
                Frame::Request(RequestMessage::OneWayMessage { body })
            }
            TAG_CHUNK_FETCH_SUCCESS => {
                let chunk_id = StreamChunkId::decode(buf)?;
                let body = try_get_blob(buf, "chunk body")?;
                Frame::Response(ResponseMessage::ChunkFetchSuccess { chunk_id, body })
            }
            TAG_CHUNK_FETCH_FAILURE => {
                let chunk_id = StreamChunkId::decode(buf)?;
                let error = try_get_string(buf, "chunk fetch error")?;
                Frame::Response(ResponseMessage::ChunkFetchFailure { chunk_id, error })
            }
            TAG_RPC_RESPONSE => {
                let request_id = try_get_i64(buf, "rpc response id")?;
                let body = try_get_blob(buf, "rpc response body")?;
                Frame::Response(ResponseMessage::RpcResponse { request_id, body })
            }
            TAG_RPC_FAILURE => {
                let request_id = try_get_i64(buf, "rpc failure id")?;
                let error = try_get_string(buf, "rpc failure error")?;
                Frame::Response(ResponseMessage::RpcFailure { request_id, error })
            }
            tag => {
                let payload = buf.copy_to_bytes(buf.remaining());
                Frame::Unrecognized { tag, payload }
            }
        };
        Ok(frame)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn chunk(stream_id: i64, chunk_index: i32) -> StreamChunkId {
        StreamChunkId::new(stream_id, chunk_index)
    }

    #[rstest]
    #[case::fetch_request(Frame::Request(RequestMessage::ChunkFetchRequest(chunk(1, 2))), vec![0, 0,0,0,0,0,0,0,1, 0,0,0,2])]
    #[case::rpc_request(Frame::Request(RequestMessage::RpcRequest { request_id: 7, body: Bytes::from_static(b"ab") }), vec![3, 0,0,0,0,0,0,0,7, 2,97,98])]
    #[case::one_way(Frame::Request(RequestMessage::OneWayMessage { body: Bytes::new() }), vec![9, 0])]
    #[case::fetch_success(Frame::Response(ResponseMessage::ChunkFetchSuccess { chunk_id: chunk(-1, 0), body: Bytes::from_static(b"x") }), vec![1, 255,255,255,255,255,255,255,255, 0,0,0,0, 1,120])]
    #[case::fetch_failure(Frame::Response(ResponseMessage::ChunkFetchFailure { chunk_id: chunk(0, 1), error: "no".to_string() }), vec![2, 0,0,0,0,0,0,0,0, 0,0,0,1, 2,110,111])]
    #[case::rpc_response(Frame::Response(ResponseMessage::RpcResponse { request_id: -2, body: Bytes::from_static(b"\x01") }), vec![4, 255,255,255,255,255,255,255,254, 1,1])]
    #[case::rpc_failure(Frame::Response(ResponseMessage::RpcFailure { request_id: 1, error: "e".to_string() }), vec![5, 0,0,0,0,0,0,0,1, 1,101])]
    #[case::unrecognized(Frame::Unrecognized { tag: 42, payload: Bytes::from_static(b"raw") }, vec![42, 114,97,119])]
    fn test_encode_decode(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let encoded = frame.to_bytes();
        assert_eq!(encoded.as_ref(), expected.as_slice());
        assert_eq!(frame.encoded_length(), expected.len());

        let mut parse_buf = encoded.clone();
        assert_eq!(Frame::decode(&mut parse_buf).unwrap(), frame);
        assert!(parse_buf.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::fetch_request_short(vec![0, 0,0,0,0,0,0,0,1, 0,0,0])]
    #[case::rpc_request_no_id(vec![3, 0,0,0])]
    #[case::rpc_request_body_short(vec![3, 0,0,0,0,0,0,0,7, 5,97])]
    #[case::rpc_failure_no_error(vec![5, 0,0,0,0,0,0,0,1])]
    #[case::one_way_no_body(vec![9])]
    fn test_decode_malformed(#[case] data: Vec<u8>) {
        let mut buf: &[u8] = &data;
        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(err.is_malformed(), "{:?}", err);
    }

    #[test]
    fn test_tag_matches_encoding() {
        let frame: Frame = ResponseMessage::RpcResponse { request_id: 3, body: Bytes::new() }.into();
        assert_eq!(frame.tag(), frame.to_bytes()[0]);
    }
}
