use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::network::protocol::{Encodable, Frame, RequestMessage, StreamChunkId, WireError};
use crate::network::response_handler::{ResponseReceiver, TransportResponseHandler};


/// The 'open' flag of a physical connection. Closing is a one-way transition that the
///  connection's driver task observes and reacts to by shutting the socket down.
pub struct ConnectionChannel {
    remote: SocketAddr,
    closed: watch::Sender<bool>,
}

impl ConnectionChannel {
    pub fn new(remote: SocketAddr) -> ConnectionChannel {
        ConnectionChannel {
            remote,
            closed: watch::channel(false).0,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// returns `true` if this call closed the channel, `false` if it was closed before
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}


/// The sending side of one connection: sends requests and registers them with the connection's
///  [TransportResponseHandler] so that responses can be correlated.
pub struct TransportClient {
    channel: Arc<ConnectionChannel>,
    outbound: mpsc::UnboundedSender<Frame>,
    response_handler: Arc<TransportResponseHandler>,
    max_frame_size: usize,
    timed_out: AtomicBool,
    next_request_id: AtomicI64,
}

impl Debug for TransportClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportClient{{remote:{}, active:{}}}", self.channel.remote_addr(), self.is_active())
    }
}

impl TransportClient {
    pub fn new(
        channel: Arc<ConnectionChannel>,
        outbound: mpsc::UnboundedSender<Frame>,
        response_handler: Arc<TransportResponseHandler>,
        max_frame_size: usize,
    ) -> TransportClient {
        TransportClient {
            channel,
            outbound,
            response_handler,
            // the length prefix on the wire is a u32
            max_frame_size: max_frame_size.min(u32::MAX as usize),
            timed_out: AtomicBool::new(false),
            next_request_id: AtomicI64::new(0),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }

    pub fn is_active(&self) -> bool {
        !self.is_timed_out() && self.channel.is_open()
    }

    /// Marks the client as timed out. A timed out client is never active again, and a factory
    ///  holding it in its cache replaces it. Returns `true` for the first call only.
    pub fn time_out(&self) -> bool {
        !self.timed_out.swap(true, Ordering::AcqRel)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.channel.close() {
            debug!("closing connection to {}", self.remote_addr());
        }
    }

    /// Sends an RPC, returning a receiver for its eventual response
    pub async fn send_rpc(&self, body: Bytes) -> anyhow::Result<ResponseReceiver> {
        let (_, rx) = self.start_rpc(body).await?;
        Ok(rx)
    }

    /// Sends an RPC and waits for its response for at most `timeout`. A request that times out is
    ///  abandoned, and a late response for it is ignored.
    pub async fn send_rpc_and_wait(&self, body: Bytes, timeout: Duration) -> anyhow::Result<Bytes> {
        let (request_id, rx) = self.start_rpc(body).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => bail!("connection to {} was dropped before RPC {} was answered", self.remote_addr(), request_id),
            Err(_) => {
                self.response_handler.remove_rpc_request(request_id).await;
                bail!("RPC {} to {} was not answered within {:?}", request_id, self.remote_addr(), timeout)
            }
        }
    }

    async fn start_rpc(&self, body: Bytes) -> anyhow::Result<(i64, ResponseReceiver)> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request(RequestMessage::RpcRequest { request_id, body });
        let rx = self.response_handler.add_rpc_request(request_id, || self.send_frame(frame)).await?;
        Ok((request_id, rx))
    }

    pub async fn fetch_chunk(&self, stream_id: i64, chunk_index: i32) -> anyhow::Result<ResponseReceiver> {
        let chunk_id = StreamChunkId::new(stream_id, chunk_index);
        let frame = Frame::Request(RequestMessage::ChunkFetchRequest(chunk_id));
        self.response_handler.add_fetch_request(chunk_id, || self.send_frame(frame)).await
    }

    /// Sends a one-way message. Nothing is recorded, there is no response.
    pub fn send(&self, body: Bytes) -> anyhow::Result<()> {
        self.send_frame(Frame::Request(RequestMessage::OneWayMessage { body }))
    }

    /// Queues a frame for writing. This does not wait for the write to happen, write failures
    ///  surface as a fault of the connection.
    pub fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        if !self.channel.is_open() {
            bail!("connection to {} is closed", self.remote_addr());
        }

        let len = frame.encoded_length();
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge { len, max: self.max_frame_size }.into());
        }

        self.outbound.send(frame)
            .map_err(|_| anyhow!("connection to {} is shut down", self.remote_addr()))
    }

    pub(crate) fn send_or_log(&self, frame: Frame) {
        if let Err(e) = self.send_frame(frame) {
            warn!("failed to send response to {}: {:#}", self.remote_addr(), e);
        }
    }
}
