use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace, warn};

use crate::network::client::TransportClient;
use crate::network::protocol::{Frame, RequestMessage, ResponseMessage};


/// Application-level handling of RPCs and one-way messages arriving on a connection. One handler
///  instance is typically shared by all connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles an RPC. The reply goes through `callback`, which may be completed later from
    ///  another task. Returning an error is a fault of the connection.
    async fn receive(&self, client: Arc<TransportClient>, body: Bytes, callback: RpcResponseCallback) -> anyhow::Result<()>;

    async fn receive_one_way(&self, client: Arc<TransportClient>, body: Bytes) -> anyhow::Result<()>;

    async fn channel_active(&self, client: Arc<TransportClient>) -> anyhow::Result<()>;

    async fn channel_inactive(&self, client: Arc<TransportClient>) -> anyhow::Result<()>;

    async fn exception_caught(&self, cause: String, client: Arc<TransportClient>) -> anyhow::Result<()>;
}


/// Source of chunks for [RequestMessage::ChunkFetchRequest]
#[cfg_attr(test, automock)]
pub trait StreamManager: Send + Sync + 'static {
    fn get_chunk(&self, stream_id: i64, chunk_index: i32) -> anyhow::Result<Bytes>;

    fn connection_terminated(&self, remote: SocketAddr);
}

/// A [StreamManager] without streams, every fetch fails
pub struct NoStreams;

impl StreamManager for NoStreams {
    fn get_chunk(&self, stream_id: i64, chunk_index: i32) -> anyhow::Result<Bytes> {
        bail!("requested chunk {} of stream {}, but no streams are registered", chunk_index, stream_id)
    }

    fn connection_terminated(&self, _remote: SocketAddr) {}
}


/// Completes one RPC with either a response or a failure. Completing consumes the callback, and
///  a callback that is dropped without being completed sends a failure, so the caller always gets
///  exactly one answer.
pub struct RpcResponseCallback {
    request_id: i64,
    client: Option<Arc<TransportClient>>,
}

impl RpcResponseCallback {
    pub fn new(request_id: i64, client: Arc<TransportClient>) -> RpcResponseCallback {
        RpcResponseCallback {
            request_id,
            client: Some(client),
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn on_success(mut self, body: Bytes) {
        if let Some(client) = self.client.take() {
            trace!("sending response for RPC {} to {}", self.request_id, client.remote_addr());
            client.send_or_log(ResponseMessage::RpcResponse { request_id: self.request_id, body }.into());
        }
    }

    pub fn on_failure(mut self, error: String) {
        if let Some(client) = self.client.take() {
            debug!("sending failure for RPC {} to {}: {}", self.request_id, client.remote_addr(), error);
            client.send_or_log(ResponseMessage::RpcFailure { request_id: self.request_id, error }.into());
        }
    }
}

impl Drop for RpcResponseCallback {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("RPC {} from {} was dropped without a reply", self.request_id, client.remote_addr());
            client.send_or_log(ResponseMessage::RpcFailure {
                request_id: self.request_id,
                error: "request was dropped without a reply".to_string(),
            }.into());
        }
    }
}


/// The request side of a connection as seen by the connection's lifecycle handler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestMessageHandler: Send + Sync + 'static {
    async fn handle(&self, request: RequestMessage) -> anyhow::Result<()>;

    async fn channel_active(&self) -> anyhow::Result<()>;

    async fn channel_inactive(&self) -> anyhow::Result<()>;

    async fn exception_caught(&self, cause: String) -> anyhow::Result<()>;
}

/// Dispatches incoming requests of one connection: RPCs and one-way messages go to the
///  [RpcHandler], chunk fetches are answered from the [StreamManager].
pub struct TransportRequestHandler {
    client: Arc<TransportClient>,
    rpc_handler: Arc<dyn RpcHandler>,
    stream_manager: Arc<dyn StreamManager>,
}

impl TransportRequestHandler {
    pub fn new(client: Arc<TransportClient>, rpc_handler: Arc<dyn RpcHandler>, stream_manager: Arc<dyn StreamManager>) -> TransportRequestHandler {
        TransportRequestHandler {
            client,
            rpc_handler,
            stream_manager,
        }
    }
}

#[async_trait]
impl RequestMessageHandler for TransportRequestHandler {
    async fn handle(&self, request: RequestMessage) -> anyhow::Result<()> {
        match request {
            RequestMessage::ChunkFetchRequest(chunk_id) => {
                trace!("received request for {:?} from {}", chunk_id, self.client.remote_addr());
                let response = match self.stream_manager.get_chunk(chunk_id.stream_id, chunk_id.chunk_index) {
                    Ok(body) => ResponseMessage::ChunkFetchSuccess { chunk_id, body },
                    Err(e) => {
                        warn!("error opening {:?} for request from {}: {:#}", chunk_id, self.client.remote_addr(), e);
                        ResponseMessage::ChunkFetchFailure { chunk_id, error: format!("{:#}", e) }
                    }
                };
                self.client.send_or_log(Frame::Response(response));
                Ok(())
            }
            RequestMessage::RpcRequest { request_id, body } => {
                let callback = RpcResponseCallback::new(request_id, self.client.clone());
                self.rpc_handler.receive(self.client.clone(), body, callback).await
            }
            RequestMessage::OneWayMessage { body } => {
                self.rpc_handler.receive_one_way(self.client.clone(), body).await
            }
        }
    }

    async fn channel_active(&self) -> anyhow::Result<()> {
        self.rpc_handler.channel_active(self.client.clone()).await
    }

    async fn channel_inactive(&self) -> anyhow::Result<()> {
        self.stream_manager.connection_terminated(self.client.remote_addr());
        self.rpc_handler.channel_inactive(self.client.clone()).await
    }

    async fn exception_caught(&self, cause: String) -> anyhow::Result<()> {
        self.rpc_handler.exception_caught(cause, self.client.clone()).await
    }
}
