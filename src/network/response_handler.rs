use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::network::protocol::{ResponseMessage, StreamChunkId};


pub type ResponseSender = oneshot::Sender<anyhow::Result<Bytes>>;
pub type ResponseReceiver = oneshot::Receiver<anyhow::Result<Bytes>>;

/// A consistent snapshot of the data the idle check decides on
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionState {
    pub outstanding: usize,
    /// `None` if no request was ever sent on this connection
    pub time_of_last_request: Option<Instant>,
}

struct Outstanding {
    rpcs: FxHashMap<i64, ResponseSender>,
    fetches: FxHashMap<StreamChunkId, ResponseSender>,
    time_of_last_request: Option<Instant>,
}

impl Outstanding {
    fn len(&self) -> usize {
        self.rpcs.len() + self.fetches.len()
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, sender) in self.rpcs.drain() {
            let _ = sender.send(Err(anyhow!("{}", reason)));
        }
        for (_, sender) in self.fetches.drain() {
            let _ = sender.send(Err(anyhow!("{}", reason)));
        }
    }
}

/// Client-side bookkeeping of requests that were sent on one connection and wait for their
///  response.
///
/// All state lives in a single mutex-guarded record. Recording a request and actually sending it
///  happen in one critical section, and the idle check reads its snapshot under the same lock (see
///  [TransportResponseHandler::with_connection_state]). So the idle check can never see a request
///  that is sent but not yet counted.
pub struct TransportResponseHandler {
    remote: SocketAddr,
    outstanding: Mutex<Outstanding>,
}

impl TransportResponseHandler {
    pub fn new(remote: SocketAddr) -> TransportResponseHandler {
        TransportResponseHandler {
            remote,
            outstanding: Mutex::new(Outstanding {
                rpcs: Default::default(),
                fetches: Default::default(),
                time_of_last_request: None,
            }),
        }
    }

    /// Registers an RPC and calls `send` while holding the lock. If `send` fails, the record is
    ///  removed again and the error is returned.
    pub async fn add_rpc_request(&self, request_id: i64, send: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<ResponseReceiver> {
        let (tx, rx) = oneshot::channel();

        let mut outstanding = self.outstanding.lock().await;
        if outstanding.rpcs.contains_key(&request_id) {
            return Err(anyhow!("request id {} is already outstanding on connection to {}", request_id, self.remote));
        }
        outstanding.rpcs.insert(request_id, tx);
        outstanding.time_of_last_request = Some(Instant::now());

        if let Err(e) = send() {
            outstanding.rpcs.remove(&request_id);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn add_fetch_request(&self, chunk_id: StreamChunkId, send: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<ResponseReceiver> {
        let (tx, rx) = oneshot::channel();

        let mut outstanding = self.outstanding.lock().await;
        if outstanding.fetches.contains_key(&chunk_id) {
            return Err(anyhow!("fetch of {:?} is already outstanding on connection to {}", chunk_id, self.remote));
        }
        outstanding.fetches.insert(chunk_id, tx);
        outstanding.time_of_last_request = Some(Instant::now());

        if let Err(e) = send() {
            outstanding.fetches.remove(&chunk_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Abandons an RPC, e.g. because its caller timed out. Returns `false` if there was no such
    ///  request, i.e. it was completed concurrently.
    pub async fn remove_rpc_request(&self, request_id: i64) -> bool {
        self.outstanding.lock().await
            .rpcs.remove(&request_id)
            .is_some()
    }

    pub async fn remove_fetch_request(&self, chunk_id: StreamChunkId) -> bool {
        self.outstanding.lock().await
            .fetches.remove(&chunk_id)
            .is_some()
    }

    pub async fn num_outstanding_requests(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    pub async fn time_of_last_request(&self) -> Option<Instant> {
        self.outstanding.lock().await.time_of_last_request
    }

    /// Runs `f` with a snapshot of the connection state while holding the lock that guards request
    ///  registration. `f` must not block.
    pub async fn with_connection_state<R>(&self, f: impl FnOnce(ConnectionState) -> R) -> R {
        let outstanding = self.outstanding.lock().await;
        f(ConnectionState {
            outstanding: outstanding.len(),
            time_of_last_request: outstanding.time_of_last_request,
        })
    }

    pub async fn handle(&self, message: ResponseMessage) -> anyhow::Result<()> {
        match message {
            ResponseMessage::RpcResponse { request_id, body } => {
                match self.outstanding.lock().await.rpcs.remove(&request_id) {
                    Some(sender) => complete(sender, Ok(body)),
                    None => warn!("ignoring response for RPC {} from {} since it is not outstanding", request_id, self.remote),
                }
            }
            ResponseMessage::RpcFailure { request_id, error } => {
                match self.outstanding.lock().await.rpcs.remove(&request_id) {
                    Some(sender) => complete(sender, Err(anyhow!("{}", error))),
                    None => warn!("ignoring failure for RPC {} from {} since it is not outstanding: {}", request_id, self.remote, error),
                }
            }
            ResponseMessage::ChunkFetchSuccess { chunk_id, body } => {
                match self.outstanding.lock().await.fetches.remove(&chunk_id) {
                    Some(sender) => complete(sender, Ok(body)),
                    None => warn!("ignoring response for block {:?} from {} since it is not outstanding", chunk_id, self.remote),
                }
            }
            ResponseMessage::ChunkFetchFailure { chunk_id, error } => {
                match self.outstanding.lock().await.fetches.remove(&chunk_id) {
                    Some(sender) => complete(sender, Err(anyhow!("failure while fetching {:?}: {}", chunk_id, error))),
                    None => warn!("ignoring failure for block {:?} from {} since it is not outstanding: {}", chunk_id, self.remote, error),
                }
            }
        }
        Ok(())
    }

    pub async fn channel_active(&self) -> anyhow::Result<()> {
        trace!("connection to {} is active", self.remote);
        Ok(())
    }

    pub async fn channel_inactive(&self) -> anyhow::Result<()> {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.len() > 0 {
            error!("still have {} requests outstanding when connection from {} is closed", outstanding.len(), self.remote);
            outstanding.fail_all(&format!("connection from {} closed", self.remote));
        }
        Ok(())
    }

    pub async fn exception_caught(&self, cause: &anyhow::Error) -> anyhow::Result<()> {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.len() > 0 {
            error!("still have {} requests outstanding when connection from {} failed: {:#}", outstanding.len(), self.remote, cause);
            outstanding.fail_all(&format!("{:#}", cause));
        }
        Ok(())
    }
}

fn complete(sender: ResponseSender, result: anyhow::Result<Bytes>) {
    if sender.send(result).is_err() {
        debug!("caller is no longer waiting for the response");
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn remote() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 7077))
    }

    #[tokio::test]
    async fn test_rpc_response_completes_request() {
        let handler = TransportResponseHandler::new(remote());
        let rx = handler.add_rpc_request(5, || Ok(())).await.unwrap();
        assert_eq!(handler.num_outstanding_requests().await, 1);

        handler.handle(ResponseMessage::RpcResponse { request_id: 5, body: Bytes::from_static(b"ok") }).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(handler.num_outstanding_requests().await, 0);
    }

    #[tokio::test]
    async fn test_rpc_failure_fails_request() {
        let handler = TransportResponseHandler::new(remote());
        let rx = handler.add_rpc_request(1, || Ok(())).await.unwrap();

        handler.handle(ResponseMessage::RpcFailure { request_id: 1, error: "boom".to_string() }).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_unknown_response_is_ignored() {
        let handler = TransportResponseHandler::new(remote());
        let _rx = handler.add_rpc_request(1, || Ok(())).await.unwrap();

        handler.handle(ResponseMessage::RpcResponse { request_id: 2, body: Bytes::new() }).await.unwrap();
        handler.handle(ResponseMessage::ChunkFetchSuccess { chunk_id: StreamChunkId::new(1, 1), body: Bytes::new() }).await.unwrap();
        assert_eq!(handler.num_outstanding_requests().await, 1);
    }

    #[tokio::test]
    async fn test_fetch_response() {
        let handler = TransportResponseHandler::new(remote());
        let ok = handler.add_fetch_request(StreamChunkId::new(1, 0), || Ok(())).await.unwrap();
        let failed = handler.add_fetch_request(StreamChunkId::new(1, 1), || Ok(())).await.unwrap();
        assert_eq!(handler.num_outstanding_requests().await, 2);

        handler.handle(ResponseMessage::ChunkFetchSuccess { chunk_id: StreamChunkId::new(1, 0), body: Bytes::from_static(b"x") }).await.unwrap();
        handler.handle(ResponseMessage::ChunkFetchFailure { chunk_id: StreamChunkId::new(1, 1), error: "gone".to_string() }).await.unwrap();

        assert_eq!(ok.await.unwrap().unwrap(), Bytes::from_static(b"x"));
        assert!(failed.await.unwrap().unwrap_err().to_string().contains("gone"));
        assert_eq!(handler.num_outstanding_requests().await, 0);
    }

    #[tokio::test]
    async fn test_failed_send_is_not_recorded() {
        let handler = TransportResponseHandler::new(remote());
        let result = handler.add_rpc_request(1, || Err(anyhow!("closed"))).await;
        assert!(result.is_err());
        assert_eq!(handler.num_outstanding_requests().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let handler = TransportResponseHandler::new(remote());
        let _rx = handler.add_rpc_request(1, || Ok(())).await.unwrap();
        let mut sent = false;
        assert!(handler.add_rpc_request(1, || { sent = true; Ok(()) }).await.is_err());
        assert!(!sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_of_last_request() {
        let handler = TransportResponseHandler::new(remote());
        assert_eq!(handler.time_of_last_request().await, None);

        let _rx = handler.add_rpc_request(1, || Ok(())).await.unwrap();
        let first = handler.time_of_last_request().await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        let _rx2 = handler.add_fetch_request(StreamChunkId::new(0, 0), || Ok(())).await.unwrap();

        let state = handler.with_connection_state(|s| s).await;
        assert_eq!(state.outstanding, 2);
        assert_eq!(state.time_of_last_request, Some(first + Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_remove_rpc_request() {
        let handler = TransportResponseHandler::new(remote());
        let rx = handler.add_rpc_request(1, || Ok(())).await.unwrap();
        assert!(handler.remove_rpc_request(1).await);
        assert!(!handler.remove_rpc_request(1).await);
        assert_eq!(handler.num_outstanding_requests().await, 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_channel_inactive_fails_all() {
        let handler = TransportResponseHandler::new(remote());
        let rpc = handler.add_rpc_request(1, || Ok(())).await.unwrap();
        let fetch = handler.add_fetch_request(StreamChunkId::new(1, 1), || Ok(())).await.unwrap();

        handler.channel_inactive().await.unwrap();

        assert!(rpc.await.unwrap().unwrap_err().to_string().contains("closed"));
        assert!(fetch.await.unwrap().is_err());
        assert_eq!(handler.num_outstanding_requests().await, 0);
    }

    #[tokio::test]
    async fn test_exception_caught_fails_with_cause() {
        let handler = TransportResponseHandler::new(remote());
        let rpc = handler.add_rpc_request(1, || Ok(())).await.unwrap();

        handler.exception_caught(&anyhow!("connection reset")).await.unwrap();

        assert_eq!(rpc.await.unwrap().unwrap_err().to_string(), "connection reset");
        assert_eq!(handler.num_outstanding_requests().await, 0);
    }
}
