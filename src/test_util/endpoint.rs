use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::deploy::DeployMessage;
use crate::rpc::{Dispatcher, EndpointAddress, RpcAddress, RpcEndpoint, RpcEndpointRef, RpcEnv};


/// An [RpcEndpointRef] standing in for a remote endpoint: it records everything that is sent to
///  it, and answers `ask` with a configurable reply.
#[derive(Debug)]
pub struct TrackingEndpointRef {
    address: EndpointAddress,
    sent: RwLock<Vec<DeployMessage>>,
    asked: RwLock<Vec<DeployMessage>>,
    ask_reply: RwLock<Result<bool, String>>,
}

impl TrackingEndpointRef {
    pub fn new(address: EndpointAddress) -> TrackingEndpointRef {
        TrackingEndpointRef {
            address,
            sent: Default::default(),
            asked: Default::default(),
            ask_reply: RwLock::new(Ok(true)),
        }
    }

    /// returns the messages passed to `send`, clearing the internal buffer
    pub async fn sent_messages(&self) -> Vec<DeployMessage> {
        std::mem::take(&mut *self.sent.write().await)
    }

    /// returns the messages passed to `ask`, clearing the internal buffer
    pub async fn asked_messages(&self) -> Vec<DeployMessage> {
        std::mem::take(&mut *self.asked.write().await)
    }

    /// `Err` makes subsequent asks fail with that message
    pub async fn set_ask_reply(&self, reply: Result<bool, String>) {
        *self.ask_reply.write().await = reply;
    }
}

#[async_trait]
impl RpcEndpointRef for TrackingEndpointRef {
    fn address(&self) -> EndpointAddress {
        self.address.clone()
    }

    async fn send(&self, message: DeployMessage) -> anyhow::Result<()> {
        self.sent.write().await.push(message);
        Ok(())
    }

    async fn ask(&self, message: DeployMessage) -> anyhow::Result<bool> {
        self.asked.write().await.push(message);
        self.ask_reply.read().await.clone()
            .map_err(|e| anyhow!(e))
    }
}


/// An [RpcEnv] without a network: local endpoints run for real, every other address is served by
///  a [TrackingEndpointRef] that tests can inspect.
pub struct TrackingRpcEnv {
    dispatcher: Dispatcher,
    remote_refs: RwLock<FxHashMap<EndpointAddress, Arc<TrackingEndpointRef>>>,
    stopped: RwLock<Vec<EndpointAddress>>,
}

impl TrackingRpcEnv {
    pub fn new(address: RpcAddress) -> Arc<TrackingRpcEnv> {
        Arc::new(TrackingRpcEnv {
            dispatcher: Dispatcher::new(address),
            remote_refs: Default::default(),
            stopped: Default::default(),
        })
    }

    /// The tracking reference for a remote endpoint, the same one for every call with the same
    ///  address
    pub async fn remote(&self, address: &EndpointAddress) -> Arc<TrackingEndpointRef> {
        self.remote_refs.write().await
            .entry(address.clone())
            .or_insert_with(|| Arc::new(TrackingEndpointRef::new(address.clone())))
            .clone()
    }

    /// A reference to a local endpoint, or `None` if there is no (running) endpoint of that name
    pub async fn local(&self, name: &str) -> Option<Arc<dyn RpcEndpointRef>> {
        let local: Arc<dyn RpcEndpointRef> = self.dispatcher.lookup(name).await?;
        Some(local)
    }

    /// simulates the loss of the connection to `remote`
    pub async fn disconnect(&self, remote: &RpcAddress) {
        self.dispatcher.broadcast_disconnected(remote).await;
    }

    /// returns the endpoints that were stopped through [RpcEnv::stop]
    pub async fn stopped(&self) -> Vec<EndpointAddress> {
        self.stopped.read().await.clone()
    }
}

#[async_trait]
impl RpcEnv for TrackingRpcEnv {
    fn address(&self) -> RpcAddress {
        self.dispatcher.address().clone()
    }

    async fn setup_endpoint(&self, name: &str, endpoint: Arc<dyn RpcEndpoint>) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
        let endpoint_ref: Arc<dyn RpcEndpointRef> = self.dispatcher.register(name, endpoint).await?;
        Ok(endpoint_ref)
    }

    async fn endpoint_ref(&self, address: &EndpointAddress) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
        if &address.address == self.dispatcher.address() {
            return self.local(&address.name).await
                .ok_or_else(|| anyhow!("no endpoint named {}", address.name));
        }
        let remote: Arc<dyn RpcEndpointRef> = self.remote(address).await;
        Ok(remote)
    }

    async fn stop(&self, address: &EndpointAddress) {
        self.stopped.write().await.push(address.clone());
        self.dispatcher.unregister(&address.name).await;
    }
}
