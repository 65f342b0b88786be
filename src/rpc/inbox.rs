use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn, Instrument};

use crate::deploy::DeployMessage;
use crate::rpc::{EndpointAddress, RpcAddress, RpcCallContext, RpcEndpoint, RpcEndpointRef};


pub enum InboxMessage {
    OneWay {
        sender: RpcAddress,
        message: DeployMessage,
    },
    Rpc {
        message: DeployMessage,
        context: RpcCallContext,
    },
    RemoteDisconnected(RpcAddress),
    Stop,
}

/// Spawns the task that feeds an endpoint its messages, one at a time in arrival order. The
///  endpoint's `on_start` runs before the first message, `on_stop` after [InboxMessage::Stop].
pub fn spawn_inbox(address: EndpointAddress, endpoint: Arc<dyn RpcEndpoint>) -> mpsc::UnboundedSender<InboxMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let span = tracing::info_span!("endpoint", name = %address.name);
    tokio::spawn(async move {
        if let Err(e) = endpoint.on_start().await {
            error!("endpoint {} failed to start, stopping it: {:#}", address, e);
            endpoint.on_stop().await;
            return;
        }

        while let Some(msg) = rx.recv().await {
            match msg {
                InboxMessage::OneWay { sender, message } => {
                    if let Err(e) = endpoint.receive(sender, message).await {
                        warn!("error handling message: {:#}", e);
                    }
                }
                InboxMessage::Rpc { message, context } => {
                    if let Err(e) = endpoint.receive_and_reply(message, context).await {
                        warn!("error handling request: {:#}", e);
                    }
                }
                InboxMessage::RemoteDisconnected(remote) => {
                    endpoint.on_disconnected(remote).await;
                }
                InboxMessage::Stop => {
                    break;
                }
            }
        }

        rx.close();
        endpoint.on_stop().await;
        debug!("endpoint stopped");
    }.instrument(span));

    tx
}


/// Reference to an endpoint in the same process: messages go straight to its inbox
pub struct LocalEndpointRef {
    address: EndpointAddress,
    sender: RpcAddress,
    inbox: mpsc::UnboundedSender<InboxMessage>,
}

impl Debug for LocalEndpointRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalEndpointRef{{{}}}", self.address)
    }
}

impl LocalEndpointRef {
    /// `sender` is what the endpoint sees as the origin of messages sent through this reference
    pub fn new(address: EndpointAddress, sender: RpcAddress, inbox: mpsc::UnboundedSender<InboxMessage>) -> LocalEndpointRef {
        LocalEndpointRef {
            address,
            sender,
            inbox,
        }
    }

    fn post(&self, msg: InboxMessage) -> anyhow::Result<()> {
        self.inbox.send(msg)
            .map_err(|_| anyhow!("endpoint {} is stopped", self.address))
    }
}

#[async_trait]
impl RpcEndpointRef for LocalEndpointRef {
    fn address(&self) -> EndpointAddress {
        self.address.clone()
    }

    async fn send(&self, message: DeployMessage) -> anyhow::Result<()> {
        self.post(InboxMessage::OneWay { sender: self.sender.clone(), message })
    }

    async fn ask(&self, message: DeployMessage) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.post(InboxMessage::Rpc { message, context: RpcCallContext::new(self.sender.clone(), tx) })?;
        rx.await
            .map_err(|_| anyhow!("endpoint {} did not reply", self.address))?
    }
}


/// The endpoints registered in one RPC environment, by name
pub struct Dispatcher {
    address: RpcAddress,
    endpoints: RwLock<FxHashMap<String, Arc<LocalEndpointRef>>>,
}

impl Dispatcher {
    pub fn new(address: RpcAddress) -> Dispatcher {
        Dispatcher {
            address,
            endpoints: Default::default(),
        }
    }

    pub fn address(&self) -> &RpcAddress {
        &self.address
    }

    pub async fn register(&self, name: &str, endpoint: Arc<dyn RpcEndpoint>) -> anyhow::Result<Arc<LocalEndpointRef>> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(name) {
            bail!("there is already an endpoint named {}", name);
        }

        let address = EndpointAddress::new(self.address.clone(), name);
        let inbox = spawn_inbox(address.clone(), endpoint);
        let endpoint_ref = Arc::new(LocalEndpointRef::new(address, self.address.clone(), inbox));
        endpoints.insert(name.to_string(), endpoint_ref.clone());
        info!("registered endpoint {}", name);
        Ok(endpoint_ref)
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<LocalEndpointRef>> {
        self.endpoints.read().await
            .get(name)
            .cloned()
    }

    /// Delivers a message to a local endpoint on behalf of a remote sender
    pub async fn post(&self, name: &str, msg: InboxMessage) -> anyhow::Result<()> {
        match self.lookup(name).await {
            Some(endpoint_ref) => endpoint_ref.post(msg),
            None => bail!("no endpoint named {} in {}", name, self.address),
        }
    }

    pub async fn broadcast_disconnected(&self, remote: &RpcAddress) {
        for endpoint_ref in self.endpoints.read().await.values() {
            let _ = endpoint_ref.post(InboxMessage::RemoteDisconnected(remote.clone()));
        }
    }

    /// Removes the endpoint and lets it finish the messages it already has
    pub async fn unregister(&self, name: &str) {
        if let Some(endpoint_ref) = self.endpoints.write().await.remove(name) {
            let _ = endpoint_ref.post(InboxMessage::Stop);
            info!("unregistered endpoint {}", name);
        }
    }

    pub async fn stop_all(&self) {
        for (_, endpoint_ref) in self.endpoints.write().await.drain() {
            let _ = endpoint_ref.post(InboxMessage::Stop);
        }
    }
}
