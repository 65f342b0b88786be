use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::config::TransportConf;
use crate::deploy::DeployMessage;
use crate::network::client::TransportClient;
use crate::network::connection::{TransportClientFactory, TransportServer};
use crate::network::protocol::WireError;
use crate::network::request_handler::{NoStreams, RpcHandler, RpcResponseCallback};
use crate::rpc::{Dispatcher, EndpointAddress, InboxMessage, RpcAddress, RpcCallContext, RpcEndpoint, RpcEndpointRef, RpcEnv};
use crate::util::buf::{put_string, try_get_bool, try_get_string};


/// The body of a frame between two RPC environments
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestEnvelope {
    pub sender: RpcAddress,
    pub receiver: String,
    pub message: DeployMessage,
}

impl RequestEnvelope {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.sender.ser(buf);
        put_string(buf, &self.receiver);
        self.message.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<RequestEnvelope, WireError> {
        let sender = RpcAddress::try_deser(buf)?;
        let receiver = try_get_string(buf, "receiver endpoint name")?;
        let message = DeployMessage::try_deser(buf)?;
        Ok(RequestEnvelope { sender, receiver, message })
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}


/// Identifies a connection for as long as its [TransportClient] is alive. A reconnect to the same
///  socket address gets a different key.
fn connection_key(client: &Arc<TransportClient>) -> usize {
    Arc::as_ptr(client) as usize
}

/// Connects the transport layer to local endpoints. It also remembers which RPC environment is at
///  the other end of each connection, so that endpoints can be told when it goes away.
struct EnvRpcHandler {
    dispatcher: Arc<Dispatcher>,
    peers: RwLock<FxHashMap<usize, RpcAddress>>,
}

impl EnvRpcHandler {
    async fn record_peer(&self, client: &Arc<TransportClient>, address: &RpcAddress) {
        // an entry is only removed when its connection becomes inactive
        if !client.is_active() {
            return;
        }
        let mut peers = self.peers.write().await;
        let key = connection_key(client);
        if peers.get(&key) != Some(address) {
            debug!("connection {} belongs to {}", client.remote_addr(), address);
            peers.insert(key, address.clone());
        }
    }

    fn decode(body: Bytes) -> anyhow::Result<RequestEnvelope> {
        let mut buf = body;
        let envelope = RequestEnvelope::try_deser(&mut buf)?;
        if buf.has_remaining() {
            return Err(WireError::InvalidLength("request envelope").into());
        }
        Ok(envelope)
    }
}

#[async_trait]
impl RpcHandler for EnvRpcHandler {
    async fn receive(&self, client: Arc<TransportClient>, body: Bytes, callback: RpcResponseCallback) -> anyhow::Result<()> {
        let envelope = Self::decode(body)?;
        self.record_peer(&client, &envelope.sender).await;

        let (tx, rx) = oneshot::channel();
        let context = RpcCallContext::new(envelope.sender, tx);
        if let Err(e) = self.dispatcher.post(&envelope.receiver, InboxMessage::Rpc { message: envelope.message, context }).await {
            callback.on_failure(format!("{:#}", e));
            return Ok(());
        }

        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(reply)) => callback.on_success(Bytes::copy_from_slice(&[u8::from(reply)])),
                Ok(Err(e)) => callback.on_failure(format!("{:#}", e)),
                Err(_) => callback.on_failure("endpoint did not reply".to_string()),
            }
        });
        Ok(())
    }

    async fn receive_one_way(&self, client: Arc<TransportClient>, body: Bytes) -> anyhow::Result<()> {
        let envelope = Self::decode(body)?;
        self.record_peer(&client, &envelope.sender).await;

        if let Err(e) = self.dispatcher.post(&envelope.receiver, InboxMessage::OneWay { sender: envelope.sender, message: envelope.message }).await {
            warn!("dropping message from {}: {:#}", client.remote_addr(), e);
        }
        Ok(())
    }

    async fn channel_active(&self, _client: Arc<TransportClient>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn channel_inactive(&self, client: Arc<TransportClient>) -> anyhow::Result<()> {
        let peer = self.peers.write().await.remove(&connection_key(&client));
        if let Some(address) = peer {
            info!("lost connection to {}", address);
            self.dispatcher.broadcast_disconnected(&address).await;
        }
        Ok(())
    }

    async fn exception_caught(&self, cause: String, client: Arc<TransportClient>) -> anyhow::Result<()> {
        debug!("connection to {} failed: {}", client.remote_addr(), cause);
        Ok(())
    }
}


/// Reference to an endpoint in another RPC environment. The connection is looked up (or created)
///  for every call, so a reference survives reconnects.
struct RemoteEndpointRef {
    address: EndpointAddress,
    sender: RpcAddress,
    client_factory: Arc<TransportClientFactory>,
    handler: Arc<EnvRpcHandler>,
    ask_timeout: Duration,
}

impl Debug for RemoteEndpointRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteEndpointRef{{{}}}", self.address)
    }
}

impl RemoteEndpointRef {
    async fn client(&self) -> anyhow::Result<Arc<TransportClient>> {
        let socket_addr = self.address.address.resolve().await?;
        let client = self.client_factory.create_client(socket_addr).await
            .with_context(|| format!("connecting to {}", self.address))?;
        self.handler.record_peer(&client, &self.address.address).await;
        Ok(client)
    }

    fn envelope(&self, message: DeployMessage) -> Bytes {
        RequestEnvelope {
            sender: self.sender.clone(),
            receiver: self.address.name.clone(),
            message,
        }.to_bytes()
    }
}

#[async_trait]
impl RpcEndpointRef for RemoteEndpointRef {
    fn address(&self) -> EndpointAddress {
        self.address.clone()
    }

    async fn send(&self, message: DeployMessage) -> anyhow::Result<()> {
        let body = self.envelope(message);
        self.client().await?
            .send(body)
    }

    async fn ask(&self, message: DeployMessage) -> anyhow::Result<bool> {
        let body = self.envelope(message);
        let mut reply = self.client().await?
            .send_rpc_and_wait(body, self.ask_timeout).await?;
        Ok(try_get_bool(&mut reply, "ask reply")?)
    }
}


/// An [RpcEnv] whose endpoints are reachable over the network
pub struct TransportRpcEnv {
    address: RpcAddress,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<EnvRpcHandler>,
    server: TransportServer,
    client_factory: Arc<TransportClientFactory>,
    ask_timeout: Duration,
}

impl TransportRpcEnv {
    /// Binds to `host:port`. With port 0 a free port is chosen, the environment's address has the
    ///  actual port.
    pub async fn create(conf: TransportConf, host: &str, port: u16) -> anyhow::Result<Arc<TransportRpcEnv>> {
        let bind_addr = RpcAddress::new(host, port).resolve().await?;
        let listener = TcpListener::bind(bind_addr).await
            .with_context(|| format!("binding to {}", bind_addr))?;
        let address = RpcAddress::new(host, listener.local_addr()?.port());

        let dispatcher = Arc::new(Dispatcher::new(address.clone()));
        let handler = Arc::new(EnvRpcHandler {
            dispatcher: dispatcher.clone(),
            peers: Default::default(),
        });
        let server = TransportServer::from_listener(conf.clone(), listener, handler.clone(), Arc::new(NoStreams))?;
        let ask_timeout = conf.request_timeout;
        let client_factory = Arc::new(TransportClientFactory::new(conf, handler.clone(), Arc::new(NoStreams)));

        info!("RPC environment listening at {}", address);
        Ok(Arc::new(TransportRpcEnv {
            address,
            dispatcher,
            handler,
            server,
            client_factory,
            ask_timeout,
        }))
    }

    /// Stops all endpoints and closes all connections
    pub async fn shutdown(&self) {
        self.dispatcher.stop_all().await;
        self.server.shutdown().await;
        self.client_factory.close().await;
    }
}

#[async_trait]
impl RpcEnv for TransportRpcEnv {
    fn address(&self) -> RpcAddress {
        self.address.clone()
    }

    async fn setup_endpoint(&self, name: &str, endpoint: Arc<dyn RpcEndpoint>) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
        let endpoint_ref: Arc<dyn RpcEndpointRef> = self.dispatcher.register(name, endpoint).await?;
        Ok(endpoint_ref)
    }

    async fn endpoint_ref(&self, address: &EndpointAddress) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
        if address.address == self.address {
            let endpoint_ref: Arc<dyn RpcEndpointRef> = self.dispatcher.lookup(&address.name).await
                .ok_or_else(|| anyhow!("no local endpoint named {}", address.name))?;
            return Ok(endpoint_ref);
        }

        Ok(Arc::new(RemoteEndpointRef {
            address: address.clone(),
            sender: self.address.clone(),
            client_factory: self.client_factory.clone(),
            handler: self.handler.clone(),
            ask_timeout: self.ask_timeout,
        }))
    }

    async fn stop(&self, address: &EndpointAddress) {
        if address.address != self.address {
            warn!("can not stop remote endpoint {}", address);
            return;
        }
        self.dispatcher.unregister(&address.name).await;
    }
}
