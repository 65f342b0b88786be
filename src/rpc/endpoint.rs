use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use tokio::sync::oneshot;
use tracing::debug;

use crate::deploy::DeployMessage;
use crate::network::protocol::WireError;
use crate::rpc::RpcAddress;
use crate::util::buf::{put_string, try_get_string};


/// Names an endpoint: the RPC environment it lives in, and its name inside that environment. This
///  is also the wire form of an endpoint reference.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct EndpointAddress {
    pub address: RpcAddress,
    pub name: String,
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

impl EndpointAddress {
    pub fn new(address: RpcAddress, name: &str) -> EndpointAddress {
        EndpointAddress {
            address,
            name: name.to_string(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.address.ser(buf);
        put_string(buf, &self.name);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<EndpointAddress, WireError> {
        let address = RpcAddress::try_deser(buf)?;
        let name = try_get_string(buf, "endpoint name")?;
        Ok(EndpointAddress { address, name })
    }
}


/// A handle to a (local or remote) endpoint.
#[async_trait]
pub trait RpcEndpointRef: Debug + Send + Sync + 'static {
    fn address(&self) -> EndpointAddress;

    /// Fire-and-forget. Success means the message was handed to the transport, not that it
    ///  arrived.
    async fn send(&self, message: DeployMessage) -> anyhow::Result<()>;

    /// Sends a request and waits for the endpoint's reply
    async fn ask(&self, message: DeployMessage) -> anyhow::Result<bool>;
}


/// The reply channel of one request received through [RpcEndpoint::receive_and_reply]. Replying
///  consumes the context, so there is exactly one reply per request. A context that is dropped
///  without replying fails the request on the asking side.
pub struct RpcCallContext {
    sender: RpcAddress,
    reply_to: oneshot::Sender<anyhow::Result<bool>>,
}

impl Debug for RpcCallContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcCallContext{{sender:{}}}", self.sender)
    }
}

impl RpcCallContext {
    pub fn new(sender: RpcAddress, reply_to: oneshot::Sender<anyhow::Result<bool>>) -> RpcCallContext {
        RpcCallContext {
            sender,
            reply_to,
        }
    }

    pub fn sender_address(&self) -> &RpcAddress {
        &self.sender
    }

    pub fn reply(self, response: bool) {
        self.finish(Ok(response));
    }

    pub fn send_failure(self, error: anyhow::Error) {
        self.finish(Err(error));
    }

    /// Replies with the outcome of `f` once it completes, without blocking the caller. Both
    ///  success and failure are passed on.
    pub fn reply_with<F>(self, f: F)
    where
        F: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = f.await;
            self.finish(result);
        });
    }

    fn finish(self, result: anyhow::Result<bool>) {
        if self.reply_to.send(result).is_err() {
            debug!("{} is no longer waiting for a reply", self.sender);
        }
    }
}


/// The logic behind an endpoint. An endpoint's callbacks are invoked one at a time, in the order
///  its messages arrived.
#[async_trait]
pub trait RpcEndpoint: Send + Sync + 'static {
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// a message sent with [RpcEndpointRef::send]
    async fn receive(&self, sender: RpcAddress, message: DeployMessage) -> anyhow::Result<()>;

    /// a message sent with [RpcEndpointRef::ask]
    async fn receive_and_reply(&self, message: DeployMessage, context: RpcCallContext) -> anyhow::Result<()>;

    /// the RPC environment lost its connection to `remote`
    async fn on_disconnected(&self, _remote: RpcAddress) {}

    async fn on_stop(&self) {}
}


#[async_trait]
pub trait RpcEnv: Send + Sync + 'static {
    fn address(&self) -> RpcAddress;

    /// Registers an endpoint under `name` and starts processing its messages
    async fn setup_endpoint(&self, name: &str, endpoint: Arc<dyn RpcEndpoint>) -> anyhow::Result<Arc<dyn RpcEndpointRef>>;

    async fn endpoint_ref(&self, address: &EndpointAddress) -> anyhow::Result<Arc<dyn RpcEndpointRef>>;

    /// Stops a local endpoint. Messages it has already received are processed first.
    async fn stop(&self, address: &EndpointAddress);
}
