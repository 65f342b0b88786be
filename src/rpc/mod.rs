//! Named endpoints on top of the transport layer.
//!
//! An endpoint is addressed by its RPC environment's address plus a name, and it is reached through
//!  an [RpcEndpointRef]. Each endpoint processes its messages sequentially from an inbox, so
//!  endpoint implementations see one message at a time.

mod endpoint;
mod inbox;
mod rpc_address;
mod transport_env;

pub use endpoint::{EndpointAddress, RpcCallContext, RpcEndpoint, RpcEndpointRef, RpcEnv};
pub use inbox::{spawn_inbox, Dispatcher, InboxMessage, LocalEndpointRef};
pub use rpc_address::RpcAddress;
pub use transport_env::{RequestEnvelope, TransportRpcEnv};
