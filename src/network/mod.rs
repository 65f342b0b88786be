//! The transport layer: one physical TCP connection per peer, carrying length-prefixed frames.
//!
//! Each connection is driven by its own task ([connection]) which hands decoded frames to a
//!  [channel_handler::TransportChannelHandler]. That handler routes requests to the
//!  [request_handler] side and responses to the [response_handler] side, and it owns the liveness
//!  decision when the connection goes idle.

pub mod channel_handler;
pub mod client;
pub mod connection;
pub mod protocol;
pub mod request_handler;
pub mod response_handler;
