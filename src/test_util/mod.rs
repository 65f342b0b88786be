//! Utilities for testing code that talks to a master through [crate::rpc::RpcEnv]. They are used
//!  for testing this crate itself, but they are also exported for application testing, which is
//!  why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod endpoint;
pub mod listener;

use crate::rpc::{EndpointAddress, RpcAddress};


/// convenience for test code: an [RpcAddress] based on a number, the same number generating the
///  same address and different numbers different addresses
pub fn test_rpc_addr_from_number(number: u16) -> RpcAddress {
    RpcAddress::new("127.0.0.1", number)
}

/// The master's endpoint in an environment created with [test_rpc_addr_from_number]
pub fn test_master_endpoint(number: u16) -> EndpointAddress {
    EndpointAddress::new(test_rpc_addr_from_number(number), crate::deploy::MASTER_ENDPOINT_NAME)
}

pub fn test_master_url(number: u16) -> String {
    format!("masterlink://{}", test_rpc_addr_from_number(number))
}
