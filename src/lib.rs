//! Transport and cluster-membership plumbing for talking to a cluster master: a length-prefixed
//!  binary frame protocol with per-connection liveness handling, a small endpoint-based RPC layer
//!  on top of it, and the client that registers an application with the master and keeps that
//!  registration alive across retries and master failover.

pub mod config;
pub mod deploy;
pub mod network;
pub mod rpc;
pub mod test_util;
pub mod util;
