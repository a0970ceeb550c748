//! Tunnel Manager and its workers
//!
//! This module provides:
//! - The boundary to the external tunnel client
//! - Per-worker supervision with Starting/Connected/Failed/Stopped states
//! - The live-endpoint pool read by the Proxy Rotator

pub mod client;
pub mod manager;
pub mod pool;
pub mod process;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{TunnelClient, TunnelSession, WorkerSpec};
pub use manager::TunnelManager;
pub use pool::EndpointPool;
pub use process::ProcessTunnelClient;
