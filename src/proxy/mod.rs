//! Proxy Rotator implementation
//!
//! This module provides the rotator functionality including:
//! - SOCKS5 handshake and request codec
//! - Username/password authentication
//! - Backend rotation strategies over live tunnel endpoints
//! - Buffered bidirectional relaying

pub mod middleware;
pub mod relay;
pub mod rotation;
pub mod server;
pub mod socks5;

pub use rotation::{create_selector, EndpointSelector, EndpointSource, RotationStrategy};
pub use server::ProxyRotator;
