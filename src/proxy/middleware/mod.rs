//! Rotator middleware for inbound authentication

mod auth;

pub use auth::SocksAuth;
