//! frontgate - SOCKS5 tunnel rotator with a domain-fronting gateway
//!
//! ## Components
//!
//! - Tunnel Manager: one tunnel client worker per authorization, each
//!   exposing a local SOCKS5 port
//! - Proxy Rotator: authenticated SOCKS5 front rotating over live workers
//! - Domain-Fronting Gateway: classifies inbound traffic with the Rule
//!   Engine and fronts matched hosts through the rotator
//! - redsocks integration for transparent redirection

pub mod app;
pub mod config;
pub mod error;
pub mod inject;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod services;
pub mod shutdown;
pub mod tunnel;

pub use app::App;
pub use config::Config;
pub use error::{GateError, Result};
